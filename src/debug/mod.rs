//! Guest debugging: breakpoints, watchpoints and the event sink the gdb
//! stub listens on.

pub mod hw_breakpoint;
pub mod hw_stop_point;
pub mod manager;
pub mod sw_breakpoint;
pub mod watchpoint;

pub use hw_breakpoint::HwBreakpointManager;
pub use hw_stop_point::{HwStopPointManager, ReloadContext};
pub use manager::{DebugEventInfo, DebugEventKind, DebugManager};
pub use sw_breakpoint::SwBreakpointManager;
pub use watchpoint::{Watchpoint, WatchpointDirection, WatchpointManager};
