//! PL011 UART Driver for QEMU virt machine
//!
//! Provides the console (`print!`/`println!`), the `log` backend and the
//! byte transport the GDB stub runs on.

use core::fmt;

use crate::gdb::Transport;
use crate::platform;
use crate::sync::SpinLock;

/// PL011 register offsets
const UART_DR: usize = 0x00; // Data Register
const UART_FR: usize = 0x18; // Flag Register
const UART_IMSC: usize = 0x38; // Interrupt Mask Set/Clear
const UART_ICR: usize = 0x44; // Interrupt Clear Register

/// Flag Register bits
const UART_FR_RXFE: u32 = 1 << 4; // Receive FIFO empty
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

/// Interrupt bits (IMSC/ICR)
const UART_INT_RX: u32 = 1 << 4;
const UART_INT_RT: u32 = 1 << 6; // Receive timeout

/// UART device structure
pub struct Uart {
    base: usize,
}

impl Uart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Write a byte to the UART
    pub fn putc(&self, c: u8) {
        while self.read_reg(UART_FR) & UART_FR_TXFF != 0 {}
        self.write_reg(UART_DR, c as u32);
    }

    /// Read a byte if the receive FIFO has one.
    pub fn getc(&self) -> Option<u8> {
        if self.read_reg(UART_FR) & UART_FR_RXFE != 0 {
            None
        } else {
            Some((self.read_reg(UART_DR) & 0xFF) as u8)
        }
    }

    /// Write a string to the UART
    pub fn puts(&self, s: &str) {
        for byte in s.bytes() {
            self.putc(byte);
        }
    }

    /// Raise the UART interrupt whenever receive data is available.
    pub fn enable_rx_interrupt(&self) {
        self.write_reg(UART_ICR, UART_INT_RX | UART_INT_RT);
        self.write_reg(UART_IMSC, UART_INT_RX | UART_INT_RT);
    }

    pub fn disable_rx_interrupt(&self) {
        self.write_reg(UART_IMSC, 0);
    }

    pub fn ack_rx_interrupt(&self) {
        self.write_reg(UART_ICR, UART_INT_RX | UART_INT_RT);
    }

    #[inline]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Global console UART instance
static UART: Uart = Uart::new(platform::UART_BASE);

/// Serializes console output between cores.
static CONSOLE_LOCK: SpinLock<()> = SpinLock::new(());

/// Print a string to the UART
pub fn print(s: &str) {
    let _guard = CONSOLE_LOCK.lock();
    UART.puts(s);
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

/// Print macro (without newline)
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::uart::writer(), $($arg)*);
    }};
}

/// Println macro (with newline)
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::uart::writer(), $($arg)*);
    }};
}

/// Get a writer for the UART
pub fn writer() -> UartWriter {
    UartWriter
}

/// Writer wrapper for formatting
pub struct UartWriter;

impl fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        UART.puts(s);
        Ok(())
    }
}

/// `log` backend writing `[LEVEL target] message` lines to the console.
pub struct UartLogger;

impl log::Log for UartLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        use core::fmt::Write;
        let _guard = CONSOLE_LOCK.lock();
        let _ = writeln!(
            UartWriter,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger;

/// Install the UART logger. Called once by the boot core.
pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// GDB transport over a dedicated PL011.
///
/// The console and the debugger may share the same UART; log output then
/// interleaves with packets, which GDB tolerates outside of packet framing.
pub struct UartTransport {
    uart: Uart,
}

impl UartTransport {
    pub const fn new(base: usize) -> Self {
        Self {
            uart: Uart::new(base),
        }
    }

    pub fn uart(&self) -> &Uart {
        &self.uart
    }
}

impl Transport for UartTransport {
    fn read_byte(&self) -> Option<u8> {
        self.uart.getc()
    }

    fn write_all(&self, data: &[u8]) {
        let _guard = CONSOLE_LOCK.lock();
        for &b in data {
            self.uart.putc(b);
        }
    }

    fn set_rx_interrupt_enabled(&self, enabled: bool) {
        if enabled {
            self.uart.enable_rx_interrupt();
        } else {
            self.uart.disable_rx_interrupt();
        }
    }
}
