#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

//! EL2 firmware image. On hosted targets this is an empty program so the
//! crate builds and tests on a development machine.

#[cfg(target_os = "none")]
mod firmware {
    use core::panic::PanicInfo;

    use thermosphere::arch::aarch64::{self, current_core_id, enter_guest, QemuVirt};
    use thermosphere::arch::aarch64::{Cpu, DebugRegisters, Gicv2, SmcMonitor, Stage12Translator, Timer};
    use thermosphere::arch::ExceptionStackFrame;
    use thermosphere::dtb::{self, PlatformInfo};
    use thermosphere::platform::{self, GUEST_KERNEL_ENTRY};
    use thermosphere::{println, uart, Hypervisor};

    static HYPERVISOR: Hypervisor<QemuVirt> = Hypervisor::new(
        Gicv2::new(PlatformInfo::qemu_virt()),
        Timer,
        DebugRegisters,
        Stage12Translator::new(platform::GICD_BASE),
        SmcMonitor,
        Cpu,
    );

    #[cfg(feature = "gdb_stub")]
    mod stub {
        use thermosphere::gdb::GdbTransportTask;
        use thermosphere::gdb::Transport;
        use thermosphere::irq_manager::{ThermosphereSgi, HOST_PRIORITY};
        use thermosphere::platform::{UART_BASE, UART_IRQ};
        use thermosphere::uart::UartTransport;

        use super::{QemuVirt, HYPERVISOR};
        use thermosphere::Hypervisor;

        static TRANSPORT: UartTransport = UartTransport::new(UART_BASE);
        static GDB: GdbTransportTask<Hypervisor<QemuVirt>, UartTransport> =
            GdbTransportTask::new(&HYPERVISOR, &TRANSPORT, UART_IRQ);

        /// Every core takes `ReportDebuggerBreak`; the boot core also owns
        /// the UART interrupt.
        pub fn init(core_id: u32, is_boot_core: bool) {
            let irq = HYPERVISOR.irq();
            irq.register(core_id, &GDB, ThermosphereSgi::ReportDebuggerBreak.id(), false, HOST_PRIORITY);
            if is_boot_core {
                irq.register(core_id, &GDB, GDB.irq_id(), true, HOST_PRIORITY);
                TRANSPORT.set_rx_interrupt_enabled(true);
                log::info!("gdb: listening on uart irq {}", GDB.irq_id());
            }
        }
    }

    fn log_level() -> log::LevelFilter {
        if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }

    fn start_core(core_id: u32, is_boot_core: bool) -> ! {
        aarch64::init_el2();
        HYPERVISOR.init_core(core_id, is_boot_core);
        #[cfg(feature = "gdb_stub")]
        stub::init(core_id, is_boot_core);

        let frame = HYPERVISOR.initial_guest_frame(core_id);
        log::debug!("core {}: entering guest at {:#x}", core_id, frame.elr_el2);
        unsafe { enter_guest(&frame) }
    }

    /// Boot core entry from `entry.S`, with the host DTB address.
    #[no_mangle]
    pub extern "C" fn thermosphere_main(dtb_addr: usize, core_id: u32) -> ! {
        uart::init_logger(log_level());
        println!("========================================");
        println!("  Thermosphere EL2 debug hypervisor");
        println!("========================================");

        dtb::init(dtb_addr);
        let info = dtb::platform_info();
        aarch64::init_platform(info, HYPERVISOR.irq().gic(), HYPERVISOR.memory());
        log::info!(
            "platform: gicd {:#x} gicc {:#x} gich {:#x} gicv {:#x}, {} cpus",
            info.gicd_base,
            info.gicc_base,
            info.gich_base,
            info.gicv_base,
            info.num_cpus
        );

        HYPERVISOR
            .cores()
            .get(core_id)
            .set_boot_parameters(GUEST_KERNEL_ENTRY, dtb_addr as u64);
        start_core(core_id, true)
    }

    /// Secondary cores, started by the guest through PSCI `CPU_ON`.
    #[no_mangle]
    pub extern "C" fn thermosphere_warm_main(core_id: u32) -> ! {
        start_core(core_id, false)
    }

    #[no_mangle]
    pub extern "C" fn thermosphere_lower_el_sync(frame: &mut ExceptionStackFrame) {
        HYPERVISOR.handle_lower_el_sync(current_core_id(), frame);
    }

    #[no_mangle]
    pub extern "C" fn thermosphere_lower_el_irq(frame: &mut ExceptionStackFrame) {
        HYPERVISOR.handle_lower_el_irq(current_core_id(), frame);
    }

    #[no_mangle]
    pub extern "C" fn thermosphere_current_el_sync(frame: &mut ExceptionStackFrame) {
        if !aarch64::fixup_device_copy(frame) {
            panic!("EL2 synchronous exception on core {}\n{:?}", current_core_id(), frame);
        }
    }

    #[no_mangle]
    pub extern "C" fn thermosphere_current_el_irq(_frame: &mut ExceptionStackFrame) {
        HYPERVISOR.handle_current_el_irq(current_core_id());
    }

    #[no_mangle]
    pub extern "C" fn thermosphere_unhandled_exception(frame: &mut ExceptionStackFrame) {
        panic!("unhandled exception on core {}\n{:?}", current_core_id(), frame);
    }

    /// Panic handler - required for no_std
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("\n!!! PANIC !!!");
        println!("{}", info);

        loop {
            unsafe {
                core::arch::asm!("wfe");
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
