use cortex_m::peripheral::{NVIC, SCB};
use keyboot_core::HandoffTarget;
use stm32f1xx_hal::pac::{RCC, STK};

#[cfg(feature = "debug-log")]
use core::fmt::Write;
#[cfg(feature = "debug-log")]
use stm32f1xx_hal::{pac::USART1, serial::Tx};

/// Log a formatted line to USART1. Without `debug-log` the arguments are
/// type checked and nothing else, so no formatting code ends up in flash.
#[cfg(feature = "debug-log")]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::util::_log_fmt(format_args!($($arg)*))
    };
}

#[cfg(not(feature = "debug-log"))]
macro_rules! log {
    ($($arg:tt)*) => {
        if false {
            $crate::util::discard(format_args!($($arg)*))
        }
    };
}

#[cfg(not(feature = "debug-log"))]
#[inline(always)]
pub(crate) fn discard(_: core::fmt::Arguments) {}

#[cfg(feature = "debug-log")]
pub(crate) static mut LOGGER: Option<Tx<USART1>> = None;

#[cfg(feature = "debug-log")]
pub(crate) fn init_logger(tx: Tx<USART1>) {
    cortex_m::interrupt::free(|_| unsafe { LOGGER = Some(tx) });
}

#[cfg(feature = "debug-log")]
pub(crate) fn _log_fmt(args: core::fmt::Arguments) {
    unsafe {
        if let Some(logger) = LOGGER.as_mut() {
            logger.write_fmt(args).ok();
        }
    }
}

/// Wait until the last byte has left the UART.
#[cfg(feature = "debug-log")]
fn log_flush() {
    unsafe {
        if let Some(logger) = LOGGER.as_mut() {
            nb::block!(embedded_hal::serial::Write::flush(logger)).ok();
        }
    }
}

#[cfg(not(feature = "debug-log"))]
fn log_flush() {}

/// Hand the chip over to the application. `target` comes from
/// `handoff::prepare`, which already checked the image and released the
/// pins and clocks the core touched.
pub(crate) unsafe fn jump_to_usercode(target: &HandoffTarget) -> ! {
    let scb = &*SCB::ptr();
    let nvic = &*NVIC::ptr();
    let stk = &*STK::ptr();
    let rcc = &*RCC::ptr();

    log!("Jumping to User Code: {}\r\n", target);
    log_flush();

    let user_msp = target.stack_pointer;
    let user_jmp = target.entry;

    cortex_m::interrupt::disable();

    //disable interrupts
    nvic.icer[0].write(0xffffffff);
    nvic.icer[1].write(0xffffffff);
    nvic.icpr[0].write(0xffffffff);
    nvic.icpr[1].write(0xffffffff);
    //disable systick
    stk.ctrl.modify(|_, w| w.enable().bit(false));
    //reset the peripherals we started, then gate every clock as after reset
    rcc.apb1rstr.modify(|r, w| w.bits(r.bits() | target.apb1_resets));
    rcc.apb1rstr.modify(|r, w| w.bits(r.bits() & !target.apb1_resets));
    rcc.apb2rstr.modify(|r, w| w.bits(r.bits() | target.apb2_resets));
    rcc.apb2rstr.modify(|r, w| w.bits(r.bits() & !target.apb2_resets));
    rcc.apb1enr.write(|w| w.bits(0));
    rcc.apb2enr.write(|w| w.bits(0));
    //reset clocks
    rcc.cr.modify(|_, w| w.hsion().bit(true));
    rcc.cfgr.modify(|r, w| w.bits(r.bits() & 0xf8ff0000));
    rcc.cr.modify(|r, w| w.bits(r.bits() & 0xfef6ffff));
    rcc.cr.modify(|r, w| w.bits(r.bits() & 0xfffbffff));
    rcc.cfgr.modify(|r, w| w.bits(r.bits() & 0xff80ffff));
    rcc.cir.write(|w| w.bits(0));

    scb.vtor.write(target.vector_table);

    // stack switch and branch in one block, nothing may touch the old stack
    core::arch::asm!(
        "msr msp, {msp}",
        "cpsie i",
        "bx {jmp}",
        msp = in(reg) user_msp,
        jmp = in(reg) user_jmp,
        options(noreturn),
    );
}
