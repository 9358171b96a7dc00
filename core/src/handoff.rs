//! Getting the board ready for the application.
//!
//! The jump itself is a few instructions of firmware that cannot be tested on
//! the host. Everything before it can: the image is checked one last time,
//! the pins and clocks the bootloader touched go back to their reset state,
//! and the addresses the jump needs are read from the vector table.

use crate::config::{
    BoardConfig, EntryKey, RCC_APB1ENR_TIM2_CLK, RCC_APB1ENR_USB_CLK, RCC_APB2ENR_AFIO_CLK,
    RCC_APB2ENR_USART1_CLK,
};
use crate::error::BootError;
use crate::hal::{Bank, Board, ClockGate, Gpio, PinMode, RCC_APB2ENR_IOPA_CLK};
use crate::image::{FlashRegion, VectorTable};
use crate::intent::BACKUP_CLOCKS;

/// Peripherals the bootloader may have started, as `RCC_APB1RSTR` bits.
/// The bit layout matches `RCC_APB1ENR`.
pub const APB1_RESETS: u32 = RCC_APB1ENR_TIM2_CLK | RCC_APB1ENR_USB_CLK;

/// Peripherals the bootloader may have started, as `RCC_APB2RSTR` bits:
/// AFIO, USART1 and every GPIO port.
pub const APB2_RESETS: u32 = RCC_APB2ENR_AFIO_CLK | RCC_APB2ENR_USART1_CLK | all_ports();

const fn all_ports() -> u32 {
    let banks = [Bank::A, Bank::B, Bank::C, Bank::D, Bank::E];
    let mut mask = 0;
    let mut i = 0;
    while i < banks.len() {
        mask |= RCC_APB2ENR_IOPA_CLK << banks[i].index();
        i += 1;
    }
    mask
}

/// Where and how the application is entered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandoffTarget {
    /// Absolute address of the application vector table, for `SCB.VTOR`.
    pub vector_table: u32,
    pub stack_pointer: u32,
    /// Reset handler, Thumb bit set.
    pub entry: u32,
    /// Pulse these through `RCC_APB1RSTR` before the jump.
    pub apb1_resets: u32,
    /// Pulse these through `RCC_APB2RSTR` before the jump.
    pub apb2_resets: u32,
}

impl core::fmt::Display for HandoffTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "vtor: 0x{:x} msp: 0x{:x} entry: 0x{:x}",
            self.vector_table, self.stack_pointer, self.entry
        )
    }
}

/// Check the image and undo the bootloader's pin and clock setup. On error
/// nothing is changed and the bootloader must stay.
pub fn prepare<B: Board + ?Sized>(
    board: &mut B,
    config: &BoardConfig,
    region: &FlashRegion,
) -> Result<HandoffTarget, BootError> {
    let vt = VectorTable::read(board, region);
    if !vt.is_valid(region, config.ram_size) {
        return Err(BootError::InvalidImage);
    }

    release_pins(board, config);
    board.disable_clock(ClockGate::Apb1(RCC_APB1ENR_USB_CLK));
    board.disable_clock(BACKUP_CLOCKS);

    Ok(HandoffTarget {
        vector_table: region.start(),
        stack_pointer: vt.stack_pointer,
        entry: vt.reset_vector,
        apb1_resets: APB1_RESETS,
        apb2_resets: APB2_RESETS,
    })
}

fn release_pins<G: Gpio + ?Sized>(gpio: &mut G, config: &BoardConfig) {
    let mut pins = [None; 3];
    if let Some(led) = config.led {
        pins[0] = Some(led.pin);
    }
    match config.entry_key {
        EntryKey::None => {}
        EntryKey::Button { pin, .. } => pins[1] = Some(pin),
        EntryKey::Matrix { drive, sense, .. } => {
            pins[1] = Some(sense);
            pins[2] = Some(drive);
        }
    }
    for pin in pins.iter().flatten() {
        gpio.configure(*pin, PinMode::Floating);
    }
    for pin in pins.iter().flatten() {
        gpio.disable_clock(pin.bank.clock());
    }
}
