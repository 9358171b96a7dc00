//! The hardware the bootloader core needs, as traits.
//!
//! The firmware crate implements these on top of the STM32F1 PAC; tests
//! implement them on a simulated board. Components take the board context
//! as `&mut B` instead of reaching for global peripherals, so every decision
//! can be replayed on the host.

use embedded_hal::blocking::delay::DelayMs;

use crate::error::FlashError;

/// `RCC_APB2ENR.IOPAEN`, the port clocks for banks B.. follow in order.
pub const RCC_APB2ENR_IOPA_CLK: u32 = 0x0000_0004;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Bank {
    A,
    B,
    C,
    D,
    E,
}

impl Bank {
    pub const fn index(self) -> u8 {
        match self {
            Bank::A => 0,
            Bank::B => 1,
            Bank::C => 2,
            Bank::D => 3,
            Bank::E => 4,
        }
    }

    /// Clock gate feeding this port.
    pub const fn clock(self) -> ClockGate {
        ClockGate::Apb2(RCC_APB2ENR_IOPA_CLK << self.index())
    }
}

/// A single GPIO line, e.g. `Pin::new(Bank::C, 13)` for PC13.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pin {
    pub bank: Bank,
    pub number: u8,
}

impl Pin {
    pub const fn new(bank: Bank, number: u8) -> Self {
        Pin { bank, number }
    }
}

impl core::fmt::Display for Pin {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let port = [b'A', b'B', b'C', b'D', b'E'][self.bank.index() as usize] as char;
        write!(f, "P{}{}", port, self.number)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub const fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl core::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Pin configurations the bootloader uses. `Floating` is the reset state
/// of every STM32F1 GPIO and is what pins are returned to before handoff.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinMode {
    Floating,
    PullUp,
    PullDown,
    PushPull,
}

/// One or more enable bits in `RCC_APB1ENR` or `RCC_APB2ENR`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockGate {
    Apb1(u32),
    Apb2(u32),
}

pub trait Gpio {
    fn enable_clock(&mut self, gate: ClockGate);
    fn disable_clock(&mut self, gate: ClockGate);
    fn configure(&mut self, pin: Pin, mode: PinMode);
    fn set_pin(&mut self, pin: Pin, level: Level);
    fn read_pin(&mut self, pin: Pin) -> Level;
}

/// On-chip flash. Addresses are absolute bus addresses.
pub trait FlashController {
    /// Called once before the first erase of a transfer.
    fn unlock(&mut self) {}

    /// Called when a transfer ends, successfully or not.
    fn lock(&mut self) {}

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> Result<(), FlashError>;

    /// Program `data` at `address` and verify it. `address` and
    /// `data.len()` are multiples of the program granularity.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    fn read_word(&self, address: u32) -> u32;
}

/// Battery-backed data registers (`BKP_DRx`), numbered from 1.
pub trait BackupRegisters {
    fn read_backup_reg(&mut self, index: u8) -> u32;
    fn write_backup_reg(&mut self, index: u8, value: u32);
}

/// Free running millisecond tick. Wraps at `u32::MAX`; callers compare with
/// `wrapping_sub`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Everything the core needs from a board, in one context object.
pub trait Board: Gpio + FlashController + BackupRegisters + Clock + DelayMs<u32> {}

impl<T> Board for T where T: Gpio + FlashController + BackupRegisters + Clock + DelayMs<u32> {}
