//! Decide, once per reset, between staying in the bootloader and starting
//! the application.
//!
//! Signals are checked in priority order and the first one that asks for
//! the bootloader wins:
//!
//! 1. the persistent flag armed by the application (cleared on the way),
//! 2. the entry key held for the whole debounce window,
//! 3. no valid image at `USER_CODE`.
//!
//! Only when none of them fire does the application run. There is no error
//! path: anything doubtful ends in the bootloader.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::config::{BoardConfig, EntryKey, BUTTON_SAMPLES, BUTTON_SAMPLE_MS};
use crate::hal::{Board, Gpio, Level, PinMode};
use crate::image::{image_is_valid, FlashRegion};
use crate::intent::{self, BootIntent};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryReason {
    /// The application armed the backup register flag.
    Flag,
    /// The entry key was held at reset.
    Button,
    /// Nothing runnable at `USER_CODE`.
    NoValidImage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    RunBootloader(EntryReason),
    RunApplication,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Decision::RunBootloader(EntryReason::Flag) => {
                f.write_str("Bootloader flag set: Entering bootloader")
            }
            Decision::RunBootloader(EntryReason::Button) => {
                f.write_str("Button pressed: Entering bootloader")
            }
            Decision::RunBootloader(EntryReason::NoValidImage) => {
                f.write_str("User Code not present: Entering bootloader")
            }
            Decision::RunApplication => f.write_str("Jumping to User Code"),
        }
    }
}

pub fn decide<B: Board + ?Sized>(
    board: &mut B,
    config: &BoardConfig,
    region: &FlashRegion,
) -> Decision {
    if intent::consume(board) == BootIntent::ForceBootloader {
        return Decision::RunBootloader(EntryReason::Flag);
    }
    if key_held(board, &config.entry_key) {
        return Decision::RunBootloader(EntryReason::Button);
    }
    if !image_is_valid(board, region, config.ram_size) {
        return Decision::RunBootloader(EntryReason::NoValidImage);
    }
    Decision::RunApplication
}

/// Sample the entry key `BUTTON_SAMPLES` times, `BUTTON_SAMPLE_MS` apart.
/// Held means pressed on every sample; the first release stops sampling.
/// The pins involved are left floating afterwards.
pub fn key_held<B: Gpio + DelayMs<u32> + ?Sized>(board: &mut B, key: &EntryKey) -> bool {
    let (sense, pressed) = match key.sense() {
        Some(s) => s,
        None => return false,
    };

    board.enable_clock(sense.bank.clock());
    if let EntryKey::Matrix { drive, .. } = *key {
        board.enable_clock(drive.bank.clock());
        board.configure(drive, PinMode::PushPull);
        board.set_pin(drive, Level::High);
    }
    board.configure(sense, key.sense_mode());

    let mut held = true;
    for _ in 0..BUTTON_SAMPLES {
        board.delay_ms(BUTTON_SAMPLE_MS);
        if board.read_pin(sense) != pressed {
            held = false;
            break;
        }
    }

    board.configure(sense, PinMode::Floating);
    if let EntryKey::Matrix { drive, .. } = *key {
        board.set_pin(drive, Level::Low);
        board.configure(drive, PinMode::Floating);
    }
    held
}
