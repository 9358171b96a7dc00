//! Hardware independent half of the keyboot DFU bootloader.
//!
//! Everything that decides *what* the bootloader does lives here: whether a
//! reset stays in the bootloader or boots the application, how the LED
//! blinks while waiting, how incoming firmware chunks are erased and
//! programmed, and what has to be true before control is handed to the
//! application. Register access is left to the firmware crate, which
//! implements the traits in [`hal`] for the STM32F103.
//!
//! Because nothing here touches a register directly, the whole crate builds
//! and tests on the host against a simulated board.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod entry;
pub mod error;
pub mod hal;
pub mod handoff;
pub mod image;
pub mod indicator;
pub mod intent;
pub mod programmer;
pub mod resident;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;

pub use config::BoardConfig;
pub use entry::{decide, Decision, EntryReason};
pub use error::{BootError, FlashError};
pub use hal::Board;
pub use handoff::HandoffTarget;
pub use image::FlashRegion;
pub use resident::{Handoff, Resident};
