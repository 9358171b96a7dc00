//! "Enter the bootloader on the next reset", kept in backup register 10.
//!
//! The application arms the flag and resets; the entry decision consumes it
//! once. The register survives a warm reset but not a loss of backup domain
//! power, so a stale flag can never outlive a power cycle.

use crate::config::{
    BACKUP_FLAG_REGISTER, RCC_APB1ENR_BKP_CLK, RCC_APB1ENR_PWR_CLK, RTC_BOOTLOADER_FLAG,
};
use crate::hal::{BackupRegisters, ClockGate, Gpio};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootIntent {
    Normal,
    ForceBootloader,
}

/// Clocks that have to run before the backup registers can be touched.
pub const BACKUP_CLOCKS: ClockGate = ClockGate::Apb1(RCC_APB1ENR_PWR_CLK | RCC_APB1ENR_BKP_CLK);

/// Arm the flag. Called by an application right before it resets into the
/// bootloader.
pub fn set<B: Gpio + BackupRegisters + ?Sized>(board: &mut B) {
    board.enable_clock(BACKUP_CLOCKS);
    board.write_backup_reg(BACKUP_FLAG_REGISTER, RTC_BOOTLOADER_FLAG);
}

/// Read the flag without clearing it.
pub fn is_armed<B: Gpio + BackupRegisters + ?Sized>(board: &mut B) -> bool {
    board.enable_clock(BACKUP_CLOCKS);
    board.read_backup_reg(BACKUP_FLAG_REGISTER) == RTC_BOOTLOADER_FLAG
}

/// Read and clear the flag. Only the first call after a [`set`] reports
/// `ForceBootloader`.
pub fn consume<B: Gpio + BackupRegisters + ?Sized>(board: &mut B) -> BootIntent {
    if is_armed(board) {
        board.write_backup_reg(BACKUP_FLAG_REGISTER, 0);
        BootIntent::ForceBootloader
    } else {
        BootIntent::Normal
    }
}
