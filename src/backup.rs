use keyboot_core::hal::BackupRegisters;
use stm32f1xx_hal::pac::{BKP, PWR};

use crate::board::Stm32Board;

// DR1..DR10 sit right after the reserved word, DR11..DR42 after RTCCR/CR/CSR
fn register_offset(index: u8) -> Option<usize> {
    match index {
        1..=10 => Some(index as usize * 4),
        11..=42 => Some(0x40 + (index as usize - 11) * 4),
        _ => None,
    }
}

fn register(index: u8) -> Option<*mut u32> {
    register_offset(index).map(|offset| unsafe { (BKP::ptr() as *mut u8).add(offset) as *mut u32 })
}

impl BackupRegisters for Stm32Board {
    fn read_backup_reg(&mut self, index: u8) -> u32 {
        match register(index) {
            Some(reg) => unsafe { core::ptr::read_volatile(reg) & 0xffff },
            None => 0,
        }
    }

    fn write_backup_reg(&mut self, index: u8, value: u32) {
        if let Some(reg) = register(index) {
            unsafe {
                let pwr = &*PWR::ptr();
                // backup domain is write protected out of reset
                pwr.cr.modify(|_, w| w.dbp().set_bit());
                core::ptr::write_volatile(reg, value & 0xffff);
                pwr.cr.modify(|_, w| w.dbp().clear_bit());
            }
        }
    }
}
