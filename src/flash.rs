use keyboot_core::{
    hal::FlashController,
    image::FLASH_SIZE_REGISTER,
    FlashError,
};
use stm32f1xx_hal::pac::FLASH;

use crate::board::Stm32Board;

const KEY1: u32 = 0x45670123;
const KEY2: u32 = 0xCDEF89AB;

// SR bits, cleared by writing 1
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

/// Flash size in KiB as reported by the device signature.
pub(crate) fn flash_size_kib() -> u16 {
    unsafe { (core::ptr::read_volatile(FLASH_SIZE_REGISTER as *const u32) & 0xffff) as u16 }
}

unsafe fn wait_idle(flash: &stm32f1xx_hal::pac::flash::RegisterBlock) {
    while flash.sr.read().bsy().bit_is_set() {}
}

unsafe fn clear_status(flash: &stm32f1xx_hal::pac::flash::RegisterBlock) {
    flash.sr.write(|w| w.bits(SR_PGERR | SR_WRPRTERR | SR_EOP));
}

unsafe fn check_status(flash: &stm32f1xx_hal::pac::flash::RegisterBlock) -> Result<(), FlashError> {
    let sr = flash.sr.read();
    if sr.wrprterr().bit_is_set() {
        Err(FlashError::WriteProtected)
    } else if sr.pgerr().bit_is_set() {
        Err(FlashError::ProgrammingError)
    } else {
        Ok(())
    }
}

unsafe fn write_half_word(
    flash: &stm32f1xx_hal::pac::flash::RegisterBlock,
    addr: u32,
    data: u16,
) -> Result<(), FlashError> {
    wait_idle(flash);
    clear_status(flash);
    core::ptr::write_volatile(addr as *mut u16, data);
    wait_idle(flash);
    check_status(flash)?;

    if core::ptr::read_volatile(addr as *const u16) != data {
        return Err(FlashError::VerifyFailed);
    }
    Ok(())
}

impl FlashController for Stm32Board {
    fn unlock(&mut self) {
        unsafe {
            let flash = &*FLASH::ptr();
            // a second key sequence on an unlocked controller faults
            if flash.cr.read().lock().bit_is_set() {
                flash.keyr.write(|w| w.bits(KEY1));
                flash.keyr.write(|w| w.bits(KEY2));
            }
        }
    }

    fn lock(&mut self) {
        unsafe {
            let flash = &*FLASH::ptr();
            wait_idle(flash);
            flash.cr.modify(|_, w| w.lock().bit(true));
        }
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        unsafe {
            let flash = &*FLASH::ptr();

            wait_idle(flash);
            if flash.cr.read().lock().bit_is_set() {
                return Err(FlashError::WriteProtected);
            }
            clear_status(flash);
            flash.cr.modify(|_, w| w.per().bit(true));
            flash.ar.write(|w| w.far().bits(address));
            flash.cr.modify(|_, w| w.strt().bit(true).per().bit(true));
            wait_idle(flash);
            flash.cr.modify(|_, w| w.per().bit(false).strt().bit(false));

            check_status(flash)?;
            if flash.sr.read().eop().bit_is_clear() {
                return Err(FlashError::Busy);
            }
            clear_status(flash);

            let first = core::ptr::read_volatile(address as *const u32);
            if first != 0xffff_ffff {
                return Err(FlashError::VerifyFailed);
            }
            Ok(())
        }
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        unsafe {
            let flash = &*FLASH::ptr();

            wait_idle(flash);
            if flash.cr.read().lock().bit_is_set() {
                return Err(FlashError::WriteProtected);
            }
            flash.cr.modify(|_, w| w.strt().bit(false).pg().bit(true));

            let mut result = Ok(());
            for (i, hw) in data.chunks(2).enumerate() {
                let half = match *hw {
                    [lo, hi] => u16::from_le_bytes([lo, hi]),
                    [lo] => u16::from_le_bytes([lo, 0xff]),
                    _ => break,
                };
                result = write_half_word(flash, address + (i as u32) * 2, half);
                if result.is_err() {
                    break;
                }
            }

            flash.cr.modify(|_, w| w.pg().bit(false));
            clear_status(flash);
            result
        }
    }

    fn read_word(&self, address: u32) -> u32 {
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }
}
