//! Board constants and per-board configuration.
//!
//! The constants are fixed for every STM32F103 target. What differs between
//! boards (LED, the key that forces the bootloader, how long to wait) is a
//! [`BoardConfig`] value; the firmware picks one preset at build time.

use crate::hal::{Bank, Level, Pin, PinMode};

// Flash layout
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const USER_CODE: u32 = 0x0800_2000;
pub const LARGEST_FLASH_PAGE_SIZE: u32 = 0x800;
pub const SMALLEST_FLASH_PAGE_SIZE: u32 = 0x400;
/// STM32F1 flash programs half-words.
pub const PROGRAM_GRANULARITY: u32 = 2;
pub const RAM_START: u32 = 0x2000_0000;

// Clock enables, RCC_APB1ENR
pub const RCC_APB1ENR_USB_CLK: u32 = 0x0080_0000;
pub const RCC_APB1ENR_PWR_CLK: u32 = 0x1000_0000;
pub const RCC_APB1ENR_BKP_CLK: u32 = 0x0800_0000;
pub const RCC_APB1ENR_TIM2_CLK: u32 = 0x0000_0001;

// Clock enables, RCC_APB2ENR
pub const RCC_APB2ENR_AFIO_CLK: u32 = 0x0000_0001;
pub const RCC_APB2ENR_USART1_CLK: u32 = 0x0000_4000;

/// Value placed in backup register 10 to request the bootloader on the next
/// reset.
pub const RTC_BOOTLOADER_FLAG: u32 = 0x424C;
pub const BACKUP_FLAG_REGISTER: u8 = 10;

// LED strobe timing, milliseconds per on or off phase
pub const BLINK_FAST_MS: u32 = 60;
pub const BLINK_SLOW_MS: u32 = 250;
pub const STARTUP_BLINKS: u32 = 5;

/// Seconds to wait for a host when the board has an entry key.
pub const BOOTLOADER_WAIT_WITH_KEY: u32 = 6;
/// Seconds to wait for a host when it has none; the only way in is a reset.
pub const BOOTLOADER_WAIT_NO_KEY: u32 = 30;

// Entry key debounce
pub const BUTTON_SAMPLES: u32 = 8;
pub const BUTTON_SAMPLE_MS: u32 = 2;

/// Time between a verified download and the jump, so the host can read the
/// final status.
pub const MANIFEST_GRACE_MS: u32 = 500;

// USB identity (DONT CHANGE)
pub const VEND_ID0: u8 = 0x62;
pub const VEND_ID1: u8 = 0x6B;
pub const PROD_ID0: u8 = 0x00;
pub const PROD_ID1: u8 = 0x00;
pub const USB_VID: u16 = u16::from_le_bytes([VEND_ID0, VEND_ID1]);
pub const USB_PID: u16 = u16::from_le_bytes([PROD_ID0, PROD_ID1]);

/// Largest DFU_DNLOAD payload (wTransferSize).
pub const TRANSFER_SIZE: usize = 256;

/// Pull resistor handling for the key's sense pin.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InputMode {
    /// Pull towards the released level.
    PullUpDown,
    /// Leave the pin floating, for pins with a weak external pull (BOOT1 on
    /// the Blue Pill) or an alternate function.
    Floating,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Led {
    pub pin: Pin,
    /// Level that lights the LED; boards wiring it between Vcc and the pin
    /// use `Low`.
    pub on: Level,
}

/// How a user forces the bootloader at reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKey {
    None,
    /// A dedicated button reading `pressed` while held.
    Button {
        pin: Pin,
        pressed: Level,
        input_mode: InputMode,
    },
    /// A key in a keyboard matrix. `drive` is driven high and `sense` reads
    /// high while the key is held.
    Matrix {
        drive: Pin,
        sense: Pin,
        input_mode: InputMode,
    },
}

impl EntryKey {
    /// Pin sampled for the key and the level meaning "held".
    pub fn sense(&self) -> Option<(Pin, Level)> {
        match *self {
            EntryKey::None => None,
            EntryKey::Button { pin, pressed, .. } => Some((pin, pressed)),
            EntryKey::Matrix { sense, .. } => Some((sense, Level::High)),
        }
    }

    /// Configuration for the sense pin while sampling.
    pub fn sense_mode(&self) -> PinMode {
        let (input_mode, pressed) = match *self {
            EntryKey::None => return PinMode::Floating,
            EntryKey::Button {
                input_mode, pressed, ..
            } => (input_mode, pressed),
            EntryKey::Matrix { input_mode, .. } => (input_mode, Level::High),
        };
        match (input_mode, pressed) {
            (InputMode::Floating, _) => PinMode::Floating,
            (InputMode::PullUpDown, Level::High) => PinMode::PullDown,
            (InputMode::PullUpDown, Level::Low) => PinMode::PullUp,
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, EntryKey::None)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoardConfig {
    pub name: &'static str,
    pub led: Option<Led>,
    pub entry_key: EntryKey,
    /// Seconds to wait for a transfer before booting a valid application.
    pub bootloader_wait: u32,
    /// SRAM size, bounds the initial stack pointer of a valid image.
    pub ram_size: u32,
}

const fn default_wait(key: &EntryKey) -> u32 {
    match key {
        EntryKey::None => BOOTLOADER_WAIT_NO_KEY,
        _ => BOOTLOADER_WAIT_WITH_KEY,
    }
}

const fn matrix_key(drive: Pin, sense: Pin) -> EntryKey {
    EntryKey::Matrix {
        drive,
        sense,
        input_mode: InputMode::PullUpDown,
    }
}

const RAM_20K: u32 = 20 * 1024;

impl BoardConfig {
    /// Generic STM32F103 board (Blue Pill LED on PC13, no key).
    pub const GENERIC: BoardConfig = BoardConfig {
        name: "generic",
        led: Some(Led {
            pin: Pin::new(Bank::C, 13),
            on: Level::Low,
        }),
        entry_key: EntryKey::None,
        bootloader_wait: default_wait(&EntryKey::None),
        ram_size: RAM_20K,
    };

    /// BasicPad v1, middle key of the 3x3 matrix.
    pub const BASICPAD_V1: BoardConfig = BoardConfig::keypad(
        "basicpad-v1",
        matrix_key(Pin::new(Bank::B, 10), Pin::new(Bank::A, 4)),
    );

    /// BasicPad v2, middle key of the 3x3 matrix.
    pub const BASICPAD_V2: BoardConfig = BoardConfig::keypad(
        "basicpad-v2",
        matrix_key(Pin::new(Bank::B, 12), Pin::new(Bank::A, 3)),
    );

    /// BasicPold, the backspace key.
    pub const BASICPOLD: BoardConfig = BoardConfig::keypad(
        "basicpold",
        matrix_key(Pin::new(Bank::A, 9), Pin::new(Bank::B, 1)),
    );

    const fn keypad(name: &'static str, entry_key: EntryKey) -> BoardConfig {
        BoardConfig {
            name,
            led: None,
            entry_key,
            bootloader_wait: default_wait(&entry_key),
            ram_size: RAM_20K,
        }
    }

    pub const fn with_wait(mut self, seconds: u32) -> BoardConfig {
        self.bootloader_wait = seconds;
        self
    }

    pub const fn wait_ms(&self) -> u32 {
        self.bootloader_wait * 1000
    }
}
