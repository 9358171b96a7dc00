use keyboot_core::BoardConfig;
#[cfg(feature = "debug-log")]
use stm32f1xx_hal::{
    prelude::*,
    serial::Config,
};

// USB constants
pub(crate) const USB_MANUFACTURER: &'static str = "aika";
pub(crate) const USB_PRODUCT: &'static str = concat!("keyboot ", env!("CARGO_PKG_VERSION"));
pub(crate) const USB_SERIAL_NO: &'static str = "8971842209015648";

// Alternate Setting 0 name string
pub(crate) const DFU_AL0: &'static str = concat!("keyboot ", env!("CARGO_PKG_VERSION"), " @Internal Flash");

// Board selection, most specific feature wins over the default
#[cfg(feature = "board-basicpad-v1")]
pub(crate) const BOARD: BoardConfig = BoardConfig::BASICPAD_V1;

#[cfg(all(feature = "board-basicpad-v2", not(feature = "board-basicpad-v1")))]
pub(crate) const BOARD: BoardConfig = BoardConfig::BASICPAD_V2;

#[cfg(all(
    feature = "board-basicpold",
    not(any(feature = "board-basicpad-v1", feature = "board-basicpad-v2"))
))]
pub(crate) const BOARD: BoardConfig = BoardConfig::BASICPOLD;

#[cfg(not(any(
    feature = "board-basicpad-v1",
    feature = "board-basicpad-v2",
    feature = "board-basicpold"
)))]
pub(crate) const BOARD: BoardConfig = BoardConfig::GENERIC;

#[cfg(feature = "debug-log")]
pub(crate) fn usart1_config() -> Config {
    Config::default().baudrate(9_600.bps())
}
