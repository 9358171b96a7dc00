use embedded_hal::blocking::delay::DelayMs;
use keyboot_core::{
    hal::{Bank, ClockGate, Clock, Gpio, Level, Pin, PinMode},
    transport::TickCounter,
};
use stm32f1xx_hal::pac::{self, gpioa, RCC};

/// Milliseconds since the tick timer started, bumped from the TIM2 interrupt.
pub(crate) static TICKS: TickCounter = TickCounter::new();

/// Register level access to the parts of the chip the core drives itself:
/// GPIO ports and their clocks, the tick counter and a busy wait delay.
/// Flash and backup register access live in `flash.rs` and `backup.rs`.
pub(crate) struct Stm32Board {
    sysclk_hz: u32,
}

impl Stm32Board {
    pub(crate) fn new(sysclk_hz: u32) -> Self {
        Stm32Board { sysclk_hz }
    }
}

fn port(bank: Bank) -> &'static gpioa::RegisterBlock {
    unsafe {
        match bank {
            Bank::A => &*pac::GPIOA::ptr(),
            Bank::B => &*pac::GPIOB::ptr(),
            Bank::C => &*pac::GPIOC::ptr(),
            Bank::D => &*pac::GPIOD::ptr(),
            Bank::E => &*pac::GPIOE::ptr(),
        }
    }
}

impl Gpio for Stm32Board {
    fn enable_clock(&mut self, gate: ClockGate) {
        let rcc = unsafe { &*RCC::ptr() };
        cortex_m::interrupt::free(|_| match gate {
            ClockGate::Apb1(mask) => rcc.apb1enr.modify(|r, w| unsafe { w.bits(r.bits() | mask) }),
            ClockGate::Apb2(mask) => rcc.apb2enr.modify(|r, w| unsafe { w.bits(r.bits() | mask) }),
        });
    }

    fn disable_clock(&mut self, gate: ClockGate) {
        let rcc = unsafe { &*RCC::ptr() };
        cortex_m::interrupt::free(|_| match gate {
            ClockGate::Apb1(mask) => rcc.apb1enr.modify(|r, w| unsafe { w.bits(r.bits() & !mask) }),
            ClockGate::Apb2(mask) => rcc.apb2enr.modify(|r, w| unsafe { w.bits(r.bits() & !mask) }),
        });
    }

    fn configure(&mut self, pin: Pin, mode: PinMode) {
        let gpio = port(pin.bank);
        // CNF[1:0] MODE[1:0], output at 2 MHz
        let (bits, pull) = match mode {
            PinMode::Floating => (0b0100, None),
            PinMode::PullUp => (0b1000, Some(Level::High)),
            PinMode::PullDown => (0b1000, Some(Level::Low)),
            PinMode::PushPull => (0b0010, None),
        };
        let shift = (pin.number as u32 % 8) * 4;
        cortex_m::interrupt::free(|_| {
            if pin.number < 8 {
                gpio.crl.modify(|r, w| unsafe { w.bits((r.bits() & !(0xf << shift)) | (bits << shift)) });
            } else {
                gpio.crh.modify(|r, w| unsafe { w.bits((r.bits() & !(0xf << shift)) | (bits << shift)) });
            }
        });
        // pull direction is selected through ODR
        if let Some(level) = pull {
            self.set_pin(pin, level);
        }
    }

    fn set_pin(&mut self, pin: Pin, level: Level) {
        let gpio = port(pin.bank);
        let bit = match level {
            Level::High => 1u32 << pin.number,
            Level::Low => 1u32 << (pin.number + 16),
        };
        gpio.bsrr.write(|w| unsafe { w.bits(bit) });
    }

    fn read_pin(&mut self, pin: Pin) -> Level {
        let gpio = port(pin.bank);
        Level::from(gpio.idr.read().bits() & (1u32 << pin.number) != 0)
    }
}

impl Clock for Stm32Board {
    fn now_ms(&self) -> u32 {
        TICKS.now()
    }
}

impl DelayMs<u32> for Stm32Board {
    fn delay_ms(&mut self, ms: u32) {
        // runs before the tick timer exists, so count cycles
        let per_ms = self.sysclk_hz / 1000;
        for _ in 0..ms {
            cortex_m::asm::delay(per_ms);
        }
    }
}
