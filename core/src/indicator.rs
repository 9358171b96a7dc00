//! LED strobe and the window in which a host may start a download.
//!
//! `poll` never blocks; the resident loop calls it as often as it likes and
//! it catches up from the tick counter. The wait ends three ways:
//!
//! * a transfer starts: [`WaitStatus::Cancelled`], the bootloader stays;
//! * the window runs out and a valid image exists: [`WaitStatus::TimedOut`];
//! * the window runs out without one: keep waiting, forever. Giving up is
//!   only safe when there is something to boot into.
//!
//! Ticks are compared with `wrapping_sub`, so a counter overflow during the
//! wait neither ends it early nor makes it endless.

use crate::config::{BoardConfig, Led, BLINK_FAST_MS, BLINK_SLOW_MS, STARTUP_BLINKS};
use crate::hal::{Gpio, PinMode};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Waiting,
    Cancelled,
    TimedOut,
}

pub struct Indicator {
    led: Option<Led>,
    wait_ms: u32,
    image_valid: bool,
    started_at: u32,
    last_toggle: u32,
    fast_phases_left: u32,
    lit: bool,
    window_elapsed: bool,
    cancelled: bool,
}

impl Indicator {
    pub fn new(config: &BoardConfig, image_valid: bool) -> Self {
        Indicator {
            led: config.led,
            wait_ms: config.wait_ms(),
            image_valid,
            started_at: 0,
            last_toggle: 0,
            fast_phases_left: STARTUP_BLINKS * 2,
            lit: false,
            window_elapsed: false,
            cancelled: false,
        }
    }

    /// Take the LED pin and open the wait window at `now`.
    pub fn start<G: Gpio + ?Sized>(&mut self, gpio: &mut G, now: u32) {
        self.started_at = now;
        self.last_toggle = now;
        if let Some(led) = self.led {
            gpio.enable_clock(led.pin.bank.clock());
            gpio.configure(led.pin, PinMode::PushPull);
        }
        self.show(gpio, true);
    }

    /// Stop the countdown; blinking goes on.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn set_image_valid(&mut self, valid: bool) {
        self.image_valid = valid;
    }

    pub fn poll<G: Gpio + ?Sized>(&mut self, gpio: &mut G, now: u32) -> WaitStatus {
        let period = if self.fast_phases_left > 0 {
            BLINK_FAST_MS
        } else {
            BLINK_SLOW_MS
        };
        if now.wrapping_sub(self.last_toggle) >= period {
            self.last_toggle = now;
            self.fast_phases_left = self.fast_phases_left.saturating_sub(1);
            let lit = !self.lit;
            self.show(gpio, lit);
        }

        if self.cancelled {
            return WaitStatus::Cancelled;
        }
        if now.wrapping_sub(self.started_at) >= self.wait_ms {
            self.window_elapsed = true;
        }
        if self.window_elapsed && self.image_valid {
            WaitStatus::TimedOut
        } else {
            WaitStatus::Waiting
        }
    }

    /// Leave the LED dark and its pin floating.
    pub fn release<G: Gpio + ?Sized>(&mut self, gpio: &mut G) {
        self.show(gpio, false);
        if let Some(led) = self.led {
            gpio.configure(led.pin, PinMode::Floating);
        }
    }

    fn show<G: Gpio + ?Sized>(&mut self, gpio: &mut G, lit: bool) {
        self.lit = lit;
        if let Some(led) = self.led {
            let level = if lit { led.on } else { !led.on };
            gpio.set_pin(led.pin, level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Level, Pin};
    use crate::image::FlashRegion;
    use crate::sim::SimBoard;

    fn board() -> SimBoard {
        SimBoard::new(FlashRegion::for_flash_size(64))
    }

    fn led_pin() -> Pin {
        BoardConfig::GENERIC.led.unwrap().pin
    }

    /// Poll every millisecond from `from` for `ms` milliseconds.
    fn run(ind: &mut Indicator, b: &mut SimBoard, from: u32, ms: u32) -> WaitStatus {
        let mut status = WaitStatus::Waiting;
        for t in 0..=ms {
            let now = from.wrapping_add(t);
            b.set_now(now);
            status = ind.poll(b, now);
            if status != WaitStatus::Waiting {
                break;
            }
        }
        status
    }

    #[test]
    fn five_fast_blinks_then_slow() {
        let config = BoardConfig::GENERIC;
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        ind.start(&mut b, 0);
        run(&mut ind, &mut b, 0, 2000);

        let pin = led_pin();
        // LED is active low
        let on_times: Vec<u32> = b
            .output_log
            .iter()
            .filter(|&&(_, p, l)| p == pin && l == Level::Low)
            .map(|&(t, _, _)| t)
            .collect();
        assert_eq!(&on_times[..5], &[0, 120, 240, 360, 480]);
        // slow blinking afterwards
        assert_eq!(on_times[5], 600);
        assert_eq!(on_times[6], 600 + 2 * BLINK_SLOW_MS);
    }

    #[test]
    fn times_out_with_valid_image() {
        let config = BoardConfig::GENERIC.with_wait(6);
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        ind.start(&mut b, 1000);
        assert_eq!(run(&mut ind, &mut b, 1000, 5999), WaitStatus::Waiting);
        assert_eq!(ind.poll(&mut b, 7000), WaitStatus::TimedOut);
    }

    #[test]
    fn transfer_cancels_wait() {
        let config = BoardConfig::GENERIC.with_wait(1);
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        ind.start(&mut b, 0);
        assert_eq!(ind.poll(&mut b, 500), WaitStatus::Waiting);
        ind.cancel();
        assert_eq!(ind.poll(&mut b, 501), WaitStatus::Cancelled);
        assert_eq!(ind.poll(&mut b, 100_000), WaitStatus::Cancelled);
    }

    #[test]
    fn no_image_waits_forever() {
        let config = BoardConfig::BASICPAD_V2;
        let mut b = board();
        let mut ind = Indicator::new(&config, false);
        let start = u32::MAX - 3000;
        ind.start(&mut b, start);
        // run through the window and across the tick overflow
        assert_eq!(run(&mut ind, &mut b, start, 20_000), WaitStatus::Waiting);
        for step in 0..64u32 {
            let now = start.wrapping_add(step.wrapping_mul(0x0400_0000));
            assert_eq!(ind.poll(&mut b, now), WaitStatus::Waiting);
        }
    }

    #[test]
    fn overflow_does_not_end_wait_early() {
        let config = BoardConfig::GENERIC.with_wait(6);
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        let start = u32::MAX - 100;
        ind.start(&mut b, start);
        assert_eq!(ind.poll(&mut b, 200), WaitStatus::Waiting);
        assert_eq!(ind.poll(&mut b, 5_898), WaitStatus::Waiting);
        assert_eq!(ind.poll(&mut b, 5_899), WaitStatus::TimedOut);
    }

    #[test]
    fn board_without_led_still_counts() {
        let config = BoardConfig::BASICPOLD;
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        ind.start(&mut b, 0);
        assert_eq!(run(&mut ind, &mut b, 0, 6000), WaitStatus::TimedOut);
        assert!(b.output_log.is_empty());
    }

    #[test]
    fn release_turns_led_off() {
        let config = BoardConfig::GENERIC;
        let mut b = board();
        let mut ind = Indicator::new(&config, true);
        ind.start(&mut b, 0);
        ind.release(&mut b);
        assert_eq!(b.modes.get(&led_pin()), Some(&PinMode::Floating));
    }
}
