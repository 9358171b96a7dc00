//! The main loop while the bootloader is resident.
//!
//! One [`Resident::poll`] handles at most one transport event, so a single
//! call never does more than a chunk's worth of flash work, then advances the
//! LED and the wait window. It returns `Some` once it is time to leave.

use core::fmt;

use crate::config::{BoardConfig, MANIFEST_GRACE_MS};
use crate::hal::Board;
use crate::image::FlashRegion;
use crate::indicator::{Indicator, WaitStatus};
use crate::programmer::{Programmer, Progress};
use crate::transport::{EngineStatus, EventConsumer, SharedStatus, TransportEvent};

/// Why the resident loop gave up control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Handoff {
    /// No transfer within the wait window, existing image boots.
    Timeout,
    /// A download was verified.
    Manifested,
}

impl fmt::Display for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Handoff::Timeout => f.write_str("Timeout: starting User Code"),
            Handoff::Manifested => f.write_str("Download verified: starting User Code"),
        }
    }
}

pub struct Resident<'a> {
    programmer: Programmer,
    indicator: Indicator,
    status: &'a SharedStatus,
    manifested_at: Option<u32>,
}

impl<'a> Resident<'a> {
    pub fn new(
        config: &BoardConfig,
        region: FlashRegion,
        image_valid: bool,
        status: &'a SharedStatus,
    ) -> Self {
        Resident {
            programmer: Programmer::new(region, config.ram_size),
            indicator: Indicator::new(config, image_valid),
            status,
            manifested_at: None,
        }
    }

    pub fn start<B: Board + ?Sized>(&mut self, board: &mut B) {
        self.status.publish(EngineStatus::Idle);
        let now = board.now_ms();
        self.indicator.start(board, now);
    }

    pub fn programmer(&self) -> &Programmer {
        &self.programmer
    }

    pub fn poll<B: Board + ?Sized>(
        &mut self,
        board: &mut B,
        events: &mut EventConsumer<'_>,
    ) -> Option<Handoff> {
        if let Some(event) = events.dequeue() {
            let more = events.ready();
            self.dispatch(board, &event, more);
        }

        let now = board.now_ms();
        if self.indicator.poll(board, now) == WaitStatus::TimedOut {
            return Some(Handoff::Timeout);
        }
        match self.manifested_at {
            Some(at) if now.wrapping_sub(at) >= MANIFEST_GRACE_MS => Some(Handoff::Manifested),
            _ => None,
        }
    }

    fn dispatch<B: Board + ?Sized>(&mut self, board: &mut B, event: &TransportEvent, more: bool) {
        self.manifested_at = None;

        let result = self.programmer.handle(board, event);
        // only a transfer that actually opened a session holds the bootloader
        if self.programmer.is_active() || result == Ok(Progress::Manifested) {
            self.indicator.cancel();
        }

        let status = match result {
            Ok(Progress::Manifested) => {
                self.manifested_at = Some(board.now_ms());
                EngineStatus::Manifested
            }
            Ok(Progress::Aborted) => EngineStatus::Idle,
            Ok(_) if more => EngineStatus::Busy,
            Ok(_) => EngineStatus::Ok,
            Err(e) => EngineStatus::Error(e),
        };
        self.status.publish(status);
    }

    /// Stay resident for good, e.g. after the handoff itself was refused.
    pub fn stay(&mut self) {
        self.indicator.set_image_valid(false);
        self.manifested_at = None;
    }

    /// Hand the LED back before leaving.
    pub fn release<B: Board + ?Sized>(&mut self, board: &mut B) {
        self.indicator.release(board);
    }
}
