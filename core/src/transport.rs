//! What passes between the USB interrupt and the main loop.
//!
//! The USB class runs in interrupt context and must not touch flash. It turns
//! DFU requests into [`TransportEvent`]s and pushes them into a bounded
//! single-producer/single-consumer queue; the main loop pops them and does
//! the slow work. The main loop reports back through [`SharedStatus`], which
//! the USB class reads when the host asks `DFU_GETSTATUS`.
//!
//! `SharedStatus` has two writers. The main loop publishes the outcome of
//! each event. The USB class publishes `Busy` when it queues a download
//! block and `Idle` when the host clears an error, so a `GETSTATUS` that
//! arrives before the main loop has run never reports the previous block's
//! result. The two never interleave: the main loop dequeues, handles and
//! publishes inside one critical section, and the USB class only writes
//! from its interrupt, which cannot run during that section.
//!
//! Ordering: the queue is lock free (`heapless::spsc`). `SharedStatus` is
//! written with `Release` and read with `Acquire`, so a status never
//! overtakes the flash work it reports on. [`TickCounter`] is a plain
//! counter and only needs `Relaxed`.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};

use crate::config::TRANSFER_SIZE;
use crate::error::BootError;

/// Queue slots; a `heapless` queue of length N holds N - 1 events.
pub const EVENT_QUEUE_LEN: usize = 4;

pub type EventQueue = Queue<TransportEvent, EVENT_QUEUE_LEN>;
pub type EventProducer<'a> = Producer<'a, TransportEvent, EVENT_QUEUE_LEN>;
pub type EventConsumer<'a> = Consumer<'a, TransportEvent, EVENT_QUEUE_LEN>;

/// A block of firmware addressed to flash.
#[derive(Clone)]
pub struct Chunk {
    pub address: u32,
    len: u16,
    data: [u8; TRANSFER_SIZE],
}

impl Chunk {
    /// `None` when `bytes` is larger than a DFU transfer.
    pub fn new(address: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() > TRANSFER_SIZE {
            return None;
        }
        let mut data = [0xFF; TRANSFER_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Chunk {
            address,
            len: bytes.len() as u16,
            data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extend with erased bytes (`0xFF`) up to a multiple of `granularity`.
    /// Used on the last block of a download, which may have any length.
    pub fn pad_to(&mut self, granularity: usize) {
        let len = self.len as usize;
        let padded = (len + granularity - 1) / granularity * granularity;
        if padded <= TRANSFER_SIZE {
            self.len = padded as u16;
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Chunk {{ address: 0x{:x}, len: {} }}", self.address, self.len)
    }
}

#[derive(Clone, Debug)]
pub enum TransportEvent {
    TransferStart,
    WriteChunk(Chunk),
    TransferComplete,
    TransferAbort,
}

/// Where the flash engine is, as seen by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    /// Events are queued or being written.
    Busy,
    /// Last request done.
    Ok,
    /// Download verified, handoff pending.
    Manifested,
    Error(BootError),
}

impl EngineStatus {
    fn encode(self) -> u8 {
        match self {
            EngineStatus::Idle => 0,
            EngineStatus::Busy => 1,
            EngineStatus::Ok => 2,
            EngineStatus::Manifested => 3,
            EngineStatus::Error(BootError::OutOfRange) => 0x10,
            EngineStatus::Error(BootError::Unaligned) => 0x11,
            EngineStatus::Error(BootError::HardwareFault) => 0x12,
            EngineStatus::Error(BootError::InvalidImage) => 0x13,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => EngineStatus::Idle,
            1 => EngineStatus::Busy,
            2 => EngineStatus::Ok,
            3 => EngineStatus::Manifested,
            0x10 => EngineStatus::Error(BootError::OutOfRange),
            0x11 => EngineStatus::Error(BootError::Unaligned),
            0x12 => EngineStatus::Error(BootError::HardwareFault),
            _ => EngineStatus::Error(BootError::InvalidImage),
        }
    }
}

/// Engine status shared between the main loop and the USB interrupt.
pub struct SharedStatus(AtomicU8);

impl SharedStatus {
    pub const fn new() -> Self {
        SharedStatus(AtomicU8::new(0))
    }

    pub fn publish(&self, status: EngineStatus) {
        self.0.store(status.encode(), Ordering::Release);
    }

    pub fn current(&self) -> EngineStatus {
        EngineStatus::decode(self.0.load(Ordering::Acquire))
    }
}

impl Default for SharedStatus {
    fn default() -> Self {
        SharedStatus::new()
    }
}

/// Millisecond tick, advanced from the timer interrupt.
pub struct TickCounter(AtomicU32);

impl TickCounter {
    pub const fn new() -> Self {
        TickCounter(AtomicU32::new(0))
    }

    pub fn tick(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn now(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        TickCounter::new()
    }
}
