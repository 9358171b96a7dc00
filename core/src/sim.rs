//! Simulated STM32F103 board for host tests.
//!
//! Flash behaves like the real part where it matters: erase sets a page to
//! `0xFF`, and programming a half-word that is not erased fails with
//! `ProgrammingError`. Faults can be injected per erase or per write, and
//! every erase and write is counted.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};

use embedded_hal::blocking::delay::DelayMs;

use crate::config::FLASH_BASE;
use crate::error::FlashError;
use crate::hal::{BackupRegisters, ClockGate, Clock, FlashController, Gpio, Level, Pin, PinMode};
use crate::image::FlashRegion;

pub struct SimBoard {
    region: FlashRegion,
    flash: Vec<u8>,
    pub erases: Vec<u32>,
    pub writes: Vec<(u32, usize)>,
    /// Fail the n-th erase call (1 based).
    pub fail_erase_call: Option<usize>,
    /// Fail any write touching this address.
    pub fail_write_at: Option<u32>,
    pub unlocked: bool,

    backup: [u32; 43],

    pub apb1: u32,
    pub apb2: u32,
    pub modes: HashMap<Pin, PinMode>,
    pub outputs: HashMap<Pin, Level>,
    pub output_log: Vec<(u32, Pin, Level)>,
    inputs: HashMap<Pin, Level>,
    scripted: HashMap<Pin, VecDeque<Level>>,
    /// (drive, sense) pairs of held matrix keys.
    matrix: Vec<(Pin, Pin)>,
    pub reads: usize,

    now: Cell<u32>,
}

impl SimBoard {
    pub fn new(region: FlashRegion) -> Self {
        SimBoard {
            region,
            flash: vec![0xFF; (region.end() - FLASH_BASE) as usize],
            erases: Vec::new(),
            writes: Vec::new(),
            fail_erase_call: None,
            fail_write_at: None,
            unlocked: false,
            backup: [0; 43],
            apb1: 0,
            apb2: 0,
            modes: HashMap::new(),
            outputs: HashMap::new(),
            output_log: Vec::new(),
            inputs: HashMap::new(),
            scripted: HashMap::new(),
            matrix: Vec::new(),
            reads: 0,
            now: Cell::new(0),
        }
    }

    pub fn region(&self) -> FlashRegion {
        self.region
    }

    /// Write bytes straight into flash, bypassing the controller.
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let at = (address - FLASH_BASE) as usize;
        self.flash[at..at + data.len()].copy_from_slice(data);
    }

    pub fn load_vector_table(&mut self, sp: u32, reset: u32) {
        let start = self.region.start();
        self.load(start, &sp.to_le_bytes());
        self.load(start + 4, &reset.to_le_bytes());
    }

    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let at = (address - FLASH_BASE) as usize;
        &self.flash[at..at + len]
    }

    pub fn erase_count(&self, page: u32) -> usize {
        self.erases.iter().filter(|&&a| a == page).count()
    }

    pub fn set_input(&mut self, pin: Pin, level: Level) {
        self.inputs.insert(pin, level);
    }

    /// Levels returned by successive reads of `pin`, before falling back to
    /// the static input level.
    pub fn script_input(&mut self, pin: Pin, levels: &[Level]) {
        self.scripted
            .entry(pin)
            .or_default()
            .extend(levels.iter().copied());
    }

    pub fn hold_matrix_key(&mut self, drive: Pin, sense: Pin) {
        self.matrix.push((drive, sense));
    }

    pub fn backup_reg(&self, index: u8) -> u32 {
        self.backup[index as usize]
    }

    pub fn set_now(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl FlashController for SimBoard {
    fn unlock(&mut self) {
        self.unlocked = true;
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        assert!(self.unlocked, "erase with locked flash");
        assert_eq!((address - self.region.start()) % self.region.page_size(), 0);
        self.erases.push(address);
        if self.fail_erase_call == Some(self.erases.len()) {
            return Err(FlashError::WriteProtected);
        }
        let at = (address - FLASH_BASE) as usize;
        let size = self.region.page_size() as usize;
        for b in &mut self.flash[at..at + size] {
            *b = 0xFF;
        }
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        assert!(self.unlocked, "write with locked flash");
        assert_eq!(address % 2, 0);
        assert_eq!(data.len() % 2, 0);
        if let Some(bad) = self.fail_write_at {
            if bad >= address && bad < address + data.len() as u32 {
                return Err(FlashError::VerifyFailed);
            }
        }
        let at = (address - FLASH_BASE) as usize;
        let target = &mut self.flash[at..at + data.len()];
        if target.iter().any(|&b| b != 0xFF) {
            return Err(FlashError::ProgrammingError);
        }
        target.copy_from_slice(data);
        self.writes.push((address, data.len()));
        Ok(())
    }

    fn read_word(&self, address: u32) -> u32 {
        let b = self.bytes(address, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl BackupRegisters for SimBoard {
    fn read_backup_reg(&mut self, index: u8) -> u32 {
        self.backup[index as usize]
    }

    fn write_backup_reg(&mut self, index: u8, value: u32) {
        // data registers are 16 bits wide
        self.backup[index as usize] = value & 0xFFFF;
    }
}

impl Gpio for SimBoard {
    fn enable_clock(&mut self, gate: ClockGate) {
        match gate {
            ClockGate::Apb1(m) => self.apb1 |= m,
            ClockGate::Apb2(m) => self.apb2 |= m,
        }
    }

    fn disable_clock(&mut self, gate: ClockGate) {
        match gate {
            ClockGate::Apb1(m) => self.apb1 &= !m,
            ClockGate::Apb2(m) => self.apb2 &= !m,
        }
    }

    fn configure(&mut self, pin: Pin, mode: PinMode) {
        self.modes.insert(pin, mode);
        if mode != PinMode::PushPull {
            self.outputs.remove(&pin);
        }
    }

    fn set_pin(&mut self, pin: Pin, level: Level) {
        self.outputs.insert(pin, level);
        self.output_log.push((self.now.get(), pin, level));
    }

    fn read_pin(&mut self, pin: Pin) -> Level {
        self.reads += 1;
        if let Some(level) = self.scripted.get_mut(&pin).and_then(|q| q.pop_front()) {
            return level;
        }
        let driven = self.matrix.iter().any(|&(drive, sense)| {
            sense == pin
                && self.modes.get(&drive) == Some(&PinMode::PushPull)
                && self.outputs.get(&drive) == Some(&Level::High)
        });
        if driven {
            return Level::High;
        }
        if let Some(&level) = self.inputs.get(&pin) {
            return level;
        }
        match self.modes.get(&pin) {
            Some(PinMode::PullUp) => Level::High,
            _ => Level::Low,
        }
    }
}

impl Clock for SimBoard {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}

impl DelayMs<u32> for SimBoard {
    fn delay_ms(&mut self, ms: u32) {
        self.advance(ms);
    }
}
