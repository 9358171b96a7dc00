//! Flash programming engine.
//!
//! Takes the transport's write requests and turns them into page erases and
//! half-word programming inside the application region. Rules:
//!
//! * every page is erased exactly once per session, before its first write;
//! * the first page is erased before anything else is written, so an old
//!   vector table never fronts a half-new image;
//! * the first 8 bytes at `USER_CODE` (stack pointer and reset vector) are
//!   kept in RAM and written last, at `TransferComplete`. Until then the
//!   image reads as erased and the next boot stays in the bootloader, whatever
//!   happens to power or to the host.
//!
//! A bad request (`OutOfRange`, `Unaligned`) is refused on its own and the
//! session carries on. A flash fault ends the session.

use crate::config::PROGRAM_GRANULARITY;
use crate::error::BootError;
use crate::hal::FlashController;
use crate::image::{image_is_valid, FlashRegion, MAX_PAGES};
use crate::transport::TransportEvent;

/// Bytes at the start of the image held back until completion.
pub const HEAD_LEN: usize = 8;

const ALL_HEAD_BYTES: u8 = 0xFF;

/// State of one download, from `TransferStart` to completion or abort.
#[derive(Clone, Debug)]
pub struct TransferSession {
    erased: [u32; MAX_PAGES / 32],
    bytes_received: u32,
    head: [u8; HEAD_LEN],
    head_mask: u8,
}

impl TransferSession {
    fn new() -> Self {
        TransferSession {
            erased: [0; MAX_PAGES / 32],
            bytes_received: 0,
            head: [0xFF; HEAD_LEN],
            head_mask: 0,
        }
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    pub fn is_erased(&self, page: usize) -> bool {
        self.erased[page / 32] & (1 << (page % 32)) != 0
    }

    fn mark_erased(&mut self, page: usize) {
        self.erased[page / 32] |= 1 << (page % 32);
    }

    fn head_complete(&self) -> bool {
        self.head_mask == ALL_HEAD_BYTES
    }
}

/// What an event did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Started,
    Written,
    /// Download finished and the image checks out.
    Manifested,
    Aborted,
}

pub struct Programmer {
    region: FlashRegion,
    ram_size: u32,
    session: Option<TransferSession>,
}

impl Programmer {
    pub fn new(region: FlashRegion, ram_size: u32) -> Self {
        Programmer {
            region,
            ram_size,
            session: None,
        }
    }

    pub fn region(&self) -> &FlashRegion {
        &self.region
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn handle<F: FlashController + ?Sized>(
        &mut self,
        flash: &mut F,
        event: &TransportEvent,
    ) -> Result<Progress, BootError> {
        match event {
            TransportEvent::TransferStart => {
                self.start(flash);
                Ok(Progress::Started)
            }
            TransportEvent::WriteChunk(chunk) => {
                self.write(flash, chunk.address, chunk.bytes())?;
                Ok(Progress::Written)
            }
            TransportEvent::TransferComplete => {
                self.complete(flash)?;
                Ok(Progress::Manifested)
            }
            TransportEvent::TransferAbort => {
                self.abort(flash);
                Ok(Progress::Aborted)
            }
        }
    }

    /// Open a session. An open session is thrown away and started over, so
    /// its pages get erased again on their next write.
    pub fn start<F: FlashController + ?Sized>(&mut self, flash: &mut F) {
        flash.unlock();
        self.session = Some(TransferSession::new());
    }

    pub fn abort<F: FlashController + ?Sized>(&mut self, flash: &mut F) {
        if self.session.take().is_some() {
            flash.lock();
        }
    }

    /// Program `bytes` at `address`. Opens a session if none is open.
    pub fn write<F: FlashController + ?Sized>(
        &mut self,
        flash: &mut F,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), BootError> {
        if !self.region.contains(address, bytes.len()) {
            return Err(BootError::OutOfRange);
        }
        if address % PROGRAM_GRANULARITY != 0 || bytes.len() as u32 % PROGRAM_GRANULARITY != 0 {
            return Err(BootError::Unaligned);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if self.session.is_none() {
            self.start(flash);
        }

        let result = self.program(flash, address, bytes);
        if let Err(e) = result {
            if e.ends_session() {
                self.abort(flash);
            }
        }
        result
    }

    fn program<F: FlashController + ?Sized>(
        &mut self,
        flash: &mut F,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), BootError> {
        let region = self.region;
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Err(BootError::HardwareFault),
        };

        // the old vector table goes first
        ensure_erased(flash, &region, session, 0)?;

        let head_end = region.start() + HEAD_LEN as u32;
        let mut address = address;
        let mut rest = bytes;
        if address < head_end {
            let offset = (address - region.start()) as usize;
            let n = rest.len().min(HEAD_LEN - offset);
            session.head[offset..offset + n].copy_from_slice(&rest[..n]);
            for i in offset..offset + n {
                session.head_mask |= 1 << i;
            }
            address += n as u32;
            rest = &rest[n..];
        }

        while !rest.is_empty() {
            let page = region.page_index(address);
            let page_end = region.page_base(page + 1);
            let n = rest.len().min((page_end - address) as usize);
            ensure_erased(flash, &region, session, page)?;
            flash.write(address, &rest[..n])?;
            address += n as u32;
            rest = &rest[n..];
        }

        session.bytes_received += bytes.len() as u32;
        Ok(())
    }

    /// Finish the download: write the held back vector table and check the
    /// image. The session ends either way.
    pub fn complete<F: FlashController + ?Sized>(&mut self, flash: &mut F) -> Result<(), BootError> {
        let session = match self.session.take() {
            Some(s) => s,
            None => {
                return if image_is_valid(flash, &self.region, self.ram_size) {
                    Ok(())
                } else {
                    Err(BootError::InvalidImage)
                };
            }
        };

        let result = self.finish(flash, &session);
        flash.lock();
        result
    }

    fn finish<F: FlashController + ?Sized>(
        &self,
        flash: &mut F,
        session: &TransferSession,
    ) -> Result<(), BootError> {
        if !session.head_complete() {
            return Err(BootError::InvalidImage);
        }
        flash.write(self.region.start(), &session.head)?;
        if image_is_valid(flash, &self.region, self.ram_size) {
            Ok(())
        } else {
            Err(BootError::InvalidImage)
        }
    }
}

fn ensure_erased<F: FlashController + ?Sized>(
    flash: &mut F,
    region: &FlashRegion,
    session: &mut TransferSession,
    page: usize,
) -> Result<(), BootError> {
    if !session.is_erased(page) {
        flash.erase_page(region.page_base(page))?;
        session.mark_erased(page);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardConfig, USER_CODE};
    use crate::entry::{decide, Decision, EntryReason};
    use crate::sim::SimBoard;
    use crate::transport::Chunk;

    const RAM: u32 = 20 * 1024;

    /// Firmware image with a valid vector table followed by a byte pattern.
    fn image(len: usize) -> Vec<u8> {
        let mut v: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        v[..4].copy_from_slice(&0x2000_5000u32.to_le_bytes());
        v[4..8].copy_from_slice(&(USER_CODE + 0x101).to_le_bytes());
        v
    }

    fn large_pages() -> (SimBoard, Programmer) {
        let region = FlashRegion::for_flash_size(256);
        (SimBoard::new(region), Programmer::new(region, RAM))
    }

    fn small_pages() -> (SimBoard, Programmer) {
        let region = FlashRegion::for_flash_size(64);
        (SimBoard::new(region), Programmer::new(region, RAM))
    }

    fn chunk(address: u32, bytes: &[u8]) -> TransportEvent {
        TransportEvent::WriteChunk(Chunk::new(address, bytes).unwrap())
    }

    /// Feed `img` as DFU sized blocks.
    fn download(b: &mut SimBoard, p: &mut Programmer, img: &[u8]) -> Result<(), BootError> {
        p.handle(b, &TransportEvent::TransferStart)?;
        for (i, block) in img.chunks(256).enumerate() {
            p.handle(b, &chunk(USER_CODE + (i * 256) as u32, block))?;
        }
        p.handle(b, &TransportEvent::TransferComplete).map(|_| ())
    }

    #[test]
    fn two_pages_two_erases() {
        let (mut b, mut p) = large_pages();
        let img = image(4096);
        assert_eq!(p.handle(&mut b, &TransportEvent::TransferStart), Ok(Progress::Started));
        assert_eq!(p.write(&mut b, USER_CODE, &img[..2048]), Ok(()));
        assert_eq!(p.write(&mut b, USER_CODE + 2048, &img[2048..]), Ok(()));
        assert_eq!(p.session().unwrap().bytes_received(), 4096);
        assert_eq!(
            p.handle(&mut b, &TransportEvent::TransferComplete),
            Ok(Progress::Manifested)
        );

        assert_eq!(b.erases, vec![USER_CODE, USER_CODE + 0x800]);
        assert_eq!(b.bytes(USER_CODE, 4096), &img[..]);
        assert!(!p.is_active());
        assert!(!b.unlocked);

        let region = b.region();
        assert_eq!(
            decide(&mut b, &BoardConfig::GENERIC, &region),
            Decision::RunApplication
        );
    }

    #[test]
    fn small_pages_erase_per_page() {
        let (mut b, mut p) = small_pages();
        let img = image(4096);
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &img[..2048]).unwrap();
        p.write(&mut b, USER_CODE + 2048, &img[2048..]).unwrap();
        p.complete(&mut b).unwrap();
        assert_eq!(b.erases.len(), 4);
        for page in 0..4 {
            assert_eq!(b.erase_count(USER_CODE + page * 0x400), 1);
        }
    }

    #[test]
    fn first_write_clears_vector_table_page() {
        let (mut b, mut p) = small_pages();
        b.load_vector_table(0x2000_5000, USER_CODE + 0x101);
        p.start(&mut b);
        p.write(&mut b, USER_CODE + 3 * 0x400, &[0x11; 64]).unwrap();
        assert_eq!(b.erases, vec![USER_CODE, USER_CODE + 3 * 0x400]);
        assert_eq!(b.bytes(USER_CODE, 8), &[0xFF; 8]);
        assert!(p.session().unwrap().is_erased(0));

        p.write(&mut b, USER_CODE + 3 * 0x400 + 64, &[0x22; 64]).unwrap();
        assert_eq!(b.erase_count(USER_CODE), 1);
    }

    #[test]
    fn many_blocks_erase_each_page_once() {
        let (mut b, mut p) = small_pages();
        let img = image(5000);
        download(&mut b, &mut p, &img).unwrap();
        // 5000 bytes over 1 KiB pages
        assert_eq!(b.erases.len(), 5);
        assert_eq!(b.bytes(USER_CODE, 5000), &img[..]);
    }

    #[test]
    fn block_across_page_boundary() {
        let (mut b, mut p) = large_pages();
        p.start(&mut b);
        let data = [0x5Au8; 256];
        p.write(&mut b, USER_CODE + 0x800 - 128, &data).unwrap();
        assert_eq!(b.erases, vec![USER_CODE, USER_CODE + 0x800]);
        assert_eq!(b.writes, vec![(USER_CODE + 0x780, 128), (USER_CODE + 0x800, 128)]);
        assert!(p.session().unwrap().is_erased(1));
    }

    #[test]
    fn vector_table_written_last() {
        let (mut b, mut p) = large_pages();
        let img = image(512);
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &img).unwrap();
        // everything but the head is in place
        assert_eq!(b.read_word(USER_CODE), 0xFFFF_FFFF);
        assert_eq!(b.read_word(USER_CODE + 4), 0xFFFF_FFFF);
        assert_eq!(b.bytes(USER_CODE + 8, 504), &img[8..]);

        p.complete(&mut b).unwrap();
        assert_eq!(b.writes.last(), Some(&(USER_CODE, HEAD_LEN)));
        assert_eq!(b.bytes(USER_CODE, 8), &img[..8]);
    }

    #[test]
    fn head_split_over_requests() {
        let (mut b, mut p) = large_pages();
        let img = image(64);
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &img[..2]).unwrap();
        p.write(&mut b, USER_CODE + 2, &img[2..6]).unwrap();
        p.write(&mut b, USER_CODE + 6, &img[6..]).unwrap();
        p.complete(&mut b).unwrap();
        assert_eq!(b.bytes(USER_CODE, 64), &img[..]);
        assert_eq!(b.erases.len(), 1);
    }

    #[test]
    fn out_of_range_leaves_flash_alone() {
        let (mut b, mut p) = small_pages();
        p.start(&mut b);
        let end = b.region().end();
        let data = [0u8; 64];
        assert_eq!(p.write(&mut b, 0x0800_0000, &data), Err(BootError::OutOfRange));
        assert_eq!(p.write(&mut b, USER_CODE - 32, &data), Err(BootError::OutOfRange));
        assert_eq!(p.write(&mut b, end - 32, &data), Err(BootError::OutOfRange));
        assert_eq!(p.write(&mut b, end, &data), Err(BootError::OutOfRange));
        assert_eq!(p.write(&mut b, 0x2000_0000, &data), Err(BootError::OutOfRange));
        assert!(b.erases.is_empty());
        assert!(b.writes.is_empty());
        assert!(b.bytes(0x0800_0000, (end - 0x0800_0000) as usize).iter().all(|&x| x == 0xFF));

        // session still usable
        assert!(p.is_active());
        assert_eq!(p.write(&mut b, USER_CODE + 16, &data), Ok(()));
    }

    #[test]
    fn unaligned_requests_refused() {
        let (mut b, mut p) = small_pages();
        p.start(&mut b);
        assert_eq!(p.write(&mut b, USER_CODE + 9, &[0; 4]), Err(BootError::Unaligned));
        assert_eq!(p.write(&mut b, USER_CODE + 8, &[0; 3]), Err(BootError::Unaligned));
        assert!(b.erases.is_empty());
        assert!(p.is_active());
    }

    #[test]
    fn second_erase_failure_is_a_hardware_fault() {
        let (mut b, mut p) = large_pages();
        b.fail_erase_call = Some(2);
        let img = image(4096);
        p.handle(&mut b, &TransportEvent::TransferStart).unwrap();
        assert_eq!(p.write(&mut b, USER_CODE, &img[..2048]), Ok(()));
        assert_eq!(
            p.handle(&mut b, &chunk(USER_CODE + 2048, &img[2048..2304])),
            Err(BootError::HardwareFault)
        );
        assert!(!p.is_active());
        assert!(!b.unlocked);

        // the board comes back up in the bootloader
        b.fail_erase_call = None;
        let region = b.region();
        assert_eq!(
            decide(&mut b, &BoardConfig::GENERIC, &region),
            Decision::RunBootloader(EntryReason::NoValidImage)
        );
    }

    #[test]
    fn write_failure_is_a_hardware_fault() {
        let (mut b, mut p) = small_pages();
        b.fail_write_at = Some(USER_CODE + 0x500);
        assert_eq!(download(&mut b, &mut p, &image(4096)), Err(BootError::HardwareFault));
        assert!(!image_is_valid(&b, &b.region(), RAM));
    }

    #[test]
    fn restart_erases_again() {
        let (mut b, mut p) = large_pages();
        let img = image(1024);
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &img).unwrap();
        p.handle(&mut b, &TransportEvent::TransferStart).unwrap();
        p.write(&mut b, USER_CODE, &img).unwrap();
        p.complete(&mut b).unwrap();
        assert_eq!(b.erase_count(USER_CODE), 2);
    }

    #[test]
    fn abort_drops_session() {
        let (mut b, mut p) = large_pages();
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &image(256)).unwrap();
        assert_eq!(p.handle(&mut b, &TransportEvent::TransferAbort), Ok(Progress::Aborted));
        assert!(!p.is_active());
        assert!(!b.unlocked);
        assert!(!image_is_valid(&b, &b.region(), RAM));
    }

    #[test]
    fn missing_head_is_invalid() {
        let (mut b, mut p) = large_pages();
        p.start(&mut b);
        p.write(&mut b, USER_CODE + 8, &[0u8; 248]).unwrap();
        assert_eq!(p.complete(&mut b), Err(BootError::InvalidImage));
        assert!(!p.is_active());
    }

    #[test]
    fn garbage_vector_table_is_invalid() {
        let (mut b, mut p) = large_pages();
        p.start(&mut b);
        p.write(&mut b, USER_CODE, &[0u8; 256]).unwrap();
        assert_eq!(p.complete(&mut b), Err(BootError::InvalidImage));
    }

    #[test]
    fn write_without_start_opens_session() {
        let (mut b, mut p) = large_pages();
        let img = image(256);
        assert_eq!(p.write(&mut b, USER_CODE, &img), Ok(()));
        assert!(p.is_active());
        assert_eq!(p.complete(&mut b), Ok(()));
    }

    #[test]
    fn complete_without_session_checks_existing_image() {
        let (mut b, mut p) = large_pages();
        assert_eq!(p.complete(&mut b), Err(BootError::InvalidImage));
        b.load_vector_table(0x2000_4000, USER_CODE + 0x41);
        assert_eq!(p.complete(&mut b), Ok(()));
        assert!(b.erases.is_empty());
    }
}
