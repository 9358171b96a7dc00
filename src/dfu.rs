use usb_device::{
    class_prelude::*,
    Result,
};

use core::marker::PhantomData;

use keyboot_core::{
    config::{PROGRAM_GRANULARITY, TRANSFER_SIZE, USER_CODE},
    transport::{Chunk, EngineStatus, EventProducer, SharedStatus, TransportEvent},
    BootError,
};

use crate::config::DFU_AL0;

const CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;
const SUBCLASS_DFU: u8 = 0x01;
const PROTOCOL_DFU_MODE: u8 = 0x02;
const DESC_DFU_FUNCTIONAL: u8 = 0x21;

// bwPollTimeout handed to the host while flash work is pending
const POLL_BUSY_MS: u32 = 50;

#[allow(unused)]
pub(crate) mod dfu_request {
    pub const DFU_DETACH: u8 = 0; // proto 1
    pub const DFU_DNLOAD: u8 = 1; // proto 2
    pub const DFU_UPLOAD: u8 = 2; // proto 2
    pub const DFU_GETSTATUS: u8 = 3; // proto 1/2
    pub const DFU_CLRSTATUS: u8 = 4; // proto 2
    pub const DFU_GETSTATE: u8 = 5; // proto 1/2
    pub const DFU_ABORT: u8 = 6; // proto 2
}

#[allow(unused)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DfuState {
    AppIdle,
    AppDetach,

    DfuIdle,
    DfuDnloadSync,
    DfuDnloadBusy,
    DfuDnloadIdle,
    DfuManifestSync,
    DfuManifest,
    DfuManifestWaitReset,
    DfuUploadIdle,
    DfuError,
}

#[allow(unused)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DfuDeviceStatus {
    Ok, // No error condition is present.
    ErrTarget, // File is not targeted for use by this device.
    ErrFile, // File is for this device but fails some vendor-specific verification test.
    ErrWrite, // Device is unable to write memory.
    ErrErase, // Memory erase function failed.
    ErrCheckErased, // Memory erase check failed
    ErrProg, // Program memory function failed.
    ErrVerify, // Programmed memory failed verification.
    ErrAddress, // Cannot program memory due to received address that is out of range.
    ErrNotDone, // Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrFirmware, // Device’s firmware is corrupt.  It cannot return to run-time (non-DFU) operations.
    ErrVendor, // iString indicates a vendor-specific error.
    ErrUsbR, // Device detected unexpected USB reset signaling.
    ErrPoR, // Device detected unexpected power on reset.
    ErrUnknown, // Something went wrong, but the device does not know what it was.
    ErrStaledPkt, // Device stalled an unexpected request.
}

impl From<BootError> for DfuDeviceStatus {
    fn from(e: BootError) -> Self {
        match e {
            BootError::OutOfRange => DfuDeviceStatus::ErrAddress,
            BootError::Unaligned => DfuDeviceStatus::ErrAddress,
            BootError::HardwareFault => DfuDeviceStatus::ErrWrite,
            BootError::InvalidImage => DfuDeviceStatus::ErrFirmware,
        }
    }
}

/// DFU 1.1 interface in DFU mode. Runs in the USB interrupt and never
/// touches flash: downloads become [`TransportEvent`]s for the main loop,
/// whose progress comes back through `engine`.
pub struct Dfu<'a, B: UsbBus> {
    woosh: PhantomData<B>,
    comm_if: InterfaceNumber,
    def_str: StringIndex,
    download_capable: bool,
    state: DfuState,
    status: DfuDeviceStatus,
    events: EventProducer<'a>,
    engine: &'a SharedStatus,
    // flash address of the next block
    next_address: u32,
}

impl<'a, B: UsbBus> Dfu<'a, B> {
    pub fn new(
        alloc: &UsbBusAllocator<B>,
        download_capable: bool,
        events: EventProducer<'a>,
        engine: &'a SharedStatus,
    ) -> Dfu<'a, B> {
        Dfu {
            woosh: PhantomData,
            comm_if: alloc.interface(),
            def_str: alloc.string(),
            download_capable: download_capable,
            state: DfuState::DfuIdle,
            status: DfuDeviceStatus::Ok,
            events: events,
            engine: engine,
            next_address: USER_CODE,
        }
    }

    fn enqueue(&mut self, event: TransportEvent) -> bool {
        match self.events.enqueue(event) {
            Ok(()) => true,
            Err(_) => {
                log!("Event queue full in state {:?}\r\n", self.state);
                false
            }
        }
    }

    fn fail(&mut self, status: DfuDeviceStatus) {
        self.state = DfuState::DfuError;
        self.status = status;
    }

    fn download(&mut self, data: &[u8]) -> bool {
        let starting = self.state == DfuState::DfuIdle;
        if starting {
            self.next_address = USER_CODE;
        }

        let mut chunk = match Chunk::new(self.next_address, data) {
            Some(chunk) => chunk,
            None => {
                self.fail(DfuDeviceStatus::ErrUnknown);
                return false;
            }
        };
        // the last block of an image may be odd sized
        chunk.pad_to(PROGRAM_GRANULARITY as usize);

        self.engine.publish(EngineStatus::Busy);
        if starting && !self.enqueue(TransportEvent::TransferStart) {
            self.fail(DfuDeviceStatus::ErrUnknown);
            return false;
        }
        if !self.enqueue(TransportEvent::WriteChunk(chunk)) {
            self.fail(DfuDeviceStatus::ErrUnknown);
            return false;
        }
        self.next_address = self.next_address.wrapping_add(data.len() as u32);
        self.state = DfuState::DfuDnloadSync;
        true
    }

    /// Fold the main loop's progress into the DFU state machine, returning
    /// the poll timeout to report.
    fn sync_engine(&mut self) -> u32 {
        let engine = self.engine.current();
        match (self.state, engine) {
            (_, EngineStatus::Error(e)) if self.state != DfuState::DfuError
                && self.state != DfuState::DfuIdle => {
                log!("Download failed: {}\r\n", e);
                self.fail(DfuDeviceStatus::from(e));
                0
            },
            (DfuState::DfuDnloadSync, EngineStatus::Busy)
            | (DfuState::DfuDnloadBusy, EngineStatus::Busy) => {
                self.state = DfuState::DfuDnloadBusy;
                POLL_BUSY_MS
            },
            (DfuState::DfuDnloadSync, _) | (DfuState::DfuDnloadBusy, _) => {
                self.state = DfuState::DfuDnloadIdle;
                0
            },
            (DfuState::DfuManifestSync, EngineStatus::Manifested)
            | (DfuState::DfuManifest, EngineStatus::Manifested) => {
                self.state = DfuState::DfuManifestWaitReset;
                0
            },
            (DfuState::DfuManifestSync, _) | (DfuState::DfuManifest, _) => {
                self.state = DfuState::DfuManifest;
                POLL_BUSY_MS
            },
            _ => 0,
        }
    }
}

impl<B:UsbBus> UsbClass<B> for Dfu<'_, B> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface_alt(self.comm_if,
                             0,
                             CLASS_APPLICATION_SPECIFIC,
                             SUBCLASS_DFU,
                             PROTOCOL_DFU_MODE,
                             Some(self.def_str))?;

        writer.write(DESC_DFU_FUNCTIONAL, &[
                     if self.download_capable { 0x01 } else { 0x00 }, //bmAttributes
                     255, 0, // wDetachTimeout
                     (TRANSFER_SIZE & 0xff) as u8,
                     ((TRANSFER_SIZE >> 8) & 0xff) as u8, // wTransferSize
                     0x10, 0x01, // bcdDFUVersion
                     ])?;
        Ok(())
    }

    fn get_string(&self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        if index == self.def_str {
            Some(DFU_AL0)
        } else {
            None
        }
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        if !(req.request_type == control::RequestType::Class
             && req.recipient == control::Recipient::Interface
             && req.index == u8::from(self.comm_if) as u16) {
            return;
        }

        match req.request {
            dfu_request::DFU_GETSTATUS if req.value == 0
                && req.length == 6 => {
                    let wait_time_ms = self.sync_engine();
                    xfer.accept_with(&[
                                     self.status as u8,
                                     (wait_time_ms & 0xff) as u8,
                                     ((wait_time_ms >> 8) & 0xff) as u8,
                                     ((wait_time_ms >> 16) & 0xff) as u8,
                                     self.state as u8,
                                     0,
                    ]).ok();
            },
            dfu_request::DFU_GETSTATE if req.value == 0
                && req.length == 1 => {
                    xfer.accept_with(&[ self.state as u8 ]).ok();
            },
            _ => {
                self.fail(DfuDeviceStatus::ErrStaledPkt);
                log!("Stalled pkt  req: {:?}\r\n", req);
                xfer.reject().ok();
            },
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        if !(req.request_type == control::RequestType::Class
             && req.recipient == control::Recipient::Interface
             && req.index == u8::from(self.comm_if) as u16) {
            return;
        }

        match req.request {
            dfu_request::DFU_DNLOAD if self.download_capable => {
                    if req.length > 0 {
                        match self.state {
                            DfuState::DfuIdle | DfuState::DfuDnloadIdle => {
                                if self.download(xfer.data()) {
                                    xfer.accept().ok();
                                } else {
                                    xfer.reject().ok();
                                }
                            },
                            _ => {xfer.reject().ok();},
                        }
                    }
                    else {
                        match self.state {
                            DfuState::DfuDnloadIdle => {
                                self.engine.publish(EngineStatus::Busy);
                                if self.enqueue(TransportEvent::TransferComplete) {
                                    self.state = DfuState::DfuManifestSync;
                                    xfer.accept().ok();
                                } else {
                                    self.fail(DfuDeviceStatus::ErrUnknown);
                                    xfer.reject().ok();
                                }
                            },
                            _ => {
                                self.fail(DfuDeviceStatus::ErrNotDone);
                                xfer.reject().ok();
                            },
                        }
                    }
            },
            dfu_request::DFU_CLRSTATUS if req.value == 0
                && req.length == 0 => {
                    match self.state {
                        DfuState::DfuError => {
                            self.state = DfuState::DfuIdle;
                            self.status = DfuDeviceStatus::Ok;
                            self.engine.publish(EngineStatus::Idle);
                            xfer.accept().ok();
                        },
                        _ => {xfer.reject().ok();},
                    }
            },
            dfu_request::DFU_ABORT if req.value == 0
                && req.length == 0 => {
                    match self.state {
                        DfuState::DfuIdle => {
                            self.status = DfuDeviceStatus::Ok;
                            xfer.accept().ok();
                        },
                        DfuState::DfuDnloadIdle | DfuState::DfuManifestWaitReset => {
                            self.enqueue(TransportEvent::TransferAbort);
                            self.state = DfuState::DfuIdle;
                            self.status = DfuDeviceStatus::Ok;
                            xfer.accept().ok();
                        },
                        _ => {xfer.reject().ok();}
                    }
            },
            _ => {
                self.fail(DfuDeviceStatus::ErrStaledPkt);
                xfer.reject().ok();
            },
        }
    }
}
