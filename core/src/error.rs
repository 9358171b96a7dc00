use core::fmt;

/// Why a request or a boot path did not go ahead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootError {
    /// Write request outside the application region. The session survives.
    OutOfRange,
    /// Write request not aligned to the program granularity. The session
    /// survives.
    Unaligned,
    /// The flash controller failed an erase or a write. The session is gone.
    HardwareFault,
    /// The vector table at `USER_CODE` does not describe a runnable image.
    InvalidImage,
}

impl BootError {
    /// Errors after which the current transfer cannot continue.
    pub fn ends_session(self) -> bool {
        matches!(self, BootError::HardwareFault | BootError::InvalidImage)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            BootError::OutOfRange => "address out of range",
            BootError::Unaligned => "unaligned write",
            BootError::HardwareFault => "flash hardware fault",
            BootError::InvalidImage => "invalid image",
        };
        f.write_str(s)
    }
}

/// Error reported by a [`FlashController`](crate::hal::FlashController).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// Controller stayed busy.
    Busy,
    /// `WRPRTERR`: the page is write protected.
    WriteProtected,
    /// `PGERR`: programming a location that was not erased.
    ProgrammingError,
    /// Read back differs from what was written.
    VerifyFailed,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FlashError::Busy => "busy",
            FlashError::WriteProtected => "write protected",
            FlashError::ProgrammingError => "programming error",
            FlashError::VerifyFailed => "verify failed",
        };
        f.write_str(s)
    }
}

impl From<FlashError> for BootError {
    fn from(_: FlashError) -> Self {
        BootError::HardwareFault
    }
}
