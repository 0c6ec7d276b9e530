// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::panic::Location;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use heapless::Vec;

/// Number of abnormal flash errors kept for diagnostics.
pub const ERROR_LOG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashOp {
    Read,
    Write,
    Erase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    NotAligned,
    OutOfBounds,
    Other,
}

impl From<NorFlashErrorKind> for Fault {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => Self::NotAligned,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => Self::Other,
        }
    }
}

/// A failed flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashError {
    pub op: FlashOp,
    pub address: u32,
    pub fault: Fault,
    /// Source line of the failing call.
    pub line: u32,
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "flash {:?} at {:#x} failed ({:?}, line {})", self.op, self.address, self.fault, self.line)
    }
}

/// NOR flash with an error log.
pub struct Flash<F> {
    inner: F,
    errors: Vec<FlashError, ERROR_LOG_LEN>,
}

impl<F: NorFlash> Flash<F> {
    pub fn new(inner: F) -> Self {
        Self { inner, errors: Vec::new() }
    }

    pub fn release(self) -> F {
        self.inner
    }

    /// Errors seen so far, oldest first. Once full, later errors are dropped.
    pub fn errors(&self) -> &[FlashError] {
        &self.errors
    }

    #[track_caller]
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let res = self.inner.read(address, buf);
        self.log(FlashOp::Read, address, res)
    }

    #[track_caller]
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let res = self.inner.write(address, data);
        self.log(FlashOp::Write, address, res)
    }

    #[track_caller]
    pub fn erase(&mut self, from: u32, to: u32) -> Result<(), FlashError> {
        let res = self.inner.erase(from, to);
        self.log(FlashOp::Erase, from, res)
    }

    /// Check that `len` bytes at `address` all equal `expected`.
    ///
    /// Every byte is read and folded in, whatever the outcome, so the run time
    /// does not depend on where a mismatch is.
    #[track_caller]
    pub fn compare(&mut self, address: u32, expected: u8, len: u32) -> Result<bool, FlashError> {
        let mut buf = [0u8; 64];
        let mut diff = 0u8;
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(buf.len() as u32);
            let chunk = &mut buf[..n as usize];
            self.read(address + offset, chunk)?;
            for b in chunk.iter() {
                diff |= b ^ expected;
            }
            offset += n;
        }
        Ok(core::hint::black_box(diff) == 0)
    }

    #[track_caller]
    pub fn is_erased(&mut self, address: u32, len: u32) -> Result<bool, FlashError> {
        self.compare(address, 0xff, len)
    }

    #[track_caller]
    fn log<E: NorFlashError>(&mut self, op: FlashOp, address: u32, res: Result<(), E>) -> Result<(), FlashError> {
        let Err(e) = res else {
            return Ok(());
        };
        let error = FlashError {
            op,
            address,
            fault: e.kind().into(),
            line: Location::caller().line(),
        };
        warn!("flash error at {:#x} (line {})", address, error.line);
        let _ = self.errors.push(error);
        Err(error)
    }
}
