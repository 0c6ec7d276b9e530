// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot info page: the last security exception, kept across resets.
//!
//! Stored as `[length: u32][crc: u32][postcard bytes]`, little endian. An
//! erased page or a CRC mismatch reads as the default record.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::exception::ExceptionId;

pub const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Encoded size of a record, prefix included, before write padding.
pub const RECORD_BUF: usize = 32;

const PREFIX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootInfo {
    pub last_exception: ExceptionId,
    /// Security exceptions since the page was last erased.
    pub exception_count: u32,
    /// Security exceptions since the last clean boot.
    pub consecutive_errors: u32,
}

impl Default for BootInfo {
    fn default() -> Self {
        Self {
            last_exception: ExceptionId::None,
            exception_count: 0,
            consecutive_errors: 0,
        }
    }
}

impl BootInfo {
    /// Account for a new exception. [`ExceptionId::None`] marks a clean boot.
    pub fn record(&mut self, id: ExceptionId) {
        self.last_exception = id;
        if id == ExceptionId::None {
            self.consecutive_errors = 0;
        } else {
            self.exception_count = self.exception_count.saturating_add(1);
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        }
    }

    /// Encode into `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut [u8; RECORD_BUF]) -> Option<usize> {
        let len = postcard::to_slice(self, &mut buf[PREFIX..]).ok()?.len();
        let crc = CRC.checksum(&buf[PREFIX..PREFIX + len]);
        buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        Some(PREFIX + len)
    }

    /// Decode a record, `None` if the buffer holds no valid one.
    pub fn decode(buf: &[u8; RECORD_BUF]) -> Option<Self> {
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let data = buf.get(PREFIX..PREFIX.checked_add(len)?)?;
        if CRC.checksum(data) != crc {
            return None;
        }
        postcard::from_bytes(data).ok()
    }
}
