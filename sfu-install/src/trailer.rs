// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Installation trailer, the write-ahead record at the end of a download
//! slot.
//!
//! ```text
//! swap:    [Valid][Test][magic 16][clean 16][N x W to-active][N x W to-download]
//! no-swap: [Valid][Test][magic 16]
//! ```
//!
//! The magic is derived from both header copies. A matching magic is the
//! only sign of an installation in flight; an all-zero magic marks a spent
//! trailer whose download slot holds the backup of the replaced image.

use embedded_storage::nor_flash::NorFlash;
use sfu_image::Header;

use crate::crypto::CryptoEngine;
use crate::engine::Engine;
use crate::exception::{ExceptionId, Platform};
use crate::header::RawHeader;
use crate::Error;

pub const MAGIC_LEN: usize = 16;

/// Written right before the magic of a swap trailer.
pub const CLEAN_PATTERN: [u8; MAGIC_LEN] = *b"sfu clean blocks";

const SALT: [u8; MAGIC_LEN] = *b"sfu trailer salt";

const SIGNATURE_TAIL: core::ops::Range<usize> = Header::SIGNATURE.end - MAGIC_LEN..Header::SIGNATURE.end;

/// State of the trailer magic, judged word by word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MagicState {
    /// No trailer.
    Erased,
    /// Installation in flight.
    Valid,
    /// Power was lost while the magic was written; nothing was installed.
    Incomplete,
    /// Spent trailer, the installation completed.
    Cleared,
    /// A pattern no write sequence produces.
    Corrupt,
}

/// Progress marker arrays of a swap trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Set once an active block holds its new content.
    ToActive,
    /// Set once an active block is backed up in the download slot.
    ToDownload,
}

/// Placement of a trailer at the end of a download slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerLayout {
    begin: u32,
    blocks: u32,
    word: u32,
    swap: bool,
}

impl TrailerLayout {
    pub fn swap(slot_end: u32, blocks: u32, word: u32) -> Self {
        let size = Self::size_for(blocks, word, true);
        Self {
            begin: slot_end - size,
            blocks,
            word,
            swap: true,
        }
    }

    pub fn no_swap(slot_end: u32, word: u32) -> Self {
        Self {
            begin: slot_end - Self::size_for(0, word, false),
            blocks: 0,
            word,
            swap: false,
        }
    }

    pub const fn size_for(blocks: u32, word: u32, swap: bool) -> u32 {
        let copies = 2 * Header::SIZE as u32 + MAGIC_LEN as u32;
        if swap {
            copies + MAGIC_LEN as u32 + 2 * blocks * word
        } else {
            copies
        }
    }

    pub fn size(&self) -> u32 {
        Self::size_for(self.blocks, self.word, self.swap)
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn valid(&self) -> u32 {
        self.begin
    }

    pub fn test(&self) -> u32 {
        self.begin + Header::SIZE as u32
    }

    pub fn magic(&self) -> u32 {
        self.begin + 2 * Header::SIZE as u32
    }

    pub fn clean(&self) -> Option<u32> {
        self.swap.then(|| self.magic() + MAGIC_LEN as u32)
    }

    pub fn marker(&self, marker: Marker, block: u32) -> Option<u32> {
        if !self.swap || block >= self.blocks {
            return None;
        }
        let to_active = self.magic() + 2 * MAGIC_LEN as u32;
        let array = match marker {
            Marker::ToActive => to_active,
            Marker::ToDownload => to_active + self.blocks * self.word,
        };
        Some(array + block * self.word)
    }
}

/// Magic expected for a pair of header copies.
pub fn expected_magic(valid: &RawHeader, test: &RawHeader) -> [u8; MAGIC_LEN] {
    let mut magic = SALT;
    for ((m, t), v) in magic
        .iter_mut()
        .zip(&test.0[SIGNATURE_TAIL])
        .zip(&valid.0[SIGNATURE_TAIL])
    {
        *m ^= t ^ v;
    }
    magic
}

/// Judge a magic read from flash. `clean` tells whether the clean pattern is
/// present, `None` for trailers without one.
pub fn classify_magic(found: &[u8; MAGIC_LEN], expected: &[u8; MAGIC_LEN], word: usize, clean: Option<bool>) -> MagicState {
    let (mut erased, mut zero, mut matching, mut other) = (0, 0, 0, 0);
    for (f, e) in found.chunks(word).zip(expected.chunks(word)) {
        if f == e {
            matching += 1;
        } else if f.iter().all(|&b| b == 0xff) {
            erased += 1;
        } else if f.iter().all(|&b| b == 0) {
            zero += 1;
        } else {
            other += 1;
        }
    }
    let words = MAGIC_LEN / word;
    if other > 0 {
        MagicState::Corrupt
    } else if erased == words {
        MagicState::Erased
    } else if matching == words {
        match clean {
            Some(false) => MagicState::Corrupt,
            _ => MagicState::Valid,
        }
    } else if zero == 0 {
        MagicState::Incomplete
    } else {
        MagicState::Cleared
    }
}

/// A trailer as read from flash.
#[derive(Debug, Clone)]
pub struct Trailer {
    pub valid: RawHeader,
    pub test: RawHeader,
    pub magic: MagicState,
    pub clean: bool,
}

impl<F: NorFlash, C: CryptoEngine, P: Platform> Engine<F, C, P> {
    pub(crate) fn read_trailer(&mut self, layout: &TrailerLayout) -> Result<Trailer, Error> {
        let valid = self.read_header(layout.valid())?;
        let test = self.read_header(layout.test())?;
        let mut magic = [0; MAGIC_LEN];
        self.read(layout.magic(), &mut magic)?;
        let clean = match layout.clean() {
            Some(address) => {
                let mut pattern = [0; MAGIC_LEN];
                self.read(address, &mut pattern)?;
                Some(pattern == CLEAN_PATTERN)
            }
            None => None,
        };
        let expected = expected_magic(&valid, &test);
        Ok(Trailer {
            magic: classify_magic(&magic, &expected, F::WRITE_SIZE, clean),
            clean: clean.unwrap_or(false),
            valid,
            test,
        })
    }

    pub(crate) fn check_trailer_magic(&mut self, layout: &TrailerLayout) -> Result<MagicState, Error> {
        Ok(self.read_trailer(layout)?.magic)
    }

    /// Write a fresh trailer. The magic goes last: until it is complete the
    /// trailer does not count.
    pub(crate) fn write_trailer(&mut self, layout: &TrailerLayout, valid: &RawHeader, test: &RawHeader) -> Result<(), Error> {
        if self.check_trailer_magic(layout)? != MagicState::Erased {
            self.clear_magic(layout)?;
        }
        let start = layout.begin() - layout.begin() % self.page();
        self.erase(start, layout.begin() + layout.size())?;
        self.write(layout.valid(), &valid.0)?;
        self.write(layout.test(), &test.0)?;
        if let Some(clean) = layout.clean() {
            self.write(clean, &CLEAN_PATTERN)?;
        }
        self.write(layout.magic(), &expected_magic(valid, test))?;

        if self.check_trailer_magic(layout)? != MagicState::Valid {
            return Err(self.raise(ExceptionId::TrailerUpdate));
        }
        Ok(())
    }

    /// Turn the magic into the spent pattern.
    pub(crate) fn clear_magic(&mut self, layout: &TrailerLayout) -> Result<(), Error> {
        self.write(layout.magic(), &[0; MAGIC_LEN])
    }

    pub(crate) fn marker(&mut self, layout: &TrailerLayout, marker: Marker, block: u32) -> Result<bool, Error> {
        let address = layout.marker(marker, block).ok_or(Error::Geometry)?;
        let mut buf = [0xff; 16];
        let buf = &mut buf[..F::WRITE_SIZE];
        self.read(address, buf)?;
        Ok(buf.iter().all(|&b| b == 0))
    }

    pub(crate) fn set_marker(&mut self, layout: &TrailerLayout, marker: Marker, block: u32) -> Result<(), Error> {
        let address = layout.marker(marker, block).ok_or(Error::Geometry)?;
        self.write(address, &[0; 16][..F::WRITE_SIZE])
    }
}
