// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::ops::Range;

use crate::config::{Region, CHUNK_SIZE};

/// Address arithmetic of one slot.
///
/// A slot holds the header area at its base, then the body. Download slots
/// end with a trailer; for active slots the trailer is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    region: Region,
    header_area: u32,
    block: u32,
    trailer: u32,
    erase: u32,
}

impl SlotView {
    pub fn new(region: Region, header_area: u32, block: u32, trailer: u32, erase: u32) -> Self {
        Self {
            region,
            header_area,
            block,
            trailer,
            erase,
        }
    }

    pub fn base(&self) -> u32 {
        self.region.base
    }

    pub fn size(&self) -> u32 {
        self.region.size
    }

    pub fn end(&self) -> u32 {
        self.region.end()
    }

    pub fn header_range(&self) -> Range<u32> {
        self.base()..self.base() + self.header_area
    }

    /// Everything between the header area and the erase-aligned trailer start.
    pub fn body_range(&self) -> Range<u32> {
        self.header_range().end..self.trailer_erase_start()
    }

    pub fn trailer_range(&self) -> Range<u32> {
        self.end() - self.trailer..self.end()
    }

    /// First page touched when the trailer is erased.
    pub fn trailer_erase_start(&self) -> u32 {
        let start = self.trailer_range().start;
        start - (start - self.base()) % self.erase
    }

    /// Bytes usable for data in front of the trailer pages.
    pub fn capacity(&self) -> u32 {
        self.trailer_erase_start() - self.base()
    }

    pub fn blocks(&self) -> u32 {
        match self.block {
            0 => 0,
            block => self.size() / block,
        }
    }

    pub fn block(&self, index: u32) -> Option<Range<u32>> {
        if index >= self.blocks() {
            return None;
        }
        let start = self.base() + index * self.block;
        Some(start..start + self.block)
    }

    /// Chunk `index` of block `block`, clipped to the block end.
    pub fn chunk(&self, block: u32, index: u32) -> Option<Range<u32>> {
        let block = self.block(block)?;
        let start = block.start.checked_add(index.checked_mul(CHUNK_SIZE as u32)?)?;
        if start >= block.end {
            return None;
        }
        Some(start..(start + CHUNK_SIZE as u32).min(block.end))
    }

    /// Chunks of block `block` from address `from` on, the first one clipped.
    pub fn chunks_from(&self, block: u32, from: u32) -> impl Iterator<Item = Range<u32>> + '_ {
        (0..)
            .map_while(move |j| self.chunk(block, j))
            .filter(move |chunk| chunk.end > from)
            .map(move |chunk| chunk.start.max(from)..chunk.end)
    }
}
