// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::ops::Range;

use sfu_image::Header;

/// Largest amount of data moved per flash write. The watchdog is refreshed
/// before every chunk.
pub const CHUNK_SIZE: usize = 256;

/// A contiguous area of flash, in flash offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn range(&self) -> Range<u32> {
        self.base..self.end()
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.size != 0 && other.size != 0 && self.base < other.end() && other.base < self.end()
    }
}

/// Flash layout of the device.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Executable slots. The header magic selects one of them.
    pub active: &'static [Region],
    /// Slots receiving candidate images.
    pub download: &'static [Region],
    /// Scratch area of the swap installer. Its size is the swap block size.
    pub swap: Region,
    /// Bytes reserved for the header at the base of every slot. The firmware
    /// body starts right after it.
    pub header_area: u32,
    /// Page keeping the last security exception across resets.
    pub boot_info: Region,
}

/// Installation policy.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Only version accepted when no authentic image is installed.
    pub initial_version: u16,
    /// Lowest version ever accepted.
    pub min_version: u16,
    /// Track the self-test state of new images and roll back failed ones.
    pub image_state_handling: bool,
    /// Halt on any abnormal flash error instead of carrying on.
    pub halt_on_flash_error: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            initial_version: 1,
            min_version: 1,
            image_state_handling: true,
            halt_on_flash_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    NoActiveSlot,
    NoDownloadSlot,
    TooManyActiveSlots,
    ReadSizeUnsupported,
    WriteSizeUnsupported,
    Misaligned(u32),
    Overlap(u32),
    OutOfFlash(u32),
    HeaderArea,
    BootInfo,
    SwapBlock,
    SlotNotBlockMultiple(u32),
    DownloadTooSmall(u32),
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoActiveSlot => write!(f, "no active slot configured"),
            Self::NoDownloadSlot => write!(f, "no download slot configured"),
            Self::TooManyActiveSlots => write!(f, "more active slots than header magics"),
            Self::ReadSizeUnsupported => write!(f, "flash read size must be 1"),
            Self::WriteSizeUnsupported => {
                write!(f, "flash write size must divide 16 and the chunk size")
            }
            Self::Misaligned(base) => write!(f, "region at {base:#x} is not erase aligned"),
            Self::Overlap(base) => write!(f, "region at {base:#x} overlaps another region"),
            Self::OutOfFlash(base) => write!(f, "region at {base:#x} exceeds the flash"),
            Self::HeaderArea => write!(f, "invalid header area size"),
            Self::BootInfo => write!(f, "no boot info page configured"),
            Self::SwapBlock => write!(f, "invalid swap area size"),
            Self::SlotNotBlockMultiple(base) => {
                write!(f, "slot at {base:#x} is not a multiple of the swap block")
            }
            Self::DownloadTooSmall(base) => {
                write!(f, "download slot at {base:#x} cannot hold its trailer")
            }
        }
    }
}

impl Layout {
    /// Checks shared by every installer. The swap specific constraints are
    /// checked by the installer itself.
    pub fn validate(&self, capacity: usize, read: usize, write: usize, erase: usize) -> Result<(), LayoutError> {
        if self.active.is_empty() {
            return Err(LayoutError::NoActiveSlot);
        }
        if self.download.is_empty() {
            return Err(LayoutError::NoDownloadSlot);
        }
        if self.active.len() > 3 {
            return Err(LayoutError::TooManyActiveSlots);
        }
        if read != 1 {
            return Err(LayoutError::ReadSizeUnsupported);
        }
        if write == 0 || 16 % write != 0 || CHUNK_SIZE % write != 0 {
            return Err(LayoutError::WriteSizeUnsupported);
        }
        let erase = erase as u32;
        if self.header_area < Header::SIZE as u32 || self.header_area % erase != 0 {
            return Err(LayoutError::HeaderArea);
        }

        if self.boot_info.size == 0 {
            return Err(LayoutError::BootInfo);
        }

        let regions = self.slots().chain([self.swap, self.boot_info]).filter(|r| r.size != 0);
        for (i, region) in regions.clone().enumerate() {
            if region.base % erase != 0 || region.size % erase != 0 {
                return Err(LayoutError::Misaligned(region.base));
            }
            if region.end() as usize > capacity {
                return Err(LayoutError::OutOfFlash(region.base));
            }
            if regions.clone().skip(i + 1).any(|other| region.overlaps(&other)) {
                return Err(LayoutError::Overlap(region.base));
            }
        }
        if self.slots().any(|s| s.size <= self.header_area) {
            return Err(LayoutError::HeaderArea);
        }
        Ok(())
    }

    /// All active and download slots.
    pub fn slots(&self) -> impl Iterator<Item = Region> + Clone + '_ {
        self.active.iter().chain(self.download.iter()).copied()
    }

    pub fn active_slot(&self, index: usize) -> Option<Region> {
        self.active.get(index).copied()
    }

    pub fn download_slot(&self, index: usize) -> Option<Region> {
        self.download.get(index).copied()
    }

    /// Largest number of swap blocks in an active slot.
    pub fn max_active_blocks(&self) -> u32 {
        match self.swap.size {
            0 => 0,
            block => self.active.iter().map(|r| r.size / block).max().unwrap_or(0),
        }
    }
}
