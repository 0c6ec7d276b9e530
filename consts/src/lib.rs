// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash map of the nRF52840 board running the secure bootloader.
//!
//! ```text
//! 0x00000 +----------------------+
//!         | bootloader           |
//! 0x18000 +----------------------+
//!         | boot info page       |
//! 0x19000 +----------------------+
//!         | swap area            |
//! 0x1D000 +----------------------+
//!         | (unused)             |
//! 0x20000 +----------------------+
//!         | active slot 1        |
//! 0x80000 +----------------------+
//!         | download slot 1      |
//! 0xE4000 +----------------------+
//! ```
#![no_std]

/// Size of a flash memory page in bytes (4KB).
/// Erase operations always cover whole pages.
pub const FLASH_PAGE: u32 = 4096;

/// Smallest programmable unit of the NVMC, one 32-bit word.
pub const FLASH_WRITE_SIZE: u32 = 4;

/// Total size of the internal flash.
pub const FLASH_SIZE: u32 = 0x10_0000;

/// Start address of the bootloader in flash memory.
pub const BASE_BOOTLOADER_ADDR: u32 = 0x0;

/// Space reserved for the bootloader code.
pub const BOOTLOADER_SIZE: u32 = 0x1_8000;

/// Page holding the persisted boot info record (last security exception).
pub const BOOT_INFO_ADDR: u32 = 0x1_8000;
pub const BOOT_INFO_SIZE: u32 = FLASH_PAGE;

/// Scratch area used by the swap installer. Its size is the swap block size,
/// every slot is a multiple of it.
pub const SWAP_ADDR: u32 = 0x1_9000;
pub const SWAP_SIZE: u32 = 0x4000;

/// Executable slot. The firmware header sits at the slot base and the vector
/// table follows the header area.
pub const ACTIVE_1_ADDR: u32 = 0x2_0000;
pub const ACTIVE_1_SIZE: u32 = 0x6_0000;

/// Slot receiving candidate images. One swap block larger than the active
/// slot so that a full image plus the trailer fit.
pub const DOWNLOAD_1_ADDR: u32 = 0x8_0000;
pub const DOWNLOAD_1_SIZE: u32 = 0x6_4000;

/// Bytes reserved in front of the firmware for the header. The firmware
/// vector table starts right after it.
pub const HEADER_AREA_SIZE: u32 = FLASH_PAGE;

/// Entry point of the firmware in the active slot.
pub const BASE_APP_ADDR: u32 = ACTIVE_1_ADDR + HEADER_AREA_SIZE;

/// Version accepted when no trustworthy image is installed.
pub const INITIAL_FW_VERSION: u16 = 1;

/// Lowest firmware version the bootloader will ever install.
pub const MIN_FW_VERSION: u16 = 1;
