// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware protections applied before anything else runs.

#[cfg(feature = "flash-protect")]
use consts::{BASE_BOOTLOADER_ADDR, BOOTLOADER_SIZE};
use defmt::{info, warn};
#[cfg(feature = "no-dbg-access")]
use nrf52840_pac::{NVMC, UICR};

#[cfg(feature = "no-dbg-access")]
#[used]
#[link_section = ".uicr_approtect"]
pub static APP_PROTECTION: u32 = 0x00;

/// UICR APPROTECT value enabling the access port protection.
#[cfg(feature = "no-dbg-access")]
const APPROTECT_ENABLED: u32 = 0x00;

/// APPROTECT.FORCEPROTECT, locks the debug port until the next reset.
#[cfg(feature = "no-dbg-access")]
const FORCEPROTECT: *mut u32 = 0x4000_0550 as *mut u32;

/// Make the bootloader pages read-only until the next reset.
pub fn write_protect() {
    #[cfg(feature = "flash-protect")]
    {
        // PERM.WRITE = Disable
        const PERM_WRITE_DISABLE: u32 = 1 << 1;
        let acl = unsafe { &*nrf52840_pac::ACL::ptr() };
        acl.acl[0].addr.write(|w| unsafe { w.bits(BASE_BOOTLOADER_ADDR) });
        acl.acl[0].size.write(|w| unsafe { w.bits(BOOTLOADER_SIZE) });
        acl.acl[0].perm.write(|w| unsafe { w.bits(PERM_WRITE_DISABLE) });
        info!("bootloader write protected");
    }
    #[cfg(not(feature = "flash-protect"))]
    warn!("flash protection disabled");
}

/// Check the readout protection in UICR and program it if the device left
/// the factory without it. The new value only takes effect after a reset.
pub fn readout_protect() {
    #[cfg(feature = "no-dbg-access")]
    unsafe {
        let uicr = &*UICR::ptr();
        if uicr.approtect.read().bits() != APPROTECT_ENABLED {
            warn!("readout protection missing, programming UICR");
            let nvmc = &*NVMC::ptr();
            nvmc.config.write(|w| w.wen().wen());
            while nvmc.ready.read().ready().is_busy() {}
            uicr.approtect.write(|w| w.bits(APPROTECT_ENABLED));
            while nvmc.ready.read().ready().is_busy() {}
            nvmc.config.reset();
            while nvmc.ready.read().ready().is_busy() {}
            cortex_m::peripheral::SCB::sys_reset();
        }
    }
    #[cfg(not(feature = "no-dbg-access"))]
    warn!("readout protection disabled");
}

/// Close the debug port for the rest of this boot cycle.
pub fn debug_lock() {
    #[cfg(feature = "no-dbg-access")]
    unsafe {
        FORCEPROTECT.write_volatile(0);
    }
    #[cfg(not(feature = "no-dbg-access"))]
    warn!("debug port left open");
}
