// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]
mod board;
mod jump_app;
mod keys;
mod protect;

use defmt_rtt as _;
use embassy_nrf::peripherals::{self, RNG};
// global logger
use embassy_nrf as _;
// time driver
use panic_probe as _;

use board::{Board, RngJitter};
use consts::*;
use core::cell::RefCell;
use cortex_m::peripheral::SCB;
use defmt::{error, info, warn};
use embassy_executor::Spawner;
use embassy_nrf::nvmc::Nvmc;
use embassy_nrf::rng::{self, Rng};
use embassy_nrf::{bind_interrupts, wdt};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use jump_app::jump_to_app;
use sfu_image::ImageState;
use sfu_install::rustcrypto::RustCryptoEngine;
use sfu_install::{Error, ExceptionId, Layout, Pending, Policy, ProtectStep, Region, Sfu, Swap};

// Mutex for random hw generator to delay in verification
pub static RNG_HW: Mutex<ThreadModeRawMutex, RefCell<Option<Rng<'_, RNG>>>> = Mutex::new(RefCell::new(None));

bind_interrupts!(struct Irqs {
    RNG => rng::InterruptHandler<peripherals::RNG>;
});

static ACTIVE: [Region; 1] = [Region::new(ACTIVE_1_ADDR, ACTIVE_1_SIZE)];
static DOWNLOAD: [Region; 1] = [Region::new(DOWNLOAD_1_ADDR, DOWNLOAD_1_SIZE)];

const LAYOUT: Layout = Layout {
    active: &ACTIVE,
    download: &DOWNLOAD,
    swap: Region::new(SWAP_ADDR, SWAP_SIZE),
    header_area: HEADER_AREA_SIZE,
    boot_info: Region::new(BOOT_INFO_ADDR, BOOT_INFO_SIZE),
};

const POLICY: Policy = Policy {
    initial_version: INITIAL_FW_VERSION,
    min_version: MIN_FW_VERSION,
    image_state_handling: true,
    halt_on_flash_error: false,
};

/// Watchdog period, in 32.768 kHz ticks. Long enough for one page erase plus
/// one chunk write with the random delays on top.
const WDT_TIMEOUT_TICKS: u32 = 32768 * 4;

type Bootloader<'a> = Sfu<Nvmc<'a>, RustCryptoEngine<'a, RngJitter>, Board, Swap>;

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_nrf::init(Default::default());

    // Protections first, then the installer sees them in order.
    protect::write_protect();
    protect::readout_protect();

    let mut config_wdt = wdt::Config::default();
    config_wdt.timeout_ticks = WDT_TIMEOUT_TICKS;
    config_wdt.run_during_debug_halt = false;
    let (_wdt, [handle]) = match wdt::Watchdog::try_new(p.WDT, config_wdt) {
        Ok(x) => x,
        Err(_) => {
            // Running from a previous boot with another configuration. It
            // cannot be stopped, so let it reset the device.
            error!("watchdog already running with another configuration");
            SCB::sys_reset()
        }
    };

    protect::debug_lock();

    // RNG
    let rng = Rng::new(p.RNG, Irqs);
    {
        RNG_HW.lock(|f| f.borrow_mut().replace(rng));
    }

    let keys = keys::slot_keys();
    let crypto = RustCryptoEngine::new(&keys, RngJitter);
    let flash = Nvmc::new(p.NVMC);
    let mut sfu: Bootloader = match Sfu::new(flash, crypto, Board { wdt: handle }, LAYOUT, POLICY) {
        Ok(sfu) => sfu,
        Err(e) => {
            error!("invalid flash layout: {}", e);
            halt()
        }
    };
    sfu.protect_step(ProtectStep::StaticWriteProtect);
    sfu.protect_step(ProtectStep::StaticReadoutProtect);
    sfu.protect_step(ProtectStep::RuntimeWatchdog);
    sfu.protect_step(ProtectStep::RuntimeDebugLock);

    match sfu.boot_info() {
        Ok(info) if info.last_exception != ExceptionId::None => {
            warn!(
                "last exception: {}, {} since the last clean boot",
                info.last_exception, info.consecutive_errors
            );
        }
        Ok(_) => {}
        Err(e) => warn!("boot info unreadable: {}", e),
    }

    // Every installation path ends with a reset, so that the next boot
    // classifies the flash from scratch.
    match sfu.check_pending_installation() {
        Ok(Pending::NoUpdate) => {}
        Ok(Pending::UpdateReady { active, download }) => {
            info!("installing download slot {} into active slot {}", download, active);
            report("install", sfu.trigger_install(download));
            SCB::sys_reset()
        }
        Ok(Pending::ResumeUpdate { active, download }) => {
            info!("resuming installation of download slot {} into active slot {}", download, active);
            report("resume", sfu.trigger_resume(active, download));
            SCB::sys_reset()
        }
        Ok(Pending::RollbackRequired { active, download }) => {
            info!("rolling back active slot {}", active);
            report("rollback", sfu.trigger_rollback(active, download));
            SCB::sys_reset()
        }
        Err(e) => {
            error!("pending installation check failed: {}", e);
            SCB::sys_reset()
        }
    }

    let header = match sfu.verify_active_image(0) {
        Ok(header) => header,
        Err(Error::NoImage) => {
            error!("no firmware installed");
            halt()
        }
        Err(e) => {
            error!("active image rejected: {}", e);
            SCB::sys_reset()
        }
    };
    info!("firmware version {}, {} bytes", header.fw_version(), header.fw_size());

    // A new image gets one boot to confirm itself.
    if header.image_state() == ImageState::New {
        if let Err(e) = sfu.set_image_state(0, ImageState::SelfTest) {
            error!("could not start the self-test: {}", e);
            SCB::sys_reset()
        }
    }
    if let Ok(info) = sfu.boot_info() {
        if info.consecutive_errors > 0 && sfu.record_clean_boot().is_err() {
            warn!("could not clear the error count");
        }
    }

    sfu.lock_services();
    sfu.launch_gate();

    let (_flash, _crypto, _board) = sfu.release();
    RNG_HW.lock(|f| f.borrow_mut().take());
    unsafe {
        jump_to_app();
    }
}

fn report(what: &str, res: Result<(), Error>) {
    match res {
        Ok(()) => info!("{} done", what),
        Err(e) => error!("{} failed: {}", what, e),
    }
}

/// Nothing to boot. The watchdog is not refreshed anymore and resets the
/// device, which then looks for a candidate again.
fn halt() -> ! {
    loop {
        cortex_m::asm::wfe();
    }
}
