// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::RNG_HW;
use cortex_m::peripheral::SCB;
use defmt::error;
use embassy_nrf::wdt::WatchdogHandle;
use embassy_time::{block_for, Duration};
use sfu_install::rustcrypto::Jitter;
use sfu_install::{ExceptionId, Platform};

/// Board services handed to the installer.
pub struct Board {
    pub wdt: WatchdogHandle,
}

impl Platform for Board {
    fn refresh_watchdog(&mut self) {
        self.wdt.pet();
    }

    fn fatal(&mut self, reason: ExceptionId) -> ! {
        error!("fatal: {}", reason);
        SCB::sys_reset()
    }
}

/// Random delays from the hardware RNG.
pub struct RngJitter;

impl Jitter for RngJitter {
    fn delay(&mut self) {
        RNG_HW.lock(|rng| {
            let mut bytes = [0; 1];
            if let Some(rng) = rng.borrow_mut().as_mut() {
                rng.blocking_fill_bytes(&mut bytes);
            }
            // Get 0 - 15 ms
            bytes[0] %= 16;
            block_for(Duration::from_millis(bytes[0] as u64));
        });
    }
}
