// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flow-control ledger.
//!
//! Two XOR chained accumulators follow the protection and crypto milestones
//! of a boot cycle. Every milestone folds its constant into the accumulator
//! and compares the result with the value expected at that point, so a
//! skipped milestone leaves the chain off its expected terminal value.

use core::sync::atomic::{compiler_fence, Ordering};

pub const FLOW_INIT: u32 = 0x0000_5776;

const VALUE_AUTHENTICATE: u32 = 0x0003_0aad;
const VALUE_INTEGRITY: u32 = 0x0005_1f3c;
const VALUE_INSTALL: u32 = 0x0006_4c4b;
const VALUE_LOCK_SERVICE: u32 = 0x0009_2d86;
const VALUE_STATIC_WRITE_PROTECT: u32 = 0x000a_5533;
const VALUE_STATIC_READOUT_PROTECT: u32 = 0x000c_6ca4;
const VALUE_RUNTIME_WATCHDOG: u32 = 0x000f_3b19;
const VALUE_RUNTIME_DEBUG_LOCK: u32 = 0x0011_76e2;

/// A milestone: the constant folded into the chain and the chain value
/// expected right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step {
    pub value: u32,
    pub expected: u32,
}

impl Step {
    pub const fn first(value: u32) -> Self {
        Self {
            value,
            expected: FLOW_INIT ^ value,
        }
    }

    pub const fn after(previous: Step, value: u32) -> Self {
        Self {
            value,
            expected: previous.expected ^ value,
        }
    }
}

pub const AUTHENTICATE: Step = Step::first(VALUE_AUTHENTICATE);
pub const INTEGRITY: Step = Step::after(AUTHENTICATE, VALUE_INTEGRITY);
pub const INSTALL: Step = Step::after(INTEGRITY, VALUE_INSTALL);
pub const LOCK_SERVICE: Step = Step::after(INTEGRITY, VALUE_LOCK_SERVICE);

pub const STATIC_WRITE_PROTECT: Step = Step::first(VALUE_STATIC_WRITE_PROTECT);
pub const STATIC_READOUT_PROTECT: Step = Step::after(STATIC_WRITE_PROTECT, VALUE_STATIC_READOUT_PROTECT);
pub const RUNTIME_WATCHDOG: Step = Step::after(STATIC_READOUT_PROTECT, VALUE_RUNTIME_WATCHDOG);
pub const RUNTIME_DEBUG_LOCK: Step = Step::after(RUNTIME_WATCHDOG, VALUE_RUNTIME_DEBUG_LOCK);

/// Protection milestones reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtectStep {
    StaticWriteProtect,
    StaticReadoutProtect,
    RuntimeWatchdog,
    RuntimeDebugLock,
}

impl ProtectStep {
    pub fn step(self) -> Step {
        match self {
            Self::StaticWriteProtect => STATIC_WRITE_PROTECT,
            Self::StaticReadoutProtect => STATIC_READOUT_PROTECT,
            Self::RuntimeWatchdog => RUNTIME_WATCHDOG,
            Self::RuntimeDebugLock => RUNTIME_DEBUG_LOCK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlowError {
    pub expected: u32,
    pub found: u32,
}

/// The two ledgers of a boot cycle.
#[derive(Debug)]
pub struct FlowControl {
    protect: u32,
    crypto: u32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    pub const fn new() -> Self {
        Self {
            protect: FLOW_INIT,
            crypto: FLOW_INIT,
        }
    }

    pub fn step_protect(&mut self, step: Step) -> Result<(), FlowError> {
        Self::step(&mut self.protect, step)
    }

    pub fn step_crypto(&mut self, step: Step) -> Result<(), FlowError> {
        Self::step(&mut self.crypto, step)
    }

    /// Compare the protection ledger with `step` without advancing it.
    pub fn check_protect(&self, step: Step) -> Result<(), FlowError> {
        Self::check(&self.protect, step)
    }

    /// Compare the crypto ledger with `step` without advancing it.
    pub fn check_crypto(&self, step: Step) -> Result<(), FlowError> {
        Self::check(&self.crypto, step)
    }

    pub fn protect(&self) -> u32 {
        self.protect
    }

    pub fn crypto(&self) -> u32 {
        self.crypto
    }

    #[inline(never)]
    fn step(ledger: &mut u32, step: Step) -> Result<(), FlowError> {
        *ledger ^= step.value;
        compiler_fence(Ordering::SeqCst);
        Self::check(ledger, step)
    }

    #[inline(never)]
    fn check(ledger: &u32, step: Step) -> Result<(), FlowError> {
        let found = unsafe { (ledger as *const u32).read_volatile() };
        if core::hint::black_box(found) == step.expected {
            Ok(())
        } else {
            Err(FlowError {
                expected: step.expected,
                found,
            })
        }
    }
}
