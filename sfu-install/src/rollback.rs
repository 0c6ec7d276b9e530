// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Anti-rollback gate.

use core::sync::atomic::{compiler_fence, Ordering};

use crate::config::Policy;

/// Outcome of the version check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Verdict {
    // Complementary patterns, so a single flipped bit never turns one into the other.
    Allowed = 0x5aa5_3cc3,
    Rejected = 0xa55a_c33c,
}

/// Compare a candidate version with the installed one.
///
/// A `current` version of zero means no authentic image is installed: only
/// the initial version may be installed then.
#[inline(never)]
pub fn check(policy: &Policy, current: u16, candidate: u16) -> Verdict {
    if current == 0 {
        if candidate == policy.initial_version {
            return Verdict::Allowed;
        }
        return Verdict::Rejected;
    }
    if candidate >= current && candidate >= policy.min_version {
        Verdict::Allowed
    } else {
        Verdict::Rejected
    }
}

/// Run [`check`] twice, re-reading the current version in between.
///
/// `current` is called once per evaluation and must derive the version from
/// flash again, so that a single fault can neither skip the comparison nor
/// feed both evaluations the same corrupted value.
#[inline(never)]
pub fn double_check<E>(
    policy: &Policy,
    candidate: u16,
    mut current: impl FnMut() -> Result<u16, E>,
) -> Result<Verdict, E> {
    let first = check(policy, core::hint::black_box(current()?), candidate);
    compiler_fence(Ordering::SeqCst);
    if core::hint::black_box(first) != Verdict::Allowed {
        return Ok(Verdict::Rejected);
    }

    let second = check(policy, core::hint::black_box(current()?), candidate);
    compiler_fence(Ordering::SeqCst);
    let second_ptr = &second as *const Verdict;
    if unsafe { second_ptr.read_volatile() } == Verdict::Allowed && first == Verdict::Allowed {
        Ok(Verdict::Allowed)
    } else {
        Ok(Verdict::Rejected)
    }
}
