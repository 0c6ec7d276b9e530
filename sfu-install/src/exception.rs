// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// Reason of a security exception, persisted in the boot info page so that
/// it survives the reset that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExceptionId {
    None,
    FlowControl,
    SignatureFailure,
    DecryptFailure,
    IntegrityCheck,
    AdditionalCode,
    TrailerUpdate,
    SwapFailure,
    VersionRollback,
    MagicPattern,
    FlashError,
    HeaderMismatch,
    RollbackImpossible,
}

impl core::fmt::Display for ExceptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::None => "none",
            Self::FlowControl => "flow control mismatch",
            Self::SignatureFailure => "header signature failure",
            Self::DecryptFailure => "decryption failure",
            Self::IntegrityCheck => "image integrity check failure",
            Self::AdditionalCode => "additional code beyond the image",
            Self::TrailerUpdate => "trailer update failure",
            Self::SwapFailure => "swap failure",
            Self::VersionRollback => "version rollback rejected",
            Self::MagicPattern => "corrupt trailer magic",
            Self::FlashError => "flash error",
            Self::HeaderMismatch => "active header matches neither trailer copy",
            Self::RollbackImpossible => "no previous image to roll back to",
        };
        f.write_str(text)
    }
}

/// Board services the installer relies on.
pub trait Platform {
    /// Restart the watchdog window. Called before every flash write chunk
    /// and every page erase.
    fn refresh_watchdog(&mut self);

    /// Stop execution after an unrecoverable security exception. The reason
    /// has already been persisted when this is called.
    fn fatal(&mut self, reason: ExceptionId) -> !;
}
