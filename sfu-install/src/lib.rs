// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware image installation engine.
//!
//! Decides at every boot whether a downloaded image has to be installed, an
//! interrupted installation resumed or a failed image rolled back, and does
//! so such that power can be cut at any point without leaving a device that
//! boots a partial or unauthenticated image.
//!
//! A boot cycle goes:
//!
//! 1. [`Sfu::check_pending_installation`] classifies the flash contents.
//! 2. The matching `trigger_*` call installs, resumes or rolls back. The
//!    device is reset afterwards, successful or not.
//! 3. Without pending work, [`Sfu::verify_active_image`] checks the image,
//!    [`Sfu::lock_services`] and [`Sfu::launch_gate`] close the boot.
#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod boot_info;
mod config;
mod context;
mod crypto;
mod decision;
mod engine;
mod exception;
mod flash;
mod flow;
mod header;
mod install;
mod rollback;
#[cfg(any(test, feature = "rustcrypto"))]
pub mod rustcrypto;
mod slot;
mod trailer;

#[cfg(test)]
mod tests;

use core::marker::PhantomData;

use embedded_storage::nor_flash::NorFlash;
use sfu_image::{Header, ImageState, VerificationResult};

pub use boot_info::BootInfo;
pub use config::{Layout, LayoutError, Policy, Region, CHUNK_SIZE};
pub use context::BootContext;
pub use crypto::{CryptoEngine, CryptoError, Payload, Span};
pub use decision::Pending;
pub use exception::{ExceptionId, Platform};
pub use flash::{FlashError, FlashOp, Fault};
pub use flow::{FlowControl, FlowError, ProtectStep, Step};
pub use header::RawHeader;
pub use install::{Installer, NoSwap, Swap};
pub use rollback::Verdict;
pub use trailer::{MagicState, TrailerLayout};

use engine::Engine;
use trailer::MagicState::{Erased, Incomplete};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Flash(FlashError),
    /// A security exception, already persisted in the boot info page.
    Security(ExceptionId),
    /// The candidate does not fit the download slot next to the trailer.
    DownloadSlotTooSmall,
    ImageTooLarge,
    /// A delta image, but no authentic image to apply it to.
    DeltaWithoutBase,
    DeltaUnsupported,
    NoImage,
    NotResumable,
    InvalidLayout(LayoutError),
    InvalidSlot,
    /// Address arithmetic left the slot. Points at an inconsistent layout.
    Geometry,
    Encoding,
    /// Image states only move forward.
    StateTransition,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Flash(e) => write!(f, "{e}"),
            Self::Security(id) => write!(f, "security exception: {id}"),
            Self::DownloadSlotTooSmall => write!(f, "download slot too small"),
            Self::ImageTooLarge => write!(f, "image larger than the active slot"),
            Self::DeltaWithoutBase => write!(f, "delta image without base image"),
            Self::DeltaUnsupported => write!(f, "delta images need the swap installer"),
            Self::NoImage => write!(f, "no image"),
            Self::NotResumable => write!(f, "no installation to resume"),
            Self::InvalidLayout(e) => write!(f, "invalid layout: {e}"),
            Self::InvalidSlot => write!(f, "invalid slot index"),
            Self::Geometry => write!(f, "address out of slot"),
            Self::Encoding => write!(f, "boot info encoding failed"),
            Self::StateTransition => write!(f, "image state can only move forward"),
        }
    }
}

/// The installation engine over flash `F`, crypto engine `C` and board
/// services `P`, with installer `I`.
pub struct Sfu<F, C, P, I = Swap> {
    engine: Engine<F, C, P>,
    installer: PhantomData<I>,
}

impl<F: NorFlash, C: CryptoEngine, P: Platform, I: Installer> Sfu<F, C, P, I> {
    pub fn new(flash: F, crypto: C, platform: P, layout: Layout, policy: Policy) -> Result<Self, Error> {
        layout
            .validate(flash.capacity(), F::READ_SIZE, F::WRITE_SIZE, F::ERASE_SIZE)
            .and_then(|()| I::validate_layout(&layout, F::WRITE_SIZE as u32, F::ERASE_SIZE as u32))
            .map_err(Error::InvalidLayout)?;
        Ok(Self {
            engine: Engine::new(flash, crypto, platform, layout, policy),
            installer: PhantomData,
        })
    }

    /// Decide what this boot has to do. Fills the [`context`](Self::context)
    /// for the matching `trigger_*` call.
    pub fn check_pending_installation(&mut self) -> Result<Pending, Error> {
        decision::classify::<I, _, _, _>(&mut self.engine)
    }

    /// Install the candidate in download slot `download`.
    pub fn trigger_install(&mut self, download: usize) -> Result<(), Error> {
        let res = self.install(download);
        self.settle(res, download)
    }

    fn install(&mut self, download: usize) -> Result<(), Error> {
        let (view, layout) = install::download::<I, _, _, _>(&self.engine, download)?;
        if !matches!(self.engine.check_trailer_magic(&layout)?, Erased | Incomplete) {
            return Err(Error::NoImage);
        }
        let raw = self.engine.read_header(view.base())?;
        if raw.parse().is_none() {
            return Err(Error::NoImage);
        }
        let Some(header) = self.engine.authenticate(&raw) else {
            return Err(self.engine.raise(ExceptionId::SignatureFailure));
        };
        let active = header.magic().slot_index();
        if active >= self.engine.layout.active.len() {
            return Err(Error::InvalidSlot);
        }
        I::install(&mut self.engine, active, download, &header)
    }

    /// Finish an interrupted installation from `download` into `active`.
    pub fn trigger_resume(&mut self, active: usize, download: usize) -> Result<(), Error> {
        let res = I::resume(&mut self.engine, active, download);
        self.settle(res, download)
    }

    /// Put back the image `active` replaced, from the backup in `download`.
    /// Without a backup the failed image is invalidated.
    pub fn trigger_rollback(&mut self, active: usize, download: Option<usize>) -> Result<(), Error> {
        let res = I::rollback(&mut self.engine, active, download);
        match download {
            Some(download) => self.settle(res, download),
            None => res,
        }
    }

    /// A failed candidate is dropped so it is not retried on the next boot.
    /// After a flash error the download slot is left alone; the error is
    /// recorded instead.
    fn settle(&mut self, res: Result<(), Error>, download: usize) -> Result<(), Error> {
        match res {
            Ok(()) | Err(Error::NoImage | Error::NotResumable | Error::InvalidSlot) => {}
            Err(Error::Flash(e)) => {
                error!("flash error at {:#x}", e.address);
                if self.engine.store_exception(ExceptionId::FlashError).is_err() {
                    warn!("could not persist the exception");
                }
            }
            Err(_) => {
                warn!("discarding download slot {}", download);
                let _ = self.engine.erase_download(download);
            }
        }
        res
    }

    /// Erase download slot `download` together with the swap area, so the
    /// application can store a new candidate.
    pub fn erase_downloaded_image(&mut self, download: usize) -> Result<(), Error> {
        self.engine.erase_download(download)
    }

    /// Check the image in active slot `active` before it is started.
    pub fn verify_active_image(&mut self, active: usize) -> Result<Header, Error> {
        let view = self.engine.active_view(active)?;
        let raw = self.engine.read_header(view.base())?;
        if raw.is_erased() {
            return Err(Error::NoImage);
        }
        let Some(header) = self.engine.authenticate_for(&raw, active) else {
            return Err(self.engine.raise(ExceptionId::SignatureFailure));
        };
        self.engine.step(flow::AUTHENTICATE);

        let body = view.header_range().end;
        let image = Payload::single(body, header.fw_size());
        if self.engine.authenticate_payload(&header, &image)? != VerificationResult::Valid {
            return Err(self.engine.raise(ExceptionId::IntegrityCheck));
        }
        let end = body + header.fw_size();
        if !self.engine.is_erased(end, view.end() - end)? {
            return Err(self.engine.raise(ExceptionId::AdditionalCode));
        }
        self.engine.step(flow::INTEGRITY);
        Ok(header)
    }

    pub fn image_state(&mut self, active: usize) -> Result<ImageState, Error> {
        let view = self.engine.active_view(active)?;
        let raw = self.engine.read_header(view.base())?;
        let header = self.engine.authenticate_for(&raw, active).ok_or(Error::NoImage)?;
        Ok(header.image_state())
    }

    /// Move the image in `active` to `state`. Only forward moves are
    /// possible: each one clears another state word.
    pub fn set_image_state(&mut self, active: usize, state: ImageState) -> Result<(), Error> {
        let view = self.engine.active_view(active)?;
        let raw = self.engine.read_header(view.base())?;
        let mut header = self.engine.authenticate_for(&raw, active).ok_or(Error::NoImage)?;
        match (header.image_state().rank(), state.rank()) {
            (Some(from), Some(to)) if to > from => {}
            _ => return Err(Error::StateTransition),
        }
        header.set_image_state(state);
        let bytes = header.to_bytes();
        self.engine
            .write(view.base() + Header::STATE.start as u32, &bytes[Header::STATE])
    }

    /// Record a protection milestone. A milestone out of order is fatal.
    pub fn protect_step(&mut self, step: ProtectStep) {
        self.engine.step_protect(step.step());
    }

    /// Close the crypto services before the image is started.
    pub fn lock_services(&mut self) {
        self.engine.step(flow::LOCK_SERVICE);
    }

    /// Last check before the jump: both ledgers must be at their terminal
    /// values.
    pub fn launch_gate(&mut self) {
        let crypto = self.engine.flow.check_crypto(flow::LOCK_SERVICE);
        let protect = self.engine.flow.check_protect(flow::RUNTIME_DEBUG_LOCK);
        if crypto.is_err() || protect.is_err() {
            error!("launch refused: crypto {:#x}, protect {:#x}", self.engine.flow.crypto(), self.engine.flow.protect());
            let _ = self.engine.store_exception(ExceptionId::FlowControl);
            self.engine.platform.fatal(ExceptionId::FlowControl);
        }
    }

    pub fn flow(&self) -> &FlowControl {
        &self.engine.flow
    }

    pub fn boot_info(&mut self) -> Result<BootInfo, Error> {
        self.engine.boot_info()
    }

    /// Reset the consecutive error count once an image started.
    pub fn record_clean_boot(&mut self) -> Result<(), Error> {
        self.engine.store_exception(ExceptionId::None)
    }

    /// Abnormal flash errors seen during this boot cycle.
    pub fn flash_errors(&self) -> &[FlashError] {
        self.engine.flash.errors()
    }

    pub fn context(&self) -> &BootContext {
        &self.engine.ctx
    }

    pub fn release(self) -> (F, C, P) {
        let Engine { flash, crypto, platform, .. } = self.engine;
        (flash.release(), crypto, platform)
    }
}
