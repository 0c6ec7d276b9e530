// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot-time decision: what, if anything, the installer has to do.

use embedded_storage::nor_flash::NorFlash;
use sfu_image::{Header, ImageState};

use crate::crypto::CryptoEngine;
use crate::engine::Engine;
use crate::exception::{ExceptionId, Platform};
use crate::header::RawHeader;
use crate::install::{self, Installer};
use crate::trailer::{MagicState, Trailer};
use crate::Error;

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pending {
    NoUpdate,
    /// A fresh candidate in `download`, built for `active`.
    UpdateReady { active: usize, download: usize },
    /// An installation from `download` into `active` was interrupted.
    ResumeUpdate { active: usize, download: usize },
    /// The image in `active` failed its self-test. `download` holds the
    /// backup of the previous image, if there is one.
    RollbackRequired { active: usize, download: Option<usize> },
}

/// Why an interrupted installation may go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResumeCase {
    /// The active header equals both trailer copies.
    // Cannot tell "not started" from "header installed". Accepted as is.
    Ambiguous,
    /// The active header is still the one being replaced.
    NotStarted,
    /// The new header is installed, cleanup was cut short.
    HeaderInstalled,
    /// The active header is being rewritten.
    HeaderWindow,
    /// No authentic active header and the candidate is the initial version.
    InitialVersion,
}

pub(crate) fn classify<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
) -> Result<Pending, Error> {
    let (actives, downloads) = (engine.layout.active.len(), engine.layout.download.len());

    for active in 0..actives {
        if engine.policy.image_state_handling {
            if let Some(pending) = advisory(rollback_check::<I, _, _, _>(engine, active))?.flatten() {
                return Ok(pending);
            }
        }
        for download in 0..downloads {
            if advisory(resume_check::<I, _, _, _>(engine, active, download))? == Some(true) {
                info!("resuming installation into slot {} from {}", active, download);
                return Ok(Pending::ResumeUpdate { active, download });
            }
        }
    }

    for download in 0..downloads {
        if let Some(active) = advisory(fresh_check::<I, _, _, _>(engine, download))?.flatten() {
            info!("new image in download slot {} for slot {}", download, active);
            return Ok(Pending::UpdateReady { active, download });
        }
    }
    Ok(Pending::NoUpdate)
}

/// Flash errors do not stop the scan of the other slots. They are in the
/// flash error log already.
fn advisory<T>(res: Result<T, Error>) -> Result<Option<T>, Error> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(Error::Flash(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn rollback_check<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    active: usize,
) -> Result<Option<Pending>, Error> {
    let view = engine.active_view(active)?;
    let raw = engine.read_header(view.base())?;
    match engine.authenticate_for(&raw, active) {
        Some(header) => match header.image_state() {
            ImageState::SelfTest | ImageState::Corrupt => {
                warn!("image in slot {} failed its self-test", active);
                let download = I::find_rollback_source(engine, active, &raw)?;
                Ok(Some(Pending::RollbackRequired { active, download }))
            }
            _ => Ok(None),
        },
        None => Ok(I::find_rollback_source(engine, active, &raw)?
            .map(|download| Pending::RollbackRequired { active, download: Some(download) })),
    }
}

fn resume_check<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    active: usize,
    download: usize,
) -> Result<bool, Error> {
    let (_, layout) = install::download::<I, _, _, _>(engine, download)?;
    let trailer = engine.read_trailer(&layout)?;
    match trailer.magic {
        MagicState::Valid => {}
        MagicState::Corrupt => return Err(engine.reject(download, ExceptionId::MagicPattern)),
        _ => return Ok(false),
    }
    let Some(test) = engine.authenticate(&trailer.test) else {
        return Err(engine.reject(download, ExceptionId::SignatureFailure));
    };
    if test.magic().slot_index() != active {
        return Ok(false);
    }

    let view = engine.active_view(active)?;
    let active_header = engine.read_header(view.base())?;
    match resume_case::<I, _, _, _>(engine, active, download, &active_header, &trailer, &test)? {
        Some(_) => {
            engine.ctx.fw_to_test = trailer.test;
            engine.ctx.fw_validated = trailer.valid;
            Ok(true)
        }
        None => Err(engine.reject(download, ExceptionId::HeaderMismatch)),
    }
}

/// Compare the active header with both trailer copies.
///
/// Returns the resume case with the version the candidate must not be older
/// than, or `None` when the active header belongs to neither image.
pub(crate) fn resume_case<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    active: usize,
    download: usize,
    active_header: &RawHeader,
    trailer: &Trailer,
    test: &Header,
) -> Result<Option<(ResumeCase, u16)>, Error> {
    let current = engine.authenticate_for(active_header, active);
    let is_valid = *active_header == trailer.valid;
    let is_test = *active_header == trailer.test;

    let case = if is_valid && is_test {
        ResumeCase::Ambiguous
    } else if is_valid {
        ResumeCase::NotStarted
    } else if is_test {
        ResumeCase::HeaderInstalled
    } else if I::header_window(engine, active, download, active_header, trailer)? {
        ResumeCase::HeaderWindow
    } else if current.is_none() && test.fw_version() == engine.policy.initial_version {
        ResumeCase::InitialVersion
    } else {
        return Ok(None);
    };

    let reference = match (&current, case) {
        (Some(header), _) => header.fw_version(),
        (None, ResumeCase::HeaderWindow) => engine
            .authenticate_for(&trailer.valid, active)
            .map_or(0, |h| h.fw_version()),
        (None, _) => 0,
    };
    Ok(Some((case, reference)))
}

/// Re-derive from flash the version a resumed candidate is checked against.
pub(crate) fn resume_reference<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    active: usize,
    download: usize,
) -> Result<u16, Error> {
    let (_, layout) = install::download::<I, _, _, _>(engine, download)?;
    let trailer = engine.read_trailer(&layout)?;
    let Some(test) = engine.authenticate_for(&trailer.test, active) else {
        return Err(engine.raise(ExceptionId::SignatureFailure));
    };
    let view = engine.active_view(active)?;
    let active_header = engine.read_header(view.base())?;
    match resume_case::<I, _, _, _>(engine, active, download, &active_header, &trailer, &test)? {
        Some((_, reference)) => Ok(reference),
        None => Err(engine.raise(ExceptionId::HeaderMismatch)),
    }
}

fn fresh_check<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    download: usize,
) -> Result<Option<usize>, Error> {
    let (view, layout) = install::download::<I, _, _, _>(engine, download)?;
    if !matches!(engine.check_trailer_magic(&layout)?, MagicState::Erased | MagicState::Incomplete) {
        return Ok(None);
    }
    let raw = engine.read_header(view.base())?;
    if raw.parse().is_none() {
        return Ok(None);
    }
    let Some(header) = engine.authenticate(&raw) else {
        return Err(engine.reject(download, ExceptionId::SignatureFailure));
    };
    let active = header.magic().slot_index();
    if active >= engine.layout.active.len() || !I::check_pending(engine, &header, active, download)? {
        return Ok(None);
    }
    engine.ctx.fw_to_test = raw;
    Ok(Some(active))
}
