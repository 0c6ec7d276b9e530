// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Installer without swap area. The candidate is decrypted straight into the
//! active slot; the download slot keeps the ciphertext until the end, so an
//! interrupted installation starts over. The replaced image is lost.

use embedded_storage::nor_flash::NorFlash;
use sfu_image::{Header, VerificationResult};

use super::{check_no_additional_code, download, header_to_test, invalidate, Installer};
use crate::config::{Layout, LayoutError, Region};
use crate::crypto::{CryptoEngine, Payload};
use crate::decision::resume_reference;
use crate::engine::Engine;
use crate::exception::{ExceptionId, Platform};
use crate::flow;
use crate::header::RawHeader;
use crate::rollback::{double_check, Verdict};
use crate::slot::SlotView;
use crate::trailer::{MagicState, Trailer, TrailerLayout};
use crate::Error;

/// Installer overwriting the active slot in place.
pub struct NoSwap;

impl NoSwap {
    fn fits(header: &Header, active: &SlotView, download: &SlotView) -> Result<(), Error> {
        let body = active.header_range().len() as u32;
        if body + header.fw_size() > active.size() {
            return Err(Error::ImageTooLarge);
        }
        if body + header.partial_size() > download.capacity() {
            return Err(Error::DownloadSlotTooSmall);
        }
        Ok(())
    }

    fn verify_installed<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: &SlotView,
        header: &Header,
    ) -> Result<bool, Error> {
        let image = Payload::single(active.header_range().end, header.fw_size());
        Ok(engine.authenticate_payload(header, &image)? == VerificationResult::Valid)
    }

    /// Cleanup once the image is in place: spend the trailer, drop the download.
    fn finish<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        trailer: &TrailerLayout,
        download: &SlotView,
    ) -> Result<(), Error> {
        engine.clear_magic(trailer)?;
        engine.erase_if_needed(download.base(), download.end())?;
        engine.step(flow::INSTALL);
        Ok(())
    }

    fn run<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: &SlotView,
        download: &SlotView,
        trailer: &TrailerLayout,
        test: &RawHeader,
    ) -> Result<(), Error> {
        let header = test.parse().ok_or(Error::Geometry)?;

        // Header area first: from here on the slot holds no authentic image.
        let area = active.header_range();
        engine.erase(area.start, area.end)?;
        engine.erase(area.end, active.end())?;
        if engine.crypto.decrypt_init(&header).is_err() {
            return Err(engine.raise(ExceptionId::DecryptFailure));
        }
        engine.decrypt_into(download.header_range().end, area.end, header.partial_size())?;
        if engine.crypto.decrypt_finish().is_err() {
            return Err(engine.raise(ExceptionId::DecryptFailure));
        }

        if !Self::verify_installed(engine, active, &header)? {
            return Err(engine.raise(ExceptionId::IntegrityCheck));
        }
        engine.step(flow::INTEGRITY);

        engine.write_header(active.base(), test)?;
        Self::finish(engine, trailer, download)?;
        info!("image installed, version {}", header.fw_version());
        Ok(())
    }
}

impl Installer for NoSwap {
    fn validate_layout(layout: &Layout, word: u32, _page: u32) -> Result<(), LayoutError> {
        for &slot in layout.download {
            let trailer = Self::trailer_layout(layout, slot, word);
            if trailer.size() + layout.header_area >= slot.size {
                return Err(LayoutError::DownloadTooSmall(slot.base));
            }
        }
        Ok(())
    }

    fn trailer_layout(_layout: &Layout, download: Region, word: u32) -> TrailerLayout {
        TrailerLayout::no_swap(download.end(), word)
    }

    fn check_pending<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        header: &Header,
        active: usize,
        download_index: usize,
    ) -> Result<bool, Error> {
        if header.is_delta() {
            return Ok(false);
        }
        let (view, _) = download::<Self, _, _, _>(engine, download_index)?;
        let slot = engine.active_view(active)?;
        Ok(Self::fits(header, &slot, &view).is_ok())
    }

    fn header_window<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        _active: usize,
        _download: usize,
        active_header: &RawHeader,
        trailer: &Trailer,
    ) -> Result<bool, Error> {
        Ok(active_header.is_transition(&trailer.valid, &trailer.test, engine.word() as usize))
    }

    fn find_rollback_source<F: NorFlash, C: CryptoEngine, P: Platform>(
        _engine: &mut Engine<F, C, P>,
        _active: usize,
        _active_header: &RawHeader,
    ) -> Result<Option<usize>, Error> {
        Ok(None)
    }

    fn install<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download_index: usize,
        header: &Header,
    ) -> Result<(), Error> {
        let raw = RawHeader::from_header(header);
        let Some(test) = engine.authenticate_for(&raw, active) else {
            return Err(engine.raise(ExceptionId::SignatureFailure));
        };
        engine.step(flow::AUTHENTICATE);
        if test.is_delta() {
            return Err(Error::DeltaUnsupported);
        }

        let policy = engine.policy;
        if double_check(&policy, test.fw_version(), || engine.current_version(active))? != Verdict::Allowed {
            return Err(engine.raise(ExceptionId::VersionRollback));
        }

        let view = engine.active_view(active)?;
        let (download, trailer) = download::<Self, _, _, _>(engine, download_index)?;
        Self::fits(&test, &view, &download)?;
        check_no_additional_code(engine, &download, &test)?;

        let active_header = engine.read_header(view.base())?;
        let to_test = header_to_test(&test, &active_header);
        engine.ctx.fw_to_test = to_test.clone();
        engine.ctx.fw_validated = active_header.clone();

        info!("installing version {} into slot {}", test.fw_version(), active);
        if let Err(e) = engine.write_trailer(&trailer, &active_header, &to_test) {
            return Err(match e {
                Error::Security(_) => e,
                _ => engine.raise(ExceptionId::TrailerUpdate),
            });
        }
        Self::run(engine, &view, &download, &trailer, &to_test)
    }

    fn resume<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download_index: usize,
    ) -> Result<(), Error> {
        let (download, layout) = download::<Self, _, _, _>(engine, download_index)?;
        let trailer = engine.read_trailer(&layout)?;
        if trailer.magic != MagicState::Valid {
            return Err(Error::NotResumable);
        }
        let Some(test) = engine.authenticate_for(&trailer.test, active) else {
            return Err(engine.raise(ExceptionId::SignatureFailure));
        };
        engine.step(flow::AUTHENTICATE);

        let policy = engine.policy;
        let verdict = double_check(&policy, test.fw_version(), || {
            resume_reference::<Self, _, _, _>(engine, active, download_index)
        })?;
        if verdict != Verdict::Allowed {
            return Err(engine.raise(ExceptionId::VersionRollback));
        }

        let view = engine.active_view(active)?;
        engine.ctx.fw_to_test = trailer.test.clone();
        engine.ctx.fw_validated = trailer.valid.clone();

        let installed = engine.read_header(view.base())? == trailer.test;
        if installed && Self::verify_installed(engine, &view, &test)? {
            engine.step(flow::INTEGRITY);
            return Self::finish(engine, &layout, &download);
        }
        info!("restarting installation of version {}", test.fw_version());
        Self::run(engine, &view, &download, &layout, &trailer.test)
    }

    fn rollback<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        _download: Option<usize>,
    ) -> Result<(), Error> {
        invalidate(engine, active)
    }
}
