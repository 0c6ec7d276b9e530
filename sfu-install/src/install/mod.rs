// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! The two installers. Which one a device uses is fixed at build time
//! through the type parameter of [`Sfu`](crate::Sfu).

use embedded_storage::nor_flash::NorFlash;
use sfu_image::Header;

use crate::config::{Layout, LayoutError, Region};
use crate::crypto::CryptoEngine;
use crate::engine::Engine;
use crate::exception::{ExceptionId, Platform};
use crate::header::RawHeader;
use crate::slot::SlotView;
use crate::trailer::{Trailer, TrailerLayout};
use crate::Error;

mod noswap;
mod swap;

pub use noswap::NoSwap;
pub use swap::Swap;

pub trait Installer {
    /// Layout constraints of this installer, on top of [`Layout::validate`].
    fn validate_layout(layout: &Layout, word: u32, page: u32) -> Result<(), LayoutError>;

    /// Where the trailer of a download slot lives.
    fn trailer_layout(layout: &Layout, download: Region, word: u32) -> TrailerLayout;

    /// Whether a fresh candidate fits the slots it would use.
    fn check_pending<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        header: &Header,
        active: usize,
        download: usize,
    ) -> Result<bool, Error>;

    /// Whether the active header shows an interrupted header update of the
    /// installation recorded in `trailer`.
    fn header_window<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download: usize,
        active_header: &RawHeader,
        trailer: &Trailer,
    ) -> Result<bool, Error>;

    /// Download slot holding the backup of the image the active slot replaced.
    fn find_rollback_source<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        active_header: &RawHeader,
    ) -> Result<Option<usize>, Error>;

    fn install<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download: usize,
        header: &Header,
    ) -> Result<(), Error>;

    fn resume<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download: usize,
    ) -> Result<(), Error>;

    fn rollback<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download: Option<usize>,
    ) -> Result<(), Error>;
}

/// View and trailer placement of download slot `index`.
pub(crate) fn download<I: Installer, F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &Engine<F, C, P>,
    index: usize,
) -> Result<(SlotView, TrailerLayout), Error> {
    let region = engine.layout.download_slot(index).ok_or(Error::InvalidSlot)?;
    let trailer = I::trailer_layout(&engine.layout, region, engine.word());
    Ok((engine.download_view(index, trailer.size())?, trailer))
}

/// Header copy for the trailer and the active slot: the candidate in state
/// new, chained to the header it replaces.
pub(crate) fn header_to_test(candidate: &Header, replaced: &RawHeader) -> RawHeader {
    let mut header = candidate.clone();
    let mut fingerprint = [0; 64];
    fingerprint.copy_from_slice(replaced.signature());
    header.set_image_state(sfu_image::ImageState::New);
    header.set_prev_fingerprint(fingerprint);
    RawHeader::from_header(&header)
}

/// Fail when anything follows the image in the download slot.
pub(crate) fn check_no_additional_code<F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    download: &SlotView,
    header: &Header,
) -> Result<(), Error> {
    let end = download.header_range().end + header.partial_size();
    let limit = download.body_range().end;
    if end > limit {
        return Err(Error::DownloadSlotTooSmall);
    }
    if !engine.is_erased(end, limit - end)? {
        return Err(engine.raise(ExceptionId::AdditionalCode));
    }
    Ok(())
}

/// Invalidate a failed image that cannot be rolled back.
pub(crate) fn invalidate<F: NorFlash, C: CryptoEngine, P: Platform>(
    engine: &mut Engine<F, C, P>,
    active: usize,
) -> Result<(), Error> {
    let view = engine.active_view(active)?;
    let header = view.header_range();
    engine.erase(header.start, header.end)?;
    Err(engine.raise(ExceptionId::RollbackImpossible))
}
