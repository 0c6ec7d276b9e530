// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Swap installer.
//!
//! The candidate is decrypted in place: the first block of plaintext goes to
//! the swap area, the rest to the download slot shifted down by one block.
//! The affected active blocks are then processed from the last to the first.
//! Each one is first backed up into the download slot, then rewritten with
//! the new content, and both steps leave a marker in the trailer. Block `i`
//! is backed up into download block `i - first`, which only ever held
//! plaintext of blocks above `i`, so any interrupted step can be redone from
//! what is still in flash. The backups stay in the download slot after the
//! installation and serve a later rollback.

use core::ops::Range;

use embedded_storage::nor_flash::NorFlash;
use sfu_image::{Header, ImageState, VerificationResult};

use super::{check_no_additional_code, download, header_to_test, invalidate, Installer};
use crate::config::{Layout, LayoutError, Region, CHUNK_SIZE};
use crate::crypto::{CryptoEngine, Payload};
use crate::decision::resume_reference;
use crate::engine::Engine;
use crate::exception::{ExceptionId, Platform};
use crate::flow;
use crate::header::RawHeader;
use crate::rollback::{double_check, Verdict};
use crate::slot::SlotView;
use crate::trailer::{MagicState, Marker, Trailer, TrailerLayout};
use crate::Error;

/// Installer working through the swap area, with resumable block moves.
pub struct Swap;

/// Block geometry of one installation, in offsets into the active slot.
#[derive(Debug, Clone)]
struct Plan {
    block: u32,
    body: u32,
    /// Bytes shipped in the download slot.
    patch: Range<u32>,
    /// End of the new image.
    fw_end: u32,
    first: u32,
    last: u32,
    new_blocks: u32,
    old_blocks: u32,
    top: u32,
    swap: Region,
    download: u32,
}

impl Plan {
    fn new(
        layout: &Layout,
        test: &Header,
        valid: Option<&Header>,
        active: &SlotView,
        download: &SlotView,
    ) -> Result<Self, Error> {
        let block = layout.swap.size;
        let body = layout.header_area;
        let fw_end = body
            .checked_add(test.fw_size())
            .filter(|&end| end <= active.size())
            .ok_or(Error::ImageTooLarge)?;
        if test.is_delta() && valid.is_none() {
            return Err(Error::DeltaWithoutBase);
        }

        let start = body + test.partial_offset();
        let patch = start..start + test.partial_size();
        let first = patch.start / block;
        let last = (patch.end - 1) / block;
        let new_blocks = fw_end.div_ceil(block);
        let old_blocks = valid.map_or(0, |v| {
            body.saturating_add(v.fw_size()).div_ceil(block).min(active.blocks())
        });
        let top = last.max(new_blocks - 1).max(old_blocks.saturating_sub(1));

        if body + test.partial_size() > download.capacity() || (top - first + 1) * block > download.capacity() {
            return Err(Error::DownloadSlotTooSmall);
        }

        Ok(Self {
            block,
            body,
            patch,
            fw_end,
            first,
            last,
            new_blocks,
            old_blocks,
            top,
            swap: layout.swap,
            download: download.base(),
        })
    }

    fn affected(&self, index: u32) -> bool {
        index == 0
            || (self.first..=self.last).contains(&index)
            || index == self.new_blocks - 1
            || (self.new_blocks..self.old_blocks).contains(&index)
    }

    /// Affected blocks, last first.
    fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..=self.top).rev().filter(|&i| self.affected(i))
    }

    /// Where the backup of active block `index` goes.
    fn backup(&self, index: u32) -> u32 {
        if index < self.first {
            self.swap.base
        } else {
            self.download + (index - self.first) * self.block
        }
    }

    /// Location of plaintext byte `pos` of the shipped data.
    fn stream(&self, pos: u32) -> u32 {
        if pos < self.block {
            self.swap.base + pos
        } else {
            self.download + pos - self.block
        }
    }

    fn len(&self) -> u32 {
        self.patch.end - self.patch.start
    }

    /// The new image before the swap: unchanged head, decrypted data, unchanged tail.
    fn staged_image(&self, active: &SlotView) -> Payload {
        let mut payload = Payload::new();
        let staged = self.len().min(self.block);
        payload.push(active.base() + self.body, self.patch.start - self.body);
        payload.push(self.swap.base, staged);
        payload.push(self.download, self.len() - staged);
        payload.push(active.base() + self.patch.end, self.fw_end - self.patch.end);
        payload
    }
}

impl Swap {
    /// Decrypt the candidate into the swap area and the shifted download slot.
    fn prepare<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        plan: &Plan,
        header: &Header,
        download: &SlotView,
    ) -> Result<(), Error> {
        if engine.crypto.decrypt_init(header).is_err() {
            return Err(engine.raise(ExceptionId::DecryptFailure));
        }
        let cipher = download.header_range().end;
        let len = plan.len();

        engine.erase(plan.swap.base, plan.swap.end())?;
        engine.decrypt_into(cipher, plan.swap.base, len.min(plan.block))?;

        let limit = download.base() + download.capacity();
        let mut pos = plan.block;
        while pos < len {
            let to = plan.stream(pos);
            engine.erase(to, (to + plan.block).min(limit))?;
            engine.decrypt_into(cipher + pos, to, (len - pos).min(plan.block))?;
            pos += plan.block;
        }

        if engine.crypto.decrypt_finish().is_err() {
            return Err(engine.raise(ExceptionId::DecryptFailure));
        }
        Ok(())
    }

    fn run<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        plan: &Plan,
        active: &SlotView,
        trailer: &TrailerLayout,
        test: &RawHeader,
        resumed: bool,
    ) -> Result<(), Error> {
        let header = test.parse().ok_or(Error::Geometry)?;

        for i in plan.blocks() {
            let block = active.block(i).ok_or(Error::Geometry)?;
            if !engine.marker(trailer, Marker::ToDownload, i)? {
                let backup = plan.backup(i);
                engine.erase(backup, backup + plan.block)?;
                for chunk in active.chunks_from(i, block.start) {
                    let to = backup + chunk.start - block.start;
                    engine.copy_chunk(chunk.start, to, chunk.end - chunk.start)?;
                }
                engine.set_marker(trailer, Marker::ToDownload, i)?;
            }
            if !engine.marker(trailer, Marker::ToActive, i)? {
                // The header area of block 0 is rewritten on its own at the end.
                let start = if i == 0 { block.start + plan.body } else { block.start };
                engine.erase(start, block.end)?;
                Self::write_merged(engine, plan, active, i, start)?;
                if i != 0 {
                    engine.set_marker(trailer, Marker::ToActive, i)?;
                }
            }
            debug!("block {} swapped", i);
        }

        let image = Payload::single(active.base() + plan.body, header.fw_size());
        if engine.authenticate_payload(&header, &image)? != VerificationResult::Valid {
            return Err(engine.raise(ExceptionId::SwapFailure));
        }
        if resumed {
            engine.step(flow::INTEGRITY);
        }

        for i in plan.top + 1..active.blocks() {
            let block = active.block(i).ok_or(Error::Geometry)?;
            engine.erase_if_needed(block.start, block.end)?;
        }
        if engine.read_header(active.base())? != *test {
            let area = active.header_range();
            engine.erase(area.start, area.end)?;
            engine.write_header(area.start, test)?;
        }
        if !engine.marker(trailer, Marker::ToActive, 0)? {
            engine.set_marker(trailer, Marker::ToActive, 0)?;
        }
        engine.clear_magic(trailer)?;
        engine.step(flow::INSTALL);
        info!("image installed, version {}", header.fw_version());
        Ok(())
    }

    /// Write the new content of active block `index` from address `from` to
    /// the block end, which is erased. Shipped bytes come from the staged
    /// plaintext, bytes past the image are left erased, the rest is copied
    /// from the backup.
    fn write_merged<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        plan: &Plan,
        active: &SlotView,
        index: u32,
        from: u32,
    ) -> Result<(), Error> {
        let mut buf = [0xff; CHUNK_SIZE];
        let block_start = index * plan.block;
        for range in active.chunks_from(index, from) {
            let offset = range.start - active.base();
            let n = range.end - range.start;
            let chunk = &mut buf[..n as usize];
            engine.read(plan.backup(index) + offset - block_start, chunk)?;

            for (j, b) in chunk.iter_mut().enumerate() {
                if offset + j as u32 >= plan.fw_end {
                    *b = 0xff;
                }
            }

            let lo = offset.max(plan.patch.start);
            let hi = (offset + n).min(plan.patch.end);
            if lo < hi {
                let dst = &mut chunk[(lo - offset) as usize..(hi - offset) as usize];
                Self::read_stream(engine, plan, lo - plan.patch.start, dst)?;
            }

            if chunk.iter().any(|&b| b != 0xff) {
                engine.write(range.start, chunk)?;
            }
        }
        Ok(())
    }

    fn read_stream<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        plan: &Plan,
        pos: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let split = (plan.block.saturating_sub(pos) as usize).min(buf.len());
        let (head, tail) = buf.split_at_mut(split);
        if !head.is_empty() {
            engine.read(plan.stream(pos), head)?;
        }
        if !tail.is_empty() {
            engine.read(plan.stream(pos + split as u32), tail)?;
        }
        Ok(())
    }

    fn plan_for<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download: &SlotView,
        trailer: &Trailer,
    ) -> Result<Option<Plan>, Error> {
        let Some(test) = engine.authenticate_for(&trailer.test, active) else {
            return Ok(None);
        };
        let valid = engine.authenticate_for(&trailer.valid, active);
        let view = engine.active_view(active)?;
        Ok(Plan::new(&engine.layout, &test, valid.as_ref(), &view, download).ok())
    }
}

impl Installer for Swap {
    fn validate_layout(layout: &Layout, word: u32, page: u32) -> Result<(), LayoutError> {
        let block = layout.swap.size;
        if block == 0 || block % page != 0 || block % word != 0 || layout.header_area > block {
            return Err(LayoutError::SwapBlock);
        }
        for slot in layout.slots() {
            if slot.size % block != 0 {
                return Err(LayoutError::SlotNotBlockMultiple(slot.base));
            }
        }
        for &slot in layout.download {
            let trailer = Self::trailer_layout(layout, slot, word);
            if trailer.size() + layout.header_area + block > slot.size {
                return Err(LayoutError::DownloadTooSmall(slot.base));
            }
        }
        Ok(())
    }

    fn trailer_layout(layout: &Layout, download: Region, word: u32) -> TrailerLayout {
        TrailerLayout::swap(download.end(), layout.max_active_blocks(), word)
    }

    fn check_pending<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        header: &Header,
        active: usize,
        download_index: usize,
    ) -> Result<bool, Error> {
        let (view, _) = download::<Self, _, _, _>(engine, download_index)?;
        let slot = engine.active_view(active)?;
        let body = engine.layout.header_area;
        Ok(body + header.fw_size() <= slot.size() && body + header.partial_size() <= view.capacity())
    }

    fn header_window<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download_index: usize,
        active_header: &RawHeader,
        trailer: &Trailer,
    ) -> Result<bool, Error> {
        if !active_header.is_transition(&trailer.valid, &trailer.test, engine.word() as usize) {
            return Ok(false);
        }
        let (view, layout) = download::<Self, _, _, _>(engine, download_index)?;
        let Some(plan) = Self::plan_for(engine, active, &view, trailer)? else {
            return Ok(false);
        };
        // Every block moved, only the header block is waiting for its header.
        for i in plan.blocks() {
            if !engine.marker(&layout, Marker::ToDownload, i)? {
                return Ok(false);
            }
            if i != 0 && !engine.marker(&layout, Marker::ToActive, i)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn find_rollback_source<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        active_header: &RawHeader,
    ) -> Result<Option<usize>, Error> {
        let current = engine.authenticate_for(active_header, active);
        for index in 0..engine.layout.download.len() {
            let (_, layout) = download::<Self, _, _, _>(engine, index)?;
            let trailer = engine.read_trailer(&layout)?;
            if trailer.magic != MagicState::Cleared || !trailer.clean {
                continue;
            }
            let (Some(valid), Some(test)) = (
                engine.authenticate_for(&trailer.valid, active),
                engine.authenticate_for(&trailer.test, active),
            ) else {
                continue;
            };
            if test.prev_fingerprint() != valid.signature() {
                continue;
            }
            if current.is_none() || active_header.same_identity(&trailer.test) {
                return Ok(Some(index));
            }
        }
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

        let policy = engine.policy;
        if double_check(&policy, test.fw_version(), || engine.current_version(active))? != Verdict::Allowed {
            return Err(engine.raise(ExceptionId::VersionRollback));
        }

        let view = engine.active_view(active)?;
        let (download, trailer) = download::<Self, _, _, _>(engine, download_index)?;
        let active_header = engine.read_header(view.base())?;
        let valid = engine.authenticate_for(&active_header, active);
        let plan = Plan::new(&engine.layout, &test, valid.as_ref(), &view, &download)?;
        check_no_additional_code(engine, &download, &test)?;

        let to_test = header_to_test(&test, &active_header);
        engine.ctx.fw_to_test = to_test.clone();
        engine.ctx.fw_validated = active_header.clone();

        info!("installing version {} into slot {}", test.fw_version(), active);
        Self::prepare(engine, &plan, &test, &download)?;
        if engine.authenticate_payload(&test, &plan.staged_image(&view))? != VerificationResult::Valid {
            return Err(engine.raise(ExceptionId::IntegrityCheck));
        }
        engine.step(flow::INTEGRITY);

        if let Err(e) = engine.write_trailer(&trailer, &active_header, &to_test) {
            return Err(match e {
                Error::Security(_) => e,
                _ => engine.raise(ExceptionId::TrailerUpdate),
            });
        }
        Self::run(engine, &plan, &view, &trailer, &to_test, false)
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
        let valid = engine.authenticate_for(&trailer.valid, active);
        let plan = Plan::new(&engine.layout, &test, valid.as_ref(), &view, &download)?;
        engine.ctx.fw_to_test = trailer.test.clone();
        engine.ctx.fw_validated = trailer.valid.clone();

        info!("resuming installation of version {}", test.fw_version());
        Self::run(engine, &plan, &view, &layout, &trailer.test, true)
    }

    fn rollback<F: NorFlash, C: CryptoEngine, P: Platform>(
        engine: &mut Engine<F, C, P>,
        active: usize,
        download_index: Option<usize>,
    ) -> Result<(), Error> {
        let Some(download_index) = download_index else {
            return invalidate(engine, active);
        };
        let (download, layout) = download::<Self, _, _, _>(engine, download_index)?;
        let trailer = engine.read_trailer(&layout)?;
        if trailer.magic != MagicState::Cleared || !trailer.clean {
            return invalidate(engine, active);
        }
        let (Some(valid), Some(test)) = (
            engine.authenticate_for(&trailer.valid, active),
            engine.authenticate_for(&trailer.test, active),
        ) else {
            return invalidate(engine, active);
        };
        if test.prev_fingerprint() != valid.signature() {
            return invalidate(engine, active);
        }
        engine.step(flow::AUTHENTICATE);

        let view = engine.active_view(active)?;
        let active_header = engine.read_header(view.base())?;
        if engine.authenticate_for(&active_header, active).is_some() && !active_header.same_identity(&trailer.test) {
            return Err(engine.raise(ExceptionId::HeaderMismatch));
        }

        let plan = Plan::new(&engine.layout, &test, Some(&valid), &view, &download)?;
        warn!("rolling back slot {} to version {}", active, valid.fw_version());
        for i in plan.blocks() {
            let block = view.block(i).ok_or(Error::Geometry)?;
            let start = if i == 0 { block.start + plan.body } else { block.start };
            engine.erase(start, block.end)?;
            for chunk in view.chunks_from(i, start) {
                let from = plan.backup(i) + chunk.start - block.start;
                engine.copy_chunk(from, chunk.start, chunk.end - chunk.start)?;
            }
        }
        for i in plan.top + 1..view.blocks() {
            let block = view.block(i).ok_or(Error::Geometry)?;
            engine.erase_if_needed(block.start, block.end)?;
        }

        let image = Payload::single(view.base() + plan.body, valid.fw_size());
        if engine.authenticate_payload(&valid, &image)? != VerificationResult::Valid {
            return Err(engine.raise(ExceptionId::IntegrityCheck));
        }
        engine.step(flow::INTEGRITY);

        let mut restored = valid;
        if !matches!(restored.image_state(), ImageState::Valid | ImageState::ValidAll) {
            restored.set_image_state(ImageState::Valid);
        }
        let area = view.header_range();
        engine.erase(area.start, area.end)?;
        engine.write_header(area.start, &RawHeader::from_header(&restored))?;

        engine.erase_download(download_index)?;
        engine.step(flow::INSTALL);
        Ok(())
    }
}
