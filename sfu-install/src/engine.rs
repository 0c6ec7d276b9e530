// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use embedded_storage::nor_flash::NorFlash;
use sfu_image::{Header, VerificationResult};

use crate::boot_info::{BootInfo, RECORD_BUF};
use crate::config::{Layout, Policy, Region, CHUNK_SIZE};
use crate::context::BootContext;
use crate::crypto::{CryptoEngine, Payload};
use crate::exception::{ExceptionId, Platform};
use crate::flash::{Flash, FlashError};
use crate::flow::{FlowControl, Step};
use crate::header::RawHeader;
use crate::slot::SlotView;
use crate::Error;

/// Everything one boot cycle works with: flash, crypto, board services,
/// the flash layout and the per-boot state.
pub struct Engine<F, C, P> {
    pub(crate) flash: Flash<F>,
    pub(crate) crypto: C,
    pub(crate) platform: P,
    pub(crate) layout: Layout,
    pub(crate) policy: Policy,
    pub(crate) flow: FlowControl,
    pub(crate) ctx: BootContext,
}

impl<F: NorFlash, C: CryptoEngine, P: Platform> Engine<F, C, P> {
    pub(crate) fn new(flash: F, crypto: C, platform: P, layout: Layout, policy: Policy) -> Self {
        Self {
            flash: Flash::new(flash),
            crypto,
            platform,
            layout,
            policy,
            flow: FlowControl::new(),
            ctx: BootContext::default(),
        }
    }

    pub(crate) fn word(&self) -> u32 {
        F::WRITE_SIZE as u32
    }

    pub(crate) fn page(&self) -> u32 {
        F::ERASE_SIZE as u32
    }

    pub(crate) fn active_view(&self, index: usize) -> Result<SlotView, Error> {
        let region = self.layout.active_slot(index).ok_or(Error::InvalidSlot)?;
        Ok(SlotView::new(region, self.layout.header_area, self.layout.swap.size, 0, self.page()))
    }

    pub(crate) fn download_view(&self, index: usize, trailer: u32) -> Result<SlotView, Error> {
        let region = self.layout.download_slot(index).ok_or(Error::InvalidSlot)?;
        Ok(SlotView::new(region, self.layout.header_area, self.layout.swap.size, trailer, self.page()))
    }

    fn flash_error(&mut self, e: FlashError) -> Error {
        if self.policy.halt_on_flash_error {
            let _ = self.store_exception(ExceptionId::FlashError);
            self.platform.fatal(ExceptionId::FlashError);
        }
        Error::Flash(e)
    }

    #[track_caller]
    pub(crate) fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        match self.flash.read(address, buf) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.flash_error(e)),
        }
    }

    /// Write `data`, padded with 0xff to the write size, one chunk at a time.
    #[track_caller]
    pub(crate) fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let word = F::WRITE_SIZE;
        let mut buf = [0xff; CHUNK_SIZE];
        let mut offset = 0;
        for chunk in data.chunks(CHUNK_SIZE) {
            let len = chunk.len().next_multiple_of(word);
            buf[..chunk.len()].copy_from_slice(chunk);
            buf[chunk.len()..len].fill(0xff);
            self.platform.refresh_watchdog();
            if let Err(e) = self.flash.write(address + offset, &buf[..len]) {
                return Err(self.flash_error(e));
            }
            offset += chunk.len() as u32;
        }
        Ok(())
    }

    /// Erase `[from, to)` page by page.
    #[track_caller]
    pub(crate) fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        let page = self.page();
        let mut address = from;
        while address < to {
            self.platform.refresh_watchdog();
            if let Err(e) = self.flash.erase(address, address + page) {
                return Err(self.flash_error(e));
            }
            address += page;
        }
        Ok(())
    }

    /// Erase the pages of `[from, to)` that are not erased yet.
    #[track_caller]
    pub(crate) fn erase_if_needed(&mut self, from: u32, to: u32) -> Result<(), Error> {
        let page = self.page();
        let mut address = from;
        while address < to {
            if !self.is_erased(address, page)? {
                self.erase(address, address + page)?;
            }
            address += page;
        }
        Ok(())
    }

    #[track_caller]
    pub(crate) fn is_erased(&mut self, address: u32, len: u32) -> Result<bool, Error> {
        match self.flash.is_erased(address, len) {
            Ok(erased) => Ok(erased),
            Err(e) => Err(self.flash_error(e)),
        }
    }

    /// Copy one chunk of `len` bytes to erased flash. Nothing is written
    /// when the chunk is erased.
    #[track_caller]
    pub(crate) fn copy_chunk(&mut self, from: u32, to: u32, len: u32) -> Result<(), Error> {
        let mut buf = [0; CHUNK_SIZE];
        let chunk = buf.get_mut(..len as usize).ok_or(Error::Geometry)?;
        self.read(from, chunk)?;
        if chunk.iter().any(|&b| b != 0xff) {
            self.write(to, chunk)?;
        }
        Ok(())
    }

    /// Decrypt `len` bytes of body at `from` into erased flash at `to`. The
    /// decryption must have been started by the caller.
    #[track_caller]
    pub(crate) fn decrypt_into(&mut self, from: u32, to: u32, len: u32) -> Result<(), Error> {
        let mut input = [0; CHUNK_SIZE];
        let mut output = [0; CHUNK_SIZE];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(CHUNK_SIZE as u32) as usize;
            self.read(from + offset, &mut input[..n])?;
            if self.crypto.decrypt_append(&input[..n], &mut output[..n]).is_err() {
                return Err(self.raise(ExceptionId::DecryptFailure));
            }
            self.write(to + offset, &output[..n])?;
            offset += n as u32;
        }
        Ok(())
    }

    pub(crate) fn read_header(&mut self, address: u32) -> Result<RawHeader, Error> {
        let mut raw = RawHeader::default();
        self.read(address, &mut raw.0)?;
        Ok(raw)
    }

    /// Write a header into an erased header area. The signed part goes last,
    /// so an interrupted write never leaves an authentic header behind.
    #[track_caller]
    pub(crate) fn write_header(&mut self, address: u32, header: &RawHeader) -> Result<(), Error> {
        let split = Header::SIGNATURE.end;
        self.write(address + split as u32, &header.0[split..])?;
        self.write(address, &header.0[..split])
    }

    /// Parse `raw` and verify its signature.
    pub(crate) fn authenticate(&mut self, raw: &RawHeader) -> Option<Header> {
        const CF1: u32 = 3;
        const CF2: u32 = 5;
        const CF3: u32 = 7;
        let mut control_flow_integrity_counter = 0;

        let header = raw.parse()?;
        control_flow_integrity_counter += CF1;
        let res = self.crypto.verify_header_signature(&header);
        if res == VerificationResult::Valid {
            control_flow_integrity_counter += CF2;
            if core::hint::black_box(res) == VerificationResult::Valid {
                control_flow_integrity_counter += CF3;
                let cfi_counter_ptr = &control_flow_integrity_counter as *const u32;
                if unsafe { cfi_counter_ptr.read_volatile() } == CF1 + CF2 + CF3 {
                    return Some(header);
                }
            }
        }
        None
    }

    /// [`authenticate`](Self::authenticate), and check the header targets
    /// active slot `active`.
    pub(crate) fn authenticate_for(&mut self, raw: &RawHeader, active: usize) -> Option<Header> {
        self.authenticate(raw).filter(|h| h.magic().slot_index() == active)
    }

    /// Version of the authentic image in active slot `active`, zero if there
    /// is none.
    pub(crate) fn current_version(&mut self, active: usize) -> Result<u16, Error> {
        let view = self.active_view(active)?;
        let raw = self.read_header(view.base())?;
        Ok(self.authenticate_for(&raw, active).map_or(0, |h| h.fw_version()))
    }

    /// Authenticate an image spread over `payload` against the firmware tag.
    pub(crate) fn authenticate_payload(&mut self, header: &Header, payload: &Payload) -> Result<VerificationResult, Error> {
        if self.crypto.authenticate_init(header).is_err() {
            return Ok(VerificationResult::Invalid);
        }
        let mut buf = [0; CHUNK_SIZE];
        for span in payload.spans() {
            let mut offset = 0;
            while offset < span.len {
                let n = (span.len - offset).min(CHUNK_SIZE as u32) as usize;
                self.read(span.address + offset, &mut buf[..n])?;
                self.platform.refresh_watchdog();
                if self.crypto.authenticate_append(&buf[..n]).is_err() {
                    return Ok(VerificationResult::Invalid);
                }
                offset += n as u32;
            }
        }
        Ok(self.crypto.authenticate_finish().unwrap_or(VerificationResult::Invalid))
    }

    /// Advance the crypto ledger. A mismatch is fatal.
    pub(crate) fn step(&mut self, step: Step) {
        if let Err(e) = self.flow.step_crypto(step) {
            error!("flow control mismatch: expected {:#x}, found {:#x}", e.expected, e.found);
            let _ = self.store_exception(ExceptionId::FlowControl);
            self.platform.fatal(ExceptionId::FlowControl);
        }
    }

    pub(crate) fn step_protect(&mut self, step: Step) {
        if let Err(e) = self.flow.step_protect(step) {
            error!("protection flow mismatch: expected {:#x}, found {:#x}", e.expected, e.found);
            let _ = self.store_exception(ExceptionId::FlowControl);
            self.platform.fatal(ExceptionId::FlowControl);
        }
    }

    /// Persist a security exception and turn it into an error.
    pub(crate) fn raise(&mut self, id: ExceptionId) -> Error {
        error!("security exception: {}", id);
        if self.store_exception(id).is_err() {
            warn!("could not persist the exception");
        }
        Error::Security(id)
    }

    /// Persist `id` and erase download slot `download` with the swap area,
    /// so the offending image is not retried.
    pub(crate) fn reject(&mut self, download: usize, id: ExceptionId) -> Error {
        let error = self.raise(id);
        let _ = self.erase_download(download);
        error
    }

    pub(crate) fn erase_download(&mut self, download: usize) -> Result<(), Error> {
        let region = self.layout.download_slot(download).ok_or(Error::InvalidSlot)?;
        self.erase_if_needed(region.base, region.end())?;
        let swap = self.layout.swap;
        if swap.size != 0 {
            self.erase_if_needed(swap.base, swap.end())?;
        }
        Ok(())
    }

    pub(crate) fn boot_info(&mut self) -> Result<BootInfo, Error> {
        let mut buf = [0; RECORD_BUF];
        self.flash.read(self.layout.boot_info.base, &mut buf).map_err(Error::Flash)?;
        Ok(BootInfo::decode(&buf).unwrap_or_default())
    }

    /// Update the boot info page. Goes straight to flash, bypassing the flash
    /// error policy, since it runs while handling errors.
    pub(crate) fn store_exception(&mut self, id: ExceptionId) -> Result<(), Error> {
        let mut info = self.boot_info()?;
        info.record(id);

        let mut buf = [0xff; RECORD_BUF];
        let len = info.encode(&mut buf).ok_or(Error::Encoding)?;
        let len = len.next_multiple_of(F::WRITE_SIZE);

        let Region { base, size } = self.layout.boot_info;
        let page = self.page();
        let mut address = base;
        while address < base + size {
            self.platform.refresh_watchdog();
            self.flash.erase(address, address + page).map_err(Error::Flash)?;
            address += page;
        }
        self.platform.refresh_watchdog();
        self.flash.write(base, &buf[..len]).map_err(Error::Flash)
    }
}
