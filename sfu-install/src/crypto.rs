// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use heapless::Vec;
use sfu_image::{Header, VerificationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CryptoError {
    /// No key for the slot named by the header magic.
    UnknownKey,
    /// A call out of the init, append, finish order.
    Sequence,
    /// Input and output of a decrypt call differ in length.
    Length,
    /// The decrypted data does not match the header tag.
    TagMismatch,
}

/// Cryptographic services. Keys stay inside the implementation and are
/// selected through the header magic.
pub trait CryptoEngine {
    /// Check the signature over the authenticated region of a header.
    fn verify_header_signature(&mut self, header: &Header) -> VerificationResult;

    fn decrypt_init(&mut self, header: &Header) -> Result<(), CryptoError>;

    /// Decrypt the next `input.len()` bytes of the body into `output`.
    fn decrypt_append(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError>;

    /// Finish decryption, checking the decrypted data against the partial tag.
    fn decrypt_finish(&mut self) -> Result<(), CryptoError>;

    /// Start authenticating a complete image, `fw_size` bytes, against the
    /// firmware tag.
    fn authenticate_init(&mut self, header: &Header) -> Result<(), CryptoError>;

    fn authenticate_append(&mut self, data: &[u8]) -> Result<(), CryptoError>;

    fn authenticate_finish(&mut self) -> Result<VerificationResult, CryptoError>;
}

/// A contiguous run of flash holding part of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Span {
    pub address: u32,
    pub len: u32,
}

/// Up to four spans making up one image, in image order.
#[derive(Debug, Default, Clone)]
pub struct Payload {
    spans: Vec<Span, 4>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(address: u32, len: u32) -> Self {
        let mut payload = Self::new();
        payload.push(address, len);
        payload
    }

    /// Append a span. Empty spans are skipped. Returns `false` when all four
    /// spans are taken.
    pub fn push(&mut self, address: u32, len: u32) -> bool {
        len == 0 || self.spans.push(Span { address, len }).is_ok()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> u32 {
        self.spans.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
