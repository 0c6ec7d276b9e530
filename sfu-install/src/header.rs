// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use sfu_image::Header;

/// Pattern of a header buffer that was never filled from flash. Neither
/// erased nor zeroed flash can look like it.
const SENTINEL: u8 = 0xa5;

/// Bytes covering the header identity: everything up to and including the
/// signature. The state words and the fingerprint are left out since the
/// bootloader updates them in place.
const IDENTITY_LEN: usize = Header::SIGNATURE.end;

/// Header bytes exactly as stored in flash.
#[derive(Clone, PartialEq, Eq)]
pub struct RawHeader(pub [u8; Header::SIZE]);

impl Default for RawHeader {
    fn default() -> Self {
        Self([SENTINEL; Header::SIZE])
    }
}

impl core::fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RawHeader({:02x?}..)", &self.0[..8])
    }
}

impl RawHeader {
    pub fn from_header(header: &Header) -> Self {
        Self(header.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; Header::SIZE] {
        &self.0
    }

    pub fn is_erased(&self) -> bool {
        self.0.iter().all(|&b| b == 0xff)
    }

    /// Parse the fields, without checking the signature.
    pub fn parse(&self) -> Option<Header> {
        Header::parse(&self.0).ok().flatten()
    }

    pub fn same_identity(&self, other: &RawHeader) -> bool {
        self.0[..IDENTITY_LEN] == other.0[..IDENTITY_LEN]
    }

    pub fn signature(&self) -> &[u8] {
        &self.0[Header::SIGNATURE]
    }

    /// Whether this header is what flash holds while `from` is replaced by
    /// `to`: every `word`-sized word is erased or equals the same word of one
    /// of them.
    pub fn is_transition(&self, from: &RawHeader, to: &RawHeader, word: usize) -> bool {
        self.0
            .chunks(word)
            .zip(from.0.chunks(word))
            .zip(to.0.chunks(word))
            .all(|((w, f), t)| w.iter().all(|&b| b == 0xff) || w == f || w == t)
    }
}
