#![no_std]

use core::ops::Range;

#[cfg(feature = "rustcrypto")]
pub mod rustcrypto;

#[cfg(test)]
mod tests;

/// Firmware image header.
///
/// The header is stored at the base of a slot, in front of the firmware. The
/// first [`AUTH_LEN`](Header::AUTH_LEN) bytes are covered by the header
/// signature. The image state words and the previous-header fingerprint
/// follow the signature and are written by the bootloader, not the signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    magic: [u8; 4],
    protocol_version: [u8; 2],
    fw_version: [u8; 2],
    fw_size: [u8; 4],
    partial_offset: [u8; 4],
    partial_size: [u8; 4],
    fw_tag: [u8; 32],
    partial_tag: [u8; 32],
    nonce: [u8; 16],
    reserved: [u8; 28],
    signature: [u8; 64],
    state: [u8; 48],
    prev_fingerprint: [u8; 64],
}

/// SHA-256 hash function.
pub trait Sha256 {
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

/// Header signing.
pub trait HeaderSign {
    /// Sign the authenticated region of a header.
    fn sign_header(&self, auth: &[u8; Header::AUTH_LEN]) -> [u8; 64];
}

/// Verification result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum VerificationResult {
    // The values are arbitrary, but chosen to be different by more than one bit to make glitching
    // attacks more difficult.
    Valid = 0xcafebabe,
    Invalid = 0xdeadbeef,
}

impl Header {
    /// Size of the header in bytes.
    pub const SIZE: usize = 304;

    /// Length of the region covered by the header signature.
    pub const AUTH_LEN: usize = 128;

    /// Number of reserved bytes at the end of the authenticated region.
    pub const RESERVED: usize = 28;

    /// Header format version written by this crate.
    pub const PROTOCOL_VERSION: u16 = 1;

    /// Location of the signature inside the serialized header.
    pub const SIGNATURE: Range<usize> = 128..192;

    /// Location of the image state words inside the serialized header.
    pub const STATE: Range<usize> = 192..240;

    /// Location of the previous-header fingerprint inside the serialized header.
    pub const FINGERPRINT: Range<usize> = 240..304;

    /// Create an unsigned header for `firmware`.
    ///
    /// With `partial` set, the header describes a delta update: only
    /// `firmware[offset..offset + size]` is shipped, the rest of the image is
    /// expected to already be installed.
    pub fn new(
        magic: Magic,
        fw_version: u16,
        firmware: &[u8],
        partial: Option<(u32, u32)>,
        nonce: [u8; 16],
        sha: &impl Sha256,
    ) -> Result<Self, Error> {
        if firmware.is_empty() {
            return Err(Error::FirmwareEmpty);
        }
        let fw_size = u32::try_from(firmware.len()).map_err(|_| Error::FirmwareTooLong)?;
        let (partial_offset, partial_size) = partial.unwrap_or((0, fw_size));
        let end = partial_offset
            .checked_add(partial_size)
            .filter(|&end| end <= fw_size && partial_size > 0)
            .ok_or(Error::InvalidPartialRange {
                offset: partial_offset,
                size: partial_size,
                fw_size,
            })?;

        let header = Self {
            magic: magic.to_bytes(),
            protocol_version: Self::PROTOCOL_VERSION.to_le_bytes(),
            fw_version: fw_version.to_le_bytes(),
            fw_size: fw_size.to_le_bytes(),
            partial_offset: partial_offset.to_le_bytes(),
            partial_size: partial_size.to_le_bytes(),
            fw_tag: sha.hash(firmware),
            partial_tag: sha.hash(&firmware[partial_offset as usize..end as usize]),
            nonce,
            reserved: [0; Self::RESERVED],
            signature: [0; 64],
            state: ImageState::New.words(),
            prev_fingerprint: [0xFF; 64],
        };
        header.validate_fields()?;
        Ok(header)
    }

    /// Fill in the header signature.
    pub fn sign(&mut self, signer: &impl HeaderSign) {
        self.signature = signer.sign_header(&self.auth_region());
    }

    /// Parse a header.
    ///
    /// If the data does not start with a known magic value, `None` is
    /// returned. The signature is not verified here.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, Error> {
        let Some(header) = Self::deserialize(data)? else {
            return Ok(None);
        };
        header.validate_fields()?;
        Ok(Some(header))
    }

    /// Serialize the header to a buffer. Exactly [`Self::SIZE`] bytes will be
    /// written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::SerializeBufferTooSmall);
        }

        buf[..Self::AUTH_LEN].copy_from_slice(&self.auth_region());
        buf[Self::SIGNATURE].copy_from_slice(&self.signature);
        buf[Self::STATE].copy_from_slice(&self.state);
        buf[Self::FINGERPRINT].copy_from_slice(&self.prev_fingerprint);

        Ok(())
    }

    /// Serialize the header to a fixed size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0; Self::SIZE];
        buf[..Self::AUTH_LEN].copy_from_slice(&self.auth_region());
        buf[Self::SIGNATURE].copy_from_slice(&self.signature);
        buf[Self::STATE].copy_from_slice(&self.state);
        buf[Self::FINGERPRINT].copy_from_slice(&self.prev_fingerprint);
        buf
    }

    /// The bytes covered by the header signature.
    pub fn auth_region(&self) -> [u8; Self::AUTH_LEN] {
        let mut buf = [0; Self::AUTH_LEN];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.protocol_version);
        buf[6..8].copy_from_slice(&self.fw_version);
        buf[8..12].copy_from_slice(&self.fw_size);
        buf[12..16].copy_from_slice(&self.partial_offset);
        buf[16..20].copy_from_slice(&self.partial_size);
        buf[20..52].copy_from_slice(&self.fw_tag);
        buf[52..84].copy_from_slice(&self.partial_tag);
        buf[84..100].copy_from_slice(&self.nonce);
        buf[100..128].copy_from_slice(&self.reserved);
        buf
    }

    /// Magic number, identifying the active slot this firmware is built for.
    pub fn magic(&self) -> Magic {
        // Only headers with a known magic can be constructed.
        Magic::from_bytes(self.magic).unwrap_or(Magic::Slot1)
    }

    pub fn protocol_version(&self) -> u16 {
        u16::from_le_bytes(self.protocol_version)
    }

    /// Firmware version, compared by the anti-rollback check.
    pub fn fw_version(&self) -> u16 {
        u16::from_le_bytes(self.fw_version)
    }

    /// Size of the complete firmware image.
    pub fn fw_size(&self) -> u32 {
        u32::from_le_bytes(self.fw_size)
    }

    /// Offset of the shipped part inside the complete image.
    pub fn partial_offset(&self) -> u32 {
        u32::from_le_bytes(self.partial_offset)
    }

    /// Size of the shipped part.
    pub fn partial_size(&self) -> u32 {
        u32::from_le_bytes(self.partial_size)
    }

    /// Whether only a part of the image is shipped.
    pub fn is_delta(&self) -> bool {
        self.partial_offset() != 0 || self.partial_size() != self.fw_size()
    }

    /// Tag of the complete plaintext image.
    pub fn fw_tag(&self) -> &[u8; 32] {
        &self.fw_tag
    }

    /// Tag of the shipped plaintext.
    pub fn partial_tag(&self) -> &[u8; 32] {
        &self.partial_tag
    }

    /// Initial counter block of the body cipher.
    pub fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn image_state(&self) -> ImageState {
        ImageState::from_words(&self.state)
    }

    pub fn set_image_state(&mut self, state: ImageState) {
        self.state = state.words();
    }

    /// Signature of the header this image replaced.
    pub fn prev_fingerprint(&self) -> &[u8; 64] {
        &self.prev_fingerprint
    }

    pub fn set_prev_fingerprint(&mut self, fingerprint: [u8; 64]) {
        self.prev_fingerprint = fingerprint;
    }

    /// Deserialize the header fields from a buffer.
    ///
    /// Returns `None` if the buffer does not contain a header.
    fn deserialize(data: &[u8]) -> Result<Option<Self>, Error> {
        let Some(magic) = data.get(..4) else {
            return Ok(None);
        };
        let magic = [magic[0], magic[1], magic[2], magic[3]];
        if Magic::from_bytes(magic).is_none() {
            // Magic value is missing or not recognized, so this is not a header.
            return Ok(None);
        }

        // The data contains a header, so make sure it's of appropriate length.
        let data: &[u8; Self::SIZE] = data
            .get(..Self::SIZE)
            .and_then(|d| d.try_into().ok())
            .ok_or(Error::HeaderTooShort)?;

        Ok(Some(Self {
            magic,
            protocol_version: field(data, 4),
            fw_version: field(data, 6),
            fw_size: field(data, 8),
            partial_offset: field(data, 12),
            partial_size: field(data, 16),
            fw_tag: field(data, 20),
            partial_tag: field(data, 52),
            nonce: field(data, 84),
            reserved: field(data, 100),
            signature: field(data, 128),
            state: field(data, 192),
            prev_fingerprint: field(data, 240),
        }))
    }

    /// Validate the fields in the header.
    fn validate_fields(&self) -> Result<(), Error> {
        if self.protocol_version() != Self::PROTOCOL_VERSION {
            return Err(Error::InvalidProtocolVersion(self.protocol_version()));
        }

        // Check that the reserved bytes are all zero.
        if self.reserved.iter().any(|&b| b != 0) {
            return Err(Error::InvalidReservedBytes);
        }

        if self.fw_size() == 0 {
            return Err(Error::FirmwareEmpty);
        }

        let (offset, size, fw_size) = (self.partial_offset(), self.partial_size(), self.fw_size());
        match offset.checked_add(size) {
            Some(end) if end <= fw_size && size > 0 => Ok(()),
            _ => Err(Error::InvalidPartialRange {
                offset,
                size,
                fw_size,
            }),
        }
    }
}

fn field<const N: usize>(data: &[u8; Header::SIZE], offset: usize) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

/// Magic number.
///
/// Used to identify the header, and to select the active slot (and the keys)
/// the firmware is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Magic {
    Slot1,
    Slot2,
    Slot3,
}

impl Magic {
    pub fn from_bytes(b: [u8; 4]) -> Option<Self> {
        match &b {
            b"SFU1" => Some(Self::Slot1),
            b"SFU2" => Some(Self::Slot2),
            b"SFU3" => Some(Self::Slot3),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        match self {
            Self::Slot1 => *b"SFU1",
            Self::Slot2 => *b"SFU2",
            Self::Slot3 => *b"SFU3",
        }
    }

    /// Index of the active slot, starting at zero.
    pub fn slot_index(&self) -> usize {
        match self {
            Self::Slot1 => 0,
            Self::Slot2 => 1,
            Self::Slot3 => 2,
        }
    }

    pub fn for_slot(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Slot1),
            1 => Some(Self::Slot2),
            2 => Some(Self::Slot3),
            _ => None,
        }
    }
}

/// Install state of an image, kept in three 16-byte words after the header
/// signature.
///
/// Every transition clears one more word to zero, so the state can only move
/// forward on flash that does not allow setting bits without an erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageState {
    /// Freshly installed, never started.
    New,
    /// Started once, waiting for the firmware to confirm itself.
    SelfTest,
    /// Confirmed by the firmware.
    Valid,
    /// Confirmed together with all other images of the device.
    ValidAll,
    /// The words hold a pattern no transition can produce.
    Corrupt,
}

impl ImageState {
    pub const WORD: usize = 16;

    pub fn from_words(words: &[u8; 48]) -> Self {
        let word = |i: usize| -> Option<bool> {
            let w = &words[i * Self::WORD..(i + 1) * Self::WORD];
            if w.iter().all(|&b| b == 0) {
                Some(true)
            } else if w.iter().all(|&b| b == 0xFF) {
                Some(false)
            } else {
                None
            }
        };
        match (word(0), word(1), word(2)) {
            (Some(false), Some(false), Some(false)) => Self::New,
            (Some(true), Some(false), Some(false)) => Self::SelfTest,
            (Some(true), Some(true), Some(false)) => Self::Valid,
            (Some(true), Some(true), Some(true)) => Self::ValidAll,
            _ => Self::Corrupt,
        }
    }

    /// The state words for this state. A corrupt state has no valid encoding
    /// and maps to all words cleared except the last, which `from_words`
    /// never accepts as a state transition by itself.
    pub fn words(self) -> [u8; 48] {
        let cleared = match self {
            Self::New => 0,
            Self::SelfTest => 1,
            Self::Valid => 2,
            Self::ValidAll => 3,
            Self::Corrupt => return corrupt_words(),
        };
        let mut words = [0xFF; 48];
        words[..cleared * Self::WORD].fill(0);
        words
    }

    /// Position in the forward-only sequence of states.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::New => Some(0),
            Self::SelfTest => Some(1),
            Self::Valid => Some(2),
            Self::ValidAll => Some(3),
            Self::Corrupt => None,
        }
    }
}

fn corrupt_words() -> [u8; 48] {
    let mut words = [0xFF; 48];
    words[ImageState::WORD..2 * ImageState::WORD].fill(0);
    words
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    FirmwareEmpty,
    FirmwareTooLong,
    HeaderTooShort,
    InvalidPartialRange { offset: u32, size: u32, fw_size: u32 },
    InvalidProtocolVersion(u16),
    InvalidReservedBytes,
    SerializeBufferTooSmall,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::FirmwareEmpty => write!(f, "firmware is empty"),
            Self::FirmwareTooLong => write!(f, "firmware too long"),
            Self::HeaderTooShort => write!(f, "header too short"),
            Self::InvalidPartialRange {
                offset,
                size,
                fw_size,
            } => write!(
                f,
                "invalid partial range in header: {size} bytes at {offset} in a {fw_size} byte image"
            ),
            Self::InvalidProtocolVersion(version) => {
                write!(f, "invalid protocol version in header: {version}")
            }
            Self::InvalidReservedBytes => write!(f, "invalid reserved bytes in header"),
            Self::SerializeBufferTooSmall => write!(f, "buffer too small for serialization"),
        }
    }
}
