// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! [`CryptoEngine`] on the RustCrypto crates: ECDSA-P256 header signatures,
//! AES-128-CTR bodies and SHA-256 tags.

use sfu_image::rustcrypto::{verify_p256, Aes128Ctr, TagHasher, PUBLIC_KEY_LEN};
use sfu_image::{Header, VerificationResult};

use crate::crypto::{CryptoEngine, CryptoError};

/// Random delays around signature checks, against glitch and timing attacks.
pub trait Jitter {
    fn delay(&mut self);
}

/// No delays, for hosts and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn delay(&mut self) {}
}

/// Keys of one active slot.
#[derive(Clone)]
pub struct SlotKeys {
    /// Uncompressed SEC1 public key checking the header signatures.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub aes_key: [u8; 16],
}

struct Decrypt {
    ctr: Aes128Ctr,
    hasher: TagHasher,
    expected: [u8; 32],
}

struct Authenticate {
    hasher: TagHasher,
    expected: [u8; 32],
}

pub struct RustCryptoEngine<'a, J> {
    keys: &'a [SlotKeys],
    jitter: J,
    decrypt: Option<Decrypt>,
    authenticate: Option<Authenticate>,
}

impl<'a, J: Jitter> RustCryptoEngine<'a, J> {
    /// `keys[i]` belongs to active slot `i`.
    pub fn new(keys: &'a [SlotKeys], jitter: J) -> Self {
        Self {
            keys,
            jitter,
            decrypt: None,
            authenticate: None,
        }
    }

    fn keys_for(&self, header: &Header) -> Result<&'a SlotKeys, CryptoError> {
        self.keys.get(header.magic().slot_index()).ok_or(CryptoError::UnknownKey)
    }
}

fn tags_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl<J: Jitter> CryptoEngine for RustCryptoEngine<'_, J> {
    fn verify_header_signature(&mut self, header: &Header) -> VerificationResult {
        const CF1: u32 = 13;
        const CF2: u32 = 7;
        const CFI_SUCCESS: u32 = CF1 + CF2;
        let mut control_flow_integrity_counter = 0;

        let Ok(keys) = self.keys_for(header) else {
            return VerificationResult::Invalid;
        };
        control_flow_integrity_counter += CF1;
        self.jitter.delay();
        let res = verify_p256(&keys.public_key, &header.auth_region(), header.signature());
        self.jitter.delay();
        if res == VerificationResult::Valid {
            control_flow_integrity_counter += CF2;
            let res_ptr = &res as *const VerificationResult;
            if unsafe { res_ptr.read_volatile() } == VerificationResult::Valid
                && core::hint::black_box(control_flow_integrity_counter) == CFI_SUCCESS
            {
                return VerificationResult::Valid;
            }
        }
        VerificationResult::Invalid
    }

    fn decrypt_init(&mut self, header: &Header) -> Result<(), CryptoError> {
        let keys = self.keys_for(header)?;
        self.decrypt = Some(Decrypt {
            ctr: Aes128Ctr::new(&keys.aes_key, header.nonce()),
            hasher: TagHasher::new(),
            expected: *header.partial_tag(),
        });
        Ok(())
    }

    fn decrypt_append(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let state = self.decrypt.as_mut().ok_or(CryptoError::Sequence)?;
        if input.len() != output.len() {
            return Err(CryptoError::Length);
        }
        output.copy_from_slice(input);
        state.ctr.apply_keystream(output);
        state.hasher.update(output);
        Ok(())
    }

    fn decrypt_finish(&mut self) -> Result<(), CryptoError> {
        let state = self.decrypt.take().ok_or(CryptoError::Sequence)?;
        if tags_match(&state.hasher.finalize(), &state.expected) {
            Ok(())
        } else {
            Err(CryptoError::TagMismatch)
        }
    }

    fn authenticate_init(&mut self, header: &Header) -> Result<(), CryptoError> {
        self.keys_for(header)?;
        self.authenticate = Some(Authenticate {
            hasher: TagHasher::new(),
            expected: *header.fw_tag(),
        });
        Ok(())
    }

    fn authenticate_append(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        let state = self.authenticate.as_mut().ok_or(CryptoError::Sequence)?;
        state.hasher.update(data);
        Ok(())
    }

    fn authenticate_finish(&mut self) -> Result<VerificationResult, CryptoError> {
        let state = self.authenticate.take().ok_or(CryptoError::Sequence)?;
        let digest = state.hasher.finalize();
        self.jitter.delay();
        if tags_match(&digest, &state.expected) && tags_match(core::hint::black_box(&digest), &state.expected) {
            Ok(VerificationResult::Valid)
        } else {
            Ok(VerificationResult::Invalid)
        }
    }
}
