//! Reference cryptographic scheme built on the RustCrypto crates: ECDSA-P256
//! over the authenticated header region, AES-128-CTR for the body and
//! SHA-256 tags.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::Digest;

use crate::{Header, HeaderSign, VerificationResult};

/// Length of an uncompressed SEC1 P-256 public key.
pub const PUBLIC_KEY_LEN: usize = 65;

/// SHA-256 via the `sha2` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256;

impl crate::Sha256 for Sha256 {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        sha2::Sha256::digest(data).into()
    }
}

/// Streaming SHA-256 over a firmware body.
#[derive(Clone, Default)]
pub struct TagHasher(sha2::Sha256);

impl TagHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// P-256 header signer.
pub struct P256Signer(SigningKey);

impl P256Signer {
    /// Create a signer from a raw 32-byte secret scalar.
    pub fn from_slice(secret: &[u8]) -> Option<Self> {
        SigningKey::from_slice(secret).ok().map(Self)
    }

    /// Uncompressed SEC1 encoding of the matching public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.0.verifying_key().to_encoded_point(false);
        let mut out = [0; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }
}

impl HeaderSign for P256Signer {
    fn sign_header(&self, auth: &[u8; Header::AUTH_LEN]) -> [u8; 64] {
        let signature: Signature = self.0.sign(auth);
        let mut out = [0; 64];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

/// Verify a header signature against an uncompressed SEC1 public key.
pub fn verify_p256(
    public_key: &[u8; PUBLIC_KEY_LEN],
    auth: &[u8],
    signature: &[u8; 64],
) -> VerificationResult {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return VerificationResult::Invalid;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return VerificationResult::Invalid;
    };
    match key.verify(auth, &signature) {
        Ok(()) => VerificationResult::Valid,
        Err(_) => VerificationResult::Invalid,
    }
}

/// AES-128 in counter mode.
///
/// The nonce is the initial counter block, incremented as a 128-bit
/// big-endian integer. The keystream position is tracked so that data may be
/// processed in arbitrarily sized pieces.
pub struct Aes128Ctr {
    cipher: aes::Aes128,
    counter: u128,
    block: [u8; 16],
    used: usize,
}

impl Aes128Ctr {
    pub fn new(key: &[u8; 16], nonce: &[u8; 16]) -> Self {
        Self {
            cipher: aes::Aes128::new(GenericArray::from_slice(key)),
            counter: u128::from_be_bytes(*nonce),
            block: [0; 16],
            used: 16,
        }
    }

    /// XOR the keystream into `data`.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.used == 16 {
                self.refill();
            }
            *byte ^= self.block[self.used];
            self.used += 1;
        }
    }

    fn refill(&mut self) {
        let mut block = GenericArray::from(self.counter.to_be_bytes());
        self.cipher.encrypt_block(&mut block);
        self.block.copy_from_slice(&block);
        self.counter = self.counter.wrapping_add(1);
        self.used = 0;
    }
}
