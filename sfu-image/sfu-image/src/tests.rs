use super::*;
use sha2::Digest;

struct TestSha;

impl Sha256 for TestSha {
    fn hash(&self, data: &[u8]) -> [u8; 32] {
        sha2::Sha256::digest(data).into()
    }
}

struct FixedSigner;

impl HeaderSign for FixedSigner {
    fn sign_header(&self, auth: &[u8; Header::AUTH_LEN]) -> [u8; 64] {
        let mut sig = [0; 64];
        sig[..32].copy_from_slice(&sha2::Sha256::digest(auth));
        let tail = sha2::Sha256::digest(&sig[..32]);
        sig[32..].copy_from_slice(&tail);
        sig
    }
}

fn firmware() -> [u8; 1000] {
    let mut fw = [0; 1000];
    for (i, b) in fw.iter_mut().enumerate() {
        *b = (i * 7 % 251) as u8;
    }
    fw
}

#[test]
fn layout_of_serialized_header() {
    let fw = firmware();
    let mut header = Header::new(Magic::Slot2, 0x0304, &fw, None, [9; 16], &TestSha).unwrap();
    header.sign(&FixedSigner);
    let bytes = header.to_bytes();

    assert_eq!(&bytes[0..4], b"SFU2");
    assert_eq!(&bytes[4..6], &[1, 0]);
    assert_eq!(&bytes[6..8], &[4, 3]);
    assert_eq!(&bytes[8..12], &1000u32.to_le_bytes());
    assert_eq!(&bytes[12..16], &[0; 4]);
    assert_eq!(&bytes[16..20], &1000u32.to_le_bytes());
    assert_eq!(&bytes[20..52], &TestSha.hash(&fw));
    assert_eq!(&bytes[52..84], &TestSha.hash(&fw));
    assert_eq!(&bytes[84..100], &[9; 16]);
    assert!(bytes[100..128].iter().all(|&b| b == 0));
    assert_eq!(&bytes[128..192], &FixedSigner.sign_header(&header.auth_region()));
    assert!(bytes[192..304].iter().all(|&b| b == 0xFF));
    assert!(!header.is_delta());
}

#[test]
fn parse_round_trip_keeps_state_and_fingerprint() {
    let fw = firmware();
    let mut header = Header::new(Magic::Slot1, 7, &fw, Some((100, 50)), [1; 16], &TestSha).unwrap();
    header.sign(&FixedSigner);
    header.set_image_state(ImageState::SelfTest);
    header.set_prev_fingerprint([0x42; 64]);

    let mut buf = [0; Header::SIZE + 10];
    header.serialize(&mut buf).unwrap();
    let parsed = Header::parse(&buf).unwrap().unwrap();

    assert_eq!(parsed, header);
    assert!(parsed.is_delta());
    assert_eq!(parsed.partial_tag(), &TestSha.hash(&fw[100..150]));
    assert_eq!(parsed.image_state(), ImageState::SelfTest);
    assert_eq!(parsed.prev_fingerprint(), &[0x42; 64]);
}

#[test]
fn parse_without_magic() {
    assert_eq!(Header::parse(&[0xFF; Header::SIZE]), Ok(None));
    assert_eq!(Header::parse(&[]), Ok(None));
    assert_eq!(Header::parse(b"SFU"), Ok(None));
}

#[test]
fn parse_errors() {
    let fw = firmware();
    let header = Header::new(Magic::Slot1, 1, &fw, None, [0; 16], &TestSha).unwrap();
    let bytes = header.to_bytes();

    assert_eq!(Header::parse(&bytes[..100]), Err(Error::HeaderTooShort));

    let mut bad = bytes;
    bad[4] = 2;
    assert_eq!(Header::parse(&bad), Err(Error::InvalidProtocolVersion(2)));

    let mut bad = bytes;
    bad[110] = 1;
    assert_eq!(Header::parse(&bad), Err(Error::InvalidReservedBytes));

    let mut bad = bytes;
    bad[8..12].copy_from_slice(&0u32.to_le_bytes());
    assert_eq!(Header::parse(&bad), Err(Error::FirmwareEmpty));

    let mut bad = bytes;
    bad[12..16].copy_from_slice(&990u32.to_le_bytes());
    assert_eq!(
        Header::parse(&bad),
        Err(Error::InvalidPartialRange {
            offset: 990,
            size: 1000,
            fw_size: 1000
        })
    );
}

#[test]
fn new_rejects_bad_input() {
    let fw = firmware();
    assert_eq!(
        Header::new(Magic::Slot1, 1, &[], None, [0; 16], &TestSha),
        Err(Error::FirmwareEmpty)
    );
    assert_eq!(
        Header::new(Magic::Slot1, 1, &fw, Some((10, 0)), [0; 16], &TestSha),
        Err(Error::InvalidPartialRange {
            offset: 10,
            size: 0,
            fw_size: 1000
        })
    );
    assert_eq!(
        Header::new(Magic::Slot1, 1, &fw, Some((u32::MAX, 2)), [0; 16], &TestSha),
        Err(Error::InvalidPartialRange {
            offset: u32::MAX,
            size: 2,
            fw_size: 1000
        })
    );
}

#[test]
fn serialize_buffer_too_small() {
    let fw = firmware();
    let header = Header::new(Magic::Slot1, 1, &fw, None, [0; 16], &TestSha).unwrap();
    let mut buf = [0; Header::SIZE - 1];
    assert_eq!(header.serialize(&mut buf), Err(Error::SerializeBufferTooSmall));
}

#[test]
fn image_state_only_clears_bits() {
    let states = [
        ImageState::New,
        ImageState::SelfTest,
        ImageState::Valid,
        ImageState::ValidAll,
    ];
    for pair in states.windows(2) {
        let (from, to) = (pair[0].words(), pair[1].words());
        // Every bit set in the next state is also set in the previous one.
        assert!(from.iter().zip(to.iter()).all(|(f, t)| f & t == *t));
        assert!(pair[0].rank() < pair[1].rank());
    }
    for state in states {
        assert_eq!(ImageState::from_words(&state.words()), state);
    }
}

#[test]
fn image_state_corrupt_patterns() {
    let mut words = [0xFF; 48];
    words[3] = 0x7F;
    assert_eq!(ImageState::from_words(&words), ImageState::Corrupt);

    let mut words = [0xFF; 48];
    words[32..].fill(0);
    assert_eq!(ImageState::from_words(&words), ImageState::Corrupt);

    assert_eq!(
        ImageState::from_words(&ImageState::Corrupt.words()),
        ImageState::Corrupt
    );
    assert_eq!(ImageState::Corrupt.rank(), None);
}

#[test]
fn magic_slots() {
    for i in 0..3 {
        let magic = Magic::for_slot(i).unwrap();
        assert_eq!(magic.slot_index(), i);
        assert_eq!(Magic::from_bytes(magic.to_bytes()), Some(magic));
    }
    assert_eq!(Magic::for_slot(3), None);
    assert_eq!(Magic::from_bytes(*b"SFU4"), None);
}

#[cfg(feature = "rustcrypto")]
mod rustcrypto {
    use super::firmware;
    use crate::rustcrypto::{verify_p256, Aes128Ctr, P256Signer, Sha256, TagHasher};
    use crate::{Header, HeaderSign, Magic, Sha256 as _, VerificationResult};

    const SECRET: [u8; 32] = [
        58, 31, 92, 46, 155, 125, 74, 96, 200, 225, 242, 163, 180, 197, 214, 231, 248, 9, 18,
        163, 180, 197, 214, 231, 248, 9, 26, 43, 60, 77, 94, 111,
    ];

    #[test]
    fn sign_and_verify() {
        let signer = P256Signer::from_slice(&SECRET).unwrap();
        let mut header = Header::new(Magic::Slot1, 3, &firmware(), None, [5; 16], &Sha256).unwrap();
        header.sign(&signer);

        let key = signer.public_key();
        assert_eq!(key[0], 0x04);
        assert_eq!(
            verify_p256(&key, &header.auth_region(), header.signature()),
            VerificationResult::Valid
        );

        let mut auth = header.auth_region();
        auth[6] ^= 1;
        assert_eq!(
            verify_p256(&key, &auth, header.signature()),
            VerificationResult::Invalid
        );
        assert_eq!(
            verify_p256(&[0; 65], &header.auth_region(), header.signature()),
            VerificationResult::Invalid
        );
        let sig = signer.sign_header(&header.auth_region());
        assert_eq!(&sig, header.signature());
    }

    #[test]
    fn ctr_is_independent_of_chunking() {
        let key = [0x11; 16];
        // Counter wraps inside the stream.
        let nonce = [0xFF; 16];
        let plain = firmware();

        let mut whole = plain;
        Aes128Ctr::new(&key, &nonce).apply_keystream(&mut whole);
        assert_ne!(whole, plain);

        let mut pieces = plain;
        let mut ctr = Aes128Ctr::new(&key, &nonce);
        for chunk in pieces.chunks_mut(7) {
            ctr.apply_keystream(chunk);
        }
        assert_eq!(pieces, whole);

        Aes128Ctr::new(&key, &nonce).apply_keystream(&mut pieces);
        assert_eq!(pieces, plain);
    }

    #[test]
    fn streaming_tag_matches_one_shot() {
        let fw = firmware();
        let mut hasher = TagHasher::new();
        for chunk in fw.chunks(33) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), Sha256.hash(&fw));
    }
}
