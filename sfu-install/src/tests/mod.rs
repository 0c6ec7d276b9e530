
use std::vec::Vec;

use sfu_image::Header;

use self::fixtures::*;
use crate::boot_info::{BootInfo, RECORD_BUF};
use crate::config::{Layout, LayoutError, Policy, Region};
use crate::flow::{self, FlowControl, FlowError, FLOW_INIT};
use crate::header::RawHeader;
use crate::install::{Installer, NoSwap, Swap};
use crate::rollback::{check, double_check, Verdict};
use crate::slot::SlotView;
use crate::trailer::{classify_magic, expected_magic, MagicState, Marker, TrailerLayout, MAGIC_LEN};
use crate::{Error, ExceptionId, Payload};

#[test]
fn flow_ledgers_reach_their_terminal_values() {
    let mut ledger = FlowControl::new();
    assert_eq!(ledger.crypto(), FLOW_INIT);
    ledger.step_crypto(flow::AUTHENTICATE).unwrap();
    ledger.step_crypto(flow::INTEGRITY).unwrap();
    ledger.step_crypto(flow::LOCK_SERVICE).unwrap();
    ledger.check_crypto(flow::LOCK_SERVICE).unwrap();

    for step in [
        flow::STATIC_WRITE_PROTECT,
        flow::STATIC_READOUT_PROTECT,
        flow::RUNTIME_WATCHDOG,
        flow::RUNTIME_DEBUG_LOCK,
    ] {
        ledger.step_protect(step).unwrap();
    }
    ledger.check_protect(flow::RUNTIME_DEBUG_LOCK).unwrap();
    assert_eq!(ledger.protect(), flow::RUNTIME_DEBUG_LOCK.expected);
}

#[test]
fn flow_detects_a_skipped_step() {
    let mut ledger = FlowControl::new();
    ledger.step_crypto(flow::AUTHENTICATE).unwrap();
    let err = ledger.step_crypto(flow::INSTALL).unwrap_err();
    assert_eq!(
        err,
        FlowError {
            expected: flow::INSTALL.expected,
            found: FLOW_INIT ^ flow::AUTHENTICATE.value ^ flow::INSTALL.value,
        }
    );
    // The chain stays off course for every later milestone.
    assert!(ledger.check_crypto(flow::INSTALL).is_err());
    assert!(ledger.check_crypto(flow::LOCK_SERVICE).is_err());
}

#[test]
fn flow_checkpoints_are_distinct() {
    let steps = [
        flow::AUTHENTICATE,
        flow::INTEGRITY,
        flow::INSTALL,
        flow::LOCK_SERVICE,
        flow::STATIC_WRITE_PROTECT,
        flow::STATIC_READOUT_PROTECT,
        flow::RUNTIME_WATCHDOG,
        flow::RUNTIME_DEBUG_LOCK,
    ];
    for (i, a) in steps.iter().enumerate() {
        assert_ne!(a.expected, FLOW_INIT);
        for b in &steps[i + 1..] {
            assert_ne!(a.expected, b.expected);
            assert_ne!(a.value, b.value);
        }
    }
}

#[test]
fn anti_rollback_rules() {
    let policy = Policy {
        initial_version: 1,
        min_version: 2,
        ..Policy::default()
    };
    for current in 0..=5u16 {
        for candidate in 0..=5u16 {
            let allowed = if current == 0 {
                candidate == 1
            } else {
                candidate >= current && candidate >= 2
            };
            let expected = if allowed { Verdict::Allowed } else { Verdict::Rejected };
            assert_eq!(check(&policy, current, candidate), expected, "{current} -> {candidate}");
        }
    }
}

#[test]
fn anti_rollback_reads_the_version_twice() {
    let policy = Policy::default();

    let mut reads = 0;
    let verdict = double_check::<()>(&policy, 3, || {
        reads += 1;
        Ok(3)
    });
    assert_eq!(verdict, Ok(Verdict::Allowed));
    assert_eq!(reads, 2);

    // A second read disagreeing with the first one rejects the candidate.
    let mut versions = [3, 0].into_iter();
    let verdict = double_check::<()>(&policy, 3, || Ok(versions.next().unwrap()));
    assert_eq!(verdict, Ok(Verdict::Rejected));

    assert_eq!(double_check(&policy, 3, || Err("flash")), Err("flash"));
}

#[test]
fn trailer_magic_states() {
    let old = RawHeader::from_header(&old_image().header);
    let new = RawHeader::from_header(&new_image().header);
    let magic = expected_magic(&old, &new);
    assert_ne!(magic, expected_magic(&old, &old));

    let erased = [0xff; MAGIC_LEN];
    assert_eq!(classify_magic(&magic, &magic, 4, Some(true)), MagicState::Valid);
    assert_eq!(classify_magic(&magic, &magic, 4, None), MagicState::Valid);
    assert_eq!(classify_magic(&erased, &magic, 4, Some(true)), MagicState::Erased);
    assert_eq!(classify_magic(&[0; MAGIC_LEN], &magic, 4, Some(true)), MagicState::Cleared);

    let mut partial = erased;
    partial[..8].copy_from_slice(&magic[..8]);
    assert_eq!(classify_magic(&partial, &magic, 4, Some(true)), MagicState::Incomplete);

    let mut clearing = magic;
    clearing[..4].fill(0);
    assert_eq!(classify_magic(&clearing, &magic, 4, Some(true)), MagicState::Cleared);

    let mut garbage = magic;
    garbage[5] ^= 0x10;
    assert_eq!(classify_magic(&garbage, &magic, 4, Some(true)), MagicState::Corrupt);

    // A complete magic without the clean pattern in front of it.
    assert_eq!(classify_magic(&magic, &magic, 4, Some(false)), MagicState::Corrupt);
}

#[test]
fn trailer_magic_follows_both_header_copies() {
    let old = RawHeader::from_header(&old_image().header);
    let new = RawHeader::from_header(&new_image().header);
    let trailers = [
        Swap::trailer_layout(&layout(), DOWNLOAD[0], 4),
        NoSwap::trailer_layout(&layout(), DOWNLOAD[0], 4),
    ];

    for trailer in trailers {
        let mut device = sfu::<Swap>(TestFlash::new(FLASH_SIZE), layout());
        assert_eq!(device.engine.check_trailer_magic(&trailer), Ok(MagicState::Erased));
        device.engine.write_trailer(&trailer, &old, &new).unwrap();
        assert_eq!(device.engine.check_trailer_magic(&trailer), Ok(MagicState::Valid));
        let written = device.release().0;

        // Any byte of either signature tail breaks the magic.
        for copy in [trailer.valid(), trailer.test()] {
            for offset in Header::SIGNATURE.end - MAGIC_LEN..Header::SIGNATURE.end {
                let mut flash = written.snapshot();
                flash.data[copy as usize + offset] ^= 0x01;
                let mut device = sfu::<Swap>(flash, layout());
                assert_eq!(
                    device.engine.check_trailer_magic(&trailer),
                    Ok(MagicState::Corrupt),
                    "copy at {copy:#x}, byte {offset}"
                );
            }
        }

        let mut device = sfu::<Swap>(written, layout());
        device.engine.clear_magic(&trailer).unwrap();
        assert_eq!(device.engine.check_trailer_magic(&trailer), Ok(MagicState::Cleared));
    }
}

#[test]
fn trailer_placement() {
    let trailer = TrailerLayout::swap(0x6400, 8, 4);
    assert_eq!(trailer.size(), 704);
    assert_eq!(trailer.begin(), 0x6140);
    assert_eq!(trailer.test(), 0x6140 + 304);
    assert_eq!(trailer.magic(), 0x6140 + 608);
    assert_eq!(trailer.clean(), Some(0x6140 + 624));
    assert_eq!(trailer.marker(Marker::ToActive, 0), Some(0x6140 + 640));
    assert_eq!(trailer.marker(Marker::ToDownload, 7), Some(0x6140 + 640 + 32 + 28));
    assert_eq!(trailer.marker(Marker::ToDownload, 8), None);

    let trailer = TrailerLayout::no_swap(0x6400, 4);
    assert_eq!(trailer.size(), 624);
    assert_eq!(trailer.begin(), 0x6400 - 624);
    assert_eq!(trailer.magic(), 0x6400 - 16);

    // Both trailers end with the download slot, whatever the image size.
    for trailer in [
        Swap::trailer_layout(&layout(), DOWNLOAD[0], 4),
        NoSwap::trailer_layout(&layout(), DOWNLOAD[0], 4),
    ] {
        assert_eq!(trailer.begin() + trailer.size(), DOWNLOAD[0].end());
    }
    assert_eq!(trailer.clean(), None);
    assert_eq!(trailer.marker(Marker::ToActive, 0), None);
}

#[test]
fn header_transition_words() {
    let old = RawHeader::from_header(&old_image().header);
    let new = RawHeader::from_header(&new_image().header);

    let mut mixed = RawHeader([0xff; Header::SIZE]);
    assert!(mixed.is_transition(&old, &new, 4));
    mixed.0[..100].copy_from_slice(&new.0[..100]);
    mixed.0[200..].copy_from_slice(&old.0[200..]);
    assert!(mixed.is_transition(&old, &new, 4));
    mixed.0[150] ^= 1;
    assert!(!mixed.is_transition(&old, &new, 4));

    let mut confirmed = old.clone();
    confirmed.0[Header::STATE].fill(0);
    assert!(confirmed.same_identity(&old));
    assert!(!confirmed.same_identity(&new));
}

#[test]
fn slot_chunks_stay_inside_their_block() {
    let view = SlotView::new(Region::new(0x1000, 0x3000), 0x400, 0x400, 0, 0x100);
    assert_eq!(view.blocks(), 12);
    assert_eq!(view.chunk(1, 0), Some(0x1400..0x1500));
    assert_eq!(view.chunk(1, 3), Some(0x1700..0x1800));
    assert_eq!(view.chunk(1, 4), None);
    assert_eq!(view.chunk(12, 0), None);

    let chunks: Vec<_> = view.chunks_from(0, 0x1280).collect();
    assert_eq!(chunks, [0x1280..0x1300, 0x1300..0x1400]);
    assert_eq!(view.chunks_from(2, 0x1800).count(), 4);
}

#[test]
fn boot_info_records() {
    let mut info = BootInfo::default();
    info.record(ExceptionId::SignatureFailure);
    info.record(ExceptionId::IntegrityCheck);
    assert_eq!(info.exception_count, 2);
    assert_eq!(info.consecutive_errors, 2);
    info.record(ExceptionId::None);
    assert_eq!(info.last_exception, ExceptionId::None);
    assert_eq!(info.exception_count, 2);
    assert_eq!(info.consecutive_errors, 0);

    let mut buf = [0xff; RECORD_BUF];
    info.encode(&mut buf).unwrap();
    assert_eq!(BootInfo::decode(&buf), Some(info));

    buf[9] ^= 0x40;
    assert_eq!(BootInfo::decode(&buf), None);
    assert_eq!(BootInfo::decode(&[0xff; RECORD_BUF]), None);
}

#[test]
fn layout_validation() {
    let word = 4;
    let (capacity, page) = (FLASH_SIZE, 256);
    assert_eq!(layout().validate(capacity, 1, word, page), Ok(()));
    assert_eq!(Swap::validate_layout(&layout(), word as u32, page as u32), Ok(()));

    let misaligned = Layout {
        swap: Region::new(0x480, 0x400),
        ..layout()
    };
    assert_eq!(misaligned.validate(capacity, 1, word, page), Err(LayoutError::Misaligned(0x480)));

    let overlapping = Layout {
        boot_info: Region::new(0x2f00, 0x100),
        ..layout()
    };
    assert!(matches!(overlapping.validate(capacity, 1, word, page), Err(LayoutError::Overlap(_))));

    let small_header = Layout {
        header_area: 0x100,
        ..layout()
    };
    assert_eq!(small_header.validate(capacity, 1, word, page), Err(LayoutError::HeaderArea));

    assert_eq!(layout().validate(0x6000, 1, word, page), Err(LayoutError::OutOfFlash(0x4000)));
    assert_eq!(layout().validate(capacity, 4, word, page), Err(LayoutError::ReadSizeUnsupported));
    assert_eq!(layout().validate(capacity, 1, 3, page), Err(LayoutError::WriteSizeUnsupported));

    let odd_block = Layout {
        swap: Region::new(0x400, 0x300),
        ..layout()
    };
    assert_eq!(
        Swap::validate_layout(&odd_block, word as u32, page as u32),
        Err(LayoutError::SlotNotBlockMultiple(0x1000))
    );

    let flash = TestFlash::new(FLASH_SIZE);
    let platform = TestPlatform::new(flash.ops());
    let res = crate::Sfu::<_, _, _, Swap>::new(flash, TestCrypto::default(), platform, small_header, Policy::default());
    assert!(matches!(res, Err(Error::InvalidLayout(LayoutError::HeaderArea))));
}

#[test]
fn scattered_image_verifies_like_a_contiguous_one() {
    let image = new_image();
    let mut flash = TestFlash::new(FLASH_SIZE);
    let fw = &image.firmware;
    flash.program(0x1000, fw);
    flash.program(0x4000, &fw[..700]);
    flash.program(0x400, &fw[700..1024]);
    flash.program(0x5000, &fw[1024..]);

    let mut sfu = sfu::<Swap>(flash, layout());
    let engine = &mut sfu.engine;
    let whole = Payload::single(0x1000, fw.len() as u32);
    assert_eq!(
        engine.authenticate_payload(&image.header, &whole),
        Ok(sfu_image::VerificationResult::Valid)
    );

    let mut scattered = Payload::new();
    assert!(scattered.push(0x4000, 700));
    assert!(scattered.push(0x400, 324));
    assert!(scattered.push(0x6000, 0));
    assert!(scattered.push(0x5000, fw.len() as u32 - 1024));
    assert_eq!(scattered.spans().len(), 3);
    assert_eq!(scattered.len(), fw.len() as u32);
    assert_eq!(
        engine.authenticate_payload(&image.header, &scattered),
        Ok(sfu_image::VerificationResult::Valid)
    );

    let mut swapped = Payload::new();
    swapped.push(0x400, 324);
    swapped.push(0x4000, 700);
    swapped.push(0x5000, fw.len() as u32 - 1024);
    assert_eq!(
        engine.authenticate_payload(&image.header, &swapped),
        Ok(sfu_image::VerificationResult::Invalid)
    );
}

#[test]
fn exceptions_persist_across_boots() {
    let mut flash = update_ready();
    // Break the signature of the downloaded header.
    flash.data[DOWNLOAD[0].base as usize + 150] ^= 0x01;

    let (flash, outcome) = boot::<Swap>(flash, layout());
    assert_eq!(outcome, Outcome::Failed(Error::Security(ExceptionId::SignatureFailure)));
    assert!(flash.slice(DOWNLOAD[0].base, DOWNLOAD[0].size).iter().all(|&b| b == 0xff));

    let mut sfu = sfu::<Swap>(flash, layout());
    let info = sfu.boot_info().unwrap();
    assert_eq!(info.last_exception, ExceptionId::SignatureFailure);
    assert_eq!(info.exception_count, 1);
    assert_eq!(info.consecutive_errors, 1);

    sfu.record_clean_boot().unwrap();
    let info = sfu.boot_info().unwrap();
    assert_eq!(info.exception_count, 1);
    assert_eq!(info.consecutive_errors, 0);
}
