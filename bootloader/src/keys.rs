// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use nrf52840_pac::UICR;
use sfu_install::rustcrypto::SlotKeys;

// TODO: replace with the production signing key once it is generated
const SIGNER: [u8; 65] = [
    4, 125, 236, 97, 175, 124, 174, 61, 15, 100, 198, 186, 230, 84, 194, 91, 198, 198, 73, 115, 80, 187, 168, 79,
    150, 84, 237, 200, 201, 34, 102, 124, 106, 144, 161, 72, 229, 155, 23, 101, 53, 158, 73, 36, 219, 134, 138, 8,
    78, 167, 36, 125, 104, 68, 80, 137, 148, 106, 180, 103, 57, 21, 189, 25, 124,
];

/// First UICR customer register of the AES key. Provisioned at the factory,
/// four words, little endian.
const AES_KEY_IDX: usize = 0;

fn aes_key() -> [u8; 16] {
    let uicr = unsafe { &*UICR::ptr() };
    let mut key = [0; 16];
    for (i, word) in key.chunks_exact_mut(4).enumerate() {
        word.copy_from_slice(&uicr.customer[AES_KEY_IDX + i].read().bits().to_le_bytes());
    }
    key
}

/// Keys of the single active slot.
pub fn slot_keys() -> [SlotKeys; 1] {
    [SlotKeys {
        public_key: SIGNER,
        aes_key: aes_key(),
    }]
}
