// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::header::RawHeader;

/// Headers shared between the decision engine and the installers during one
/// boot cycle. Filled from flash on every boot, never persisted.
#[derive(Debug, Default, Clone)]
pub struct BootContext {
    /// Header of the image being installed.
    pub fw_to_test: RawHeader,
    /// Header of the image being replaced.
    pub fw_validated: RawHeader,
}
