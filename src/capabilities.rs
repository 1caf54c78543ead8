// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C1 extension: surfaces the device's supported decode profiles as a
//! public, codec-agnostic capability list.

use crate::profile::SupportedProfile;
use crate::ComponentError;

#[cfg(feature = "v4l2")]
use crate::device::{known_profile_fourccs, Device};
#[cfg(feature = "v4l2")]
use crate::Fourcc;

/// Queries every known codec's device and returns the profiles it actually
/// supports, each with the min/max resolution the device advertised.
#[cfg(feature = "v4l2")]
pub fn get_decoder_capabilities() -> Result<Vec<SupportedProfile>, ComponentError> {
    let mut supported = Vec::new();
    for (profile, fourcc) in known_profile_fourccs() {
        let device = match Device::open(fourcc) {
            Ok(device) => device,
            Err(_) => continue,
        };
        supported.extend(device.supported_decode_profiles(&[(profile, fourcc)])?);
    }
    Ok(supported)
}

#[cfg(not(feature = "v4l2"))]
pub fn get_decoder_capabilities() -> Result<Vec<SupportedProfile>, ComponentError> {
    Ok(Vec::new())
}

#[cfg(all(test, feature = "v4l2"))]
mod tests {
    use super::*;

    // No kernel device is available in a test environment; this only checks
    // that a missing device is treated as "not supported" rather than a
    // hard error.
    #[test]
    fn missing_device_yields_no_capabilities() {
        let fourcc = Fourcc::from(u32::MAX);
        assert!(Device::open(fourcc).is_err());
    }
}
