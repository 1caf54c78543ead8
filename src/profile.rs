// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec profile enum and its 1:1 mapping to the fourcc the device
//! understands (spec §3, §4.1).

use crate::{EncodedFormat, Fourcc};

/// Tagged enum over the three codecs this crate supports, with profile
/// variants. H264 baseline through high is collapsed to one variant per
/// spec §6 ("mapped 1:1 through profile enum"); VP8/VP9 have a single
/// profile each (VP9 only profile 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    H264Baseline,
    H264Main,
    H264High,
    VP8,
    VP9Profile0,
}

impl Profile {
    pub fn codec(&self) -> EncodedFormat {
        match self {
            Profile::H264Baseline | Profile::H264Main | Profile::H264High => EncodedFormat::H264,
            Profile::VP8 => EncodedFormat::VP8,
            Profile::VP9Profile0 => EncodedFormat::VP9,
        }
    }

    /// Fourcc the device must advertise on the OUTPUT queue to decode this
    /// profile. Bit-exact per spec §4.1: H264 family maps to
    /// `V4L2_PIX_FMT_H264[_SLICE]`, VP8 family to
    /// `V4L2_PIX_FMT_VP8[_FRAME]`, VP9 profile 0 to `V4L2_PIX_FMT_VP9[_FRAME]`.
    pub fn output_fourcc(&self) -> Fourcc {
        Fourcc::from(self.codec())
    }
}

/// One entry of `Device::supported_decode_profiles`: a profile and the
/// resolution range the device reported for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedProfile {
    pub profile: Profile,
    pub min_resolution: crate::Resolution,
    pub max_resolution: crate::Resolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_codec_mapping_is_total() {
        assert_eq!(Profile::H264Baseline.codec(), EncodedFormat::H264);
        assert_eq!(Profile::H264High.codec(), EncodedFormat::H264);
        assert_eq!(Profile::VP8.codec(), EncodedFormat::VP8);
        assert_eq!(Profile::VP9Profile0.codec(), EncodedFormat::VP9);
    }

    #[test]
    fn output_fourcc_round_trips_through_encoded_format() {
        assert_eq!(Profile::VP9Profile0.output_fourcc(), Fourcc::from(EncodedFormat::VP9));
    }
}
