// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Flat, validated configuration records replacing the codec2
//! parameter-reflection machinery (spec §9 "Deep inheritance").

use crate::profile::Profile;
use crate::{ComponentError, Resolution};

/// Configuration for a decoder [component::Component](crate::component::Component).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub profile: Profile,
    /// Hint for the initial visible size; the device's own format discovery
    /// (spec §4.3 Output path step 1) is authoritative once decoding starts.
    pub visible_size_hint: Resolution,
    /// Id of the block pool this component should fetch output surfaces
    /// from.
    pub block_pool_id: u32,
    /// Whether the stream carries secure (DRM-protected) content. Threaded
    /// through to the adaptor opaquely; never interpreted here (spec §1
    /// Non-goals: no secure-playback key management).
    pub secure: bool,
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), ComponentError> {
        if self.visible_size_hint.width == 0 || self.visible_size_hint.height == 0 {
            return Err(ComponentError::InvalidArgument);
        }
        Ok(())
    }
}

/// Configuration for an encoder component. The encode path itself is out of
/// scope (spec §1); this record exists only to give the [crate::adaptor]
/// contract a concrete, validated shape to pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub profile: Profile,
    pub input_size: Resolution,
    pub bitrate_bps: u32,
    pub framerate: u32,
    pub key_frame_period: u32,
    pub request_key_frame: bool,
    /// Number of frames between forced intra refresh, 0 disables it.
    pub intra_refresh_period: u32,
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), ComponentError> {
        if self.input_size.width == 0 || self.input_size.height == 0 {
            return Err(ComponentError::InvalidArgument);
        }
        if self.bitrate_bps == 0 {
            return Err(ComponentError::InvalidArgument);
        }
        if self.framerate == 0 {
            return Err(ComponentError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_config_rejects_empty_size() {
        let cfg = DecoderConfig {
            profile: Profile::H264Main,
            visible_size_hint: Resolution { width: 0, height: 240 },
            block_pool_id: 0,
            secure: false,
        };
        assert_eq!(cfg.validate(), Err(ComponentError::InvalidArgument));
    }

    #[test]
    fn encoder_config_rejects_zero_bitrate() {
        let cfg = EncoderConfig {
            profile: Profile::VP9Profile0,
            input_size: Resolution { width: 320, height: 240 },
            bitrate_bps: 0,
            framerate: 30,
            key_frame_period: 30,
            request_key_frame: false,
            intra_refresh_period: 0,
        };
        assert_eq!(cfg.validate(), Err(ComponentError::InvalidArgument));
    }
}
