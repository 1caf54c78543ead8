// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated video decode/encode component pair over a kernel
//! streaming video (V4L2 memory-to-memory) device.
//!
//! The [device] module ([device::Device]) is a thin wrapper over the kernel
//! streaming interface. The [buffer_pool] module brokers output graphic
//! surfaces with an external producer. The [vda] module is the decode
//! accelerator state machine driving the device's two queues. The
//! [component] module binds user work items to the accelerator. The
//! [adaptor] module is the narrow interface the accelerator exposes
//! outward, local or proxied over IPC.

pub mod adaptor;
pub mod buffer_pool;
pub mod capabilities;
pub mod component;
pub mod config;
#[cfg(feature = "v4l2")]
pub mod device;
pub mod profile;
pub mod vda;

#[cfg(feature = "v4l2")]
pub use v4l2r;

use std::str::FromStr;

/// Rounding modes for [Resolution].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolutionRoundMode {
    /// Rounds component-wise to the next even value.
    Even,
}

/// A frame resolution in pixels, used for both `CodedSize` and the visible
/// rectangle's extent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Rounds `self` according to `rnd_mode`.
    pub fn round(mut self, rnd_mode: ResolutionRoundMode) -> Self {
        match rnd_mode {
            ResolutionRoundMode::Even => {
                if self.width % 2 != 0 {
                    self.width += 1;
                }
                if self.height % 2 != 0 {
                    self.height += 1;
                }
            }
        }
        self
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// `CodedSize` is the device's idea of a frame's storage extent; it is
/// always rounded up from the `VisibleRect` the stream actually wants shown.
pub type CodedSize = Resolution;

/// An axis-aligned rectangle within a `CodedSize`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// `VisibleRect ⊆ (0,0,CodedSize)`; origin must be `(0,0)`.
    ///
    /// Violations are non-fatal: the caller is expected to fall back to the
    /// coded rect rather than treat this as an error.
    pub fn is_valid_visible_rect(&self, coded_size: CodedSize) -> bool {
        self.x == 0
            && self.y == 0
            && self.width <= coded_size.width
            && self.height <= coded_size.height
    }
}

/// `VisibleRect`: the sub-rectangle of a `CodedSize` frame that should
/// actually be shown.
pub type VisibleRect = Rect;

impl From<Rect> for Resolution {
    fn from(value: Rect) -> Self {
        Self { width: value.width, height: value.height }
    }
}

impl From<Resolution> for Rect {
    fn from(value: Resolution) -> Self {
        Self { x: 0, y: 0, width: value.width, height: value.height }
    }
}

impl From<((u32, u32), (u32, u32))> for Rect {
    fn from(value: ((u32, u32), (u32, u32))) -> Self {
        Self { x: value.0 .0, y: value.0 .1, width: value.1 .0, height: value.1 .1 }
    }
}

/// Wrapper around u32 when they are meant to be a fourcc.
///
/// Provides conversion and display/debug implementations useful when dealing
/// with fourcc codes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [n.0 as u8, (n.0 >> 8) as u8, (n.0 >> 16) as u8, (n.0 >> 24) as u8]
    }
}

impl std::fmt::Display for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c: [u8; 4] = (*self).into();
        f.write_fmt(format_args!("{}{}{}{}", c[0] as char, c[1] as char, c[2] as char, c[3] as char))
    }
}

impl std::fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// The pixel format used on the CAPTURE queue. Only NV12 is supported for
/// now (spec §6).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DecodedFormat {
    #[default]
    NV12,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            _ => Err("unrecognized output format. Only nv12 is supported"),
        }
    }
}

impl From<DecodedFormat> for Fourcc {
    fn from(format: DecodedFormat) -> Fourcc {
        match format {
            DecodedFormat::NV12 => Fourcc::from(b"NV12"),
        }
    }
}

/// Input (compressed) codec family understood by the OUTPUT queue.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum EncodedFormat {
    H264,
    VP8,
    VP9,
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "vp8" | "VP8" => Ok(EncodedFormat::VP8),
            "vp9" | "VP9" => Ok(EncodedFormat::VP9),
            _ => Err("unrecognized input format. Valid values: h264, vp8, vp9"),
        }
    }
}

impl From<Fourcc> for EncodedFormat {
    fn from(fourcc: Fourcc) -> EncodedFormat {
        match fourcc.to_string().as_str() {
            "H264" => EncodedFormat::H264,
            "VP80" => EncodedFormat::VP8,
            "VP90" => EncodedFormat::VP9,
            _ => panic!("fourcc {} not supported", fourcc),
        }
    }
}

impl From<EncodedFormat> for Fourcc {
    fn from(format: EncodedFormat) -> Fourcc {
        match format {
            EncodedFormat::H264 => Fourcc::from(b"H264"),
            EncodedFormat::VP8 => Fourcc::from(b"VP80"),
            EncodedFormat::VP9 => Fourcc::from(b"VP90"),
        }
    }
}

/// Describes the layout of one plane of a frame, used by `GraphicBlockInfo`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VideoFramePlane {
    pub offset: usize,
    pub stride: usize,
}

/// Instructs on whether an operation should block.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    #[default]
    NonBlocking,
}

/// The five-kind error taxonomy of spec §6/§7, propagated verbatim across
/// the [adaptor] boundary.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentError {
    /// API misuse, e.g. a double `initialize`. Fatal for the call; the
    /// component may continue serving other calls.
    #[error("illegal state")]
    IllegalState,
    /// Bad bitstream id, unsupported profile, bad slot id, import attempted
    /// in the wrong state. Fatal; triggers `notify_error`.
    #[error("invalid argument")]
    InvalidArgument,
    /// The input fd could not be read. Fatal; triggers `notify_error`.
    #[error("unreadable input")]
    UnreadableInput,
    /// An ioctl, poll, handle-wrap, or fence wait failed. Fatal; triggers
    /// `notify_error`.
    #[error("platform failure")]
    PlatformFailure,
    /// Too few buffers were available from the device. Surfaced at
    /// configuration time, not a fatal runtime error.
    #[error("insufficient resources")]
    InsufficientResources,
}

#[cfg(test)]
mod tests {
    use super::{Fourcc, Rect, Resolution};

    const NV12_FOURCC: u32 = 0x3231564E;

    #[test]
    fn fourcc_u32() {
        let fourcc = Fourcc::from(NV12_FOURCC);
        let value: u32 = fourcc.into();
        assert_eq!(value, NV12_FOURCC);
    }

    #[test]
    fn fourcc_u8_4() {
        let fourcc = Fourcc::from(NV12_FOURCC);
        let value: [u8; 4] = fourcc.into();
        assert_eq!(value, *b"NV12");
    }

    #[test]
    fn fourcc_display() {
        let fourcc = Fourcc::from(NV12_FOURCC);
        assert_eq!(fourcc.to_string(), "NV12");
    }

    #[test]
    fn fourcc_debug() {
        let fourcc = Fourcc::from(NV12_FOURCC);
        assert_eq!(format!("{:?}", fourcc), "0x3231564e (NV12)");
    }

    #[test]
    fn visible_rect_must_originate_at_zero() {
        let coded = Resolution { width: 320, height: 240 };
        let good = Rect { x: 0, y: 0, width: 320, height: 240 };
        let bad = Rect { x: 4, y: 0, width: 320, height: 240 };
        assert!(good.is_valid_visible_rect(coded));
        assert!(!bad.is_valid_visible_rect(coded));
    }

    #[test]
    fn visible_rect_cannot_exceed_coded_size() {
        let coded = Resolution { width: 320, height: 240 };
        let too_big = Rect { x: 0, y: 0, width: 321, height: 240 };
        assert!(!too_big.is_valid_visible_rect(coded));
    }
}
