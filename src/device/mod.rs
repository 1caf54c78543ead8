// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C1: a thin wrapper over the kernel streaming video (m2m) device.
//!
//! Responsibilities per spec §4.1: open by input fourcc, issue ioctls,
//! poll the device fd plus an interrupt eventfd, and probe supported decode
//! profiles. [Device] never interprets the bitstream; it only moves
//! access units and decoded frames across the kernel's two queues.

use std::fs::{read_dir, File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use v4l2r::device::queue::direction::Output as OutputDirection;
use v4l2r::device::queue::{Queue, QueueInit};
use v4l2r::device::{Device as VideoDevice, DeviceConfig};
use v4l2r::ioctl::FormatIterator;
use v4l2r::QueueType;

use crate::profile::{Profile, SupportedProfile};
use crate::{ComponentError, EncodedFormat, Fourcc, Resolution};

/// Smallest and largest coded size probed when discovering a device's
/// supported resolution range (spec §4.1).
const PROBE_MIN_SIZE: (u32, u32) = (16, 16);
const PROBE_MAX_SIZE: (u32, u32) = (32768, 32768);

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("no device advertises fourcc {0}")]
    NoMatchingDevice(Fourcc),
    #[error("failed to open device: {0}")]
    Open(#[source] std::io::Error),
    #[error("ioctl failed: {0}")]
    Ioctl(#[source] anyhow::Error),
}

impl From<DeviceError> for ComponentError {
    fn from(_: DeviceError) -> Self {
        ComponentError::PlatformFailure
    }
}

/// Scans `/dev/video*` for a device that both advertises multi-planar m2m
/// streaming capabilities and an OUTPUT format matching `fourcc`, returning
/// its path and the path of the media device controlling its media graph.
///
/// The video/media device pairing follows the common `/dev/videoN` ↔
/// `/dev/mediaN` kernel numbering; a driver that does not follow this
/// convention is not supported.
fn enumerate_devices(fourcc: Fourcc) -> Option<(PathBuf, PathBuf)> {
    let entries = read_dir("/dev").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name()?.to_str()?;
        let index = match name.strip_prefix("video") {
            Some(idx) => idx,
            None => continue,
        };

        let config = DeviceConfig::new().non_blocking_dqbuf();
        let device = match VideoDevice::open(&path, config) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let supports_fourcc = FormatIterator::new(&device, QueueType::VideoOutputMplane)
            .any(|desc| Fourcc::from(u32::from(desc.pixelformat)) == fourcc);
        if !supports_fourcc {
            continue;
        }

        let media_path = PathBuf::from(format!("/dev/media{}", index));
        if media_path.exists() {
            return Some((path, media_path));
        }
    }
    None
}

/// Thin wrapper over the kernel streaming video device and its interrupt
/// eventfd.
pub struct Device {
    video_device: Arc<VideoDevice>,
    media_device: File,
    interrupt: Arc<EventFd>,
}

impl Device {
    /// Opens a device that advertises both multi-planar m2m and streaming
    /// capabilities for `input_fourcc`.
    pub fn open(input_fourcc: Fourcc) -> Result<Self, DeviceError> {
        let (video_device_path, media_device_path) = enumerate_devices(input_fourcc).ok_or_else(|| {
            log::error!("no device advertises fourcc {input_fourcc}");
            DeviceError::NoMatchingDevice(input_fourcc)
        })?;
        log::debug!("opening {:?} (media: {:?})", video_device_path, media_device_path);

        let config = DeviceConfig::new().non_blocking_dqbuf();
        let video_device = Arc::new(
            VideoDevice::open(&video_device_path, config).map_err(DeviceError::Open)?,
        );
        let media_device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&media_device_path)
            .map_err(DeviceError::Open)?;

        let interrupt = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?,
        );

        Ok(Self { video_device, media_device, interrupt })
    }

    pub fn video_device(&self) -> &Arc<VideoDevice> {
        &self.video_device
    }

    pub fn media_fd(&self) -> RawFd {
        self.media_device.as_raw_fd()
    }

    /// Blocks on device readiness AND the interrupt eventfd. Returns
    /// whether a v4l2 event is queued on the device.
    pub fn poll(&self, wait_for_device: bool) -> Result<bool, DeviceError> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?;

        epoll
            .add(self.interrupt.as_ref(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
            .map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?;
        if wait_for_device {
            epoll
                .add(
                    self.video_device.as_ref(),
                    EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI, 1),
                )
                .map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?;
        }

        let mut events = [EpollEvent::empty(); 2];
        let n = epoll
            .wait(&mut events, EpollTimeout::NONE)
            .map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?;

        let mut event_pending = false;
        for event in &events[..n] {
            if event.data() == 0 {
                // Drain the interrupt so the next poll blocks again.
                let _ = self.interrupt.read();
            }
            if event.data() == 1 {
                event_pending = true;
            }
        }
        Ok(event_pending)
    }

    /// Wakes a blocked [Device::poll].
    pub fn set_device_poll_interrupt(&self) -> Result<(), DeviceError> {
        self.interrupt.write(1).map_err(|e| DeviceError::Ioctl(anyhow::Error::from(e)))?;
        Ok(())
    }

    /// Consumes a pending interrupt so `poll` can block again.
    pub fn clear_device_poll_interrupt(&self) -> Result<(), DeviceError> {
        let _ = self.interrupt.read();
        Ok(())
    }

    /// Probes each fourcc: `S_FMT` at `(16,16)` then at `(32768,32768)`,
    /// reading back the actual extents the driver accepted as the min/max
    /// resolution for that profile (spec §4.1).
    pub fn supported_decode_profiles(
        &self,
        candidates: &[(Profile, Fourcc)],
    ) -> Result<Vec<SupportedProfile>, DeviceError> {
        let mut profiles = Vec::new();
        for (profile, fourcc) in candidates {
            let min = self.probe_extent(*fourcc, PROBE_MIN_SIZE)?;
            let max = self.probe_extent(*fourcc, PROBE_MAX_SIZE)?;
            if let (Some(min), Some(max)) = (min, max) {
                profiles.push(SupportedProfile {
                    profile: *profile,
                    min_resolution: min,
                    max_resolution: max,
                });
            }
        }
        Ok(profiles)
    }

    fn probe_extent(
        &self,
        fourcc: Fourcc,
        size: (u32, u32),
    ) -> Result<Option<Resolution>, DeviceError> {
        let queue: Queue<OutputDirection, QueueInit> =
            match Queue::get_output_mplane_queue(self.video_device.clone()) {
                Ok(q) => q,
                Err(_) => return Ok(None),
            };

        let format = match queue.change_format() {
            Ok(builder) => builder
                .set_size(size.0 as usize, size.1 as usize)
                .set_pixelformat(u32::from(fourcc))
                .apply::<v4l2r::Format>(),
            Err(_) => return Ok(None),
        };

        match format {
            Ok(actual) => Ok(Some(Resolution { width: actual.width, height: actual.height })),
            Err(_) => Ok(None),
        }
    }
}

/// Builds the `(Profile, Fourcc)` candidate list this crate knows how to
/// map (spec §4.1 "fourcc↔profile map").
pub fn known_profile_fourccs() -> Vec<(Profile, Fourcc)> {
    use Profile::*;
    [H264Baseline, H264Main, H264High, VP8, VP9Profile0]
        .into_iter()
        .map(|p| (p, p.output_fourcc()))
        .collect()
}

impl crate::vda::DevicePoll for Device {
    fn poll(&self, wait_for_device: bool) -> Result<bool, ComponentError> {
        Device::poll(self, wait_for_device).map_err(ComponentError::from)
    }

    fn set_device_poll_interrupt(&self) -> Result<(), ComponentError> {
        Device::set_device_poll_interrupt(self).map_err(ComponentError::from)
    }

    fn clear_device_poll_interrupt(&self) -> Result<(), ComponentError> {
        Device::clear_device_poll_interrupt(self).map_err(ComponentError::from)
    }
}

impl From<EncodedFormat> for Vec<Profile> {
    fn from(format: EncodedFormat) -> Self {
        match format {
            EncodedFormat::H264 => {
                vec![Profile::H264Baseline, Profile::H264Main, Profile::H264High]
            }
            EncodedFormat::VP8 => vec![Profile::VP8],
            EncodedFormat::VP9 => vec![Profile::VP9Profile0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_profile_fourccs_covers_all_profiles() {
        let known = known_profile_fourccs();
        assert_eq!(known.len(), 5);
        assert!(known.iter().any(|(p, _)| *p == Profile::VP9Profile0));
    }

    #[test]
    fn encoded_format_to_profiles_is_total() {
        let profiles: Vec<Profile> = EncodedFormat::H264.into();
        assert_eq!(profiles.len(), 3);
    }
}
