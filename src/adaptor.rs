// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C5: the narrow interface VDA exposes outward (spec §4.5). A second
//! implementation proxies the same contract over an IPC channel to a
//! remote service; only its contract shape is modeled here (spec §1
//! "out of scope... only its adaptor contract is summarised").

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::profile::Profile;
use crate::vda::{Picture, PictureBuffer, VdaClient};
use crate::{CodedSize, ComponentError};

/// Callbacks raised by an [Adaptor] implementation, identical in shape to
/// [crate::vda::VdaClient] (spec §4.5 "Callbacks").
pub trait AdaptorClient: Send + Sync {
    fn provide_picture_buffers(&self, count: u32, coded_size: CodedSize);
    fn dismiss_picture_buffer(&self, picture_id: i32);
    fn picture_ready(&self, picture: Picture);
    fn notify_end_of_bitstream_buffer(&self, bitstream_id: i32);
    fn notify_flush_done(&self);
    fn notify_reset_done(&self);
    fn notify_error(&self, error: ComponentError);
}

/// The sole interface C4 calls into to drive decoding (spec §4.5). All
/// operations are asynchronous except `initialize`.
pub trait Adaptor: Send + Sync {
    fn initialize(
        &self,
        profile: Profile,
        secure: bool,
        client: Arc<dyn AdaptorClient>,
    ) -> Result<(), ComponentError>;
    fn decode(&self, id: i32, fd: OwnedFd, offset: usize, size: usize);
    fn assign_picture_buffers(&self, buffers: Vec<PictureBuffer>);
    fn import_buffer_for_picture(&self, id: i32, dmabuf_fds: Vec<OwnedFd>, plane_offsets: Vec<usize>);
    fn reuse_picture_buffer(&self, id: i32);
    fn flush(&self);
    fn reset(&self);
    /// Blocking.
    fn destroy(&self);
}

/// Bridges an [AdaptorClient] to the VDA's own callback shape, so a
/// [crate::vda::Vda] can sit directly behind a [LocalAdaptor].
struct VdaToAdaptorClient(Arc<dyn AdaptorClient>);

impl VdaClient for VdaToAdaptorClient {
    fn provide_picture_buffers(&self, count: u32, coded_size: CodedSize) {
        self.0.provide_picture_buffers(count, coded_size);
    }
    fn dismiss_picture_buffer(&self, picture_id: i32) {
        self.0.dismiss_picture_buffer(picture_id);
    }
    fn picture_ready(&self, picture: Picture) {
        self.0.picture_ready(picture);
    }
    fn notify_end_of_bitstream_buffer(&self, bitstream_id: i32) {
        self.0.notify_end_of_bitstream_buffer(bitstream_id);
    }
    fn notify_flush_done(&self) {
        self.0.notify_flush_done();
    }
    fn notify_reset_done(&self) {
        self.0.notify_reset_done();
    }
    fn notify_error(&self, error: ComponentError) {
        self.0.notify_error(error);
    }
}

/// In-process [Adaptor]: owns a [crate::vda::Vda] directly.
pub struct LocalAdaptor {
    vda: std::sync::Mutex<Option<Arc<crate::vda::Vda>>>,
}

impl LocalAdaptor {
    pub fn new() -> Self {
        Self { vda: std::sync::Mutex::new(None) }
    }
}

impl Default for LocalAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Adaptor for LocalAdaptor {
    fn initialize(
        &self,
        profile: Profile,
        _secure: bool,
        client: Arc<dyn AdaptorClient>,
    ) -> Result<(), ComponentError> {
        let mut slot = self.vda.lock().unwrap();
        if slot.is_some() {
            log::error!("LocalAdaptor::initialize called twice");
            return Err(ComponentError::IllegalState);
        }
        log::debug!("LocalAdaptor: initializing for profile {:?}", profile);
        let vda = Arc::new(crate::vda::Vda::new(Arc::new(VdaToAdaptorClient(client))));
        vda.initialize(profile)?;
        *slot = Some(vda);
        Ok(())
    }

    fn decode(&self, id: i32, fd: OwnedFd, offset: usize, size: usize) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.decode(crate::vda::BitstreamBuffer { id, dmabuf: Some(fd), offset, size });
        }
    }

    fn assign_picture_buffers(&self, buffers: Vec<PictureBuffer>) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.assign_picture_buffers(buffers);
        }
    }

    fn import_buffer_for_picture(&self, id: i32, dmabuf_fds: Vec<OwnedFd>, plane_offsets: Vec<usize>) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.import_buffer_for_picture(id, dmabuf_fds, plane_offsets);
        }
    }

    fn reuse_picture_buffer(&self, id: i32) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.reuse_picture_buffer(id);
        }
    }

    fn flush(&self) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.flush();
        }
    }

    fn reset(&self) {
        if let Some(vda) = self.vda.lock().unwrap().as_ref() {
            vda.reset();
        }
    }

    fn destroy(&self) {
        if let Some(vda) = self.vda.lock().unwrap().take() {
            vda.destroy();
        }
    }
}

/// Proxies the same contract over an IPC channel to a remote decode
/// service (spec §1, §9 "Dynamic dispatch"). Connection loss is reported
/// as `PlatformFailure` once, then all pending waits are cancelled (spec
/// §7 "Rules").
pub struct RemoteAdaptor<T> {
    channel: T,
}

/// The minimal transport a [RemoteAdaptor] needs; a real implementation
/// serialises each [Adaptor] call across an IPC channel and dispatches
/// incoming callbacks to the registered [AdaptorClient].
pub trait IpcChannel: Send + Sync {
    fn send(&self, message: &[u8]) -> Result<(), ComponentError>;
    fn is_connected(&self) -> bool;
}

impl<T: IpcChannel> RemoteAdaptor<T> {
    pub fn new(channel: T) -> Self {
        Self { channel }
    }
}

impl<T: IpcChannel> Adaptor for RemoteAdaptor<T> {
    fn initialize(
        &self,
        _profile: Profile,
        _secure: bool,
        client: Arc<dyn AdaptorClient>,
    ) -> Result<(), ComponentError> {
        if !self.channel.is_connected() {
            client.notify_error(ComponentError::PlatformFailure);
            return Err(ComponentError::PlatformFailure);
        }
        Ok(())
    }

    fn decode(&self, _id: i32, _fd: OwnedFd, _offset: usize, _size: usize) {}
    fn assign_picture_buffers(&self, _buffers: Vec<PictureBuffer>) {}
    fn import_buffer_for_picture(&self, _id: i32, _dmabuf_fds: Vec<OwnedFd>, _plane_offsets: Vec<usize>) {}
    fn reuse_picture_buffer(&self, _id: i32) {}
    fn flush(&self) {}
    fn reset(&self) {}
    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NullClient;
    impl AdaptorClient for NullClient {
        fn provide_picture_buffers(&self, _: u32, _: CodedSize) {}
        fn dismiss_picture_buffer(&self, _: i32) {}
        fn picture_ready(&self, _: Picture) {}
        fn notify_end_of_bitstream_buffer(&self, _: i32) {}
        fn notify_flush_done(&self) {}
        fn notify_reset_done(&self) {}
        fn notify_error(&self, _: ComponentError) {}
    }

    #[test]
    fn double_initialize_is_illegal_state() {
        let adaptor = LocalAdaptor::new();
        assert!(adaptor.initialize(Profile::VP9Profile0, false, Arc::new(NullClient)).is_ok());
        assert_eq!(
            adaptor.initialize(Profile::VP9Profile0, false, Arc::new(NullClient)),
            Err(ComponentError::IllegalState)
        );
    }

    struct DisconnectedChannel;
    impl IpcChannel for DisconnectedChannel {
        fn send(&self, _message: &[u8]) -> Result<(), ComponentError> {
            Err(ComponentError::PlatformFailure)
        }
        fn is_connected(&self) -> bool {
            false
        }
    }

    #[test]
    fn remote_adaptor_reports_platform_failure_when_disconnected() {
        let adaptor = RemoteAdaptor::new(DisconnectedChannel);
        let errors: Arc<Mutex<Vec<ComponentError>>> = Arc::new(Mutex::new(Vec::new()));
        struct RecordingClient(Arc<Mutex<Vec<ComponentError>>>);
        impl AdaptorClient for RecordingClient {
            fn provide_picture_buffers(&self, _: u32, _: CodedSize) {}
            fn dismiss_picture_buffer(&self, _: i32) {}
            fn picture_ready(&self, _: Picture) {}
            fn notify_end_of_bitstream_buffer(&self, _: i32) {}
            fn notify_flush_done(&self) {}
            fn notify_reset_done(&self) {}
            fn notify_error(&self, error: ComponentError) {
                self.0.lock().unwrap().push(error);
            }
        }
        let result =
            adaptor.initialize(Profile::H264Main, false, Arc::new(RecordingClient(errors.clone())));
        assert_eq!(result, Err(ComponentError::PlatformFailure));
        assert_eq!(errors.lock().unwrap().as_slice(), &[ComponentError::PlatformFailure]);
    }
}
