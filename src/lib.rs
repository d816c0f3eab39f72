pub mod archive;
pub mod chunk;
pub mod config;
pub mod device;
pub mod manifest;
pub mod messages;
pub mod remote;
pub mod status;
pub mod upload;

pub mod prelude {
    pub use crate::{
        archive::{ArchiveError, ArchiveReader, ZipArchiveReader},
        chunk::{ChunkEncoder, EncodedChunk},
        config::Config,
        device::{ChannelError, DeviceChannel, HttpDeviceChannel},
        manifest::{ManifestError, ManifestModel},
        messages::Messages,
        remote::{RemoteError, RemoteUpdateController},
        status::{OtaStatusSnapshot, StatusPoller},
        upload::{UploadError, UploadOutcome, UploadProgress, UploadService, UploadState},
    };
}
