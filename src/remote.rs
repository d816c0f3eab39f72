use crate::device::{ChannelError, DeviceChannel};
use crate::status::OtaStatusSnapshot;
use common::endpoints;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("an update is already in progress")]
    AlreadyRunning,

    #[error("no update is in progress")]
    NotRunning,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Thin wrapper around the device's fetch/cancel commands. Both are
/// single round trips; progress afterwards shows up through the status
/// poller, never through these calls. Gating uses the poller's last
/// snapshot, mirroring how the portal disables its buttons.
pub struct RemoteUpdateController<C> {
    channel: C,
    snapshots: watch::Receiver<OtaStatusSnapshot>,
}

impl<C: DeviceChannel> RemoteUpdateController<C> {
    pub fn new(channel: C, snapshots: watch::Receiver<OtaStatusSnapshot>) -> Self {
        RemoteUpdateController { channel, snapshots }
    }

    /// Asks the device to fetch and stage the latest release.
    pub async fn trigger_fetch(&self) -> Result<(), RemoteError> {
        if self.snapshots.borrow().busy {
            return Err(RemoteError::AlreadyRunning);
        }
        self.channel.post_json(endpoints::FETCH, &[]).await?;
        Ok(())
    }

    /// Cancels whichever update is running, remote fetch or manual.
    pub async fn cancel(&self) -> Result<(), RemoteError> {
        if !self.snapshots.borrow().busy {
            return Err(RemoteError::NotRunning);
        }
        self.channel.post_json(endpoints::CANCEL, &[]).await?;
        Ok(())
    }
}
