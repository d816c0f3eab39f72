use crate::archive::{ArchiveError, ArchiveReader};
use crate::chunk::ChunkEncoder;
use crate::device::{ChannelError, DeviceChannel};
use crate::manifest::{ManifestError, ManifestModel};
use crate::messages::{Messages, MANUAL_BAD_ZIP, MANUAL_BUSY, REMOTE_STATUS_ERROR};
use common::endpoints;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::watch;

/// Session states. Succeeded, Failed and Cancelled are terminal; a new
/// attempt always starts over from Idle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadState {
    #[default]
    Idle,
    SessionBegun,
    PartBegun,
    Transferring,
    PartFinishing,
    Finishing,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct UploadProgress {
    pub state: UploadState,
    pub part_index: usize,
    pub part_path: String,
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Succeeded,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("an upload is already in progress")]
    Busy,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Failure tied to one part of the transfer, identified by its path.
    #[error("part {path}: {source}")]
    Part { path: String, source: ChannelError },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Drives manual firmware uploads. Owns the process-wide busy flag: a
/// second `begin_upload` while one attempt is live is rejected before any
/// device call. Parts go over strictly in manifest order, chunks in
/// offset order, one request in flight at a time, and any failure aborts
/// the whole transfer after telling the device to cancel so it does not
/// keep a half-written image.
pub struct UploadService<C> {
    channel: C,
    encoder: ChunkEncoder,
    busy: AtomicBool,
    progress_tx: watch::Sender<UploadProgress>,
}

impl<C: DeviceChannel> UploadService<C> {
    pub fn new(channel: C, chunk_size: usize) -> Self {
        let (progress_tx, _) = watch::channel(UploadProgress::default());
        UploadService {
            channel,
            encoder: ChunkEncoder::new(chunk_size),
            busy: AtomicBool::new(false),
            progress_tx,
        }
    }

    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress_tx.subscribe()
    }

    /// Runs one complete upload attempt. `cancel` is a cooperative flag:
    /// flipping it to true does not abort the request already in flight,
    /// the session checks it between steps and then issues a device-side
    /// cancel. The attempt's manifest and progress are discarded when
    /// this returns, success or not.
    pub async fn begin_upload<A: ArchiveReader>(
        &self,
        archive: &mut A,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<UploadOutcome, UploadError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(UploadError::Busy);
        }

        let mut session = UploadSession::new(self);
        let result = session.run(archive, cancel).await;
        match &result {
            Ok(UploadOutcome::Succeeded) => {
                info!("upload finished; device is applying the update");
                session.set_state(UploadState::Succeeded);
            }
            Ok(UploadOutcome::Cancelled) => {
                info!("upload cancelled");
                session.cancel_device().await;
                session.set_state(UploadState::Cancelled);
            }
            Err(err) => {
                warn!("upload aborted: {}", err);
                // Manifest and archive rejections happen before any
                // device call, so there is nothing to cancel then.
                if session.begun {
                    session.cancel_device().await;
                }
                session.set_state(UploadState::Failed);
            }
        }

        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

/// State for a single attempt; created fresh per `begin_upload`.
struct UploadSession<'a, C> {
    service: &'a UploadService<C>,
    progress: UploadProgress,
    begun: bool,
}

impl<'a, C: DeviceChannel> UploadSession<'a, C> {
    fn new(service: &'a UploadService<C>) -> Self {
        UploadSession {
            service,
            progress: UploadProgress::default(),
            begun: false,
        }
    }

    fn set_state(&mut self, state: UploadState) {
        self.progress.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.service.progress_tx.send_replace(self.progress.clone());
    }

    async fn cancel_device(&self) {
        // Best effort only; a failure here is logged, never re-raised.
        if let Err(err) = self
            .service
            .channel
            .post_json(endpoints::CANCEL, &[])
            .await
        {
            warn!("failed to cancel device-side OTA session: {}", err);
        }
    }

    async fn run<A: ArchiveReader>(
        &mut self,
        archive: &mut A,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<UploadOutcome, UploadError> {
        let manifest_text = archive.manifest_text()?;
        let manifest = ManifestModel::parse(&manifest_text)?;
        let build = &manifest.builds[0];

        self.set_state(UploadState::SessionBegun);
        self.begun = true;
        self.service
            .channel
            .post_plain(endpoints::UPLOAD_BEGIN, manifest_text)
            .await?;

        for (index, part) in build.parts.iter().enumerate() {
            if cancelled(cancel) {
                return Ok(UploadOutcome::Cancelled);
            }

            // A part named by the manifest but absent from the archive is
            // a mid-session failure like any other.
            let data = archive.part_bytes(&part.path)?;

            self.progress.part_index = index;
            self.progress.part_path = part.path.clone();
            self.progress.bytes_total = data.len() as u64;
            self.progress.bytes_sent = 0;
            self.set_state(UploadState::PartBegun);

            let query = [
                ("path", part.path.clone()),
                ("offset", part.offset.to_string()),
                ("size", data.len().to_string()),
            ];
            self.service
                .channel
                .post_json(endpoints::PART_BEGIN, &query)
                .await
                .map_err(|source| UploadError::Part {
                    path: part.path.clone(),
                    source,
                })?;

            info!("uploading {} ({} bytes)", part.path, data.len());
            self.set_state(UploadState::Transferring);
            for chunk in self.service.encoder.encode(&data) {
                if cancelled(cancel) {
                    return Ok(UploadOutcome::Cancelled);
                }
                let raw_len = chunk.raw_len;
                self.service
                    .channel
                    .post_plain(endpoints::PART_CHUNK, chunk.payload)
                    .await
                    .map_err(|source| UploadError::Part {
                        path: part.path.clone(),
                        source,
                    })?;
                self.progress.bytes_sent += raw_len as u64;
                self.publish();
            }

            self.set_state(UploadState::PartFinishing);
            self.service
                .channel
                .post_json(endpoints::PART_FINISH, &[("path", part.path.clone())])
                .await
                .map_err(|source| UploadError::Part {
                    path: part.path.clone(),
                    source,
                })?;
            self.set_state(state_after_part(index, build.parts.len()));
        }

        if cancelled(cancel) {
            return Ok(UploadOutcome::Cancelled);
        }
        self.service
            .channel
            .post_json(endpoints::UPLOAD_FINISH, &[])
            .await?;
        Ok(UploadOutcome::Succeeded)
    }
}

fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// State published once a part's finish is acknowledged: back to the
/// open session while parts remain, straight to Finishing after the
/// last one.
fn state_after_part(index: usize, part_count: usize) -> UploadState {
    if index + 1 == part_count {
        UploadState::Finishing
    } else {
        UploadState::SessionBegun
    }
}

/// Maps an upload failure to the catalog text shown to the user. Device
/// errors carry their own message; an empty one falls back to the
/// generic failure line.
pub fn error_text(err: &UploadError, messages: &Messages) -> String {
    match err {
        UploadError::Busy => messages.translate(MANUAL_BUSY, &[]),
        UploadError::Manifest(_) | UploadError::Archive(ArchiveError::NoManifest) => {
            messages.translate(MANUAL_BAD_ZIP, &[])
        }
        other => {
            let text = other.to_string();
            if text.is_empty() {
                messages.translate(REMOTE_STATUS_ERROR, &[])
            } else {
                text
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AckPayload;
    use common::StatusPayload;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct MockChannel {
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
        gate_upload_begin: Option<Arc<Notify>>,
    }

    impl MockChannel {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<(), ChannelError> {
            self.calls.lock().unwrap().push(call.clone());
            if let Some(target) = &self.fail_on {
                if call.starts_with(target.as_str()) {
                    return Err(ChannelError::Device("device rejected request".to_string()));
                }
            }
            Ok(())
        }
    }

    impl DeviceChannel for MockChannel {
        async fn get_status(&self) -> Result<StatusPayload, ChannelError> {
            self.record(format!("GET {}", endpoints::STATUS))?;
            Ok(StatusPayload::default())
        }

        async fn post_json(
            &self,
            path: &str,
            query: &[(&str, String)],
        ) -> Result<AckPayload, ChannelError> {
            let call = if query.is_empty() {
                path.to_string()
            } else {
                let pairs: Vec<String> =
                    query.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("{} {}", path, pairs.join("&"))
            };
            self.record(call)?;
            Ok(AckPayload::default())
        }

        async fn post_plain(&self, path: &str, _body: String) -> Result<AckPayload, ChannelError> {
            if path == endpoints::UPLOAD_BEGIN {
                if let Some(gate) = &self.gate_upload_begin {
                    gate.notified().await;
                }
            }
            self.record(path.to_string())?;
            Ok(AckPayload::default())
        }
    }

    struct MemArchive {
        manifest: String,
        parts: HashMap<String, Vec<u8>>,
    }

    impl ArchiveReader for MemArchive {
        fn manifest_text(&mut self) -> Result<String, ArchiveError> {
            Ok(self.manifest.clone())
        }

        fn part_bytes(&mut self, path: &str) -> Result<Vec<u8>, ArchiveError> {
            self.parts
                .get(path)
                .cloned()
                .ok_or_else(|| ArchiveError::MissingPart(path.to_string()))
        }
    }

    fn two_part_archive() -> MemArchive {
        let manifest = r#"{"builds":[{"parts":[
            {"path":"a","offset":0,"size":10},
            {"path":"b","offset":16,"size":5}
        ]}]}"#
            .to_string();
        let mut parts = HashMap::new();
        parts.insert("a".to_string(), vec![1u8; 10]);
        parts.insert("b".to_string(), vec![2u8; 5]);
        MemArchive { manifest, parts }
    }

    fn cancel_flag() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_call_order_for_two_parts() {
        let channel = MockChannel::default();
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, mut cancel) = cancel_flag();

        let outcome = service
            .begin_upload(&mut two_part_archive(), &mut cancel)
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Succeeded);

        // 10 bytes at chunk size 4 -> 3 chunks, 5 bytes -> 2 chunks
        assert_eq!(
            channel.calls(),
            vec![
                "/ota/upload/begin".to_string(),
                "/ota/upload/part/begin path=a&offset=0&size=10".to_string(),
                "/ota/upload/part/chunk".to_string(),
                "/ota/upload/part/chunk".to_string(),
                "/ota/upload/part/chunk".to_string(),
                "/ota/upload/part/finish path=a".to_string(),
                "/ota/upload/part/begin path=b&offset=16&size=5".to_string(),
                "/ota/upload/part/chunk".to_string(),
                "/ota/upload/part/chunk".to_string(),
                "/ota/upload/part/finish path=b".to_string(),
                "/ota/upload/finish".to_string(),
            ]
        );
        assert_eq!(service.progress().borrow().state, UploadState::Succeeded);
    }

    #[tokio::test]
    async fn test_part_begin_failure_aborts_and_cancels() {
        let channel = MockChannel {
            fail_on: Some("/ota/upload/part/begin path=b".to_string()),
            ..MockChannel::default()
        };
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, mut cancel) = cancel_flag();

        let err = service
            .begin_upload(&mut two_part_archive(), &mut cancel)
            .await
            .unwrap_err();
        match err {
            UploadError::Part { path, .. } => assert_eq!(path, "b"),
            other => panic!("unexpected error: {other}"),
        }

        let calls = channel.calls();
        assert_eq!(calls.last().unwrap(), endpoints::CANCEL);
        assert!(!calls.iter().any(|call| call == "/ota/upload/finish"));
        // Part "a" completed, nothing after "b" was attempted
        assert!(calls.contains(&"/ota/upload/part/finish path=a".to_string()));
        assert_eq!(service.progress().borrow().state, UploadState::Failed);
    }

    #[tokio::test]
    async fn test_empty_manifest_makes_no_network_calls() {
        let channel = MockChannel::default();
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, mut cancel) = cancel_flag();
        let mut archive = MemArchive {
            manifest: r#"{"builds":[]}"#.to_string(),
            parts: HashMap::new(),
        };

        let err = service
            .begin_upload(&mut archive, &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Manifest(ManifestError::Empty)));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_part_cancels_device() {
        let channel = MockChannel::default();
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, mut cancel) = cancel_flag();
        let mut archive = two_part_archive();
        archive.parts.remove("b");

        let err = service
            .begin_upload(&mut archive, &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Archive(ArchiveError::MissingPart(_))
        ));
        assert_eq!(channel.calls().last().unwrap(), endpoints::CANCEL);
    }

    #[tokio::test]
    async fn test_second_upload_rejected_while_busy() {
        let gate = Arc::new(Notify::new());
        let channel = MockChannel {
            gate_upload_begin: Some(gate.clone()),
            ..MockChannel::default()
        };
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, cancel) = cancel_flag();
        let mut first_cancel = cancel.clone();
        let mut second_cancel = cancel.clone();
        let mut first_archive = two_part_archive();
        let mut second_archive = two_part_archive();

        // First attempt parks inside upload/begin; the second must bounce
        // off the busy flag without touching the device, after which the
        // first is released and runs to completion.
        let (first, second) = tokio::join!(
            service.begin_upload(&mut first_archive, &mut first_cancel),
            async {
                let result = service.begin_upload(&mut second_archive, &mut second_cancel).await;
                gate.notify_one();
                result
            }
        );

        assert!(matches!(second, Err(UploadError::Busy)));
        assert_eq!(first.unwrap(), UploadOutcome::Succeeded);
        let begins = channel
            .calls()
            .iter()
            .filter(|call| call.as_str() == endpoints::UPLOAD_BEGIN)
            .count();
        assert_eq!(begins, 1);
    }

    #[tokio::test]
    async fn test_cancel_request_stops_transfer() {
        let channel = MockChannel::default();
        let service = UploadService::new(channel.clone(), 4);
        let (tx, mut cancel) = cancel_flag();
        tx.send(true).unwrap();

        let outcome = service
            .begin_upload(&mut two_part_archive(), &mut cancel)
            .await
            .unwrap();
        assert_eq!(outcome, UploadOutcome::Cancelled);

        // Cancel lands after upload/begin but before any part traffic
        assert_eq!(
            channel.calls(),
            vec![endpoints::UPLOAD_BEGIN.to_string(), endpoints::CANCEL.to_string()]
        );
        assert_eq!(service.progress().borrow().state, UploadState::Cancelled);
    }

    #[test]
    fn test_last_part_finish_leads_straight_to_finishing() {
        // Intermediate parts reopen the session; the final one does not.
        assert_eq!(state_after_part(0, 3), UploadState::SessionBegun);
        assert_eq!(state_after_part(1, 3), UploadState::SessionBegun);
        assert_eq!(state_after_part(2, 3), UploadState::Finishing);
        assert_eq!(state_after_part(0, 1), UploadState::Finishing);
    }

    #[test]
    fn test_error_text_routes_through_catalog() {
        let messages = Messages::english();
        assert_eq!(
            error_text(&UploadError::Busy, &messages),
            "Another update is already running."
        );
        assert_eq!(
            error_text(&UploadError::Archive(ArchiveError::NoManifest), &messages),
            "Archive does not contain a usable manifest."
        );
        let malformed = ManifestModel::parse("{").unwrap_err();
        assert_eq!(
            error_text(&UploadError::Manifest(malformed), &messages),
            "Archive does not contain a usable manifest."
        );
        // A device that acks with an empty error string still gets a line
        let blank = UploadError::Channel(ChannelError::Device(String::new()));
        assert_eq!(error_text(&blank, &messages), "Update failed.");
        let part = UploadError::Part {
            path: "a".to_string(),
            source: ChannelError::Device("flash write failed".to_string()),
        };
        assert_eq!(error_text(&part, &messages), "part a: flash write failed");
    }

    #[tokio::test]
    async fn test_busy_flag_released_after_failure() {
        let channel = MockChannel {
            fail_on: Some(endpoints::UPLOAD_FINISH.to_string()),
            ..MockChannel::default()
        };
        let service = UploadService::new(channel.clone(), 4);
        let (_tx, mut cancel) = cancel_flag();

        assert!(service
            .begin_upload(&mut two_part_archive(), &mut cancel)
            .await
            .is_err());

        // A fresh attempt from Idle is allowed again
        let channel_calls_before = channel.calls().len();
        let err = service
            .begin_upload(
                &mut MemArchive {
                    manifest: "{".to_string(),
                    parts: HashMap::new(),
                },
                &mut cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Manifest(ManifestError::Malformed(_))));
        assert_eq!(channel.calls().len(), channel_calls_before);
    }
}
