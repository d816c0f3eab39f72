use serde::{Deserialize, Serialize};

// Protocol constants shared by the client and the simulator
pub const UPLOAD_CHUNK_SIZE: usize = 16384;
pub const POLL_INTERVAL_MS: u64 = 4000;

/// OTA endpoint paths on the device, relative to its base URL
pub mod endpoints {
    pub const STATUS: &str = "/ota/status";
    pub const FETCH: &str = "/ota/fetch";
    pub const CANCEL: &str = "/ota/cancel";
    pub const UPLOAD_BEGIN: &str = "/ota/upload/begin";
    pub const PART_BEGIN: &str = "/ota/upload/part/begin";
    pub const PART_CHUNK: &str = "/ota/upload/part/chunk";
    pub const PART_FINISH: &str = "/ota/upload/part/finish";
    pub const UPLOAD_FINISH: &str = "/ota/upload/finish";
}

/// Response body of `GET /ota/status`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusPayload {
    pub ota: OtaSection,
    pub current_version: Option<String>,
    pub latest_version: Option<String>,
    pub latest_error: Option<String>,
}

/// The `ota` object inside the status payload. The device reports two
/// busy indicators: `busy` for the engine itself and `taskActive` for the
/// background task wrapping it; either one means an update is running.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtaSection {
    pub busy: bool,
    pub task_active: bool,
    pub message: String,
    pub last_error: String,
    pub needs_reboot: bool,
    pub bytes_written: u64,
    pub bytes_total: u64,
}

/// Every command endpoint answers with a JSON object; a populated `error`
/// field is a failure even when the HTTP status is 200.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Update manifest bundled at the root of an OTA ZIP. Only the first
/// build is ever used; the rest are alternates for other hardware.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateManifest {
    pub version: Option<String>,
    pub builds: Vec<Build>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Build {
    pub parts: Vec<Part>,
}

/// One contiguous firmware segment: an archive path plus where it lands
/// in flash and how many bytes it holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Part {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    pub size: u64,
}

impl UpdateManifest {
    /// Sum of the declared part sizes of the first build.
    pub fn total_bytes(&self) -> u64 {
        self.builds
            .first()
            .map(|build| build.parts.iter().map(|part| part.size).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_wire_names() {
        let json = r#"{
            "ota": {
                "busy": true,
                "taskActive": false,
                "message": "Writing firmware",
                "lastError": "",
                "needsReboot": false,
                "bytesWritten": 512,
                "bytesTotal": 2048
            },
            "currentVersion": "1.4.0",
            "latestVersion": "1.5.0"
        }"#;

        let payload: StatusPayload = serde_json::from_str(json).unwrap();
        assert!(payload.ota.busy);
        assert_eq!(payload.ota.bytes_written, 512);
        assert_eq!(payload.ota.bytes_total, 2048);
        assert_eq!(payload.current_version.as_deref(), Some("1.4.0"));
        assert_eq!(payload.latest_error, None);
    }

    #[test]
    fn test_manifest_total_bytes() {
        let json = r#"{
            "version": "1.5.0",
            "builds": [
                { "parts": [
                    { "path": "firmware.bin", "offset": 65536, "size": 10 },
                    { "path": "littlefs.bin", "offset": 3145728, "size": 5 }
                ] }
            ]
        }"#;

        let manifest: UpdateManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.total_bytes(), 15);
        assert_eq!(manifest.builds[0].parts[0].offset, 65536);
    }
}
