use std::collections::HashMap;

/// User-facing message catalog. Keys are looked up directly and `{token}`
/// placeholders are substituted from the supplied parameters; an unknown
/// key renders as itself so a missing entry is visible instead of blank.
#[derive(Clone)]
pub struct Messages {
    entries: HashMap<&'static str, &'static str>,
}

pub const REMOTE_STATUS_IDLE: &str = "T_REMOTE_STATUS_IDLE";
pub const REMOTE_STATUS_WORKING: &str = "T_REMOTE_STATUS_WORKING";
pub const REMOTE_STATUS_SUCCESS: &str = "T_REMOTE_STATUS_SUCCESS";
pub const REMOTE_STATUS_ERROR: &str = "T_REMOTE_STATUS_ERROR";
pub const MANUAL_BUSY: &str = "T_MANUAL_BUSY";
pub const MANUAL_BAD_ZIP: &str = "T_MANUAL_BAD_ZIP";
pub const MANUAL_UPLOADING: &str = "T_MANUAL_UPLOADING";
pub const MANUAL_DONE: &str = "T_MANUAL_DONE";

impl Messages {
    pub fn english() -> Self {
        let mut entries = HashMap::new();
        entries.insert(REMOTE_STATUS_IDLE, "No update in progress.");
        entries.insert(REMOTE_STATUS_WORKING, "Update in progress…");
        entries.insert(REMOTE_STATUS_SUCCESS, "Update staged; reboot to apply.");
        entries.insert(REMOTE_STATUS_ERROR, "Update failed.");
        entries.insert(MANUAL_BUSY, "Another update is already running.");
        entries.insert(MANUAL_BAD_ZIP, "Archive does not contain a usable manifest.");
        entries.insert(MANUAL_UPLOADING, "Uploading {path}…");
        entries.insert(MANUAL_DONE, "Upload complete; device is applying the update.");
        Messages { entries }
    }

    pub fn translate(&self, key: &str, params: &[(&str, &str)]) -> String {
        let mut text = self.entries.get(key).copied().unwrap_or(key).to_string();
        for (token, value) in params {
            text = text.replace(&format!("{{{}}}", token), value);
        }
        text
    }
}

impl Default for Messages {
    fn default() -> Self {
        Messages::english()
    }
}
