use common::UpdateManifest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("manifest describes no uploadable parts")]
    Empty,
}

/// Parses and validates the bundled `manifest.json`. Pure data handling;
/// the caller keeps the original text around because the device receives
/// it verbatim at `upload/begin`.
pub struct ManifestModel;

impl ManifestModel {
    pub fn parse(manifest_text: &str) -> Result<UpdateManifest, ManifestError> {
        let manifest: UpdateManifest = serde_json::from_str(manifest_text)?;
        let usable = manifest
            .builds
            .first()
            .map(|build| !build.parts.is_empty())
            .unwrap_or(false);
        if !usable {
            return Err(ManifestError::Empty);
        }
        Ok(manifest)
    }
}
