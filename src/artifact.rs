//! Model archives in the model store.
//!
//! An archive is an unpacked directory, `<model_store>/<archive>`, with a
//! `MAR-INF/MANIFEST.json` describing the handler and the serialized payload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::validate_archive_name;
use crate::error::{Result, ServeError};

pub const MANIFEST_PATH: &str = "MAR-INF/MANIFEST.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archiver_version: Option<String>,
    pub model: ManifestModel,
    /// Handler specific settings, passed through untouched
    #[serde(default)]
    pub handler_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestModel {
    pub model_name: String,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Name of a built-in handler runtime
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_file: Option<String>,
    /// Hex SHA-256 of the serialized file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn default_model_version() -> String {
    "1.0".to_string()
}

/// A loaded, immutable model archive.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    /// Name the model is served under
    pub name: String,
    pub archive: String,
    pub model_dir: PathBuf,
    pub manifest: Manifest,
    /// Contents of the serialized file, if the manifest names one
    pub payload: Option<Vec<u8>>,
    pub checksum: Option<String>,
}

impl ModelArtifact {
    pub fn version(&self) -> &str {
        &self.manifest.model.model_version
    }

    pub fn handler(&self) -> &str {
        &self.manifest.model.handler
    }

    pub fn size_bytes(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Read the archive `archive` from `model_store` and serve it as `name`.
    pub fn load(model_store: &Path, name: &str, archive: &str) -> Result<Self> {
        validate_archive_name(archive).map_err(|e| load_error(name, e.to_string()))?;

        let model_dir = model_store.join(archive);
        if !model_dir.exists() {
            return Err(ServeError::ArtifactNotFound {
                model: name.to_string(),
                path: model_dir,
            });
        }
        if !model_dir.is_dir() {
            return Err(load_error(
                name,
                format!("{} is not an unpacked archive directory", model_dir.display()),
            ));
        }

        let manifest_path = model_dir.join(MANIFEST_PATH);
        let raw = std::fs::read(&manifest_path).map_err(|e| {
            load_error(name, format!("cannot read {}: {}", manifest_path.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| load_error(name, format!("malformed manifest: {}", e)))?;

        if manifest.model.handler.trim().is_empty() {
            return Err(load_error(name, "manifest names no handler".to_string()));
        }
        if manifest.model.model_name != name {
            tracing::warn!(
                model = %name,
                manifest_name = %manifest.model.model_name,
                "Archive manifest names a different model; serving under configured name"
            );
        }

        let (payload, checksum) = match &manifest.model.serialized_file {
            Some(file) => {
                validate_archive_name(file).map_err(|e| load_error(name, e.to_string()))?;
                let path = model_dir.join(file);
                let bytes = std::fs::read(&path).map_err(|e| {
                    load_error(name, format!("cannot read {}: {}", path.display(), e))
                })?;
                let digest = format!("{:x}", Sha256::digest(&bytes));

                if let Some(expected) = &manifest.model.sha256 {
                    if !expected.eq_ignore_ascii_case(&digest) {
                        return Err(load_error(
                            name,
                            format!("checksum mismatch for {}: expected {}, got {}", file, expected, digest),
                        ));
                    }
                }
                (Some(bytes), Some(digest))
            }
            None => (None, None),
        };

        tracing::debug!(
            model = %name,
            archive = %archive,
            handler = %manifest.model.handler,
            version = %manifest.model.model_version,
            "Read model archive"
        );

        Ok(Self {
            name: name.to_string(),
            archive: archive.to_string(),
            model_dir,
            manifest,
            payload,
            checksum,
        })
    }
}

fn load_error(model: &str, reason: String) -> ServeError {
    ServeError::ArtifactLoad {
        model: model.to_string(),
        reason,
    }
}
