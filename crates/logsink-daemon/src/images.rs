//! Screenshot extraction and storage.
//!
//! Admitted context trees may carry inline `data:image/...;base64,...`
//! strings. The extractor walks the tree, persists acceptable images to
//! the image directory under `<application_id>-img-<issue_id>-<N>.<ext>`
//! and replaces the field with the filename. Rejected images are
//! replaced with a sentinel string so the context stays readable; a
//! failed write never fails the admission.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use logsink_core::config::StorageConfig;
use logsink_core::{Result, SinkError};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Sentinel written in place of an oversized image.
pub const SENTINEL_TOO_LARGE: &str = "[Image too large]";
/// Sentinel written in place of a disallowed image type.
pub const SENTINEL_BAD_TYPE: &str = "[Image type not allowed]";
/// Sentinel written in place of an image that failed to persist.
pub const SENTINEL_SAVE_FAILED: &str = "[Image save failed]";

const DATA_URI_PREFIX: &str = "data:image/";

/// Storage for extracted screenshot files.
#[derive(Clone)]
pub struct ImageStore {
    dir: PathBuf,
    max_size: usize,
    allowed_types: Vec<String>,
}

impl ImageStore {
    /// Creates the store, ensuring the image directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Storage`] if the directory cannot be
    /// created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.images_dir).map_err(|e| {
            SinkError::Storage(format!(
                "cannot create image directory {}: {e}",
                config.images_dir.display()
            ))
        })?;
        Ok(Self {
            dir: config.images_dir.clone(),
            max_size: config.max_image_size,
            allowed_types: config
                .allowed_image_types
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
        })
    }

    /// Walks the context tree, persisting inline images and rewriting
    /// their fields. Returns the filenames that were written.
    pub fn extract(
        &self,
        application_id: &str,
        issue_id: Uuid,
        context: &mut Map<String, Value>,
    ) -> Vec<String> {
        let mut saved = Vec::new();
        let mut counter = 0u32;
        for value in context.values_mut() {
            self.walk(application_id, issue_id, value, &mut counter, &mut saved);
        }
        saved
    }

    fn walk(
        &self,
        application_id: &str,
        issue_id: Uuid,
        value: &mut Value,
        counter: &mut u32,
        saved: &mut Vec<String>,
    ) {
        match value {
            Value::String(s) if s.starts_with(DATA_URI_PREFIX) => {
                *value = Value::String(self.persist(application_id, issue_id, s, counter, saved));
            },
            Value::Array(items) => {
                for item in items {
                    self.walk(application_id, issue_id, item, counter, saved);
                }
            },
            Value::Object(map) => {
                for item in map.values_mut() {
                    self.walk(application_id, issue_id, item, counter, saved);
                }
            },
            _ => {},
        }
    }

    /// Decodes and writes one data URI, returning the replacement field
    /// value: the filename on success, a sentinel otherwise.
    fn persist(
        &self,
        application_id: &str,
        issue_id: Uuid,
        data_uri: &str,
        counter: &mut u32,
        saved: &mut Vec<String>,
    ) -> String {
        let Some((ext, payload)) = split_data_uri(data_uri) else {
            return SENTINEL_BAD_TYPE.to_string();
        };
        let ext = ext.to_lowercase();
        if !self.allowed_types.contains(&ext) {
            debug!(ext = %ext, "rejected image with disallowed type");
            return SENTINEL_BAD_TYPE.to_string();
        }

        // Upper bound on the decoded size; avoids decoding payloads that
        // cannot fit anyway.
        if payload.len() / 4 * 3 > self.max_size {
            debug!(encoded_len = payload.len(), "rejected oversized image");
            return SENTINEL_TOO_LARGE.to_string();
        }

        let bytes = match BASE64.decode(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "rejected undecodable image payload");
                return SENTINEL_BAD_TYPE.to_string();
            },
        };
        if bytes.len() > self.max_size {
            return SENTINEL_TOO_LARGE.to_string();
        }

        *counter += 1;
        let filename = format!("{application_id}-img-{issue_id}-{counter}.{ext}");
        match std::fs::write(self.dir.join(&filename), &bytes) {
            Ok(()) => {
                saved.push(filename.clone());
                filename
            },
            Err(err) => {
                warn!(filename = %filename, error = %err, "image write failed");
                SENTINEL_SAVE_FAILED.to_string()
            },
        }
    }

    /// Absolute path of a stored image.
    #[must_use]
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Reads a stored image.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::NotFound`] when the file does not exist.
    pub fn read(&self, filename: &str) -> Result<Vec<u8>> {
        std::fs::read(self.path_for(filename)).map_err(|_| SinkError::not_found("image"))
    }

    /// Deletes the given screenshot files, tolerating already-missing
    /// entries. Returns how many files were actually removed.
    pub fn delete(&self, filenames: &[String]) -> u32 {
        let mut removed = 0;
        for filename in filenames {
            match std::fs::remove_file(self.path_for(filename)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => {
                    warn!(filename = %filename, error = %err, "screenshot delete failed");
                },
            }
        }
        removed
    }

    /// Deletes every file in the image directory whose name is not in
    /// `referenced`. The caller scans the store first; a file created by
    /// an admission that has not persisted its row yet survives until
    /// the next run.
    pub fn sweep_orphans(&self, referenced: &HashSet<String>) -> Result<u32> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            SinkError::Storage(format!(
                "cannot read image directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(filename = %name, "removed orphaned image");
                    removed += 1;
                },
                Err(err) => {
                    warn!(filename = %name, error = %err, "orphan delete failed");
                },
            }
        }
        Ok(removed)
    }

    /// The image directory root.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Splits `data:image/<ext>;base64,<payload>` into `(ext, payload)`.
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix(DATA_URI_PREFIX)?;
    let (ext, payload) = rest.split_once(";base64,")?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some((ext, payload))
}
