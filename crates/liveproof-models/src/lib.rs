use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod catalog;

pub use catalog::{select_detector, InputSpec, ModelMetadata, ModelSelection};

/// Model file descriptor: URL, expected filename, SHA-256 checksum, human-readable size.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    pub size_display: &'static str,
}

// Checksum from the HuggingFace Git LFS pointer (oid sha256: field).
// Source: https://huggingface.co/public-data/insightface/raw/main/models/buffalo_l/
pub const DETECTOR: ModelFile = ModelFile {
    name: "det_10g.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
    size_display: "16 MB",
};

pub const MODELS: &[ModelFile] = &[DETECTOR];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("cannot hash {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} at {path} has sha256 {got}, expected {expected}")]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Hex SHA-256 of a file's contents, streamed.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let io_err = |source| ModelIntegrityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(fs::File::open(path).map_err(io_err)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(io_err)?;
    Ok(hex_digest(hasher))
}

/// Lowercase hex of a finished hasher.
pub fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Check `path` against `expected` (hex, any case). A missing file is
/// reported as such rather than as an I/O error.
pub fn verify_file_sha256(name: &str, path: &Path, expected: &str) -> Result<(), ModelIntegrityError> {
    let got = sha256_file_hex(path).map_err(|e| match e {
        ModelIntegrityError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
            ModelIntegrityError::MissingModel {
                name: name.to_string(),
                path: path.to_path_buf(),
            }
        }
        other => other,
    })?;
    if got.eq_ignore_ascii_case(expected) {
        return Ok(());
    }
    Err(ModelIntegrityError::ChecksumMismatch {
        name: name.to_string(),
        path: path.to_path_buf(),
        expected: expected.to_ascii_lowercase(),
        got,
    })
}

/// Every file in the built-in manifest must be present and intact.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    MODELS
        .iter()
        .try_for_each(|m| verify_file_sha256(m.name, &model_dir.join(m.name), m.sha256))
}

/// The detector the daemon should load, with where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub path: PathBuf,
    /// `name@version` reported with every detection.
    pub tag: String,
    pub metadata: Option<ModelMetadata>,
}

/// Find and verify the face detector under `model_dir`.
///
/// A catalog entry (`face_detection/<version>/`) wins over the flat manifest
/// file. Catalog entries are verified against their own metadata checksum
/// when they declare one.
pub fn resolve_detector(model_dir: &Path) -> Result<ResolvedModel, ModelIntegrityError> {
    if let Some(sel) = select_detector(model_dir) {
        if let Some(sha) = sel.metadata.sha256.as_deref().filter(|s| !s.is_empty()) {
            verify_file_sha256(&sel.metadata.name, &sel.path, sha)?;
        }
        return Ok(ResolvedModel {
            tag: format!("{}@{}", sel.metadata.name, sel.version),
            path: sel.path,
            metadata: Some(sel.metadata),
        });
    }

    let path = model_dir.join(DETECTOR.name);
    verify_file_sha256(DETECTOR.name, &path, DETECTOR.sha256)?;
    Ok(ResolvedModel {
        path,
        tag: "scrfd@det_10g".to_string(),
        metadata: None,
    })
}

#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "liveproof-models-test-{label}-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ))
}
