//! Versioned model catalog: `<model_dir>/face_detection/<version>/metadata.json`
//! next to a `model.onnx`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DETECTION_KIND: &str = "face_detection";

const MODEL_FILES: [&str; 2] = ["model.onnx", "model.ort"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    /// NCHW, e.g. `[1, 3, 640, 640]`. Dynamic dims are negative.
    pub shape: Vec<i64>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub mean: Option<Vec<f32>>,
    #[serde(default)]
    pub std: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl ModelMetadata {
    /// Square spatial input size declared by the first input, if static.
    pub fn input_size(&self) -> Option<u32> {
        let shape = &self.inputs.first()?.shape;
        match shape.as_slice() {
            [_, _, h, w] if h == w && *h > 0 => u32::try_from(*h).ok(),
            _ => None,
        }
    }

    pub fn mean(&self) -> Option<[f32; 3]> {
        triple(self.inputs.first()?.mean.as_deref()?)
    }

    pub fn std(&self) -> Option<[f32; 3]> {
        triple(self.inputs.first()?.std.as_deref()?)
    }
}

fn triple(v: &[f32]) -> Option<[f32; 3]> {
    match v {
        [x] => Some([*x; 3]),
        [a, b, c] => Some([*a, *b, *c]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSelection {
    pub version: String,
    pub path: PathBuf,
    pub metadata: ModelMetadata,
}

/// Every usable version of a model kind. Directories without readable
/// metadata or a model file are skipped.
pub fn discover(model_dir: &Path, kind: &str) -> Vec<ModelSelection> {
    let kind_dir = model_dir.join(kind);
    let Ok(entries) = fs::read_dir(&kind_dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let version = entry.file_name().to_string_lossy().to_string();
        let dir = entry.path();
        let meta_path = dir.join("metadata.json");
        let metadata = match fs::read_to_string(&meta_path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<ModelMetadata>(&s).map_err(|e| e.to_string()))
        {
            Ok(m) => m,
            Err(e) => {
                if meta_path.exists() {
                    tracing::warn!(path = %meta_path.display(), error = %e, "skipping model version with bad metadata");
                }
                continue;
            }
        };
        let Some(path) = MODEL_FILES.iter().map(|f| dir.join(f)).find(|p| p.exists()) else {
            tracing::warn!(kind, version = %version, "model metadata without model file");
            continue;
        };
        found.push(ModelSelection {
            version,
            path,
            metadata,
        });
    }
    found.sort_by(|a, b| a.version.cmp(&b.version));
    found
}

/// Highest declared accuracy wins; ties (and missing accuracy) go to the
/// lexically greatest version.
pub fn select_best(mut candidates: Vec<ModelSelection>) -> Option<ModelSelection> {
    candidates.sort_by(|a, b| {
        let acc_a = a.metadata.accuracy.unwrap_or(f64::NEG_INFINITY);
        let acc_b = b.metadata.accuracy.unwrap_or(f64::NEG_INFINITY);
        acc_b.total_cmp(&acc_a).then_with(|| b.version.cmp(&a.version))
    });
    candidates.into_iter().next()
}

pub fn select_detector(model_dir: &Path) -> Option<ModelSelection> {
    select_best(discover(model_dir, DETECTION_KIND))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch_dir;

    fn write_version(root: &Path, version: &str, accuracy: Option<f64>, with_model: bool) {
        let dir = root.join(DETECTION_KIND).join(version);
        fs::create_dir_all(&dir).unwrap();
        let acc = accuracy.map(|a| format!(r#","accuracy":{a}"#)).unwrap_or_default();
        fs::write(
            dir.join("metadata.json"),
            format!(
                r#"{{"name":"scrfd","version":"{version}","inputs":[{{"name":"input.1","shape":[1,3,480,480],"mean":[0.5],"std":[0.5,0.5,0.5]}}]{acc}}}"#
            ),
        )
        .unwrap();
        if with_model {
            fs::write(dir.join("model.onnx"), b"x").unwrap();
        }
    }

    #[test]
    fn discover_skips_incomplete_versions() {
        let root = scratch_dir("catalog-discover");
        write_version(&root, "v1", None, true);
        write_version(&root, "v2", None, false);
        fs::create_dir_all(root.join(DETECTION_KIND).join("empty")).unwrap();

        let found = discover(&root, DETECTION_KIND);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "v1");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn select_best_prefers_accuracy_then_version() {
        let root = scratch_dir("catalog-select");
        write_version(&root, "a", Some(0.91), true);
        write_version(&root, "b", Some(0.95), true);
        write_version(&root, "c", None, true);
        assert_eq!(select_detector(&root).unwrap().version, "b");

        let root2 = scratch_dir("catalog-select-tie");
        write_version(&root2, "v1", None, true);
        write_version(&root2, "v3", None, true);
        assert_eq!(select_detector(&root2).unwrap().version, "v3");

        let _ = fs::remove_dir_all(&root);
        let _ = fs::remove_dir_all(&root2);
    }

    #[test]
    fn metadata_overrides() {
        let root = scratch_dir("catalog-meta");
        write_version(&root, "v1", None, true);
        let sel = select_detector(&root).unwrap();
        assert_eq!(sel.metadata.input_size(), Some(480));
        assert_eq!(sel.metadata.mean(), Some([0.5; 3]));
        assert_eq!(sel.metadata.std(), Some([0.5; 3]));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_dir_is_empty() {
        assert!(select_detector(&scratch_dir("catalog-none")).is_none());
    }
}
