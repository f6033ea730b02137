//! Asset documents describing where frame data physically live.
//!
//! Bulk frames never travel in the event stream. Instead two small documents do:
//!
//! - **ResourceDoc**: one per session, naming the dataset file and how to read it
//! - **DatumDoc**: one per stored frame, pointing into a resource by frame index
//!
//! # Document Flow
//!
//! ```text
//! ResourceDoc (1 per stage)
//!    │
//!    └── DatumDoc (N, one per trigger, frame_index 0..N)
//! ```
//!
//! The JSON field names are the interchange contract with downstream readers and must
//! not change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Resource document - identifies one session's dataset file and its format.
///
/// Created once per session, immediately after the file is created; immutable after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Unique resource identifier
    pub resource_id: String,
    /// Format tag naming the handler able to read the file
    pub spec_tag: String,
    /// Root directory the relative path is anchored at
    pub root: PathBuf,
    /// File path relative to `root`
    pub relative_path: PathBuf,
    /// Handler arguments (dataset path, dtype, shape)
    #[serde(default)]
    pub kwargs: HashMap<String, serde_json::Value>,
}

impl ResourceDoc {
    /// Absolute location of the dataset file.
    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.relative_path)
    }

    /// String-valued handler argument.
    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(|v| v.as_str())
    }
}

/// Datum document - references one frame inside a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatumDoc {
    /// Process-wide unique datum identifier
    pub datum_id: String,
    /// Links to ResourceDoc
    pub resource_id: String,
    /// Row of the frame in the resource's dataset
    pub frame_index: u64,
}

impl DatumDoc {
    /// The tagged reference used for lazy resolution.
    pub fn reference(&self) -> DatumRef {
        DatumRef {
            resource_id: self.resource_id.clone(),
            frame_index: self.frame_index,
        }
    }
}

/// Path-free reference to one stored frame: a resource id plus a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatumRef {
    /// Resource holding the frame
    pub resource_id: String,
    /// Row within the resource
    pub frame_index: u64,
}

impl fmt::Display for DatumRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.resource_id, self.frame_index)
    }
}

/// Kind tag of an asset document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// A [`ResourceDoc`].
    Resource,
    /// A [`DatumDoc`].
    Datum,
}

impl AssetKind {
    /// Lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Resource => "resource",
            AssetKind::Datum => "datum",
        }
    }
}

/// A `(kind, document)` pair as queued in the asset cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "document", rename_all = "lowercase")]
pub enum AssetDocument {
    /// Resource entry.
    Resource(ResourceDoc),
    /// Datum entry.
    Datum(DatumDoc),
}

impl AssetDocument {
    /// Kind tag of this entry.
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetDocument::Resource(_) => AssetKind::Resource,
            AssetDocument::Datum(_) => AssetKind::Datum,
        }
    }

    /// The resource this entry belongs to.
    pub fn resource_id(&self) -> &str {
        match self {
            AssetDocument::Resource(d) => &d.resource_id,
            AssetDocument::Datum(d) => &d.resource_id,
        }
    }

    /// Borrow as a resource, if it is one.
    pub fn as_resource(&self) -> Option<&ResourceDoc> {
        match self {
            AssetDocument::Resource(d) => Some(d),
            AssetDocument::Datum(_) => None,
        }
    }

    /// Borrow as a datum, if it is one.
    pub fn as_datum(&self) -> Option<&DatumDoc> {
        match self {
            AssetDocument::Datum(d) => Some(d),
            AssetDocument::Resource(_) => None,
        }
    }
}

/// Schema for a data field a detector produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<u32>,
    /// Source device ID
    pub source: String,
    /// Set to `"FILESTORE:"` when the value is a datum id pointing at external storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Physical units
    pub units: String,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            external: None,
            units: units.to_string(),
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<u32>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            source: source.to_string(),
            external: None,
            units: String::new(),
        }
    }

    /// Create an array data key whose values live in external files
    pub fn external_array(source: &str, shape: Vec<u32>) -> Self {
        Self {
            external: Some("FILESTORE:".to_string()),
            ..Self::array(source, shape)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ResourceDoc {
        ResourceDoc {
            resource_id: new_uid(),
            spec_tag: "BASLER_CAM_LZ4".to_string(),
            root: PathBuf::from("/tmp/basler"),
            relative_path: PathBuf::from("2024/05/01/abc.frm"),
            kwargs: HashMap::from([("dataset".to_string(), "/entry/image".into())]),
        }
    }

    #[test]
    fn test_resource_json_field_names() {
        let json = serde_json::to_value(resource()).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["resource_id", "spec_tag", "root", "relative_path", "kwargs"] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
        assert_eq!(obj.len(), 5);
    }

    #[test]
    fn test_datum_json_field_names() {
        let datum = DatumDoc {
            datum_id: "r/0".into(),
            resource_id: "r".into(),
            frame_index: 0,
        };
        let json = serde_json::to_value(&datum).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"datum_id": "r/0", "resource_id": "r", "frame_index": 0})
        );
    }

    #[test]
    fn test_asset_document_tagging() {
        let res = resource();
        let doc = AssetDocument::Resource(res.clone());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["kind"], "resource");
        assert_eq!(json["document"]["resource_id"], res.resource_id.as_str());

        let back: AssetDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), AssetKind::Resource);
        assert_eq!(back, doc);
    }

    #[test]
    fn test_full_path_and_reference() {
        let res = resource();
        assert_eq!(res.full_path(), PathBuf::from("/tmp/basler/2024/05/01/abc.frm"));
        assert_eq!(res.kwarg_str("dataset"), Some("/entry/image"));

        let datum = DatumDoc {
            datum_id: format!("{}/3", res.resource_id),
            resource_id: res.resource_id.clone(),
            frame_index: 3,
        };
        let reference = datum.reference();
        assert_eq!(reference.frame_index, 3);
        assert_eq!(reference.to_string(), format!("{}[3]", res.resource_id));
    }

    #[test]
    fn test_external_data_key() {
        let key = DataKey::external_array("basler_cam", vec![1040, 1024]);
        assert_eq!(key.external.as_deref(), Some("FILESTORE:"));
        assert_eq!(key.dtype, "array");
        let json = serde_json::to_value(DataKey::scalar("basler_cam", "")).unwrap();
        assert!(json.get("external").is_none());
    }
}
