//! Construction of resource and datum documents.
//!
//! Apart from generating identifiers, composing a document has no side effects.
//! Datum ids take the form `<resource_id>/<seq>` where `seq` comes from a process-wide
//! counter, so two datums never share an id even if the same frame index is composed
//! twice.

use crate::experiment::document::{new_uid, DatumDoc, ResourceDoc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static DATUM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Builds asset documents for one spec tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetComposer {
    spec_tag: String,
}

impl AssetComposer {
    /// Composer emitting resources tagged `spec_tag`.
    pub fn new(spec_tag: impl Into<String>) -> Self {
        Self {
            spec_tag: spec_tag.into(),
        }
    }

    /// Spec tag stamped on every resource.
    pub fn spec_tag(&self) -> &str {
        &self.spec_tag
    }

    /// Describes a dataset file at `root/relative_path`.
    pub fn make_resource(
        &self,
        root: impl AsRef<Path>,
        relative_path: impl Into<PathBuf>,
        kwargs: HashMap<String, serde_json::Value>,
    ) -> ResourceDoc {
        ResourceDoc {
            resource_id: new_uid(),
            spec_tag: self.spec_tag.clone(),
            root: root.as_ref().to_path_buf(),
            relative_path: relative_path.into(),
            kwargs,
        }
    }

    /// References row `frame_index` of `resource`.
    pub fn make_datum(&self, resource: &ResourceDoc, frame_index: u64) -> DatumDoc {
        let seq = DATUM_SEQ.fetch_add(1, Ordering::Relaxed);
        DatumDoc {
            datum_id: format!("{}/{}", resource.resource_id, seq),
            resource_id: resource.resource_id.clone(),
            frame_index,
        }
    }
}
