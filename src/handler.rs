//! Lazy read-back of stored frames.
//!
//! A consumer holding a datum document turns it back into pixels here. Resolution is
//! independent of the writer: the file is reopened read-only, possibly long after the
//! session closed and from a different process.
//!
//! - [`FrameResolver`]: stateless `resolve(resource, frame_index)`
//! - [`HandlerRegistry`]: spec tag → handler factory
//! - [`ResourceTable`]: ingests collected documents and resolves `DatumRef`s

use crate::core::Frame;
use crate::data::FrameStore;
use crate::error::{AppResult, DaqError};
use crate::experiment::{AssetDocument, DatumDoc, DatumRef, ResourceDoc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Spec tag of resources written by the frame store.
pub const FRAME_STORE_SPEC: &str = "BASLER_CAM_LZ4";

/// Stateless reader for frame store resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameResolver;

impl FrameResolver {
    /// Reads row `frame_index` of the file named by `resource`.
    ///
    /// Every failure (missing file, corrupt layout, dataset mismatch, index out of range)
    /// is reported as `Resolve`.
    pub fn resolve(resource: &ResourceDoc, frame_index: u64) -> AppResult<Frame> {
        let path = resource.full_path();
        Self::read_row(resource, &path, frame_index).map_err(|source| DaqError::Resolve {
            path,
            source: Box::new(source),
        })
    }

    fn read_row(resource: &ResourceDoc, path: &Path, frame_index: u64) -> AppResult<Frame> {
        let mut store = FrameStore::open(path)?;
        if let Some(expected) = resource.kwarg_str("dataset") {
            let actual = store.dataset_path();
            if expected != actual {
                return Err(DaqError::Corrupt(format!(
                    "file holds dataset {actual}, resource names {expected}"
                )));
            }
        }
        let frame = store.read(frame_index)?;
        store.close()?;
        debug!(path = %path.display(), frame_index, "Frame resolved");
        Ok(frame)
    }
}

/// Reads frames of one resource.
pub trait AssetHandler: Send + Sync {
    /// Materializes row `frame_index`.
    fn resolve(&self, frame_index: u64) -> AppResult<Frame>;
}

/// Handler for frame store resources, bound to one resource document.
#[derive(Debug, Clone)]
pub struct FrameFileHandler {
    resource: ResourceDoc,
}

impl FrameFileHandler {
    /// Handler reading the file named by `resource`.
    pub fn new(resource: &ResourceDoc) -> Self {
        Self {
            resource: resource.clone(),
        }
    }
}

impl AssetHandler for FrameFileHandler {
    fn resolve(&self, frame_index: u64) -> AppResult<Frame> {
        FrameResolver::resolve(&self.resource, frame_index)
    }
}

/// Builds a handler for a resource document.
pub type HandlerFactory =
    Arc<dyn Fn(&ResourceDoc) -> AppResult<Box<dyn AssetHandler>> + Send + Sync>;

/// Maps spec tags to handler factories.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("specs", &self.specs())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the frame store handler under [`FRAME_STORE_SPEC`].
    pub fn with_defaults() -> Self {
        Self::with_frame_store_spec(FRAME_STORE_SPEC)
    }

    /// Registry with the frame store handler under [`FRAME_STORE_SPEC`] and `spec_tag`,
    /// for detectors configured with their own tag.
    pub fn with_frame_store_spec(spec_tag: &str) -> Self {
        let mut registry = Self::new();
        let factory: HandlerFactory =
            Arc::new(|resource: &ResourceDoc| -> AppResult<Box<dyn AssetHandler>> {
                Ok(Box::new(FrameFileHandler::new(resource)))
            });
        for tag in [FRAME_STORE_SPEC, spec_tag] {
            registry.factories.insert(tag.to_string(), Arc::clone(&factory));
        }
        registry
    }

    /// Registers `factory` for `spec_tag`.
    ///
    /// Fails with `HandlerExists` if the tag is taken and `overwrite` is false.
    pub fn register<F>(&mut self, spec_tag: &str, factory: F, overwrite: bool) -> AppResult<()>
    where
        F: Fn(&ResourceDoc) -> AppResult<Box<dyn AssetHandler>> + Send + Sync + 'static,
    {
        if !overwrite && self.factories.contains_key(spec_tag) {
            return Err(DaqError::HandlerExists(spec_tag.to_string()));
        }
        self.factories.insert(spec_tag.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Builds the handler for `resource`; fails with `UnknownSpec`.
    pub fn handler_for(&self, resource: &ResourceDoc) -> AppResult<Box<dyn AssetHandler>> {
        let factory = self
            .factories
            .get(&resource.spec_tag)
            .ok_or_else(|| DaqError::UnknownSpec(resource.spec_tag.clone()))?;
        factory(resource)
    }

    /// Registered spec tags, sorted.
    pub fn specs(&self) -> Vec<&str> {
        let mut specs: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        specs.sort_unstable();
        specs
    }
}

/// Resource and datum documents seen so far, used to resolve references.
#[derive(Debug, Default)]
pub struct ResourceTable {
    registry: HandlerRegistry,
    resources: HashMap<String, ResourceDoc>,
    datums: HashMap<String, DatumDoc>,
}

impl ResourceTable {
    /// Table resolving through `registry`.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            resources: HashMap::new(),
            datums: HashMap::new(),
        }
    }

    /// Records one document. A datum whose resource is unknown is rejected.
    pub fn ingest(&mut self, document: &AssetDocument) -> AppResult<()> {
        match document {
            AssetDocument::Resource(resource) => {
                self.resources
                    .insert(resource.resource_id.clone(), resource.clone());
            }
            AssetDocument::Datum(datum) => {
                if !self.resources.contains_key(&datum.resource_id) {
                    return Err(DaqError::UnknownResource(datum.resource_id.clone()));
                }
                self.datums.insert(datum.datum_id.clone(), datum.clone());
            }
        }
        Ok(())
    }

    /// Records documents in order.
    pub fn ingest_all<'a>(
        &mut self,
        documents: impl IntoIterator<Item = &'a AssetDocument>,
    ) -> AppResult<()> {
        documents.into_iter().try_for_each(|doc| self.ingest(doc))
    }

    /// Resource by id.
    pub fn resource(&self, resource_id: &str) -> Option<&ResourceDoc> {
        self.resources.get(resource_id)
    }

    /// Datum by id.
    pub fn datum(&self, datum_id: &str) -> Option<&DatumDoc> {
        self.datums.get(datum_id)
    }

    /// Number of known datums.
    pub fn datum_count(&self) -> usize {
        self.datums.len()
    }

    /// Materializes the frame behind `reference`.
    pub fn resolve(&self, reference: &DatumRef) -> AppResult<Frame> {
        let resource = self
            .resources
            .get(&reference.resource_id)
            .ok_or_else(|| DaqError::UnknownResource(reference.resource_id.clone()))?;
        self.registry
            .handler_for(resource)?
            .resolve(reference.frame_index)
    }

    /// Materializes the frame behind `datum_id`.
    pub fn resolve_datum(&self, datum_id: &str) -> AppResult<Frame> {
        let datum = self
            .datums
            .get(datum_id)
            .ok_or_else(|| DaqError::UnknownDatum(datum_id.to_string()))?;
        self.resolve(&datum.reference())
    }
}
