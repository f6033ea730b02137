//! Asset document model (Bluesky-style resource/datum documents).
//!
//! # Architecture
//!
//! - **Documents**: `ResourceDoc` per session, `DatumDoc` per stored frame
//! - **Composer**: builds documents and allocates unique ids
//! - **AssetCache**: ordered queue drained by whoever forwards documents downstream
//!
//! # Example
//!
//! ```rust
//! use basler_daq::experiment::{AssetCache, AssetComposer};
//! use std::collections::HashMap;
//!
//! let composer = AssetComposer::new("BASLER_CAM_LZ4");
//! let cache = AssetCache::new();
//!
//! let resource = composer.make_resource("/tmp/basler", "2024/05/01/run.frm", HashMap::new());
//! cache.push_resource(resource.clone());
//! cache.push_datum(composer.make_datum(&resource, 0));
//!
//! assert_eq!(cache.drain().len(), 2);
//! ```

pub mod asset_cache;
pub mod composer;
pub mod document;

pub use asset_cache::AssetCache;
pub use composer::AssetComposer;
pub use document::{
    AssetDocument, AssetKind, DataKey, DatumDoc, DatumRef, ResourceDoc,
};
