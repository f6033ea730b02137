//! Frame storage.

pub mod frame_store;
mod frm;
#[cfg(feature = "storage_hdf5")]
mod hdf5_store;

pub use frame_store::{Compression, FrameStore, StorageFormat, StoreOptions};
