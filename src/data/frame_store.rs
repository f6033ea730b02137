//! Append-only frame datasets.
//!
//! One file holds one dataset of shape `(N, H, W)`. `(H, W)` and the sample type are fixed
//! when the file is created; `N` grows by exactly one row per [`FrameStore::append`], and
//! any row can be read back without touching the others.
//!
//! Two on-disk formats sit behind [`FrameStore`]:
//!
//! - [`StorageFormat::Hdf5`]: an HDF5 file with a resizable, chunked `/entry/image`
//!   dataset. Needs the `storage_hdf5` feature and a native HDF5 library.
//! - [`StorageFormat::Frm`]: the built-in `.frm` container with one LZ4 or raw record per
//!   row. Always available.
//!
//! [`FrameStore::open`] picks the backend from the file signature, so readers never need to
//! know which format a session was written in.

use super::frm::FrmFile;
#[cfg(feature = "storage_hdf5")]
use super::hdf5_store::Hdf5File;
use crate::core::{Dtype, Frame, FrameShape};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// First bytes of every HDF5 file.
const HDF5_SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// On-disk format of new session files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Built-in `.frm` container.
    #[default]
    Frm,
    /// HDF5 file (`storage_hdf5` feature).
    Hdf5,
}

impl StorageFormat {
    /// File extension of session files in this format.
    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Frm => "frm",
            StorageFormat::Hdf5 => "h5",
        }
    }

    /// Whether this build can write the format.
    pub fn is_available(self) -> bool {
        match self {
            StorageFormat::Frm => true,
            StorageFormat::Hdf5 => cfg!(feature = "storage_hdf5"),
        }
    }
}

/// Row compression. Every setting round-trips exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Rows stored raw.
    None,
    /// LZ4 block format, size prepended (`.frm` only).
    #[default]
    Lz4,
    /// Shuffle plus deflate filter (HDF5 only).
    Deflate,
}

/// Options fixed at store creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// File format.
    #[serde(default)]
    pub format: StorageFormat,
    /// Row compression.
    pub compression: Compression,
    /// Group holding the dataset.
    pub group: String,
    /// Dataset name inside the group.
    pub dataset: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            format: StorageFormat::Frm,
            compression: Compression::Lz4,
            group: "entry".to_string(),
            dataset: "image".to_string(),
        }
    }
}

impl StoreOptions {
    /// Options with the given compression and default names.
    pub fn with_compression(compression: Compression) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }

    /// HDF5 options with deflate compression and default names.
    pub fn hdf5() -> Self {
        Self {
            format: StorageFormat::Hdf5,
            compression: Compression::Deflate,
            ..Self::default()
        }
    }

    /// Checks that this build can write the format with the chosen compression.
    pub fn validate(&self) -> AppResult<()> {
        if !self.format.is_available() {
            return Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()));
        }
        match (self.format, self.compression) {
            (StorageFormat::Frm, Compression::Deflate) => Err(DaqError::Configuration(
                "deflate compression needs the hdf5 storage format".into(),
            )),
            (StorageFormat::Hdf5, Compression::Lz4) => Err(DaqError::Configuration(
                "lz4 compression needs the frm storage format, use deflate for hdf5".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
enum Backend {
    Frm(FrmFile),
    #[cfg(feature = "storage_hdf5")]
    Hdf5(Hdf5File),
}

macro_rules! dispatch {
    ($self:expr, $file:ident => $body:expr) => {
        match $self {
            Backend::Frm($file) => $body,
            #[cfg(feature = "storage_hdf5")]
            Backend::Hdf5($file) => $body,
        }
    };
}

/// Handle to one append-only frame dataset file.
#[derive(Debug)]
pub struct FrameStore {
    backend: Backend,
}

impl FrameStore {
    /// Creates a new, empty dataset file for frames of `shape` and `dtype`.
    ///
    /// Fails with `StoreCreate` if `path` already exists or cannot be created. An existing
    /// file is never touched.
    pub fn create(
        path: impl AsRef<Path>,
        shape: FrameShape,
        dtype: Dtype,
        options: StoreOptions,
    ) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if shape.pixels() == 0 {
            return Err(DaqError::InvalidFrame(format!("empty frame shape {shape}")));
        }
        options.validate()?;
        let backend = match options.format {
            StorageFormat::Frm => Backend::Frm(FrmFile::create(path, shape, dtype, options)?),
            #[cfg(feature = "storage_hdf5")]
            StorageFormat::Hdf5 => Backend::Hdf5(Hdf5File::create(path, shape, dtype, options)?),
            #[cfg(not(feature = "storage_hdf5"))]
            StorageFormat::Hdf5 => {
                return Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()))
            }
        };
        Ok(Self { backend })
    }

    /// Opens an existing dataset file read-only, in whichever format it was written.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let backend = match sniff_format(&path)? {
            StorageFormat::Frm => Backend::Frm(FrmFile::open(path)?),
            #[cfg(feature = "storage_hdf5")]
            StorageFormat::Hdf5 => Backend::Hdf5(Hdf5File::open(path)?),
            #[cfg(not(feature = "storage_hdf5"))]
            StorageFormat::Hdf5 => {
                return Err(DaqError::FeatureNotEnabled("storage_hdf5".to_string()))
            }
        };
        Ok(Self { backend })
    }

    /// Appends one frame as a new row and returns its index (`N-1`).
    ///
    /// The frame must match the store's shape and dtype. On failure the file is left at
    /// its previous row count.
    pub fn append(&mut self, frame: &Frame) -> AppResult<u64> {
        dispatch!(&mut self.backend, file => file.append(frame))
    }

    /// Reads row `index` into a newly allocated frame.
    pub fn read(&mut self, index: u64) -> AppResult<Frame> {
        dispatch!(&mut self.backend, file => file.read(index))
    }

    /// Flushes and releases the file. Closing twice is a no-op.
    ///
    /// A writable store whose file was removed from its path while open reports
    /// `StoreLost`; the rows it held are gone with it.
    pub fn close(&mut self) -> AppResult<()> {
        let was_open = !self.is_closed();
        dispatch!(&mut self.backend, file => file.close())?;
        if was_open && self.is_writable() && !self.path().exists() {
            return Err(DaqError::StoreLost {
                path: self.path().to_path_buf(),
            });
        }
        Ok(())
    }

    /// Closes the handle and deletes the file it created.
    ///
    /// Read-only handles are only closed; their file is kept.
    pub fn discard(self) -> AppResult<()> {
        dispatch!(self.backend, file => file.discard())
    }

    /// Number of committed rows `N`.
    pub fn len(&self) -> u64 {
        dispatch!(&self.backend, file => file.len())
    }

    /// True when no frame has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed frame shape `(H, W)`.
    pub fn shape(&self) -> FrameShape {
        dispatch!(&self.backend, file => file.shape())
    }

    /// Fixed sample type.
    pub fn dtype(&self) -> Dtype {
        dispatch!(&self.backend, file => file.dtype())
    }

    /// Row compression.
    pub fn compression(&self) -> Compression {
        dispatch!(&self.backend, file => file.compression())
    }

    /// File format.
    pub fn format(&self) -> StorageFormat {
        match self.backend {
            Backend::Frm(_) => StorageFormat::Frm,
            #[cfg(feature = "storage_hdf5")]
            Backend::Hdf5(_) => StorageFormat::Hdf5,
        }
    }

    /// Dataset path inside the file, e.g. `/entry/image`.
    pub fn dataset_path(&self) -> String {
        dispatch!(&self.backend, file => file.dataset_path())
    }

    /// File location.
    pub fn path(&self) -> &Path {
        dispatch!(&self.backend, file => file.path())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        dispatch!(&self.backend, file => file.is_closed())
    }

    /// Whether this handle created the file and may append to it.
    pub fn is_writable(&self) -> bool {
        dispatch!(&self.backend, file => file.is_writable())
    }
}

/// Tells the formats apart by the file signature.
fn sniff_format(path: &Path) -> AppResult<StorageFormat> {
    let mut signature = [0u8; 8];
    let mut file = File::open(path)?;
    let read = file.read(&mut signature)?;
    if read == signature.len() && &signature == HDF5_SIGNATURE {
        Ok(StorageFormat::Hdf5)
    } else {
        Ok(StorageFormat::Frm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelBuffer;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn gradient(shape: FrameShape, offset: u8) -> Frame {
        let pixels = (0..shape.pixels())
            .map(|i| (i as u8).wrapping_add(offset))
            .collect();
        Frame::new(shape, PixelBuffer::U8(pixels)).unwrap()
    }

    #[test]
    fn test_append_then_read() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(4, 6);
        let mut store =
            FrameStore::create(dir.path().join("a.frm"), shape, Dtype::U8, StoreOptions::default())
                .unwrap();
        assert!(store.is_empty());

        let frames: Vec<Frame> = (0..3).map(|i| gradient(shape, i * 10)).collect();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(store.append(frame).unwrap(), i as u64);
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.read(1).unwrap(), frames[1]);
        assert_eq!(store.read(0).unwrap(), frames[0]);
        assert_eq!(store.read(2).unwrap(), frames[2]);
    }

    #[test]
    fn test_roundtrip_u16_and_f64_without_compression() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(3, 2);

        let u16_frame = Frame::new(
            shape,
            PixelBuffer::U16(vec![0, 1, 4095, 65535, 256, 7]),
        )
        .unwrap();
        let mut store = FrameStore::create(
            dir.path().join("u16.frm"),
            shape,
            Dtype::U16,
            StoreOptions::with_compression(Compression::None),
        )
        .unwrap();
        store.append(&u16_frame).unwrap();
        assert_eq!(store.read(0).unwrap(), u16_frame);

        let f64_frame = Frame::new(
            shape,
            PixelBuffer::F64(vec![0.5, -1.25, 1e10, 3.0, 0.0, 42.0]),
        )
        .unwrap();
        let mut store =
            FrameStore::create(dir.path().join("f64.frm"), shape, Dtype::F64, StoreOptions::default())
                .unwrap();
        store.append(&f64_frame).unwrap();
        assert_eq!(store.read(0).unwrap(), f64_frame);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken.frm");
        fs::write(&path, b"prior data").unwrap();

        let err = FrameStore::create(&path, FrameShape::new(2, 2), Dtype::U8, StoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, DaqError::StoreCreate { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"prior data");
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = FrameStore::create(
            dir.path().join("missing").join("a.frm"),
            FrameShape::new(2, 2),
            Dtype::U8,
            StoreOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::StoreCreate { .. }));
    }

    #[test]
    fn test_shape_and_dtype_checked_at_append() {
        let dir = TempDir::new().unwrap();
        let mut store = FrameStore::create(
            dir.path().join("a.frm"),
            FrameShape::new(2, 2),
            Dtype::U8,
            StoreOptions::default(),
        )
        .unwrap();

        let err = store
            .append(&Frame::filled_u8(FrameShape::new(2, 3), 1))
            .unwrap_err();
        assert!(matches!(err, DaqError::ShapeMismatch { .. }));

        let wrong_dtype =
            Frame::new(FrameShape::new(2, 2), PixelBuffer::U16(vec![1, 2, 3, 4])).unwrap();
        let err = store.append(&wrong_dtype).unwrap_err();
        assert!(matches!(err, DaqError::DtypeMismatch { .. }));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(2, 2);
        let mut store =
            FrameStore::create(dir.path().join("a.frm"), shape, Dtype::U8, StoreOptions::default())
                .unwrap();
        store.append(&Frame::filled_u8(shape, 3)).unwrap();
        let err = store.read(1).unwrap_err();
        assert!(matches!(err, DaqError::Index { index: 1, len: 1 }));
    }

    #[test]
    fn test_read_returns_independent_copy() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(2, 2);
        let mut store =
            FrameStore::create(dir.path().join("a.frm"), shape, Dtype::U8, StoreOptions::default())
                .unwrap();
        let original = Frame::filled_u8(shape, 5);
        store.append(&original).unwrap();

        let mut copy = store.read(0).unwrap().into_pixels();
        if let PixelBuffer::U8(data) = &mut copy {
            data[0] = 99;
        }
        assert_eq!(store.read(0).unwrap(), original);
    }

    #[test]
    fn test_double_close_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = FrameStore::create(
            dir.path().join("a.frm"),
            FrameShape::new(2, 2),
            Dtype::U8,
            StoreOptions::default(),
        )
        .unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.append(&Frame::filled_u8(FrameShape::new(2, 2), 0)),
            Err(DaqError::StoreClosed)
        ));
        assert!(matches!(store.read(0), Err(DaqError::StoreClosed)));
    }

    #[test]
    fn test_reopen_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let shape = FrameShape::new(5, 3);
        let frames: Vec<Frame> = (0..4).map(|i| gradient(shape, i * 3)).collect();
        {
            let mut store =
                FrameStore::create(&path, shape, Dtype::U8, StoreOptions::default()).unwrap();
            for frame in &frames {
                store.append(frame).unwrap();
            }
            store.close().unwrap();
        }

        let mut reader = FrameStore::open(&path).unwrap();
        assert_eq!(reader.len(), 4);
        assert_eq!(reader.shape(), shape);
        assert_eq!(reader.dtype(), Dtype::U8);
        assert_eq!(reader.dataset_path(), "/entry/image");
        assert_eq!(reader.read(3).unwrap(), frames[3]);
        assert_eq!(reader.read(0).unwrap(), frames[0]);
        assert!(matches!(reader.append(&frames[0]), Err(DaqError::ReadOnly)));
    }

    #[test]
    fn test_zero_frame_file_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.frm");
        let mut store =
            FrameStore::create(&path, FrameShape::new(8, 8), Dtype::U16, StoreOptions::default())
                .unwrap();
        store.close().unwrap();

        let mut reader = FrameStore::open(&path).unwrap();
        assert!(reader.is_empty());
        assert!(matches!(reader.read(0), Err(DaqError::Index { index: 0, len: 0 })));
    }

    #[test]
    fn test_uncommitted_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let shape = FrameShape::new(2, 2);
        let mut store = FrameStore::create(&path, shape, Dtype::U8, StoreOptions::default()).unwrap();
        store.append(&Frame::filled_u8(shape, 1)).unwrap();
        store.close().unwrap();

        // A record written without bumping the row count.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let mut reader = FrameStore::open(&path).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.read(0).unwrap(), Frame::filled_u8(shape, 1));
    }

    #[test]
    fn test_truncated_row_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let shape = FrameShape::new(16, 16);
        let mut store = FrameStore::create(
            &path,
            shape,
            Dtype::U8,
            StoreOptions::with_compression(Compression::None),
        )
        .unwrap();
        store.append(&Frame::filled_u8(shape, 1)).unwrap();
        store.close().unwrap();

        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 10).unwrap();
        assert!(matches!(FrameStore::open(&path), Err(DaqError::Corrupt(_))));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.frm");
        fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(FrameStore::open(&path), Err(DaqError::Corrupt(_))));
    }

    #[test]
    fn test_lz4_shrinks_flat_frames() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(64, 64);
        let path = dir.path().join("a.frm");
        let mut store = FrameStore::create(&path, shape, Dtype::U8, StoreOptions::default()).unwrap();
        for _ in 0..4 {
            store.append(&Frame::filled_u8(shape, 17)).unwrap();
        }
        store.close().unwrap();
        assert!(fs::metadata(&path).unwrap().len() < (4 * shape.pixels()) as u64);
    }

    #[test]
    fn test_discard_removes_created_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let store =
            FrameStore::create(&path, FrameShape::new(2, 2), Dtype::U8, StoreOptions::default())
                .unwrap();
        store.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_file_fails_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let shape = FrameShape::new(2, 2);
        let mut store = FrameStore::create(&path, shape, Dtype::U8, StoreOptions::default()).unwrap();
        store.append(&Frame::filled_u8(shape, 1)).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(matches!(store.close(), Err(DaqError::StoreLost { .. })));
        assert!(store.is_closed());
        store.close().unwrap();
    }

    #[test]
    fn test_options_reject_mismatched_compression() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.frm");
        let err = FrameStore::create(
            &path,
            FrameShape::new(2, 2),
            Dtype::U8,
            StoreOptions::with_compression(Compression::Deflate),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(!path.exists());

        let lz4_hdf5 = StoreOptions {
            compression: Compression::Lz4,
            ..StoreOptions::hdf5()
        };
        assert!(lz4_hdf5.validate().is_err());
    }

    #[test]
    fn test_format_extensions() {
        assert_eq!(StorageFormat::Frm.extension(), "frm");
        assert_eq!(StorageFormat::Hdf5.extension(), "h5");
        assert_eq!(StorageFormat::default(), StorageFormat::Frm);
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn test_hdf5_needs_feature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.h5");
        let err = FrameStore::create(&path, FrameShape::new(2, 2), Dtype::U8, StoreOptions::hdf5())
            .unwrap_err();
        assert!(matches!(err, DaqError::FeatureNotEnabled(_)));
        assert!(!path.exists());

        let mut bytes = HDF5_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 56]);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            FrameStore::open(&path),
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }

    #[cfg(feature = "storage_hdf5")]
    #[test]
    fn test_hdf5_store_opens_by_signature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.h5");
        let shape = FrameShape::new(4, 3);
        let frame = Frame::new(shape, PixelBuffer::F64((0..12).map(f64::from).collect())).unwrap();
        let mut store = FrameStore::create(&path, shape, Dtype::F64, StoreOptions::hdf5()).unwrap();
        assert_eq!(store.format(), StorageFormat::Hdf5);
        store.append(&frame).unwrap();
        store.close().unwrap();

        let mut reader = FrameStore::open(&path).unwrap();
        assert_eq!(reader.format(), StorageFormat::Hdf5);
        assert_eq!(reader.compression(), Compression::Deflate);
        assert_eq!(reader.dataset_path(), "/entry/image");
        assert_eq!(reader.read(0).unwrap(), frame);
    }
}
