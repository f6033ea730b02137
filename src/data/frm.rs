//! `.frm` container: the built-in frame store backend.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       8     magic "BDAQFRM1"
//! 8       2     format version (1)
//! 10      1     dtype code (0 = uint8, 1 = uint16, 2 = float64)
//! 11      1     compression code (0 = none, 1 = lz4)
//! 12      4     height
//! 16      4     width
//! 20      8     committed row count N
//! 28      2+g   group name (u16 length + UTF-8), default "entry"
//! ..      2+d   dataset name (u16 length + UTF-8), default "image"
//! ..            N row records: u32 payload length, payload
//! ```
//!
//! The row count at offset 20 is the commit point. A row record is written first and
//! the count is bumped afterwards; bytes past the last committed record are ignored when
//! the file is reopened. A failed append truncates the file back to its previous length.

use super::frame_store::{Compression, StoreOptions};
use crate::core::{Dtype, Frame, FrameShape, PixelBuffer};
use crate::error::{AppResult, DaqError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 8] = b"BDAQFRM1";
const VERSION: u16 = 1;
const ROWS_OFFSET: u64 = 20;
const FIXED_HEADER_LEN: usize = 28;
const RECORD_HEADER_LEN: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    dtype: Dtype,
    compression: Compression,
    shape: FrameShape,
    rows: u64,
    group: String,
    dataset: String,
}

impl Header {
    fn encode(&self) -> AppResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + self.group.len() + self.dataset.len() + 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.push(self.dtype.code());
        buf.push(compression_code(self.compression)?);
        buf.extend_from_slice(&self.shape.height.to_le_bytes());
        buf.extend_from_slice(&self.shape.width.to_le_bytes());
        buf.extend_from_slice(&self.rows.to_le_bytes());
        for name in [&self.group, &self.dataset] {
            let len = u16::try_from(name.len()).map_err(|_| {
                DaqError::Configuration(format!("dataset name '{name}' is too long"))
            })?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        Ok(buf)
    }

    /// Reads the header, returning it with its encoded length.
    fn read_from(reader: &mut impl Read) -> AppResult<(Self, u64)> {
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        read_exact_or_corrupt(reader, &mut fixed, "header")?;
        if &fixed[0..8] != MAGIC {
            return Err(DaqError::Corrupt("bad magic, not a frame store".into()));
        }
        let version = u16::from_le_bytes([fixed[8], fixed[9]]);
        if version != VERSION {
            return Err(DaqError::Corrupt(format!("unsupported version {version}")));
        }
        let dtype = Dtype::from_code(fixed[10])
            .ok_or_else(|| DaqError::Corrupt(format!("unknown dtype code {}", fixed[10])))?;
        let compression = compression_from_code(fixed[11]).ok_or_else(|| {
            DaqError::Corrupt(format!("unknown compression code {}", fixed[11]))
        })?;
        let height = u32::from_le_bytes([fixed[12], fixed[13], fixed[14], fixed[15]]);
        let width = u32::from_le_bytes([fixed[16], fixed[17], fixed[18], fixed[19]]);
        let mut rows = [0u8; 8];
        rows.copy_from_slice(&fixed[20..28]);
        let rows = u64::from_le_bytes(rows);

        let group = read_name(reader)?;
        let dataset = read_name(reader)?;
        let len = (FIXED_HEADER_LEN + 4 + group.len() + dataset.len()) as u64;
        let header = Header {
            dtype,
            compression,
            shape: FrameShape::new(height, width),
            rows,
            group,
            dataset,
        };
        Ok((header, len))
    }

    fn row_bytes(&self) -> usize {
        self.shape.pixels() * self.dtype.bytes_per_sample()
    }
}

fn compression_code(compression: Compression) -> AppResult<u8> {
    match compression {
        Compression::None => Ok(0),
        Compression::Lz4 => Ok(1),
        Compression::Deflate => Err(DaqError::Configuration(
            "deflate compression needs the hdf5 storage format".into(),
        )),
    }
}

fn compression_from_code(code: u8) -> Option<Compression> {
    match code {
        0 => Some(Compression::None),
        1 => Some(Compression::Lz4),
        _ => None,
    }
}

fn read_exact_or_corrupt(reader: &mut impl Read, buf: &mut [u8], what: &str) -> AppResult<()> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => DaqError::Corrupt(format!("truncated {what}")),
        _ => DaqError::Io(err),
    })
}

fn read_name(reader: &mut impl Read) -> AppResult<String> {
    let mut len = [0u8; 2];
    read_exact_or_corrupt(reader, &mut len, "header")?;
    let mut name = vec![0u8; u16::from_le_bytes(len) as usize];
    read_exact_or_corrupt(reader, &mut name, "header")?;
    String::from_utf8(name).map_err(|_| DaqError::Corrupt("dataset name is not UTF-8".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    ReadWrite,
    ReadOnly,
}

/// Open `.frm` file.
#[derive(Debug)]
pub(crate) struct FrmFile {
    path: PathBuf,
    file: Option<File>,
    mode: Mode,
    header: Header,
    /// Start offset of each committed row record.
    offsets: Vec<u64>,
    /// End of the last committed row record.
    end: u64,
}

impl FrmFile {
    /// Creates the file with `create_new`; an existing file is never touched.
    pub(crate) fn create(
        path: PathBuf,
        shape: FrameShape,
        dtype: Dtype,
        options: StoreOptions,
    ) -> AppResult<Self> {
        let header = Header {
            dtype,
            compression: options.compression,
            shape,
            rows: 0,
            group: options.group,
            dataset: options.dataset,
        };
        let encoded = header.encode()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| DaqError::StoreCreate {
                path: path.clone(),
                source,
            })?;
        if let Err(source) = file.write_all(&encoded).and_then(|_| file.flush()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(DaqError::StoreCreate { path, source });
        }

        info!(
            path = %path.display(),
            %shape,
            %dtype,
            compression = ?header.compression,
            ".frm store created"
        );
        Ok(Self {
            path,
            file: Some(file),
            mode: Mode::ReadWrite,
            header,
            offsets: Vec::new(),
            end: encoded.len() as u64,
        })
    }

    /// Opens read-only, walking the row record headers to index every committed row.
    pub(crate) fn open(path: PathBuf) -> AppResult<Self> {
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let (header, header_len) = Header::read_from(&mut file)?;

        let mut offsets = Vec::with_capacity(header.rows.min(1 << 20) as usize);
        let mut pos = header_len;
        for row in 0..header.rows {
            if pos + RECORD_HEADER_LEN > file_len {
                return Err(DaqError::Corrupt(format!(
                    "row {row} starts past end of file"
                )));
            }
            file.seek(SeekFrom::Start(pos))?;
            let mut len = [0u8; 4];
            read_exact_or_corrupt(&mut file, &mut len, "row record")?;
            let next = pos + RECORD_HEADER_LEN + u32::from_le_bytes(len) as u64;
            if next > file_len {
                return Err(DaqError::Corrupt(format!("row {row} is truncated")));
            }
            offsets.push(pos);
            pos = next;
        }

        debug!(path = %path.display(), rows = header.rows, ".frm store opened read-only");
        Ok(Self {
            path,
            file: Some(file),
            mode: Mode::ReadOnly,
            header,
            offsets,
            end: pos,
        })
    }

    pub(crate) fn append(&mut self, frame: &Frame) -> AppResult<u64> {
        if self.mode == Mode::ReadOnly {
            return Err(DaqError::ReadOnly);
        }
        let file = self.file.as_mut().ok_or(DaqError::StoreClosed)?;
        if frame.shape() != self.header.shape {
            return Err(DaqError::ShapeMismatch {
                expected: self.header.shape,
                actual: frame.shape(),
            });
        }
        if frame.dtype() != self.header.dtype {
            return Err(DaqError::DtypeMismatch {
                expected: self.header.dtype,
                actual: frame.dtype(),
            });
        }

        let raw = frame.pixels().to_le_bytes();
        let payload = match self.header.compression {
            Compression::Lz4 => lz4_flex::compress_prepend_size(&raw),
            _ => raw,
        };
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| DaqError::InvalidFrame("row exceeds 4 GiB".into()))?;

        let start = self.end;
        let committed = self.header.rows;
        if let Err(err) = write_row(file, start, &payload, committed + 1) {
            warn!(path = %self.path.display(), error = %err, "Append failed, rolling back");
            let _ = file.set_len(start);
            let _ = commit_rows(file, committed);
            return Err(err.into());
        }

        self.offsets.push(start);
        self.end = start + RECORD_HEADER_LEN + payload_len as u64;
        self.header.rows = committed + 1;
        debug!(index = committed, bytes = payload_len, "Frame appended");
        Ok(committed)
    }

    pub(crate) fn read(&mut self, index: u64) -> AppResult<Frame> {
        let file = self.file.as_mut().ok_or(DaqError::StoreClosed)?;
        let len = self.header.rows;
        if index >= len {
            return Err(DaqError::Index { index, len });
        }
        let offset = self.offsets[index as usize];
        file.seek(SeekFrom::Start(offset))?;
        let mut size = [0u8; 4];
        read_exact_or_corrupt(file, &mut size, "row record")?;
        let mut payload = vec![0u8; u32::from_le_bytes(size) as usize];
        read_exact_or_corrupt(file, &mut payload, "row payload")?;

        let raw = match self.header.compression {
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&payload)
                .map_err(|err| DaqError::Corrupt(format!("row {index}: {err}")))?,
            _ => payload,
        };
        if raw.len() != self.header.row_bytes() {
            return Err(DaqError::Corrupt(format!(
                "row {index} holds {} bytes, expected {}",
                raw.len(),
                self.header.row_bytes()
            )));
        }
        let pixels = PixelBuffer::from_le_bytes(self.header.dtype, &raw)
            .ok_or_else(|| DaqError::Corrupt(format!("row {index} has a partial sample")))?;
        Frame::new(self.header.shape, pixels)
    }

    pub(crate) fn close(&mut self) -> AppResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if self.mode == Mode::ReadWrite {
            file.flush()?;
            file.sync_all()?;
            info!(path = %self.path.display(), rows = self.header.rows, "Frame store closed");
        }
        Ok(())
    }

    pub(crate) fn discard(mut self) -> AppResult<()> {
        let _ = self.close();
        if self.mode == Mode::ReadWrite {
            fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "Frame store discarded");
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.header.rows
    }

    pub(crate) fn shape(&self) -> FrameShape {
        self.header.shape
    }

    pub(crate) fn dtype(&self) -> Dtype {
        self.header.dtype
    }

    pub(crate) fn compression(&self) -> Compression {
        self.header.compression
    }

    pub(crate) fn dataset_path(&self) -> String {
        format!("/{}/{}", self.header.group, self.header.dataset)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.mode == Mode::ReadWrite
    }
}

fn write_row(file: &mut File, start: u64, payload: &[u8], rows: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(start))?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(payload)?;
    commit_rows(file, rows)
}

fn commit_rows(file: &mut File, rows: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(ROWS_OFFSET))?;
    file.write_all(&rows.to_le_bytes())?;
    file.flush()
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create(dir: &TempDir, shape: FrameShape) -> FrmFile {
        FrmFile::create(dir.path().join("a.frm"), shape, Dtype::U8, StoreOptions::default())
            .unwrap()
    }

    #[test]
    fn test_failed_append_keeps_previous_rows() {
        let dir = TempDir::new().unwrap();
        let shape = FrameShape::new(4, 4);
        let mut store = create(&dir, shape);
        store.append(&Frame::filled_u8(shape, 1)).unwrap();
        let path = store.path().to_path_buf();
        let committed_end = store.end;
        let file_len = fs::metadata(&path).unwrap().len();

        // Swap in a handle that cannot be written through.
        let writable = store.file.replace(File::open(&path).unwrap()).unwrap();
        assert!(matches!(
            store.append(&Frame::filled_u8(shape, 2)),
            Err(DaqError::Io(_))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.offsets.len(), 1);
        assert_eq!(store.end, committed_end);
        assert_eq!(fs::metadata(&path).unwrap().len(), file_len);

        store.file = Some(writable);
        assert_eq!(store.append(&Frame::filled_u8(shape, 3)).unwrap(), 1);
        store.close().unwrap();

        let mut reader = FrmFile::open(path).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.read(1).unwrap(), Frame::filled_u8(shape, 3));
    }

    #[test]
    fn test_deflate_has_no_frm_code() {
        let dir = TempDir::new().unwrap();
        let err = FrmFile::create(
            dir.path().join("a.frm"),
            FrameShape::new(2, 2),
            Dtype::U8,
            StoreOptions::with_compression(Compression::Deflate),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(!dir.path().join("a.frm").exists());
    }
}
