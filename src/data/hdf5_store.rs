//! HDF5 frame store backend.
//!
//! The dataset lives at `/<group>/<dataset>` (default `/entry/image`) with shape
//! `(N, H, W)`. The first axis is unlimited and chunked one frame per chunk, so an append
//! resizes the dataset by one row and writes exactly one chunk. The root attribute
//! `frame_dataset` names the dataset so readers do not need the writer's options.

use super::frame_store::{Compression, StoreOptions};
use crate::core::{Dtype, Frame, FrameShape, PixelBuffer};
use crate::error::{AppResult, DaqError};
use hdf5::filters::Filter;
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group, H5Type};
use ndarray::{Array3, ArrayView3};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATASET_ATTR: &str = "frame_dataset";
const DEFLATE_LEVEL: u8 = 4;

/// Open HDF5 file holding one frame dataset.
#[derive(Debug)]
pub(crate) struct Hdf5File {
    path: PathBuf,
    file: Option<File>,
    dataset: Dataset,
    dataset_path: String,
    writable: bool,
    shape: FrameShape,
    dtype: Dtype,
    compression: Compression,
    rows: u64,
}

impl Hdf5File {
    /// Creates the file exclusively; an existing file is never touched.
    pub(crate) fn create(
        path: PathBuf,
        shape: FrameShape,
        dtype: Dtype,
        options: StoreOptions,
    ) -> AppResult<Self> {
        if options.compression == Compression::Lz4 {
            return Err(DaqError::Configuration(
                "lz4 compression needs the frm storage format, use deflate for hdf5".into(),
            ));
        }
        let file = File::create_excl(&path).map_err(|err| DaqError::StoreCreate {
            path: path.clone(),
            source: io::Error::other(err.to_string()),
        })?;

        let dataset = match layout(&file, shape, dtype, &options) {
            Ok(dataset) => dataset,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };

        info!(
            path = %path.display(),
            %shape,
            %dtype,
            compression = ?options.compression,
            "HDF5 store created"
        );
        Ok(Self {
            path,
            file: Some(file),
            dataset,
            dataset_path: format!("/{}/{}", options.group, options.dataset),
            writable: true,
            shape,
            dtype,
            compression: options.compression,
            rows: 0,
        })
    }

    pub(crate) fn open(path: PathBuf) -> AppResult<Self> {
        let file = File::open(&path)?;
        let dataset_path = file
            .attr(DATASET_ATTR)?
            .read_scalar::<VarLenUnicode>()?
            .as_str()
            .to_string();
        let dataset = file.dataset(&dataset_path)?;

        let dims = dataset.shape();
        let &[rows, height, width] = dims.as_slice() else {
            return Err(DaqError::Corrupt(format!(
                "{dataset_path} has {} dimensions, expected 3",
                dims.len()
            )));
        };
        let (Ok(height), Ok(width)) = (u32::try_from(height), u32::try_from(width)) else {
            return Err(DaqError::Corrupt(format!("{dataset_path} frame shape is too large")));
        };
        let dtype = dtype_of(&dataset)?;
        let compression = if dataset
            .filters()
            .iter()
            .any(|filter| matches!(filter, Filter::Deflate(_)))
        {
            Compression::Deflate
        } else {
            Compression::None
        };

        debug!(path = %path.display(), rows, "HDF5 store opened read-only");
        Ok(Self {
            path,
            file: Some(file),
            dataset,
            dataset_path,
            writable: false,
            shape: FrameShape::new(height, width),
            dtype,
            compression,
            rows: rows as u64,
        })
    }

    pub(crate) fn append(&mut self, frame: &Frame) -> AppResult<u64> {
        if !self.writable {
            return Err(DaqError::ReadOnly);
        }
        if self.file.is_none() {
            return Err(DaqError::StoreClosed);
        }
        if frame.shape() != self.shape {
            return Err(DaqError::ShapeMismatch {
                expected: self.shape,
                actual: frame.shape(),
            });
        }
        if frame.dtype() != self.dtype {
            return Err(DaqError::DtypeMismatch {
                expected: self.dtype,
                actual: frame.dtype(),
            });
        }

        let row = self.rows as usize;
        let (height, width) = (self.shape.height as usize, self.shape.width as usize);
        self.dataset.resize((row + 1, height, width))?;
        let written = match frame.pixels() {
            PixelBuffer::U8(data) => write_row(&self.dataset, row, height, width, data),
            PixelBuffer::U16(data) => write_row(&self.dataset, row, height, width, data),
            PixelBuffer::F64(data) => write_row(&self.dataset, row, height, width, data),
        };
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "Append failed, rolling back");
            if let Err(resize_err) = self.dataset.resize((row, height, width)) {
                warn!(error = %resize_err, "Could not shrink dataset after failed append");
            }
            return Err(err);
        }

        self.rows += 1;
        debug!(index = row, "Frame appended");
        Ok(row as u64)
    }

    pub(crate) fn read(&mut self, index: u64) -> AppResult<Frame> {
        if self.file.is_none() {
            return Err(DaqError::StoreClosed);
        }
        if index >= self.rows {
            return Err(DaqError::Index {
                index,
                len: self.rows,
            });
        }
        let row = index as usize;
        let pixels = match self.dtype {
            Dtype::U8 => PixelBuffer::U8(read_row(&self.dataset, row)?),
            Dtype::U16 => PixelBuffer::U16(read_row(&self.dataset, row)?),
            Dtype::F64 => PixelBuffer::F64(read_row(&self.dataset, row)?),
        };
        Frame::new(self.shape, pixels)
    }

    pub(crate) fn close(&mut self) -> AppResult<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if self.writable {
            file.flush()?;
            info!(path = %self.path.display(), rows = self.rows, "HDF5 store closed");
        }
        Ok(())
    }

    pub(crate) fn discard(mut self) -> AppResult<()> {
        let _ = self.close();
        if self.writable {
            fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "HDF5 store discarded");
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.rows
    }

    pub(crate) fn shape(&self) -> FrameShape {
        self.shape
    }

    pub(crate) fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub(crate) fn compression(&self) -> Compression {
        self.compression
    }

    pub(crate) fn dataset_path(&self) -> String {
        self.dataset_path.clone()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Creates the group, the resizable image dataset and the root attribute naming it.
fn layout(file: &File, shape: FrameShape, dtype: Dtype, options: &StoreOptions) -> AppResult<Dataset> {
    let group = file.create_group(&options.group)?;
    let dataset = match dtype {
        Dtype::U8 => new_image::<u8>(&group, &options.dataset, shape, options.compression)?,
        Dtype::U16 => new_image::<u16>(&group, &options.dataset, shape, options.compression)?,
        Dtype::F64 => new_image::<f64>(&group, &options.dataset, shape, options.compression)?,
    };

    let dataset_path = format!("/{}/{}", options.group, options.dataset);
    let name: VarLenUnicode = dataset_path.parse().map_err(|_| {
        DaqError::Configuration(format!("dataset path '{dataset_path}' is not valid HDF5 text"))
    })?;
    file.new_attr::<VarLenUnicode>()
        .create(DATASET_ATTR)?
        .write_scalar(&name)?;
    Ok(dataset)
}

fn new_image<T: H5Type>(
    group: &Group,
    name: &str,
    shape: FrameShape,
    compression: Compression,
) -> hdf5::Result<Dataset> {
    let (height, width) = (shape.height as usize, shape.width as usize);
    let builder = group
        .new_dataset::<T>()
        .shape((0.., height, width))
        .chunk((1, height, width));
    match compression {
        Compression::Deflate => builder.shuffle().deflate(DEFLATE_LEVEL).create(name),
        _ => builder.create(name),
    }
}

fn dtype_of(dataset: &Dataset) -> AppResult<Dtype> {
    let datatype = dataset.dtype()?;
    if datatype.is::<u8>() {
        Ok(Dtype::U8)
    } else if datatype.is::<u16>() {
        Ok(Dtype::U16)
    } else if datatype.is::<f64>() {
        Ok(Dtype::F64)
    } else {
        Err(DaqError::Corrupt("unsupported HDF5 sample type".into()))
    }
}

fn write_row<T: H5Type>(
    dataset: &Dataset,
    row: usize,
    height: usize,
    width: usize,
    data: &[T],
) -> AppResult<()> {
    let view = ArrayView3::from_shape((1, height, width), data)
        .map_err(|err| DaqError::InvalidFrame(err.to_string()))?;
    dataset.write_slice(view, hdf5::s![row..row + 1, .., ..])?;
    Ok(())
}

fn read_row<T: H5Type + Copy>(dataset: &Dataset, row: usize) -> AppResult<Vec<T>> {
    let rows: Array3<T> = dataset.read_slice(hdf5::s![row..row + 1, .., ..])?;
    Ok(rows.iter().copied().collect())
}
