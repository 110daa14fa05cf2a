//! NumPy `.npy` arrays as frame stacks.
//!
//! Only C-ordered little-endian `f4`/`f8` arrays are read. Axis roles are
//! guessed from the shape:
//! - 2-D `(h, w)`: one grayscale frame
//! - 3-D `(h, w, d)` when `d` is smaller than both other axes: one multi-channel frame
//! - 3-D otherwise `(n, h, w)`: a stack of grayscale frames
//! - 4-D `(n, h, w, d)`: a stack of multi-channel frames

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::info;

use super::image::Image;
use super::provider::Step;
use crate::error::PipelineError;

pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    pub fn word_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
        }
    }
}

/// Parsed array header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: DType,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first sample
    pub data_offset: u64,
}

/// Frame geometry derived from an array shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpyLayout {
    pub frames: usize,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl NpyLayout {
    pub fn from_shape(shape: &[usize]) -> Option<Self> {
        let layout = |frames, height, width, depth| NpyLayout {
            frames,
            width,
            height,
            depth,
        };
        match *shape {
            [h, w] => Some(layout(1, h, w, 1)),
            [h, w, d] if d < h && d < w => Some(layout(1, h, w, d)),
            [n, h, w] => Some(layout(n, h, w, 1)),
            [n, h, w, d] => Some(layout(n, h, w, d)),
            _ => None,
        }
    }

    /// Samples in one frame, None on overflow
    pub fn samples_per_frame(&self) -> Option<usize> {
        self.width.checked_mul(self.height)?.checked_mul(self.depth)
    }

    /// Bytes of sample data the whole array occupies, None on overflow
    pub fn data_bytes(&self, dtype: DType) -> Option<u64> {
        let frame = self.samples_per_frame()?.checked_mul(dtype.word_size())?;
        (frame as u64).checked_mul(self.frames as u64)
    }
}

/// Parse magic, version and header dict from the start of a file.
///
/// `bytes` must hold at least the whole header.
pub fn parse_header(bytes: &[u8]) -> Result<NpyHeader, String> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err("missing NUMPY magic".into());
    }
    let major = bytes[6];
    let (dict_start, dict_len) = match major {
        1 => (10, u16::from_le_bytes([bytes[8], bytes[9]]) as usize),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated header".into());
            }
            (12, u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize)
        }
        v => return Err(format!("unsupported format version {}", v)),
    };
    let dict = bytes
        .get(dict_start..dict_start + dict_len)
        .ok_or_else(|| "truncated header".to_string())?;
    let dict = std::str::from_utf8(dict).map_err(|_| "header is not text".to_string())?;

    let descr = dict_value(dict, "descr").ok_or("header has no 'descr'")?;
    let dtype = match descr.trim_matches(|c| c == '\'' || c == '"') {
        "<f4" | "=f4" => DType::F32,
        "<f8" | "=f8" => DType::F64,
        other => return Err(format!("unsupported dtype {}", other)),
    };

    let fortran_order = match dict_value(dict, "fortran_order").ok_or("header has no 'fortran_order'")? {
        "True" => true,
        "False" => false,
        other => return Err(format!("bad fortran_order value {}", other)),
    };

    let shape = dict_value(dict, "shape").ok_or("header has no 'shape'")?;
    let shape = shape
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("bad shape entry {}", s)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NpyHeader {
        dtype,
        fortran_order,
        shape,
        data_offset: (dict_start + dict_len) as u64,
    })
}

/// Raw text of the value following `'key':` in a Python dict literal
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let rest = dict[dict.find(&pattern)? + pattern.len()..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else if let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') {
        rest[1..].find(quote)? + 2
    } else {
        rest.find([',', '}']).unwrap_or(rest.len())
    };
    Some(rest[..end].trim())
}

/// Array facts needed to address individual frames
#[derive(Debug, Clone, Copy)]
pub struct NpyInfo {
    pub layout: NpyLayout,
    pub dtype: DType,
    pub data_offset: u64,
}

/// Open an array file and derive its frame layout.
///
/// Fortran-ordered arrays are rejected rather than misread.
pub fn probe(path: &Path) -> Result<NpyInfo, PipelineError> {
    let mut file = File::open(path).map_err(|e| PipelineError::io(path, &e))?;
    let size = file.metadata().map_err(|e| PipelineError::io(path, &e))?.len();
    let mut prefix = [0u8; 12];
    file.read_exact(&mut prefix)
        .map_err(|_| PipelineError::malformed(path, "file shorter than header"))?;
    let header_len = match prefix[6] {
        1 => 10 + u16::from_le_bytes([prefix[8], prefix[9]]) as usize,
        _ => 12 + u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize,
    };

    if header_len as u64 > size {
        return Err(PipelineError::malformed(
            path,
            format!("header of {} bytes is longer than the file", header_len),
        ));
    }

    let mut bytes = prefix.to_vec();
    if header_len > bytes.len() {
        let mut rest = vec![0u8; header_len - bytes.len()];
        file.read_exact(&mut rest)
            .map_err(|_| PipelineError::malformed(path, "truncated header"))?;
        bytes.extend_from_slice(&rest);
    }

    let header = parse_header(&bytes).map_err(|reason| PipelineError::malformed(path, reason))?;
    if header.fortran_order {
        return Err(PipelineError::malformed(
            path,
            "array stored in Fortran order is not supported",
        ));
    }
    let layout = NpyLayout::from_shape(&header.shape).ok_or_else(|| {
        PipelineError::malformed(path, format!("unsupported array rank {}", header.shape.len()))
    })?;

    let data_bytes = layout
        .data_bytes(header.dtype)
        .filter(|&b| usize::try_from(b).is_ok())
        .ok_or_else(|| PipelineError::malformed(path, format!("shape {:?} overflows", header.shape)))?;
    if header.data_offset.saturating_add(data_bytes) > size {
        return Err(PipelineError::malformed(
            path,
            format!(
                "shape {:?} needs {} bytes of data, file holds {}",
                header.shape,
                data_bytes,
                size.saturating_sub(header.data_offset)
            ),
        ));
    }

    info!(
        "opened numpy array {}, assuming size: (n={}, h={}, w={}, d={}), type={}",
        path.display(),
        layout.frames,
        layout.height,
        layout.width,
        layout.depth,
        header.dtype.name()
    );
    Ok(NpyInfo {
        layout,
        dtype: header.dtype,
        data_offset: header.data_offset,
    })
}

/// Reads one frame slice in a single step
pub struct NpyDecoder {
    path: PathBuf,
    index: usize,
    info: NpyInfo,
}

impl NpyDecoder {
    pub fn new(path: &Path, index: usize, info: NpyInfo) -> Self {
        Self {
            path: path.to_path_buf(),
            index,
            info,
        }
    }

    pub fn step(&mut self) -> Step {
        match self.read_frame() {
            Ok(img) => Step::Done(img),
            Err(e) => Step::Failed(e),
        }
    }

    fn read_frame(&self) -> Result<Image, String> {
        let NpyInfo {
            layout,
            dtype,
            data_offset,
        } = self.info;
        let word = dtype.word_size();
        let frame_bytes = layout
            .samples_per_frame()
            .and_then(|n| n.checked_mul(word))
            .ok_or_else(|| format!("frame {} size overflows", self.index))?;
        let offset = (frame_bytes as u64)
            .checked_mul(self.index as u64)
            .and_then(|b| b.checked_add(data_offset))
            .ok_or_else(|| format!("frame {} is outside any addressable file", self.index))?;

        let mut file = File::open(&self.path)
            .map_err(|e| format!("cannot open {}: {}", self.path.display(), e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| format!("cannot seek to frame {}: {}", self.index, e))?;

        let mut raw = vec![0u8; frame_bytes];
        file.read_exact(&mut raw)
            .map_err(|e| format!("short read in frame {}: {}", self.index, e))?;

        let pixels: Vec<f32> = match dtype {
            DType::F32 => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::F64 => raw
                .chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
                })
                .collect(),
        };
        Ok(Image::new(pixels, layout.width, layout.height, layout.depth))
    }
}
