//! VPP multi-frame container.
//!
//! Layout: 4-byte tag `VPP\0`, then width, height, depth as little-endian
//! `i32`, then frames of `width * height * depth` little-endian `f32`
//! samples, row-major and channel-interleaved, back to back.
//!
//! The decoder reads one row per step so a large frame shows progress.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::image::Image;
use super::provider::Step;
use crate::error::PipelineError;

pub const VPP_TAG: [u8; 4] = *b"VPP\0";
pub const VPP_HEADER_SIZE: u64 = 16;

/// Per-frame geometry shared by every frame of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VppGeometry {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl VppGeometry {
    /// Bytes per frame, None if the geometry overflows
    pub fn frame_bytes(&self) -> Option<u64> {
        [self.height, self.depth, 4]
            .into_iter()
            .try_fold(self.width as u64, |acc, n| acc.checked_mul(n as u64))
    }

    /// Whole frames that fit in a file of `file_size` bytes (trailing bytes ignored)
    pub fn frame_count(&self, file_size: u64) -> usize {
        match self.frame_bytes() {
            Some(frame) if frame > 0 && file_size >= VPP_HEADER_SIZE => {
                ((file_size - VPP_HEADER_SIZE) / frame) as usize
            }
            _ => 0,
        }
    }
}

/// Parse the 16-byte header
pub fn parse_header(path: &Path, bytes: &[u8; 16]) -> Result<VppGeometry, PipelineError> {
    if bytes[..4] != VPP_TAG {
        return Err(PipelineError::malformed(path, "missing VPP tag"));
    }
    let field = |at: usize| i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let (w, h, d) = (field(4), field(8), field(12));
    if w <= 0 || h <= 0 || d <= 0 {
        return Err(PipelineError::malformed(
            path,
            format!("invalid geometry {}x{}x{}", w, h, d),
        ));
    }
    Ok(VppGeometry {
        width: w as usize,
        height: h as usize,
        depth: d as usize,
    })
}

/// Header facts for one container file
#[derive(Debug, Clone, Copy)]
pub struct VppInfo {
    pub geometry: VppGeometry,
    pub frames: usize,
}

/// Read header and size of a container
pub fn probe(path: &Path) -> Result<VppInfo, PipelineError> {
    let mut file = File::open(path).map_err(|e| PipelineError::io(path, &e))?;
    let size = file.metadata().map_err(|e| PipelineError::io(path, &e))?.len();
    let mut header = [0u8; 16];
    file.read_exact(&mut header)
        .map_err(|_| PipelineError::malformed(path, "file shorter than header"))?;
    let geometry = parse_header(path, &header)?;

    // A frame must be addressable in memory and fit in the file
    let frame_bytes = geometry
        .frame_bytes()
        .filter(|&b| usize::try_from(b).is_ok())
        .ok_or_else(|| {
            PipelineError::malformed(
                path,
                format!(
                    "geometry {}x{}x{} overflows",
                    geometry.width, geometry.height, geometry.depth
                ),
            )
        })?;
    if frame_bytes > size - VPP_HEADER_SIZE {
        return Err(PipelineError::malformed(
            path,
            format!(
                "frame of {} bytes does not fit in {} bytes of data",
                frame_bytes,
                size - VPP_HEADER_SIZE
            ),
        ));
    }
    let frames = geometry.frame_count(size);
    info!(
        "{}: VPP container {}x{}x{}, {} frame(s)",
        path.display(),
        geometry.width,
        geometry.height,
        geometry.depth,
        frames
    );
    Ok(VppInfo { geometry, frames })
}

/// Like [`probe`], but a broken container simply has no frames
pub fn probe_or_empty(path: &Path) -> Option<VppInfo> {
    match probe(path) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

/// Row-by-row reader for one frame
pub struct VppDecoder {
    path: PathBuf,
    index: usize,
    geometry: VppGeometry,
    reader: Option<BufReader<File>>,
    row: usize,
    row_buf: Vec<u8>,
    pixels: Vec<f32>,
}

impl VppDecoder {
    pub fn new(path: &Path, index: usize, geometry: VppGeometry) -> Self {
        Self {
            path: path.to_path_buf(),
            index,
            geometry,
            reader: None,
            row: 0,
            row_buf: Vec::new(),
            pixels: Vec::new(),
        }
    }

    fn open(&mut self) -> Result<(), String> {
        let file = File::open(&self.path)
            .map_err(|e| format!("cannot open {}: {}", self.path.display(), e))?;
        let mut reader = BufReader::new(file);

        let g = self.geometry;
        let frame_bytes = g
            .frame_bytes()
            .filter(|&b| usize::try_from(b).is_ok())
            .ok_or_else(|| format!("geometry {}x{}x{} overflows", g.width, g.height, g.depth))?;
        let offset = frame_bytes
            .checked_mul(self.index as u64)
            .and_then(|b| b.checked_add(VPP_HEADER_SIZE))
            .ok_or_else(|| format!("frame {} is outside any addressable file", self.index))?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("cannot seek to frame {}: {}", self.index, e))?;

        // Both fit: they are bounded by frame_bytes
        self.row_buf = vec![0u8; g.width * g.depth * 4];
        self.pixels = Vec::with_capacity(g.width * g.height * g.depth);
        self.reader = Some(reader);
        Ok(())
    }

    pub fn step(&mut self) -> Step {
        if self.reader.is_none() {
            if let Err(e) = self.open() {
                return Step::Failed(e);
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return Step::Failed("reader not open".into());
        };

        if let Err(e) = reader.read_exact(&mut self.row_buf) {
            return Step::Failed(format!(
                "short read in frame {} at row {} of {}: {}",
                self.index, self.row, self.geometry.height, e
            ));
        }
        self.pixels.extend(
            self.row_buf
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        self.row += 1;

        let g = self.geometry;
        if self.row == g.height {
            self.reader = None;
            let pixels = std::mem::take(&mut self.pixels);
            Step::Done(Image::new(pixels, g.width, g.height, g.depth))
        } else {
            Step::Progress(self.row as f32 / g.height as f32)
        }
    }
}
