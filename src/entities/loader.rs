//! Still-image decoders and format sniffing
//!
//! Picks a decoder from the first four bytes of a file, never from its
//! extension. Supports different backends based on feature flags:
//! - Default: `image` crate (JPEG, PNG, TIFF, plus anything it can guess)
//! - Feature "raw": rawloader probe for camera raw files in TIFF containers
//! - Feature "openexr": openexr-rs as a broad fallback before the generic decoder

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::tiff::TiffDecoder;
use image::{DynamicImage, ImageReader};
use log::{debug, trace};

use super::image::Image;
use super::provider::{Decoder, Step};

/// Path that stands for standard input
pub const STDIN_MARKER: &str = "-";

/// Dedicated still decoders, plus the guess-the-format fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillFormat {
    Jpeg,
    Png,
    Tiff,
    Generic,
}

impl StillFormat {
    pub fn name(&self) -> &'static str {
        match self {
            StillFormat::Jpeg => "jpeg",
            StillFormat::Png => "png",
            StillFormat::Tiff => "tiff",
            StillFormat::Generic => "generic",
        }
    }
}

/// Container family recognized from a leading tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Jpeg,
    Png,
    /// `II` or `MM`: TIFF, or a camera raw in a TIFF container
    TiffFamily,
}

pub fn classify_tag(tag: &[u8; 4]) -> Option<TagKind> {
    if tag[..3] == [0xff, 0xd8, 0xff] {
        Some(TagKind::Jpeg)
    } else if &tag[1..4] == b"PNG" {
        Some(TagKind::Png)
    } else if &tag[..2] == b"II" || &tag[..2] == b"MM" {
        Some(TagKind::TiffFamily)
    } else {
        None
    }
}

pub fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == STDIN_MARKER
}

/// Read the first four bytes of a regular file.
///
/// None for stdin, FIFOs, unreadable or too-short files.
pub fn read_tag(path: &Path) -> Option<[u8; 4]> {
    if is_stdin(path) {
        return None;
    }
    let meta = fs::metadata(path).ok()?;
    if is_fifo(&meta) {
        return None;
    }
    let mut file = File::open(path).ok()?;
    let mut tag = [0u8; 4];
    file.read_exact(&mut tag).ok()?;
    Some(tag)
}

/// Stdin and named pipes can only be read once, so they skip sniffing
pub fn is_stream(path: &Path) -> bool {
    is_stdin(path) || fs::metadata(path).map(|m| is_fifo(&m)).unwrap_or(false)
}

#[cfg(unix)]
fn is_fifo(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &fs::Metadata) -> bool {
    false
}

/// Choose the decoder family for a still source.
///
/// First match wins: streams go generic, then JPEG/PNG/TIFF-family tags,
/// then the optional broad backend, then the generic decoder.
pub fn select_decoder(path: &Path, force_generic: bool) -> Decoder {
    let generic = || Decoder::Still(StillDecoder::new(path, StillFormat::Generic));

    if force_generic || is_stream(path) {
        trace!("{}: generic decoder (forced or stream)", path.display());
        return generic();
    }

    if let Some(kind) = read_tag(path).as_ref().and_then(classify_tag) {
        let decoder = match kind {
            TagKind::Jpeg => Decoder::Still(StillDecoder::new(path, StillFormat::Jpeg)),
            TagKind::Png => Decoder::Still(StillDecoder::new(path, StillFormat::Png)),
            TagKind::TiffFamily => tiff_family(path),
        };
        debug!("{}: {} decoder", path.display(), decoder.kind());
        return decoder;
    }

    if let Some(decoder) = broad_backend(path) {
        debug!("{}: {} decoder", path.display(), decoder.kind());
        return decoder;
    }

    debug!("{}: generic decoder", path.display());
    generic()
}

#[cfg(feature = "raw")]
fn tiff_family(path: &Path) -> Decoder {
    match rawloader::decode_file(path) {
        Ok(raw) => Decoder::Raw(RawDecoder { raw: Some(raw) }),
        Err(e) => {
            trace!("{}: not a camera raw ({}), using tiff", path.display(), e);
            Decoder::Still(StillDecoder::new(path, StillFormat::Tiff))
        }
    }
}

#[cfg(not(feature = "raw"))]
fn tiff_family(path: &Path) -> Decoder {
    Decoder::Still(StillDecoder::new(path, StillFormat::Tiff))
}

#[cfg(feature = "openexr")]
fn broad_backend(path: &Path) -> Option<Decoder> {
    use openexr::prelude::*;

    InputFile::new(path, 1)
        .ok()
        .map(|_| Decoder::Exr(ExrDecoder { path: path.to_path_buf() }))
}

#[cfg(not(feature = "openexr"))]
fn broad_backend(_path: &Path) -> Option<Decoder> {
    None
}

/// Whole-file decoder: completes in a single step
#[derive(Debug)]
pub struct StillDecoder {
    path: PathBuf,
    format: StillFormat,
}

impl StillDecoder {
    pub fn new(path: &Path, format: StillFormat) -> Self {
        Self {
            path: path.to_path_buf(),
            format,
        }
    }

    pub fn format(&self) -> StillFormat {
        self.format
    }

    pub fn step(&mut self) -> Step {
        match self.decode() {
            Ok(img) => Step::Done(img),
            Err(e) => Step::Failed(e),
        }
    }

    fn decode(&self) -> Result<Image, String> {
        debug!("Loading {} with {} decoder", self.path.display(), self.format.name());

        if is_stdin(&self.path) {
            let mut buf = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut buf)
                .map_err(|e| format!("cannot read standard input: {}", e))?;
            let img = image::load_from_memory(&buf).map_err(|e| e.to_string())?;
            return Ok(Image::from_dynamic(img));
        }

        let file = File::open(&self.path)
            .map_err(|e| format!("cannot open {}: {}", self.path.display(), e))?;
        let reader = BufReader::new(file);

        let img = match self.format {
            StillFormat::Jpeg => JpegDecoder::new(reader).and_then(DynamicImage::from_decoder),
            StillFormat::Png => PngDecoder::new(reader).and_then(DynamicImage::from_decoder),
            StillFormat::Tiff => TiffDecoder::new(reader).and_then(DynamicImage::from_decoder),
            StillFormat::Generic => ImageReader::new(reader)
                .with_guessed_format()
                .map_err(|e| format!("cannot read {}: {}", self.path.display(), e))?
                .decode(),
        }
        .map_err(|e| e.to_string())?;

        Ok(Image::from_dynamic(img))
    }
}

/// Camera raw, decoded during the probe and converted on the first step
#[cfg(feature = "raw")]
pub struct RawDecoder {
    raw: Option<rawloader::RawImage>,
}

#[cfg(feature = "raw")]
impl RawDecoder {
    pub fn step(&mut self) -> Step {
        let Some(raw) = self.raw.take() else {
            return Step::Failed("raw image already consumed".into());
        };
        let pixels: Vec<f32> = match raw.data {
            rawloader::RawImageData::Integer(data) => data.into_iter().map(f32::from).collect(),
            rawloader::RawImageData::Float(data) => data,
        };
        let channels = raw.cpp.max(1);
        if pixels.len() != raw.width * raw.height * channels {
            return Step::Failed(format!(
                "raw buffer size {} does not match {}x{}x{}",
                pixels.len(),
                raw.width,
                raw.height,
                channels
            ));
        }
        Step::Done(Image::new(pixels, raw.width, raw.height, channels))
    }
}

/// OpenEXR via the C++ library (full compression support)
#[cfg(feature = "openexr")]
pub struct ExrDecoder {
    path: PathBuf,
}

#[cfg(feature = "openexr")]
impl ExrDecoder {
    pub fn step(&mut self) -> Step {
        match self.load() {
            Ok(img) => Step::Done(img),
            Err(e) => Step::Failed(e),
        }
    }

    fn load(&self) -> Result<Image, String> {
        use openexr::prelude::*;

        debug!("Loading EXR with openexr-rs: {}", self.path.display());

        let file = InputFile::new(&self.path, 1).map_err(|e| e.to_string())?;
        let header = file.header();
        let data_window = *header.data_window::<[i32; 4]>();
        let width = (data_window[2] - data_window[0] + 1) as usize;
        let height = (data_window[3] - data_window[1] + 1) as usize;
        drop(header);

        let frame_rgba = Frame::new::<f32, _, _>(&["R", "G", "B", "A"], data_window)
            .map_err(|e| e.to_string())?;
        let (_file, mut frames) = file
            .into_reader(vec![frame_rgba])
            .map_err(|e| e.to_string())?
            .read_pixels(data_window[1], data_window[3])
            .map_err(|e| e.to_string())?;

        let pixels: Vec<f32> = frames.remove(0).into_vec();
        Ok(Image::new(pixels, width, height, 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    #[test]
    fn test_classify_tags() {
        assert_eq!(classify_tag(&[0xff, 0xd8, 0xff, 0xe0]), Some(TagKind::Jpeg));
        assert_eq!(classify_tag(&[0x89, b'P', b'N', b'G']), Some(TagKind::Png));
        assert_eq!(classify_tag(b"II*\0"), Some(TagKind::TiffFamily));
        assert_eq!(classify_tag(b"MM\0*"), Some(TagKind::TiffFamily));
        assert_eq!(classify_tag(b"GIF8"), None);
        assert_eq!(classify_tag(b"VPP\0"), None);
    }

    #[test]
    fn test_select_png_by_content_not_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("picture.jpg");
        RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();

        let decoder = select_decoder(&path, false);
        assert_eq!(decoder.kind(), "png");
    }

    #[test]
    fn test_force_generic_skips_sniffing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        RgbImage::new(2, 2).save(&path).unwrap();
        assert_eq!(select_decoder(&path, true).kind(), "generic");
    }

    #[test]
    fn test_unreadable_goes_generic() {
        let decoder = select_decoder(Path::new("/nonexistent/seqload/x.tif"), false);
        assert_eq!(decoder.kind(), "generic");
        assert_eq!(select_decoder(Path::new("-"), false).kind(), "generic");
    }

    #[cfg(not(feature = "raw"))]
    #[test]
    fn test_tiff_tag_selects_tiff() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"II*\0garbage").unwrap();
        assert_eq!(select_decoder(&path, false).kind(), "tiff");
    }

    #[test]
    fn test_png_decodes_in_one_step() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])).save(&path).unwrap();

        let mut decoder = select_decoder(&path, false);
        match decoder.step() {
            Step::Done(img) => {
                assert_eq!(img.resolution(), (4, 3));
                assert_eq!(img.channels(), 3);
                assert_eq!(img.pixel(0, 0), Some(&[10.0, 20.0, 30.0][..]));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_png_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"\x89PNG\r\n\x1a\nnot really").unwrap();

        let mut decoder = select_decoder(&path, false);
        assert_eq!(decoder.kind(), "png");
        assert!(matches!(decoder.step(), Step::Failed(_)));
    }
}
