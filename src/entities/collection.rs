//! Collections: ordered frame sequences backed by one or more files.
//!
//! **Why**: The viewer addresses frames by integer index only. A collection
//! maps that index to a cache key plus a decoder factory, so the cache can
//! deduplicate and the worker can decode without knowing the file layout.
//!
//! # Variants
//!
//! - `Single`: one still image file, one frame
//! - `Vpp`: multi-frame container, frames addressed by byte offset
//! - `Npy`: numeric array, frames addressed by slice
//! - `Multiple`: concatenation of children (prefix sums over lengths)
//! - `Masked`: another collection with one frame hidden
//! - `Edited`: sibling collections combined by an edit expression
//!
//! Indices are validated against `0..len()` on every access, never clamped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use super::edit::{EditDecoder, EditProgram};
use super::loader::{self, is_stream};
use super::npy::{self, NpyDecoder, NpyInfo};
use super::provider::{CacheKey, Decoder, FrameHandle, SharedProvider};
use super::traits::ProviderCache;
use super::vpp::{self, VppDecoder, VppInfo, VPP_TAG};
use crate::error::PipelineError;

/// Shared flag set when a source file changes on disk
pub type StaleFlag = Arc<AtomicBool>;

/// One source file of a collection, as registered with the file watcher
#[derive(Debug, Clone)]
pub struct CollectionSource {
    pub path: Arc<Path>,
    pub stale: StaleFlag,
}

/// Single still image
#[derive(Debug)]
pub struct SingleCollection {
    path: Arc<Path>,
    force_generic: bool,
    stale: StaleFlag,
}

/// VPP container; `info` is None when the header could not be read
#[derive(Debug)]
pub struct VppCollection {
    path: Arc<Path>,
    info: Option<VppInfo>,
    stale: StaleFlag,
}

/// NumPy array; `info` is None when the array could not be read
#[derive(Debug)]
pub struct NpyCollection {
    path: Arc<Path>,
    info: Option<NpyInfo>,
    stale: StaleFlag,
}

/// Concatenation of child collections
#[derive(Debug)]
pub struct MultipleCollection {
    children: Vec<Arc<Collection>>,
    /// `offsets[i]` is the first global index of child `i`; last entry is the total
    offsets: Vec<usize>,
}

/// Source collection with one frame removed
#[derive(Debug)]
pub struct MaskedCollection {
    inner: Arc<Collection>,
    hidden: usize,
}

/// Per-frame combination of sibling collections
#[derive(Debug)]
pub struct EditedCollection {
    inputs: Vec<Arc<Collection>>,
    program: EditProgram,
}

/// Closed set of collection kinds
#[derive(Debug)]
pub enum Collection {
    Single(SingleCollection),
    Vpp(VppCollection),
    Npy(NpyCollection),
    Multiple(MultipleCollection),
    Masked(MaskedCollection),
    Edited(EditedCollection),
}

impl Collection {
    pub fn single(path: &Path, force_generic: bool) -> Self {
        Collection::Single(SingleCollection {
            path: Arc::from(path),
            force_generic,
            stale: StaleFlag::default(),
        })
    }

    /// VPP container; a malformed header yields an empty collection
    pub fn vpp(path: &Path) -> Self {
        Collection::Vpp(VppCollection {
            path: Arc::from(path),
            info: vpp::probe_or_empty(path),
            stale: StaleFlag::default(),
        })
    }

    /// NumPy array; header problems are reported to the caller
    pub fn npy(path: &Path) -> Result<Self, PipelineError> {
        Ok(Self::npy_with(path, Some(npy::probe(path)?)))
    }

    /// NumPy array inside a larger sequence: an unreadable array has no frames
    pub fn npy_or_empty(path: &Path) -> Self {
        let info = npy::probe(path)
            .inspect_err(|e| warn!("{}; skipping its frames", e))
            .ok();
        Self::npy_with(path, info)
    }

    fn npy_with(path: &Path, info: Option<NpyInfo>) -> Self {
        Collection::Npy(NpyCollection {
            path: Arc::from(path),
            info,
            stale: StaleFlag::default(),
        })
    }

    pub fn multiple(children: Vec<Arc<Collection>>) -> Self {
        let mut offsets = Vec::with_capacity(children.len() + 1);
        let mut total = 0;
        offsets.push(0);
        for child in &children {
            total += child.len();
            offsets.push(total);
        }
        Collection::Multiple(MultipleCollection { children, offsets })
    }

    /// Hide frame `index` of `source`.
    ///
    /// Fails if the index is invalid or if it is the only frame left.
    pub fn masked(source: Arc<Collection>, index: usize) -> Result<Self, PipelineError> {
        source.check(index)?;
        if source.len() <= 1 {
            return Err(PipelineError::LastFrame);
        }
        Ok(Collection::Masked(MaskedCollection {
            inner: source,
            hidden: index,
        }))
    }

    /// Combine sibling collections frame by frame.
    ///
    /// Length is the shortest sibling's length.
    pub fn edited(inputs: Vec<Arc<Collection>>, program: EditProgram) -> Result<Self, PipelineError> {
        if inputs.is_empty() {
            return Err(PipelineError::Edit("no input sequence".into()));
        }
        if inputs.len() < program.inputs_required() {
            return Err(PipelineError::Edit(format!(
                "expression '{}' reads {} sequence(s), only {} given",
                program.source(),
                program.inputs_required(),
                inputs.len()
            )));
        }
        Ok(Collection::Edited(EditedCollection { inputs, program }))
    }

    pub fn len(&self) -> usize {
        match self {
            Collection::Single(_) => 1,
            Collection::Vpp(c) => c.info.map_or(0, |i| i.frames),
            Collection::Npy(c) => c.info.map_or(0, |i| i.layout.frames),
            Collection::Multiple(c) => c.offsets.last().copied().unwrap_or(0),
            Collection::Masked(c) => c.inner.len().saturating_sub(1),
            Collection::Edited(c) => c.inputs.iter().map(|i| i.len()).min().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, index: usize) -> Result<(), PipelineError> {
        let len = self.len();
        if index >= len {
            return Err(PipelineError::OutOfRange { index, len });
        }
        Ok(())
    }

    /// Request frame `index`; returns immediately, decoding happens on the worker
    pub fn frame(&self, index: usize, cache: &dyn ProviderCache) -> Result<FrameHandle, PipelineError> {
        self.check(index)?;
        Ok(FrameHandle::new(self.provider(index, cache)))
    }

    /// Resolve a validated index to its shared provider
    fn provider(&self, index: usize, cache: &dyn ProviderCache) -> SharedProvider {
        match self {
            Collection::Single(c) => {
                let path = c.path.to_path_buf();
                let force_generic = c.force_generic;
                cache.provider(
                    CacheKey::file(c.path.clone(), 0),
                    Box::new(move || Decoder::Sniff {
                        path,
                        force_generic,
                    }),
                )
            }
            Collection::Vpp(c) => {
                let path = c.path.clone();
                let info = c.info;
                cache.provider(
                    CacheKey::file(c.path.clone(), index),
                    Box::new(move || match info {
                        Some(info) => Decoder::Vpp(VppDecoder::new(&path, index, info.geometry)),
                        None => Decoder::Spent,
                    }),
                )
            }
            Collection::Npy(c) => {
                let path = c.path.clone();
                let info = c.info;
                cache.provider(
                    CacheKey::file(c.path.clone(), index),
                    Box::new(move || match info {
                        Some(info) => Decoder::Npy(NpyDecoder::new(&path, index, info)),
                        None => Decoder::Spent,
                    }),
                )
            }
            Collection::Multiple(c) => {
                let (child, local) = c.locate(index);
                c.children[child].provider(local, cache)
            }
            Collection::Masked(c) => c.inner.provider(c.source_index(index), cache),
            Collection::Edited(c) => {
                // Children first: the cache must not be re-entered from inside a factory
                let children: Vec<SharedProvider> =
                    c.inputs.iter().map(|i| i.provider(index, cache)).collect();
                let key = CacheKey::Edit {
                    program: c.program.source().clone(),
                    inputs: children.iter().map(|p| p.key().clone()).collect(),
                };
                let program = c.program.clone();
                cache.provider(
                    key,
                    Box::new(move || Decoder::Edit(EditDecoder::new(program, children))),
                )
            }
        }
    }

    /// Cache key of frame `index`
    pub fn key(&self, index: usize) -> Result<CacheKey, PipelineError> {
        self.check(index)?;
        Ok(self.key_unchecked(index))
    }

    fn key_unchecked(&self, index: usize) -> CacheKey {
        match self {
            Collection::Single(c) => CacheKey::file(c.path.clone(), 0),
            Collection::Vpp(VppCollection { path, .. }) | Collection::Npy(NpyCollection { path, .. }) => {
                CacheKey::file(path.clone(), index)
            }
            Collection::Multiple(c) => {
                let (child, local) = c.locate(index);
                c.children[child].key_unchecked(local)
            }
            Collection::Masked(c) => c.inner.key_unchecked(c.source_index(index)),
            Collection::Edited(c) => CacheKey::Edit {
                program: c.program.source().clone(),
                inputs: c.inputs.iter().map(|i| i.key_unchecked(index)).collect(),
            },
        }
    }

    /// Source file of frame `index` (first input's file for edits)
    pub fn filename(&self, index: usize) -> Result<Arc<Path>, PipelineError> {
        self.check(index)?;
        Ok(self.filename_unchecked(index))
    }

    fn filename_unchecked(&self, index: usize) -> Arc<Path> {
        match self {
            Collection::Single(c) => c.path.clone(),
            Collection::Vpp(c) => c.path.clone(),
            Collection::Npy(c) => c.path.clone(),
            Collection::Multiple(c) => {
                let (child, local) = c.locate(index);
                c.children[child].filename_unchecked(local)
            }
            Collection::Masked(c) => c.inner.filename_unchecked(c.source_index(index)),
            Collection::Edited(c) => c.inputs[0].filename_unchecked(index),
        }
    }

    /// Every source file this collection reads, with its staleness flag
    pub fn sources(&self) -> Vec<CollectionSource> {
        let mut out = Vec::new();
        self.collect_sources(&mut out);
        out
    }

    fn collect_sources(&self, out: &mut Vec<CollectionSource>) {
        match self {
            Collection::Single(SingleCollection { path, stale, .. })
            | Collection::Vpp(VppCollection { path, stale, .. })
            | Collection::Npy(NpyCollection { path, stale, .. }) => out.push(CollectionSource {
                path: path.clone(),
                stale: stale.clone(),
            }),
            Collection::Multiple(c) => c.children.iter().for_each(|ch| ch.collect_sources(out)),
            Collection::Masked(c) => c.inner.collect_sources(out),
            Collection::Edited(c) => c.inputs.iter().for_each(|i| i.collect_sources(out)),
        }
    }

    /// True once any source file changed since construction; rebuild to pick it up
    pub fn is_stale(&self) -> bool {
        self.sources().iter().any(|s| s.stale.load(Ordering::Acquire))
    }
}

impl MultipleCollection {
    /// (child, index inside child) for a validated global index
    fn locate(&self, index: usize) -> (usize, usize) {
        let child = self.offsets.partition_point(|&o| o <= index) - 1;
        (child, index - self.offsets[child])
    }
}

impl MaskedCollection {
    fn source_index(&self, index: usize) -> usize {
        if index >= self.hidden { index + 1 } else { index }
    }
}

/// Build a collection from resolved filenames.
///
/// One file: the leading tag picks VPP, NumPy or a single still image, and a
/// bad NumPy header is an error.
/// Several files: one child per file (NumPy by `.npy` suffix, still otherwise);
/// a bad NumPy file there contributes no frames.
pub fn build_from_filenames(paths: &[PathBuf], force_generic: bool) -> Result<Collection, PipelineError> {
    if let [path] = paths {
        return select_collection(path, force_generic);
    }

    let mut children = Vec::with_capacity(paths.len());
    for path in paths {
        let child = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("npy")) {
            Collection::npy_or_empty(path)
        } else {
            Collection::single(path, force_generic)
        };
        children.push(Arc::new(child));
    }
    debug!("Built concatenation of {} file(s)", children.len());
    Ok(Collection::multiple(children))
}

fn select_collection(path: &Path, force_generic: bool) -> Result<Collection, PipelineError> {
    if is_stream(path) {
        return Ok(Collection::single(path, force_generic));
    }
    match loader::read_tag(path) {
        Some(tag) if tag == VPP_TAG => Ok(Collection::vpp(path)),
        Some(tag) if tag == [0x93, b'N', b'U', b'M'] => Collection::npy(path),
        Some(_) => Ok(Collection::single(path, force_generic)),
        None => {
            warn!("{}: cannot read file tag", path.display());
            Ok(Collection::single(path, force_generic))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::npy::tests::write_npy;
    use crate::entities::provider::Provider;
    use crate::entities::traits::DecoderFactory;
    use crate::entities::vpp::tests::write_vpp;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Minimal dedup store: no worker, tests advance providers themselves
    #[derive(Default)]
    pub(crate) struct MapCache(Mutex<HashMap<CacheKey, SharedProvider>>);

    impl ProviderCache for MapCache {
        fn provider(&self, key: CacheKey, factory: DecoderFactory<'_>) -> SharedProvider {
            let mut map = self.0.lock().unwrap();
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Provider::new(key, factory())))
                .clone()
        }
    }

    fn finish(handle: &FrameHandle) -> Arc<crate::entities::Image> {
        while !handle.is_complete() {
            handle.provider().advance();
        }
        handle.image().expect("frame decoded")
    }

    #[test]
    fn test_vpp_header_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 4, 4, 1, 2, 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 + 2 * 4 * 4 * 4);

        let c = build_from_filenames(&[path], false).unwrap();
        assert!(matches!(c, Collection::Vpp(_)));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_malformed_vpp_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 0, 4, 1, 0, 0);
        let c = build_from_filenames(&[path], false).unwrap();
        assert_eq!(c.len(), 0);
        assert!(matches!(
            c.frame(0, &MapCache::default()),
            Err(PipelineError::OutOfRange { index: 0, len: 0 })
        ));
    }

    #[test]
    fn test_concatenation_routing() {
        let dir = tempdir().unwrap();
        let mut children = Vec::new();
        for (n, frames) in [3usize, 5, 2].into_iter().enumerate() {
            let path = dir.path().join(format!("c{}.vpp", n));
            write_vpp(&path, 1, 1, 1, frames, 0);
            children.push(Arc::new(Collection::vpp(&path)));
        }
        let c = Collection::multiple(children);
        assert_eq!(c.len(), 10);

        let expect = |i: usize| -> (String, usize) {
            match i {
                0..3 => ("c0.vpp".into(), i),
                3..8 => ("c1.vpp".into(), i - 3),
                _ => ("c2.vpp".into(), i - 8),
            }
        };
        for i in 0..10 {
            match c.key(i).unwrap() {
                CacheKey::File { path, frame } => {
                    let (name, local) = expect(i);
                    assert_eq!(path.file_name().unwrap().to_str().unwrap(), name);
                    assert_eq!(frame, local);
                }
                other => panic!("unexpected key {:?}", other),
            }
        }
        assert!(matches!(
            c.frame(10, &MapCache::default()),
            Err(PipelineError::OutOfRange { index: 10, len: 10 })
        ));
    }

    #[test]
    fn test_concatenation_skips_empty_children() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("e.vpp");
        let full = dir.path().join("f.vpp");
        write_vpp(&empty, 0, 1, 1, 0, 0);
        write_vpp(&full, 1, 1, 1, 2, 0);
        let c = Collection::multiple(vec![
            Arc::new(Collection::vpp(&empty)),
            Arc::new(Collection::vpp(&full)),
        ]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.key(0).unwrap(), CacheKey::file(full.as_path(), 0));
    }

    #[test]
    fn test_masked_remaps_indices() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 2, 2, 1, 5, 0);
        let source = Arc::new(build_from_filenames(&[path], false).unwrap());
        let masked = Collection::masked(source.clone(), 2).unwrap();
        assert_eq!(masked.len(), 4);

        let cache = MapCache::default();
        let a = masked.frame(2, &cache).unwrap();
        let b = source.frame(3, &cache).unwrap();
        assert!(Arc::ptr_eq(a.provider(), b.provider()));
        assert_eq!(finish(&a).pixels(), finish(&b).pixels());
        assert_eq!(finish(&a).pixels()[0], 3.0);

        assert_eq!(masked.key(1).unwrap(), source.key(1).unwrap());
        assert!(masked.frame(4, &cache).is_err());
    }

    #[test]
    fn test_mask_last_frame_rejected() {
        let c = Arc::new(Collection::single(Path::new("a.png"), false));
        assert!(matches!(Collection::masked(c.clone(), 0), Err(PipelineError::LastFrame)));
        assert!(matches!(
            Collection::masked(c, 1),
            Err(PipelineError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_npy_shapes_through_builder() {
        let dir = tempdir().unwrap();
        let gray = dir.path().join("g.npy");
        write_npy(&gray, &[10, 20], "<f4", false);
        let c = build_from_filenames(&[gray], false).unwrap();
        assert_eq!(c.len(), 1);
        let img = finish(&c.frame(0, &MapCache::default()).unwrap());
        assert_eq!((img.width(), img.height(), img.channels()), (20, 10, 1));

        let stack = dir.path().join("s.npy");
        write_npy(&stack, &[5, 20, 10, 3], "<f4", false);
        let c = build_from_filenames(&[stack], false).unwrap();
        assert_eq!(c.len(), 5);
        let img = finish(&c.frame(4, &MapCache::default()).unwrap());
        assert_eq!((img.width(), img.height(), img.channels()), (10, 20, 3));
    }

    #[test]
    fn test_multiple_files_use_suffix() {
        let dir = tempdir().unwrap();
        let arr = dir.path().join("a.npy");
        write_npy(&arr, &[3, 4, 4], "<f4", false);
        let png = dir.path().join("b.png");
        image::RgbImage::new(4, 4).save(&png).unwrap();

        let c = build_from_filenames(&[arr.clone(), png.clone()], false).unwrap();
        assert_eq!(c.len(), 4);
        assert_eq!(c.filename(2).unwrap().as_ref(), arr.as_path());
        assert_eq!(c.filename(3).unwrap().as_ref(), png.as_path());
    }

    #[test]
    fn test_bad_npy_in_sequence_contributes_no_frames() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("a.npy");
        let fortran = dir.path().join("b.npy");
        let missing = dir.path().join("c.npy");
        let png = dir.path().join("d.png");
        write_npy(&good, &[2, 4, 4], "<f4", false);
        write_npy(&fortran, &[4, 4], "<f4", true);
        image::RgbImage::new(4, 4).save(&png).unwrap();

        let c = build_from_filenames(&[good.clone(), fortran, missing, png.clone()], false).unwrap();
        assert_eq!(c.len(), 3);
        assert_eq!(c.filename(1).unwrap().as_ref(), good.as_path());
        assert_eq!(c.filename(2).unwrap().as_ref(), png.as_path());
        assert_eq!(c.sources().len(), 4);
    }

    #[test]
    fn test_fortran_npy_rejected_at_build() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.npy");
        write_npy(&path, &[4, 4], "<f4", true);
        assert!(matches!(
            build_from_filenames(&[path], false),
            Err(PipelineError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_edited_combines_siblings() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.vpp");
        let b = dir.path().join("b.vpp");
        write_vpp(&a, 2, 1, 1, 4, 0);
        write_vpp(&b, 2, 1, 1, 3, 0);
        let program = EditProgram::parse("x y + 10 *").unwrap();
        let c = Collection::edited(
            vec![Arc::new(Collection::vpp(&a)), Arc::new(Collection::vpp(&b))],
            program,
        )
        .unwrap();
        assert_eq!(c.len(), 3);

        let cache = MapCache::default();
        let handle = c.frame(2, &cache).unwrap();
        let img = finish(&handle);
        assert_eq!(img.pixels(), &[40.0, 40.0]);
        assert!(handle.key().depends_on(&a));
        assert!(handle.key().depends_on(&b));

        // Children are regular cache entries
        let child = Collection::vpp(&a).frame(2, &cache).unwrap();
        assert!(child.is_complete());
    }

    #[test]
    fn test_edited_failing_child() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("g.png");
        image::GrayImage::new(2, 2).save(&good).unwrap();
        let c = Collection::edited(
            vec![
                Arc::new(Collection::single(&good, false)),
                Arc::new(Collection::single(&dir.path().join("missing.png"), false)),
            ],
            EditProgram::parse("x y -").unwrap(),
        )
        .unwrap();
        let handle = c.frame(0, &MapCache::default()).unwrap();
        while !handle.is_complete() {
            handle.provider().advance();
        }
        assert!(matches!(handle.result(), Some(Err(msg)) if msg.contains("input 1")));
    }

    #[test]
    fn test_edited_needs_enough_inputs() {
        let c = Arc::new(Collection::single(Path::new("a.png"), false));
        assert!(matches!(
            Collection::edited(vec![c], EditProgram::parse("x y -").unwrap()),
            Err(PipelineError::Edit(_))
        ));
    }

    #[test]
    fn test_stale_flags_shared() {
        let a = Arc::new(Collection::single(Path::new("a.png"), false));
        let b = Arc::new(Collection::single(Path::new("b.png"), false));
        let c = Collection::multiple(vec![a.clone(), b]);
        assert!(!c.is_stale());
        let sources = c.sources();
        assert_eq!(sources.len(), 2);
        sources[0].stale.store(true, Ordering::Release);
        assert!(a.is_stale());
        assert!(c.is_stale());
    }
}
