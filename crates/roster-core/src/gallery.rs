//! The persistent face gallery.
//!
//! Source images named `{identity}_{YYYYMMDD_HHMMSS}.jpg` are the ground
//! truth. Each extraction strategy keeps a derived JSON cache next to them
//! (`gallery_cache_{kind}.json`), keyed by a fingerprint of the image set.
//! Any mutation deletes the caches instead of patching them; the next load
//! rebuilds from the images.

use crate::pipeline::{FaceError, FacePipeline};
use crate::quality::{QualityConfig, QualityGate};
use crate::types::{ExtractorKind, FeatureVector, UNKNOWN_IDENTITY};
use chrono::{Local, NaiveDateTime};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;
use thiserror::Error;

pub const CACHE_FORMAT_VERSION: u32 = 1;
const LOCK_FILE_NAME: &str = ".gallery.lock";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("gallery I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write image {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("gallery cache serialization: {0}")]
    Cache(#[from] serde_json::Error),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("poor image quality: {0}")]
    PoorImageQuality(String),
    #[error("identity '{0}' is already registered")]
    DuplicateIdentity(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What `register` does when the exact identity already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Last write wins; the entry keeps its gallery position.
    #[default]
    Replace,
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown duplicate policy '{other}' (expected replace or reject)")),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Replace => "replace",
            Self::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Faces whose shorter side is below this many pixels are ignored.
    pub min_face_size: u32,
    pub quality: QualityConfig,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            min_face_size: 50,
            quality: QualityConfig::default(),
            duplicate_policy: DuplicatePolicy::Replace,
        }
    }
}

/// One registered identity and its active vector.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: String,
    pub vector: FeatureVector,
    /// Source images that contributed, oldest first.
    pub sources: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct GalleryCache {
    version: u32,
    kind: ExtractorKind,
    signature: String,
    fingerprint: String,
    entries: Vec<CachedEntry>,
}

#[derive(Serialize, Deserialize)]
struct CachedEntry {
    identity: String,
    vector: Vec<f32>,
    sources: Vec<String>,
}

/// A gallery image found on disk.
#[derive(Debug, Clone)]
struct SourceImage {
    path: PathBuf,
    file_name: String,
    identity: String,
    stamp: String,
    len: u64,
    modified_nanos: u128,
}

/// Split a file stem into `(identity, timestamp)`.
///
/// Two trailing all-digit segments (`_YYYYMMDD_HHMMSS`) are both stripped;
/// a single trailing all-digit segment is stripped alone. Otherwise the
/// whole stem is the identity and the timestamp is empty.
pub fn split_source_stem(stem: &str) -> (&str, &str) {
    let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    if let Some((head, last)) = stem.rsplit_once('_') {
        if is_digits(last) {
            if let Some((name, date)) = head.rsplit_once('_') {
                if is_digits(date) {
                    return (name, &stem[name.len() + 1..]);
                }
            }
            return (head, last);
        }
    }
    (stem, "")
}

/// Trim and check an identity before it becomes part of a file name.
pub fn validate_identity(raw: &str) -> Result<String, RegistrationError> {
    let identity = raw.trim();
    if identity.is_empty() {
        return Err(RegistrationError::InvalidIdentity("identity must not be empty".into()));
    }
    if identity.contains(['/', '\\', '\0']) {
        return Err(RegistrationError::InvalidIdentity(format!(
            "'{}' contains a path separator or NUL",
            identity.escape_default()
        )));
    }
    if identity.starts_with('.') {
        return Err(RegistrationError::InvalidIdentity(format!("'{identity}' must not start with '.'")));
    }
    if identity.eq_ignore_ascii_case(UNKNOWN_IDENTITY) {
        return Err(RegistrationError::InvalidIdentity(format!("'{identity}' is reserved")));
    }
    Ok(identity.to_string())
}

pub fn cache_file_name(kind: ExtractorKind) -> String {
    format!("gallery_cache_{kind}.json")
}

/// Exclusive advisory `flock` on the gallery directory, released on drop.
struct GalleryLock {
    file: File,
}

impl GalleryLock {
    fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(StorageError::io(&path, io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for GalleryLock {
    fn drop(&mut self) {
        // SAFETY: as in `acquire`; closing the file would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Owns a gallery directory and the pipeline that produces its vectors.
pub struct GalleryStore {
    dir: PathBuf,
    pipeline: FacePipeline,
    quality: QualityGate,
    duplicate_policy: DuplicatePolicy,
    entries: Vec<GalleryEntry>,
}

impl GalleryStore {
    /// Open (creating if needed) the gallery directory. Entries stay empty
    /// until [`load`](Self::load).
    pub fn open(dir: impl Into<PathBuf>, pipeline: FacePipeline, config: &GalleryConfig) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        Ok(Self {
            dir,
            pipeline,
            quality: QualityGate::new(config.quality.clone()),
            duplicate_policy: config.duplicate_policy,
            entries: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> ExtractorKind {
        self.pipeline.kind()
    }

    pub fn pipeline(&self) -> &FacePipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut FacePipeline {
        &mut self.pipeline
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(cache_file_name(self.kind()))
    }

    /// Entries in gallery order.
    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.identity.clone()).collect()
    }

    pub fn get(&self, identity: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the in-memory gallery from the cache when it matches the
    /// current image set and strategy, otherwise by re-extracting every
    /// source image and writing a fresh cache.
    ///
    /// A failed cache write is logged, not returned: the cache only saves time.
    pub fn load(&mut self) -> Result<&[GalleryEntry], StorageError> {
        let sources = scan_sources(&self.dir)?;
        let fingerprint = fingerprint(&sources);

        match self.read_cache(&fingerprint) {
            Some(entries) => {
                tracing::info!(count = entries.len(), kind = %self.kind(), "gallery loaded from cache");
                self.entries = entries;
            }
            None => {
                self.entries = self.build_entries(&sources);
                tracing::info!(
                    count = self.entries.len(),
                    images = sources.len(),
                    kind = %self.kind(),
                    "gallery rebuilt from source images"
                );
                if let Err(e) = self.write_cache(&fingerprint) {
                    tracing::warn!(error = %e, "failed to write gallery cache");
                }
            }
        }

        Ok(self.entries.as_slice())
    }

    /// Drop the cache and load from the source images.
    pub fn rebuild(&mut self) -> Result<&[GalleryEntry], StorageError> {
        {
            let _lock = GalleryLock::acquire(&self.dir)?;
            self.invalidate_cache()?;
        }
        self.load()
    }

    /// Register `image` under `identity`, stamped with the current local time.
    pub fn register(&mut self, identity: &str, image: &DynamicImage) -> Result<GalleryEntry, RegistrationError> {
        self.register_at(identity, image, Local::now().naive_local())
    }

    /// Register with an explicit timestamp for the source file name.
    ///
    /// Checks run in order: identity, duplicates, quality, exactly one face.
    /// The image write and cache invalidation happen under the gallery lock;
    /// if invalidation fails the new image is removed again and nothing in
    /// memory changes.
    pub fn register_at(
        &mut self,
        identity: &str,
        image: &DynamicImage,
        at: NaiveDateTime,
    ) -> Result<GalleryEntry, RegistrationError> {
        let identity = validate_identity(identity)?;
        self.check_duplicate(&identity)?;

        let gray = image.to_luma8();
        let report = self.quality.assess(&gray);
        if let Some(reason) = report.rejection {
            tracing::info!(identity = %identity, %reason, "registration rejected on quality");
            return Err(RegistrationError::PoorImageQuality(reason));
        }

        let (region, vector) = self.pipeline.extract_single(&gray)?;

        let file_name = format!("{identity}_{}.jpg", at.format(TIMESTAMP_FORMAT));
        let path = self.dir.join(&file_name);
        {
            let _lock = GalleryLock::acquire(&self.dir)?;
            write_image_atomically(image, &path)?;
            if let Err(e) = self.invalidate_cache() {
                if let Err(cleanup) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %cleanup, "failed to roll back gallery image");
                }
                return Err(e.into());
            }
        }

        let entry = match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(existing) => {
                existing.vector = vector;
                if !existing.sources.contains(&path) {
                    existing.sources.push(path);
                }
                existing.clone()
            }
            None => {
                let entry = GalleryEntry {
                    identity,
                    vector,
                    sources: vec![path],
                };
                self.entries.push(entry.clone());
                entry
            }
        };

        tracing::info!(
            identity = %entry.identity,
            file = %file_name,
            face_confidence = region.confidence,
            "registered face"
        );
        Ok(entry)
    }

    /// Remove every source image of `identity` and its entry. Returns how
    /// many files were deleted; an unknown identity deletes nothing.
    ///
    /// Matches on the identity parsed from each file name, so `alice` never
    /// touches `alice_smith_…` images.
    pub fn delete(&mut self, identity: &str) -> Result<usize, StorageError> {
        let identity = identity.trim();
        let _lock = GalleryLock::acquire(&self.dir)?;

        let doomed: Vec<SourceImage> = scan_sources(&self.dir)?
            .into_iter()
            .filter(|s| s.identity == identity)
            .collect();
        let in_memory = self.entries.iter().any(|e| e.identity == identity);

        if doomed.is_empty() && !in_memory {
            tracing::debug!(identity, "delete: identity not registered");
            return Ok(0);
        }

        self.invalidate_cache()?;

        let paths: Vec<&Path> = doomed.iter().map(|s| s.path.as_path()).collect();
        let (removed, first_error) = remove_files(&paths);

        // Once any image is gone the entry no longer matches the disk; a
        // later load rebuilds it from whatever survived.
        if removed > 0 || first_error.is_none() {
            self.entries.retain(|e| e.identity != identity);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!(identity, files = removed, "deleted identity");
        Ok(removed)
    }

    fn check_duplicate(&self, identity: &str) -> Result<(), RegistrationError> {
        let folded = identity.to_lowercase();
        for entry in &self.entries {
            if entry.identity == identity {
                if self.duplicate_policy == DuplicatePolicy::Reject {
                    return Err(RegistrationError::DuplicateIdentity(identity.to_string()));
                }
                tracing::debug!(identity, "re-registering existing identity");
            } else if entry.identity.to_lowercase() == folded {
                return Err(RegistrationError::DuplicateIdentity(entry.identity.clone()));
            }
        }
        Ok(())
    }

    /// Delete the caches of every strategy; a missing cache is fine.
    fn invalidate_cache(&self) -> Result<(), StorageError> {
        for kind in [ExtractorKind::Embedding, ExtractorKind::Pixel] {
            let path = self.dir.join(cache_file_name(kind));
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "invalidated gallery cache"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }
        Ok(())
    }

    fn read_cache(&self, fingerprint: &str) -> Option<Vec<GalleryEntry>> {
        let path = self.cache_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no gallery cache");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable gallery cache");
                return None;
            }
        };

        let cache: GalleryCache = match serde_json::from_slice(&raw) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt gallery cache, rebuilding");
                return None;
            }
        };

        let kind = self.kind();
        if cache.version != CACHE_FORMAT_VERSION
            || cache.kind != kind
            || cache.signature != self.pipeline.signature()
        {
            tracing::warn!(
                version = cache.version,
                signature = %cache.signature,
                "gallery cache built by a different strategy, rebuilding"
            );
            return None;
        }
        if cache.fingerprint != fingerprint {
            tracing::info!("gallery images changed since cache was written, rebuilding");
            return None;
        }

        Some(
            cache
                .entries
                .into_iter()
                .map(|e| GalleryEntry {
                    identity: e.identity,
                    vector: FeatureVector::new(kind, e.vector),
                    sources: e.sources.iter().map(|name| self.dir.join(name)).collect(),
                })
                .collect(),
        )
    }

    fn write_cache(&self, fingerprint: &str) -> Result<(), StorageError> {
        let cache = GalleryCache {
            version: CACHE_FORMAT_VERSION,
            kind: self.kind(),
            signature: self.pipeline.signature(),
            fingerprint: fingerprint.to_string(),
            entries: self
                .entries
                .iter()
                .map(|e| CachedEntry {
                    identity: e.identity.clone(),
                    vector: e.vector.values.clone(),
                    sources: e
                        .sources
                        .iter()
                        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .collect(),
                })
                .collect(),
        };

        let path = self.cache_path();
        let tmp = self.dir.join(format!(".{}.partial", cache_file_name(self.kind())));
        fs::write(&tmp, serde_json::to_vec(&cache)?).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;

        tracing::debug!(path = %path.display(), entries = cache.entries.len(), "wrote gallery cache");
        Ok(())
    }

    /// Extract every source image in timestamp order. The newest image of an
    /// identity supplies its vector; the oldest fixes its position.
    fn build_entries(&mut self, sources: &[SourceImage]) -> Vec<GalleryEntry> {
        let mut ordered: Vec<&SourceImage> = sources.iter().collect();
        ordered.sort_by(|a, b| a.stamp.cmp(&b.stamp).then_with(|| a.file_name.cmp(&b.file_name)));

        let mut entries: Vec<GalleryEntry> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for source in ordered {
            let gray = match image::open(&source.path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    tracing::warn!(file = %source.file_name, error = %e, "skipping unreadable gallery image");
                    continue;
                }
            };

            let vector = match self.pipeline.extract_primary(&gray) {
                Ok((_, vector)) => vector,
                Err(e) => {
                    tracing::warn!(file = %source.file_name, error = %e, "skipping gallery image without a usable face");
                    continue;
                }
            };

            tracing::debug!(identity = %source.identity, file = %source.file_name, "extracted gallery vector");
            match positions.get(&source.identity) {
                Some(&idx) => {
                    entries[idx].vector = vector;
                    entries[idx].sources.push(source.path.clone());
                }
                None => {
                    positions.insert(source.identity.clone(), entries.len());
                    entries.push(GalleryEntry {
                        identity: source.identity.clone(),
                        vector,
                        sources: vec![source.path.clone()],
                    });
                }
            }
        }

        entries
    }
}

/// List the gallery images in `dir`. Hidden files (lock, partial writes) and
/// names that yield no identity are skipped.
/// Remove every path, carrying on past failures. Returns how many were
/// removed and the first error.
fn remove_files(paths: &[&Path]) -> (usize, Option<StorageError>) {
    let mut removed = 0;
    let mut first_error = None;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete gallery image");
                first_error.get_or_insert(StorageError::io(path, e));
            }
        }
    }
    (removed, first_error)
}

fn scan_sources(dir: &Path) -> Result<Vec<SourceImage>, StorageError> {
    let mut sources = Vec::new();

    for dirent in fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))? {
        let dirent = dirent.map_err(|e| StorageError::io(dir, e))?;
        let path = dirent.path();

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)));
        if !is_image {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let (identity, stamp) = split_source_stem(stem);
        if identity.is_empty() {
            tracing::warn!(file = %file_name, "gallery image name has no identity, skipping");
            continue;
        }

        let metadata = dirent.metadata().map_err(|e| StorageError::io(&path, e))?;
        if !metadata.is_file() {
            continue;
        }
        let modified_nanos = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());

        sources.push(SourceImage {
            identity: identity.to_string(),
            stamp: stamp.to_string(),
            len: metadata.len(),
            modified_nanos,
            file_name,
            path,
        });
    }

    Ok(sources)
}

/// SHA-256 over the sorted `(name, length, mtime)` of every source image.
fn fingerprint(sources: &[SourceImage]) -> String {
    let mut keyed: Vec<&SourceImage> = sources.iter().collect();
    keyed.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let mut hasher = Sha256::new();
    for source in keyed {
        hasher.update(source.file_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.len.to_le_bytes());
        hasher.update(source.modified_nanos.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Encode as JPEG to a hidden partial file, then rename into place.
fn write_image_atomically(image: &DynamicImage, path: &Path) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.partial"));

    // JPEG has no alpha channel or 16-bit depth.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    if let Err(source) = rgb.save_with_format(&tmp, ImageFormat::Jpeg) {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::Encode { path: tmp, source });
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FullFrameDetector;
    use crate::pixel::PixelExtractor;
    use crate::testing::textured_image;
    use chrono::NaiveDate;
    use image::{GrayImage, Luma, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn pixel_pipeline() -> FacePipeline {
        FacePipeline::new(Box::new(FullFrameDetector), Box::new(PixelExtractor::new(16)), 50)
    }

    fn open_store(dir: &TempDir, policy: DuplicatePolicy) -> GalleryStore {
        let config = GalleryConfig {
            duplicate_policy: policy,
            ..Default::default()
        };
        GalleryStore::open(dir.path(), pixel_pipeline(), &config).unwrap()
    }

    fn face(seed: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(textured_image(64, 64, seed))
    }

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    /// Drop an image into the gallery directory the way an older install would have.
    fn place(dir: &TempDir, name: &str, seed: u32) {
        textured_image(64, 64, seed).save(dir.path().join(name)).unwrap();
    }

    #[test]
    fn test_split_source_stem() {
        assert_eq!(split_source_stem("alice_20240315_090000"), ("alice", "20240315_090000"));
        assert_eq!(split_source_stem("mary_jane_20240315_090000"), ("mary_jane", "20240315_090000"));
        assert_eq!(split_source_stem("bob_1710493200"), ("bob", "1710493200"));
        assert_eq!(split_source_stem("carol"), ("carol", ""));
        assert_eq!(split_source_stem("dan_smith"), ("dan_smith", ""));
        assert_eq!(split_source_stem("eve_v2_20240315"), ("eve_v2", "20240315"));
    }

    #[test]
    fn test_validate_identity() {
        assert_eq!(validate_identity("  Alice ").unwrap(), "Alice");
        for bad in ["", "   ", "a/b", "a\\b", "nul\0", "Unknown", "unknown", ".hidden"] {
            assert!(
                matches!(validate_identity(bad), Err(RegistrationError::InvalidIdentity(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_register_persists_and_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();
        assert!(store.cache_path().exists());

        let entry = store.register_at("Alice", &face(1), at(9, 0, 0)).unwrap();

        assert_eq!(entry.identity, "Alice");
        assert!(dir.path().join("Alice_20240315_090000.jpg").exists());
        assert!(!store.cache_path().exists());
        assert_eq!(store.identities(), vec!["Alice"]);
    }

    #[test]
    fn test_register_rejects_case_insensitive_collision() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.register_at("Alice", &face(1), at(9, 0, 0)).unwrap();

        let err = store.register_at("alice", &face(2), at(9, 1, 0)).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateIdentity(ref name) if name == "Alice"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_policy_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        let first = store.register_at("Alice", &face(1), at(9, 0, 0)).unwrap();
        store.register_at("Bob", &face(2), at(9, 1, 0)).unwrap();
        let second = store.register_at("Alice", &face(3), at(9, 2, 0)).unwrap();

        assert_ne!(first.vector, second.vector);
        assert_eq!(store.identities(), vec!["Alice", "Bob"]);
        assert_eq!(store.get("Alice").unwrap().vector, second.vector);
        assert_eq!(store.get("Alice").unwrap().sources.len(), 2);
    }

    #[test]
    fn test_reject_policy_refuses_exact_duplicate() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Reject);
        store.register_at("Alice", &face(1), at(9, 0, 0)).unwrap();

        let err = store.register_at("Alice", &face(2), at(9, 1, 0)).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateIdentity(_)));
        assert!(!dir.path().join("Alice_20240315_090100.jpg").exists());
    }

    #[test]
    fn test_poor_quality_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([128])));

        let err = store.register_at("Alice", &flat, at(9, 0, 0)).unwrap_err();
        assert!(matches!(err, RegistrationError::PoorImageQuality(ref r) if r.starts_with("too blurry")));
        assert!(store.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_face_too_small_for_full_frame() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        let tiny = DynamicImage::ImageLuma8(textured_image(40, 40, 1));

        let err = store.register_at("Alice", &tiny, at(9, 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Face(FaceError::FaceTooSmall { min_face_size: 50 })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_register_rgba_image() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        let gray = textured_image(64, 64, 9);
        let rgba = RgbaImage::from_fn(64, 64, |x, y| {
            let v = gray.get_pixel(x, y)[0];
            Rgba([v, v, v, 200])
        });

        store
            .register_at("Alice", &DynamicImage::ImageRgba8(rgba), at(9, 0, 0))
            .unwrap();
        assert!(image::open(dir.path().join("Alice_20240315_090000.jpg")).is_ok());
    }

    #[test]
    fn test_load_twice_is_lossless() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        place(&dir, "bob_20240315_091500.png", 2);

        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        let rebuilt = store.load().unwrap().to_vec();
        assert!(store.cache_path().exists());

        let mut reopened = open_store(&dir, DuplicatePolicy::Replace);
        let cached = reopened.load().unwrap().to_vec();

        assert_eq!(rebuilt, cached);
        assert_eq!(reopened.identities(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_new_image_makes_cache_stale() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();

        place(&dir, "bob_20240315_091500.png", 2);
        store.load().unwrap();
        assert_eq!(store.identities(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_corrupt_cache_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        fs::write(store.cache_path(), b"{not json").unwrap();

        store.load().unwrap();
        assert_eq!(store.identities(), vec!["alice"]);
        let raw = fs::read(store.cache_path()).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_ok());
    }

    #[test]
    fn test_cache_from_other_strategy_ignored() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();

        let config = GalleryConfig::default();
        let wider = FacePipeline::new(Box::new(FullFrameDetector), Box::new(PixelExtractor::new(24)), 50);
        let mut other = GalleryStore::open(dir.path(), wider, &config).unwrap();
        other.load().unwrap();
        assert_eq!(other.get("alice").unwrap().vector.len(), 24 * 24);
    }

    #[test]
    fn test_newest_image_wins_oldest_sets_position() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240101_080000.png", 1);
        place(&dir, "bob_20240201_080000.png", 2);
        place(&dir, "alice_20240301_080000.png", 3);

        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();
        assert_eq!(store.identities(), vec!["alice", "bob"]);

        let mut reference = pixel_pipeline();
        let (_, newest) = reference.extract_primary(&textured_image(64, 64, 3)).unwrap();
        assert_eq!(store.get("alice").unwrap().vector, newest);
        assert_eq!(store.get("alice").unwrap().sources.len(), 2);
    }

    #[test]
    fn test_skips_unreadable_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        fs::write(dir.path().join("broken_20240315_090000.jpg"), b"not an image").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        place(&dir, ".hidden_20240315_090000.png", 2);

        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();
        assert_eq!(store.identities(), vec!["alice"]);
    }

    #[test]
    fn test_delete_matches_parsed_identity() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        place(&dir, "alice_20240316_090000.png", 2);
        place(&dir, "alice_smith_20240315_090000.png", 3);

        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();
        assert!(store.cache_path().exists());

        assert_eq!(store.delete("alice").unwrap(), 2);
        assert!(!store.cache_path().exists());
        assert_eq!(store.identities(), vec!["alice_smith"]);
        assert!(dir.path().join("alice_smith_20240315_090000.png").exists());

        store.load().unwrap();
        assert_eq!(store.identities(), vec!["alice_smith"]);
    }

    #[test]
    fn test_remove_files_continues_past_failure() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("alice_20240315_090000.png");
        let blocked = dir.path().join("alice_20240316_090000.png");
        let last = dir.path().join("alice_20240317_090000.png");
        fs::write(&first, b"x").unwrap();
        fs::create_dir(&blocked).unwrap();
        fs::write(&last, b"x").unwrap();

        let (removed, error) = remove_files(&[first.as_path(), blocked.as_path(), last.as_path()]);
        assert_eq!(removed, 2);
        assert!(matches!(error, Some(StorageError::Io { ref path, .. }) if *path == blocked));
        assert!(!first.exists());
        assert!(!last.exists());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();
        assert_eq!(store.delete("nobody").unwrap(), 0);
        assert!(store.cache_path().exists());
    }

    #[test]
    fn test_rebuild_ignores_valid_cache() {
        let dir = TempDir::new().unwrap();
        place(&dir, "alice_20240315_090000.png", 1);
        let mut store = open_store(&dir, DuplicatePolicy::Replace);
        store.load().unwrap();

        let entries = store.rebuild().unwrap().to_vec();
        assert_eq!(entries.len(), 1);
        assert!(store.cache_path().exists());
    }

    #[test]
    fn test_duplicate_policy_parsing() {
        assert_eq!("Reject".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Reject);
        assert!("merge".parse::<DuplicatePolicy>().is_err());
    }
}
