//! Disk-backed segment cache.
//!
//! Tile results are spilled here instead of being held in working memory;
//! the pipeline keeps only keys once a tile is written. Entries carry no
//! content addressing; staleness is handled purely by lifecycle discipline
//! (`clear_all` before every run).

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::ProcessError;
use crate::raster::{PixelLayout, RasterImage};

const SEGMENT_MAGIC: &[u8; 4] = b"RSG1";
const SEGMENT_EXT: &str = "seg";

/// Opaque, globally-unique lookup key. Generated fresh per tile result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key→raster store backed by a directory of raw segment files.
///
/// Writes are synchronous: a tile's entry is durable before the pipeline
/// reports that tile's progress. The encoding is a fixed header plus the
/// raw pixel bytes, so round-trips are bit-for-bit.
pub struct SegmentCache {
    dir: PathBuf,
}

impl SegmentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, image: &RasterImage, key: &CacheKey) -> Result<(), ProcessError> {
        let path = self.entry_path(key);
        let mut file = fs::File::create(&path)?;
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&image.width().to_le_bytes())?;
        file.write_all(&image.height().to_le_bytes())?;
        file.write_all(&[layout_tag(image.layout())])?;
        file.write_all(image.data())?;
        file.flush()?;
        debug!(key = %key, width = image.width(), height = image.height(), "wrote segment to cache");
        Ok(())
    }

    /// Read an entry back, or `None` if no entry exists for the key.
    pub fn read(&self, key: &CacheKey) -> Result<Option<RasterImage>, ProcessError> {
        let path = self.entry_path(key);
        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut header = [0u8; 13];
        file.read_exact(&mut header)?;
        if &header[..4] != SEGMENT_MAGIC {
            return Err(ProcessError::Raster(format!(
                "segment '{key}' has an invalid header"
            )));
        }
        let width = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let height = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let layout = layout_from_tag(header[12])
            .ok_or_else(|| ProcessError::Raster(format!("segment '{key}' has an unknown layout")))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        debug!(key = %key, width, height, "read segment from cache");
        Ok(Some(RasterImage::new(data, width, height, layout)?))
    }

    /// Remove every entry. Called before each run, so a new run (or a model
    /// switch) can never observe a previous run's tiles.
    pub fn clear_all(&self) -> Result<(), ProcessError> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_segment = path
                .extension()
                .map(|ext| ext == SEGMENT_EXT)
                .unwrap_or(false);
            if is_segment {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!(removed, dir = %self.dir.display(), "cleared segment cache");
        Ok(())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{SEGMENT_EXT}"))
    }
}

fn layout_tag(layout: PixelLayout) -> u8 {
    match layout {
        PixelLayout::Rgb8 => 0,
        PixelLayout::Bgra8 => 1,
    }
}

fn layout_from_tag(tag: u8) -> Option<PixelLayout> {
    match tag {
        0 => Some(PixelLayout::Rgb8),
        1 => Some(PixelLayout::Bgra8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_image() -> RasterImage {
        let data: Vec<u8> = (0..48).map(|i| (i * 5 % 256) as u8).collect();
        RasterImage::new(data, 4, 4, PixelLayout::Rgb8).unwrap()
    }

    #[test]
    fn round_trip_is_bit_for_bit() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let img = sample_image();
        let key = CacheKey::generate();

        cache.write(&img, &key).unwrap();
        let back = cache.read(&key).unwrap().expect("entry present");
        assert_eq!(back, img);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        assert!(cache.read(&CacheKey::generate()).unwrap().is_none());
    }

    #[test]
    fn clear_all_removes_every_entry() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let img = sample_image();

        let keys: Vec<CacheKey> = (0..3).map(|_| CacheKey::generate()).collect();
        for key in &keys {
            cache.write(&img, key).unwrap();
        }

        cache.clear_all().unwrap();
        for key in &keys {
            assert!(cache.read(key).unwrap().is_none());
        }
    }

    #[test]
    fn clear_all_leaves_foreign_files_alone() {
        let dir = tempdir().expect("tempdir");
        let cache = SegmentCache::new(dir.path()).unwrap();
        let foreign = dir.path().join("notes.txt");
        std::fs::write(&foreign, b"keep me").unwrap();

        cache.clear_all().unwrap();
        assert!(foreign.exists());
    }

    #[test]
    fn keys_are_unique() {
        let a = CacheKey::generate();
        let b = CacheKey::generate();
        assert_ne!(a, b);
    }
}
