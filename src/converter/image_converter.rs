//! # Image Converter Module
//!
//! Conversione di un singolo file: stat, controllo formato, cache, backup,
//! codec esterno, aggiornamento cache, rimozione dell'originale.
//!
//! Un'unica istanza è condivisa da tutti i worker: la cache è concorrente e
//! nessun lock viene tenuto durante la chiamata al codec, perché job
//! diversi lavorano su file diversi.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::codec::{Codec, CodecError, EncodeRequest, TargetFormat};
use crate::config::{Config, MetadataPolicy};
use crate::converter::cache::{config_hash, fingerprint, CacheEntry, ConversionCache};
use crate::converter::panic_message;
use crate::converter::path_resolver::PathResolver;
use crate::error::ConvertError;
use crate::file_manager::FileManager;

/// Settings applied to every conversion
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertOptions {
    pub quality: u8,
    /// 0 = no downscale
    pub max_dimension: u32,
    pub keep_original: bool,
    pub dry_run: bool,
    pub backup: bool,
    pub metadata: MetadataPolicy,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            max_dimension: 0,
            keep_original: false,
            dry_run: false,
            backup: false,
            metadata: MetadataPolicy::Keep,
        }
    }
}

impl From<&Config> for ConvertOptions {
    fn from(config: &Config) -> Self {
        Self {
            quality: config.quality,
            max_dimension: config.max_dimension,
            keep_original: config.keep_original,
            dry_run: config.dry_run,
            backup: config.auto_backup,
            metadata: config.metadata,
        }
    }
}

/// One file scheduled for conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub source_path: PathBuf,
    pub format: String,
    /// Overrides the in-place output path
    pub output_path: Option<PathBuf>,
}

impl Job {
    pub fn new(source_path: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            format: format.into(),
            output_path: None,
        }
    }

    pub fn with_output_path(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(output_path.into());
        self
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionResult {
    pub original_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub original_size: u64,
    pub new_size: u64,
    pub duration: Duration,
    pub error: Option<ConvertError>,
}

impl ConversionResult {
    pub fn failed(original_path: impl Into<PathBuf>, error: ConvertError) -> Self {
        Self {
            original_path: original_path.into(),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Uniform scale factor bringing the longer side down to `max_dimension`.
/// Never upscales; `None` means no resize.
pub fn downscale_factor(width: u32, height: u32, max_dimension: u32) -> Option<f64> {
    let longer = width.max(height);
    if max_dimension == 0 || longer <= max_dimension {
        return None;
    }
    Some((max_dimension as f64 / longer as f64).min(1.0))
}

/// `jpg`/`jpeg` (and `tif`/`tiff`) count as the same format.
fn is_already_in_format(path: &Path, target: TargetFormat) -> bool {
    FileManager::extension(path)
        .and_then(|ext| TargetFormat::parse(&ext))
        .map(|current| current == target)
        .unwrap_or(false)
}

/// Converts single images, sharing one cache across all workers
pub struct ImageConverter {
    options: ConvertOptions,
    codec: Arc<dyn Codec>,
    cache: Arc<ConversionCache>,
    config_hash: String,
}

impl ImageConverter {
    pub fn new(options: ConvertOptions, codec: Arc<dyn Codec>) -> Self {
        Self::with_cache(options, codec, Arc::new(ConversionCache::new()))
    }

    pub fn with_cache(
        options: ConvertOptions,
        codec: Arc<dyn Codec>,
        cache: Arc<ConversionCache>,
    ) -> Self {
        if !options.metadata.is_implemented() {
            warn!("Metadata policy 'strip-location' is not implemented yet: all metadata will be kept");
        }
        let config_hash = config_hash(options.quality, options.max_dimension);
        Self {
            options,
            codec,
            cache,
            config_hash,
        }
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<ConversionCache> {
        &self.cache
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub async fn convert(&self, path: &Path, format: &str) -> ConversionResult {
        self.convert_with_output_path(path, format, None).await
    }

    pub async fn convert_job(&self, job: &Job) -> ConversionResult {
        self.convert_with_output_path(&job.source_path, &job.format, job.output_path.as_deref())
            .await
    }

    /// Convert `path` to `format`, writing to `output_path` when given.
    pub async fn convert_with_output_path(
        &self,
        path: &Path,
        format: &str,
        output_path: Option<&Path>,
    ) -> ConversionResult {
        let start = Instant::now();
        let mut result = ConversionResult {
            original_path: path.to_path_buf(),
            ..ConversionResult::default()
        };

        if let Err(e) = self.run(path, format, output_path, &mut result).await {
            debug!("Conversion of {} failed: {}", path.display(), e);
            result.error = Some(e);
        }

        result.duration = start.elapsed();
        result
    }

    async fn run(
        &self,
        path: &Path,
        format: &str,
        output_path: Option<&Path>,
        result: &mut ConversionResult,
    ) -> Result<(), ConvertError> {
        let (original_size, source_modified) = FileManager::get_file_info(path)
            .await
            .map_err(|e| ConvertError::from_io(&e, "failed to stat file"))?;
        result.original_size = original_size;

        let format = format.trim().to_lowercase();
        let target = TargetFormat::parse(&format).ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("target format {} is not supported", format))
        })?;
        if is_already_in_format(path, target) {
            return Err(ConvertError::AlreadyInTargetFormat);
        }

        let new_path = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathResolver::in_place(path, &format));
        result.new_path = Some(new_path.clone());

        let key = fingerprint(path, &format, &self.config_hash);
        if let Some(entry) = self.cache.get(&key) {
            if entry.is_valid(source_modified, &new_path, &self.config_hash) {
                debug!("Cache hit: {}", path.display());
                result.new_size = entry.output_size;
                return Ok(());
            }
            if !self.options.dry_run {
                debug!("Evicting stale cache entry for {}", path.display());
                self.cache.remove(&key);
            }
        }

        // An existing output is recorded but does not by itself skip the conversion
        if let Ok(metadata) = tokio::fs::metadata(&new_path).await {
            result.new_size = metadata.len();
            if !self.options.dry_run {
                self.cache.insert(
                    key.clone(),
                    self.cache_entry(&new_path, result.new_size, source_modified),
                );
            }
        }

        if self.options.dry_run {
            debug!("Dry run: would convert {} -> {}", path.display(), new_path.display());
            return Ok(());
        }

        let output_size = match self.write_output(path, target, &new_path).await {
            Ok(size) => size,
            Err(e) => {
                // the entry recorded above must not outlive a failed conversion
                self.cache.remove(&key);
                return Err(e);
            }
        };
        result.new_size = output_size;

        self.cache.insert(key, self.cache_entry(&new_path, output_size, source_modified));

        if !self.options.keep_original {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| ConvertError::from_io(&e, "failed to remove original"))?;
        }

        Ok(())
    }

    /// Backup, decode, encode and atomically write `new_path`.
    async fn write_output(
        &self,
        path: &Path,
        target: TargetFormat,
        new_path: &Path,
    ) -> Result<u64, ConvertError> {
        if self.options.backup {
            self.create_backup(path).await?;
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ConvertError::from_io(&e, "failed to read source"))?;
        let encoded = self.encode(data, target).await?;

        PathResolver::ensure_parent_dirs(new_path)
            .await
            .map_err(|e| ConvertError::from_io(&e, "failed to create output directory"))?;
        let output_size = encoded.len() as u64;
        let destination = new_path.to_path_buf();
        tokio::task::spawn_blocking(move || FileManager::atomic_write(&destination, &encoded))
            .await
            .map_err(|e| ConvertError::Other(format!("write task failed: {}", e)))?
            .map_err(|e| ConvertError::from_io(&e, "failed to write output"))?;
        Ok(output_size)
    }

    fn cache_entry(
        &self,
        output_path: &Path,
        output_size: u64,
        source_modified: std::time::SystemTime,
    ) -> CacheEntry {
        CacheEntry {
            output_path: output_path.to_path_buf(),
            output_size,
            source_modified,
            config_hash: self.config_hash.clone(),
        }
    }

    /// Run the codec on a blocking thread; a codec panic becomes an error.
    async fn encode(&self, data: Vec<u8>, format: TargetFormat) -> Result<Vec<u8>, ConvertError> {
        let codec = self.codec.clone();
        let quality = self.options.quality;
        let max_dimension = self.options.max_dimension;
        let metadata = self.options.metadata;

        let task = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CodecError> {
            let scale = if max_dimension > 0 {
                let (width, height) = codec.dimensions(&data)?;
                downscale_factor(width, height, max_dimension)
            } else {
                None
            };
            let request = EncodeRequest {
                format,
                quality,
                scale,
                metadata,
            };
            codec.encode(&data, &request)
        });

        match task.await {
            Ok(encoded) => encoded.map_err(ConvertError::from),
            Err(e) if e.is_panic() => Err(ConvertError::Other(format!(
                "codec panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(e) => Err(ConvertError::Other(format!("codec task failed: {}", e))),
        }
    }

    /// Copy the original to `<dir>/backup/<name>.bak` atomically.
    async fn create_backup(&self, path: &Path) -> Result<PathBuf, ConvertError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let backup_dir = dir.join("backup");
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .map_err(|e| ConvertError::from_io(&e, "backup failed: cannot create backup directory"))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let backup_path = backup_dir.join(format!("{}.bak", file_name));

        let src = path.to_path_buf();
        let dst = backup_path.clone();
        tokio::task::spawn_blocking(move || FileManager::atomic_copy(&src, &dst))
            .await
            .map_err(|e| ConvertError::Other(format!("backup task failed: {}", e)))?
            .map_err(|e| ConvertError::from_io(&e, "backup failed"))?;

        debug!("Backup written: {}", backup_path.display());
        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::MockCodec;
    use crate::error::ErrorKind;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn converter(options: ConvertOptions) -> (ImageConverter, Arc<MockCodec>) {
        let codec = Arc::new(MockCodec::default());
        (ImageConverter::new(options, codec.clone()), codec)
    }

    fn keep() -> ConvertOptions {
        ConvertOptions {
            keep_original: true,
            ..ConvertOptions::default()
        }
    }

    fn listing(dir: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .map(|e| e.unwrap().path().to_path_buf())
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn test_downscale_factor() {
        assert_eq!(downscale_factor(4000, 3000, 0), None);
        assert_eq!(downscale_factor(800, 600, 1000), None);
        assert_eq!(downscale_factor(1000, 1000, 1000), None);
        assert_eq!(downscale_factor(4000, 2000, 1000), Some(0.25));
        assert_eq!(downscale_factor(1500, 3000, 1500), Some(0.5));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("job.png");
        std::fs::write(&source, b"fake png").unwrap();
        let before = listing(temp_dir.path());

        let (converter, codec) = converter(ConvertOptions {
            dry_run: true,
            ..ConvertOptions::default()
        });
        let result = converter.convert(&source, "jpg").await;

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.original_path, source);
        assert_eq!(result.new_path, Some(temp_dir.path().join("job.jpg")));
        assert_eq!(result.original_size, 8);
        assert_eq!(codec.calls(), 0);
        assert!(converter.cache().is_empty());
        assert_eq!(listing(temp_dir.path()), before);
    }

    #[tokio::test]
    async fn test_already_in_target_format_is_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let jpg = temp_dir.path().join("a.jpg");
        let jpeg = temp_dir.path().join("b.JPEG");
        std::fs::write(&jpg, b"jpg").unwrap();
        std::fs::write(&jpeg, b"jpeg").unwrap();
        let before = listing(temp_dir.path());

        let (converter, codec) = converter(ConvertOptions::default());
        for (path, format) in [(&jpg, "jpg"), (&jpg, "jpeg"), (&jpeg, "jpg"), (&jpeg, "JPEG")] {
            let result = converter.convert(path, format).await;
            assert_eq!(result.error, Some(ConvertError::AlreadyInTargetFormat));
        }

        assert_eq!(codec.calls(), 0);
        assert_eq!(listing(temp_dir.path()), before);
    }

    #[tokio::test]
    async fn test_second_conversion_is_a_cache_hit() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();

        let (converter, codec) = converter(keep());
        let first = converter.convert(&source, "webp").await;
        assert!(first.is_success(), "{:?}", first.error);
        assert_eq!(codec.calls(), 1);
        let output = temp_dir.path().join("a.webp");
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded:webp:80");

        let second = converter.convert(&source, "webp").await;
        assert!(second.is_success());
        assert_eq!(codec.calls(), 1);
        assert_eq!(second.new_size, first.new_size);
    }

    #[tokio::test]
    async fn test_quality_change_invalidates_cache() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();

        let codec = Arc::new(MockCodec::default());
        let cache = Arc::new(ConversionCache::new());
        let q80 = ImageConverter::with_cache(keep(), codec.clone(), cache.clone());
        let q50 = ImageConverter::with_cache(
            ConvertOptions {
                quality: 50,
                ..keep()
            },
            codec.clone(),
            cache.clone(),
        );

        assert!(q80.convert(&source, "jpg").await.is_success());
        assert!(q50.convert(&source, "jpg").await.is_success());
        assert_eq!(codec.calls(), 2);
        assert_eq!(
            std::fs::read(temp_dir.path().join("a.jpg")).unwrap(),
            b"encoded:jpeg:50"
        );
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_evicted() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();
        let (converter, codec) = converter(keep());

        assert!(converter.convert(&source, "gif").await.is_success());

        // source touched after the conversion
        let later = SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(converter.convert(&source, "gif").await.is_success());
        assert_eq!(codec.calls(), 2);

        // output deleted
        std::fs::remove_file(temp_dir.path().join("a.gif")).unwrap();
        assert!(converter.convert(&source, "gif").await.is_success());
        assert_eq!(codec.calls(), 3);
    }

    #[tokio::test]
    async fn test_existing_output_does_not_skip_conversion() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();
        let output = temp_dir.path().join("a.tiff");
        std::fs::write(&output, b"stale").unwrap();

        let (converter, codec) = converter(keep());
        let result = converter.convert(&source, "tiff").await;
        assert!(result.is_success());
        assert_eq!(codec.calls(), 1);
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded:tiff:80");
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_no_cache_entry() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"CORRUPT").unwrap();
        let output = temp_dir.path().join("a.webp");
        std::fs::write(&output, b"leftover").unwrap();

        let (converter, codec) = converter(keep());
        let result = converter.convert(&source, "webp").await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::CorruptedImage);
        assert!(converter.cache().is_empty());

        // still not served from the cache on the next attempt
        let retry = converter.convert(&source, "webp").await;
        assert!(!retry.is_success());
        assert_eq!(codec.calls(), 2);
        assert!(converter.cache().is_empty());
    }

    #[tokio::test]
    async fn test_original_removed_unless_kept() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();

        let (converter, _) = converter(ConvertOptions::default());
        let result = converter.convert(&source, "avif").await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(!source.exists());
        assert!(temp_dir.path().join("a.avif").exists());
    }

    #[tokio::test]
    async fn test_backup_is_written_next_to_source() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"original").unwrap();

        let (converter, _) = converter(ConvertOptions {
            backup: true,
            ..ConvertOptions::default()
        });
        assert!(converter.convert(&source, "jpg").await.is_success());

        let backup_dir = temp_dir.path().join("backup");
        assert_eq!(std::fs::read(backup_dir.join("a.png.bak")).unwrap(), b"original");
        assert_eq!(std::fs::read_dir(&backup_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_output_path_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();
        let output = temp_dir.path().join("out").join("nested").join("a.webp");

        let (converter, _) = converter(keep());
        let job = Job::new(&source, "webp").with_output_path(&output);
        let result = converter.convert_job(&job).await;
        assert!(result.is_success());
        assert_eq!(result.new_path.as_deref(), Some(output.as_path()));
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_max_dimension_passes_uniform_scale() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.png");
        std::fs::write(&source, b"pixels").unwrap();

        let (converter, codec) = converter(ConvertOptions {
            max_dimension: 100,
            metadata: MetadataPolicy::Strip,
            ..keep()
        });
        assert!(converter.convert(&source, "jpg").await.is_success());

        let requests = codec.requests.lock().unwrap();
        assert_eq!(requests[0].scale, Some(0.25));
        assert_eq!(requests[0].metadata, MetadataPolicy::Strip);
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let temp_dir = TempDir::new().unwrap();
        let (converter, _) = converter(keep());

        let missing = converter.convert(&temp_dir.path().join("nope.png"), "jpg").await;
        assert_eq!(missing.error.unwrap().kind(), ErrorKind::SourceNotFound);

        let corrupt = temp_dir.path().join("bad.png");
        std::fs::write(&corrupt, b"CORRUPT").unwrap();
        let result = converter.convert(&corrupt, "jpg").await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::CorruptedImage);
        assert!(corrupt.exists());

        let unsupported = converter.convert(&corrupt, "bmp").await;
        assert_eq!(unsupported.error.unwrap().kind(), ErrorKind::UnsupportedFormat);
    }

    #[tokio::test]
    async fn test_codec_panic_becomes_error_result() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("boom.png");
        std::fs::write(&source, b"PANIC").unwrap();

        let (converter, _) = converter(ConvertOptions::default());
        let result = converter.convert(&source, "jpg").await;
        let err = result.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.to_string().contains("codec exploded"));
        assert!(source.exists());
    }
}
