//! # Path Resolution Module
//!
//! Centralizza tutta la logica di calcolo dei path di output.
//! Usato sia dal driver batch sia da `ImageConverter`.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::BatchConfig;

/// Utility per calcolare i path di output in modo centralizzato
pub struct PathResolver;

impl PathResolver {
    /// Calcola il path di output per un file dato.
    ///
    /// - output dir + preserve structure: `<output>/<relative dir>/<stem>.<format>`
    /// - output dir flattened: `<output>/<stem>.<format>` (last writer wins on collisions)
    /// - no output dir: extension replaced beside the source
    pub fn get_output_path(
        root: &Path,
        file_path: &Path,
        target_format: &str,
        config: &BatchConfig,
    ) -> PathBuf {
        let filename = Self::output_file_name(file_path, target_format);

        match config.output_dir {
            Some(ref output_dir) if config.preserve_structure => {
                Self::resolve_output_directory_path(root, file_path, output_dir, filename)
            }
            Some(ref output_dir) => output_dir.join(filename),
            None => Self::in_place(file_path, target_format),
        }
    }

    /// `photo.png` + `webp` -> `photo.webp` in the same directory
    pub fn in_place(file_path: &Path, target_format: &str) -> PathBuf {
        file_path.with_file_name(Self::output_file_name(file_path, target_format))
    }

    fn output_file_name(file_path: &Path, target_format: &str) -> String {
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}.{}", stem, target_format.to_lowercase())
    }

    /// Risolve il path per modalità output directory
    fn resolve_output_directory_path(
        root: &Path,
        file_path: &Path,
        output_dir: &Path,
        filename: String,
    ) -> PathBuf {
        let relative_dir = match file_path.strip_prefix(root) {
            Ok(rel) => rel.parent().unwrap_or(Path::new("")),
            Err(e) => {
                debug!("Strip prefix failed for {}: {} - flattening", file_path.display(), e);
                Path::new("")
            }
        };

        let result = output_dir.join(relative_dir).join(filename);
        debug!("Resolved output path: {} -> {}", file_path.display(), result.display());
        result
    }

    /// Mirror `dir` (below `root`) under the output directory, if one is set.
    pub fn mirror_directory(root: &Path, dir: &Path, config: &BatchConfig) -> Option<PathBuf> {
        let output_dir = config.output_dir.as_ref()?;
        if !config.preserve_structure {
            return None;
        }
        dir.strip_prefix(root).ok().map(|rel| output_dir.join(rel))
    }

    /// Crea le directory parent se necessario
    pub async fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(output_dir: Option<&str>, preserve_structure: bool) -> BatchConfig {
        BatchConfig {
            output_dir: output_dir.map(PathBuf::from),
            preserve_structure,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_in_place_replaces_extension() {
        let out = PathResolver::get_output_path(
            Path::new("/photos"),
            Path::new("/photos/sub/test2.jpg"),
            "webp",
            &config(None, true),
        );
        assert_eq!(out, PathBuf::from("/photos/sub/test2.webp"));
    }

    #[test]
    fn test_preserve_structure_mirrors_relative_dir() {
        let out = PathResolver::get_output_path(
            Path::new("/photos"),
            Path::new("/photos/2023/vacation/img.png"),
            "jpg",
            &config(Some("/out"), true),
        );
        assert_eq!(out, PathBuf::from("/out/2023/vacation/img.jpg"));
    }

    #[test]
    fn test_flatten_puts_everything_under_output_dir() {
        let cfg = config(Some("/out"), false);
        let a = PathResolver::get_output_path(
            Path::new("/photos"),
            Path::new("/photos/a/img.png"),
            "webp",
            &cfg,
        );
        let b = PathResolver::get_output_path(
            Path::new("/photos"),
            Path::new("/photos/b/c/img.png"),
            "webp",
            &cfg,
        );
        assert_eq!(a, PathBuf::from("/out/img.webp"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_mirror_directory() {
        let cfg = config(Some("/out"), true);
        assert_eq!(
            PathResolver::mirror_directory(Path::new("/in"), Path::new("/in/x/y"), &cfg),
            Some(PathBuf::from("/out/x/y"))
        );
        assert_eq!(
            PathResolver::mirror_directory(Path::new("/in"), Path::new("/in/x"), &config(Some("/out"), false)),
            None
        );
    }
}
