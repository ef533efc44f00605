//! On-disk layout shared by the stages.

use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::config::WorkspaceConfig;
use crate::pipeline::WorkItem;

/// ABI markers recognised in artifact filenames, most specific first.
const VARIANTS: &[&str] = &["armeabi-v7a", "arm64-v8a", "x86_64", "x86", "universal"];

#[derive(Debug, Clone)]
pub struct Workspace {
    downloads_dir: PathBuf,
    output_dir: PathBuf,
    output_suffix: String,
}

impl Workspace {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            downloads_dir: config.downloads_dir.clone(),
            output_dir: config.output_dir.clone(),
            output_suffix: config.output_suffix.clone(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where fetch leaves the source artifact for `item`:
    /// `<downloads>/<name>/<artifact>`, so items never share a download.
    pub fn fetched_path(&self, item: &WorkItem) -> PathBuf {
        self.downloads_dir
            .join(path_safe(&item.name))
            .join(artifact_name(item))
    }

    /// Where transform writes its output: `<name>-<stem><suffix>.<ext>`.
    /// The item name prefix keeps published asset names unique per release.
    pub fn output_path(&self, item: &WorkItem) -> PathBuf {
        let name = artifact_name(item);
        let path = Path::new(&name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let prefix = path_safe(&item.name);
        let file = match path.extension() {
            Some(ext) => format!("{}-{}{}.{}", prefix, stem, self.output_suffix, ext.to_string_lossy()),
            None => format!("{}-{}{}", prefix, stem, self.output_suffix),
        };
        self.output_dir.join(file)
    }
}

/// Filename of the source artifact: the last non-empty path segment of the
/// source URL or path. Falls back to `<name>.bin`.
pub fn artifact_name(item: &WorkItem) -> String {
    let last = match Url::parse(&item.source) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string),
        _ => Path::new(&item.source)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned()),
    };
    match last {
        Some(name) if !name.is_empty() => path_safe(&name),
        _ => format!("{}.bin", path_safe(&item.name)),
    }
}

/// Item names and URL segments reduced to characters safe in a filename.
/// A result of only dots would name a parent directory, so it becomes `_`.
fn path_safe(raw: &str) -> String {
    let safe: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if safe.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        safe
    }
}

/// Architecture variant encoded in an artifact filename. Builds without an
/// ABI marker are universal.
pub fn detect_variant(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    VARIANTS
        .iter()
        .copied()
        .find(|v| lower.contains(v))
        .unwrap_or("universal")
}
