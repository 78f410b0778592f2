//! Configuration loading and management.
//!
//! [`ConversionConfig`] holds every tunable of a conversion call. It can be
//! built programmatically or loaded from TOML, YAML or JSON, and
//! [`ConversionConfig::discover`] looks for a `mimepack.toml` in the current
//! directory and its parents.

use crate::core::sniff::SniffMode;
use crate::{MimepackError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main conversion configuration.
///
/// # Example
///
/// ```rust
/// use mimepack::core::config::ConversionConfig;
///
/// let config = ConversionConfig::default();
/// assert_eq!(config.dedup.threshold, 10);
///
/// // let config = ConversionConfig::from_toml_file("mimepack.toml")?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Maximum simultaneous converter invocations (None = number of CPUs)
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Per-invocation timeout for external converters
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Capacity of the bounded queues between pipeline stages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum nesting of containers and forwarded messages
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Bodies larger than this are spilled to temporary files
    #[serde(default = "default_in_memory_threshold")]
    pub in_memory_threshold: usize,

    /// Cap on the total size of collected error text
    #[serde(default = "default_max_error_bytes")]
    pub max_error_bytes: usize,

    /// Keep the per-call work directory for debugging
    #[serde(default)]
    pub keep_temp_files: bool,

    /// Keep packaging remaining items when one item fails to write
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// Converter result cache (None = caching disabled)
    #[serde(default)]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub html: HtmlConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub libreoffice: LibreOfficeConfig,

    /// Extra external converters, consulted before the built-in ones
    #[serde(default)]
    pub commands: Vec<CommandConverterConfig>,

    /// External tool used to merge PDFs into one document
    #[serde(default = "default_merge_command")]
    pub merge_command: String,

    #[serde(default)]
    pub sniff_mode: SniffMode,
}

/// Content-addressed converter cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory (None = platform cache dir)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: f64,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: f64,

    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: f64,
}

/// Repeated-attachment guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Header carrying the caller-supplied content hash
    #[serde(default = "default_dedup_header")]
    pub header_name: String,

    /// Occurrences of one hash allowed through
    #[serde(default = "default_dedup_threshold")]
    pub threshold: usize,
}

/// Windows and counts for the legacy-encoding heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_qp_sniff_window")]
    pub qp_sniff_window: usize,

    #[serde(default = "default_qp_min_escapes")]
    pub qp_min_escapes: usize,

    #[serde(default = "default_bork_sniff_window")]
    pub bork_sniff_window: usize,

    #[serde(default = "default_bork_min_lines")]
    pub bork_min_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlConfig {
    /// Snapshot untouched HTML bodies here before they are rewritten
    #[serde(default)]
    pub preserve_original_dir: Option<PathBuf>,

    /// Splice a From/To/Subject block into text and HTML bodies
    #[serde(default = "default_true")]
    pub inject_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Member path prefixes or file names that are silently dropped
    #[serde(default = "default_noise_entries")]
    pub noise_entries: Vec<String>,

    /// Members larger than this (uncompressed) are reported and skipped
    #[serde(default = "default_max_member_size")]
    pub max_member_size: u64,

    /// External unpacker for formats without an in-process reader (rar, 7z)
    #[serde(default = "default_external_unpacker")]
    pub external_unpacker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LibreOfficeConfig {
    /// Explicit `soffice` binary (None = discover)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Serialize all invocations through one lock
    #[serde(default)]
    pub single_instance: bool,
}

/// An external converter: `program args...` where `{input}` and `{output}`
/// are replaced by the source and destination paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConverterConfig {
    pub name: String,

    /// MIME types or prefixes (ending in `/` or `*`) handled by this command
    pub mime_types: Vec<String>,

    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Content type written to `{output}`
    #[serde(default = "default_output_type")]
    pub output_type: String,
}

fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_queue_capacity() -> usize {
    16
}
fn default_max_depth() -> usize {
    8
}
fn default_in_memory_threshold() -> usize {
    1024 * 1024
}
fn default_max_error_bytes() -> usize {
    64 * 1024
}
fn default_merge_command() -> String {
    "pdfunite".to_string()
}
fn default_max_age_days() -> f64 {
    30.0
}
fn default_max_size_mb() -> f64 {
    500.0
}
fn default_min_free_space_mb() -> f64 {
    1000.0
}
fn default_dedup_header() -> String {
    "X-Content-Hash".to_string()
}
fn default_dedup_threshold() -> usize {
    10
}
fn default_qp_sniff_window() -> usize {
    2048
}
fn default_qp_min_escapes() -> usize {
    3
}
fn default_bork_sniff_window() -> usize {
    1024
}
fn default_bork_min_lines() -> usize {
    2
}
fn default_noise_entries() -> Vec<String> {
    ["__MACOSX/", ".DS_Store", "Thumbs.db", "desktop.ini", ".git/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_member_size() -> u64 {
    512 * 1024 * 1024
}
fn default_external_unpacker() -> String {
    "bsdtar".to_string()
}
fn default_output_type() -> String {
    crate::core::mime::PDF_MIME_TYPE.to_string()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            timeout_secs: default_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            max_depth: default_max_depth(),
            in_memory_threshold: default_in_memory_threshold(),
            max_error_bytes: default_max_error_bytes(),
            keep_temp_files: false,
            continue_on_error: true,
            cache: None,
            dedup: DedupConfig::default(),
            text: TextConfig::default(),
            html: HtmlConfig::default(),
            archive: ArchiveConfig::default(),
            libreoffice: LibreOfficeConfig::default(),
            commands: Vec::new(),
            merge_command: default_merge_command(),
            sniff_mode: SniffMode::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: None,
            max_age_days: default_max_age_days(),
            max_size_mb: default_max_size_mb(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            header_name: default_dedup_header(),
            threshold: default_dedup_threshold(),
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            qp_sniff_window: default_qp_sniff_window(),
            qp_min_escapes: default_qp_min_escapes(),
            bork_sniff_window: default_bork_sniff_window(),
            bork_min_lines: default_bork_min_lines(),
        }
    }
}

impl Default for HtmlConfig {
    fn default() -> Self {
        Self {
            preserve_original_dir: None,
            inject_headers: true,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            noise_entries: default_noise_entries(),
            max_member_size: default_max_member_size(),
            external_unpacker: default_external_unpacker(),
        }
    }
}

impl ConversionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `MimepackError::Validation` if the file doesn't exist or is invalid TOML.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        toml::from_str(&content)
            .map_err(|e| MimepackError::validation(format!("Invalid TOML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| MimepackError::validation(format!("Invalid YAML in {}: {}", path.as_ref().display(), e)))
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        serde_json::from_str(&content)
            .map_err(|e| MimepackError::validation(format!("Invalid JSON in {}: {}", path.as_ref().display(), e)))
    }

    /// Discover `mimepack.toml` in the current directory or a parent.
    pub fn discover() -> Result<Option<Self>> {
        let mut current = std::env::current_dir().map_err(MimepackError::Io)?;

        loop {
            let candidate = current.join("mimepack.toml");
            if candidate.exists() {
                return Ok(Some(Self::from_toml_file(candidate)?));
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }

        Ok(None)
    }

    /// Effective concurrency limit, never zero.
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Reject settings that would stall or disable the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(MimepackError::validation("concurrency must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(MimepackError::validation("queue_capacity must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(MimepackError::validation("timeout_secs must be at least 1"));
        }
        if self.dedup.header_name.trim().is_empty() {
            return Err(MimepackError::validation("dedup.header_name must not be empty"));
        }
        for command in &self.commands {
            if command.mime_types.is_empty() {
                return Err(MimepackError::validation(format!(
                    "command converter '{}' handles no MIME types",
                    command.name
                )));
            }
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| MimepackError::validation(format!("Failed to read config file {}: {}", path.display(), e)))
}
