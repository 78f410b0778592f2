use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;

use crate::error::Result;

// ============================================================================
// Media types and headers
// ============================================================================

/// A content type split into its essence (`type/subtype`) and parameters.
///
/// The essence is always lowercase. Parameter names are lowercase, values keep
/// their case with surrounding quotes removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaType {
    pub essence: String,
    pub params: Vec<(String, String)>,
}

impl MediaType {
    pub fn new(essence: impl Into<String>) -> Self {
        Self {
            essence: essence.into().trim().to_ascii_lowercase(),
            params: Vec::new(),
        }
    }

    /// Parse a `Content-Type` header value such as `text/plain; charset="ISO-8859-1"`.
    ///
    /// Never fails: unparsable input yields an empty essence, which the resolver
    /// treats as generic.
    pub fn parse(value: &str) -> Self {
        let mut pieces = split_unquoted(value, ';').into_iter();
        let essence = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
        let essence = if essence.contains('/') { essence } else { String::new() };

        let params = pieces
            .filter_map(|piece| {
                let (name, value) = piece.split_once('=')?;
                let name = name.trim().to_ascii_lowercase();
                if name.is_empty() {
                    return None;
                }
                Some((name, unquote(value.trim()).to_string()))
            })
            .collect();

        Self { essence, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.params.push((name.to_ascii_lowercase(), value));
        }
    }

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
    }

    /// Replace the essence while keeping the parameters.
    pub fn with_essence(&self, essence: &str) -> Self {
        Self {
            essence: essence.trim().to_ascii_lowercase(),
            params: self.params.clone(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.essence.starts_with("text/")
    }

    pub fn is_html(&self) -> bool {
        self.essence == "text/html" || self.essence == "application/xhtml+xml"
    }

    pub fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.essence)?;
        for (name, value) in &self.params {
            if value.bytes().any(|b| b.is_ascii_whitespace() || b"()<>@,;:\\\"/[]?=".contains(&b)) {
                write!(f, "; {}=\"{}\"", name, value.replace('"', "\\\""))?;
            } else {
                write!(f, "; {}={}", name, value)?;
            }
        }
        Ok(())
    }
}

fn split_unquoted(value: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c == sep && !quoted => out.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    out.push(current);
    out
}

fn unquote(value: &str) -> std::borrow::Cow<'_, str> {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        if inner.contains('\\') {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            return out.into();
        }
        return inner.into();
    }
    value.into()
}

/// Ordered header multimap with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an unfolded-or-folded RFC 5322 header block.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut map = Self::new();
        let mut current: Option<(String, String)> = None;

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = current.take() {
                map.append(name, value);
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if !name.is_empty() && !name.contains(' ') {
                    current = Some((name.to_string(), value.trim().to_string()));
                }
            }
        }
        if let Some((name, value)) = current {
            map.append(name, value);
        }
        map
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single value, keeping the first position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = 0;
                self.entries.retain(|(k, _)| {
                    let keep = idx <= pos || !k.eq_ignore_ascii_case(name);
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize back into a CRLF-terminated header block.
    pub fn to_raw(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

// ============================================================================
// Bodies
// ============================================================================

#[derive(Clone)]
enum BodyStorage {
    Memory(Arc<[u8]>),
    Spilled(Arc<NamedTempFile>),
    Persisted(Arc<PathBuf>),
}

/// Immutable, re-readable byte region of a [`Part`].
///
/// Cloning is cheap: the bytes (or the backing file) are shared. Every reader
/// starts at offset 0, so a body can be consumed any number of times.
#[derive(Clone)]
pub struct Body {
    storage: BodyStorage,
    len: u64,
}

impl Body {
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            storage: BodyStorage::Memory(Arc::from(data)),
            len,
        }
    }

    /// Keep `data` in memory when it fits under `threshold`, else spill it to
    /// a temporary file inside `dir`.
    pub fn with_threshold(data: Vec<u8>, threshold: usize, dir: &Path) -> Result<Self> {
        if data.len() <= threshold {
            return Ok(Self::from_vec(data));
        }
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&data)?;
        file.flush()?;
        Ok(Self {
            storage: BodyStorage::Spilled(Arc::new(file)),
            len: data.len() as u64,
        })
    }

    /// Wrap an already-written temporary file.
    pub fn from_temp_file(file: NamedTempFile) -> Result<Self> {
        let len = file.as_file().metadata()?.len();
        Ok(Self {
            storage: BodyStorage::Spilled(Arc::new(file)),
            len,
        })
    }

    /// Reference a durable file that outlives the call.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self {
            storage: BodyStorage::Persisted(Arc::new(path)),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file, when the body is not held in memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            BodyStorage::Memory(_) => None,
            BodyStorage::Spilled(file) => Some(file.path()),
            BodyStorage::Persisted(path) => Some(path.as_path()),
        }
    }

    /// Synchronous reader positioned at offset 0.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(match &self.storage {
            BodyStorage::Memory(bytes) => Box::new(std::io::Cursor::new(Arc::clone(bytes))),
            BodyStorage::Spilled(file) => Box::new(std::fs::File::open(file.path())?),
            BodyStorage::Persisted(path) => Box::new(std::fs::File::open(path.as_path())?),
        })
    }

    /// Asynchronous reader positioned at offset 0.
    pub async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(match &self.storage {
            BodyStorage::Memory(bytes) => Box::new(std::io::Cursor::new(Arc::clone(bytes))),
            BodyStorage::Spilled(file) => Box::new(tokio::fs::File::open(file.path()).await?),
            BodyStorage::Persisted(path) => Box::new(tokio::fs::File::open(path.as_path()).await?),
        })
    }

    /// Up to `n` leading bytes.
    pub fn prefix(&self, n: usize) -> Result<Vec<u8>> {
        if let BodyStorage::Memory(bytes) = &self.storage {
            return Ok(bytes[..n.min(bytes.len())].to_vec());
        }
        let mut buf = Vec::with_capacity(n.min(self.len as usize));
        self.open()?.take(n as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        if let BodyStorage::Memory(bytes) = &self.storage {
            return Ok(bytes.to_vec());
        }
        let mut buf = Vec::with_capacity(self.len as usize);
        self.open()?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.storage {
            BodyStorage::Memory(_) => "memory",
            BodyStorage::Spilled(_) => "spilled",
            BodyStorage::Persisted(_) => "persisted",
        };
        f.debug_struct("Body").field("storage", &kind).field("len", &self.len).finish()
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[u8]> for Body {
    fn from(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }
}

// ============================================================================
// Parts
// ============================================================================

/// One node of the decomposed document tree.
///
/// `parent` is the sequence number of the enclosing part, resolved through the
/// walk's lineage arena; it never owns anything.
#[derive(Debug, Clone)]
pub struct Part {
    pub sequence: u64,
    pub level: u32,
    pub parent: Option<u64>,
    pub media_type: MediaType,
    pub header: HeaderMap,
    pub body: Body,
    pub file_name: Option<String>,
    /// Plain-text alternative used when converting this (HTML) part fails.
    pub fallback: Option<Box<Part>>,
}

impl Part {
    pub fn content_type(&self) -> &str {
        &self.media_type.essence
    }

    /// Copy of this part carrying a new body; the original stays untouched.
    pub fn with_body(&self, body: Body) -> Part {
        Part {
            body,
            ..self.clone()
        }
    }

    /// `Content-ID` without the surrounding angle brackets.
    pub fn content_id(&self) -> Option<&str> {
        self.header
            .get("Content-ID")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').trim())
            .filter(|id| !id.is_empty())
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// Where the bytes of an [`ArtifactItem`] live.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Already-materialized content.
    Body(Body),
    /// File opened lazily at packaging time.
    Path(PathBuf),
}

/// A packaged output unit: a converted document or a recorded failure.
#[derive(Debug, Clone)]
pub struct ArtifactItem {
    pub source: ArtifactSource,
    pub archive_name: Option<String>,
    pub content_type: String,
    /// Set when the item carries original bytes because conversion failed.
    pub error: Option<String>,
}

impl ArtifactItem {
    pub fn from_path(path: impl Into<PathBuf>, archive_name: impl Into<String>, content_type: &str) -> Self {
        Self {
            source: ArtifactSource::Path(path.into()),
            archive_name: Some(archive_name.into()),
            content_type: content_type.to_string(),
            error: None,
        }
    }

    pub fn failed(body: Body, archive_name: impl Into<String>, content_type: &str, error: impl Into<String>) -> Self {
        Self {
            source: ArtifactSource::Body(body),
            archive_name: Some(archive_name.into()),
            content_type: content_type.to_string(),
            error: Some(error.into()),
        }
    }

    /// Archive member name: the override, else the backing file name.
    pub fn name(&self) -> String {
        if let Some(name) = &self.archive_name {
            return name.clone();
        }
        match &self.source {
            ArtifactSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string()),
            ArtifactSource::Body(body) => body
                .path()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "artifact".to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.source {
            ArtifactSource::Body(body) => body.open(),
            ArtifactSource::Path(path) => Ok(Box::new(std::fs::File::open(path)?)),
        }
    }
}

/// Items produced by one conversion call plus the aggregate of non-fatal errors.
#[derive(Debug)]
pub struct ConversionOutcome {
    pub items: Vec<ArtifactItem>,
    pub error: Option<crate::MimepackError>,
}

impl ConversionOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &ArtifactItem> {
        self.items.iter().filter(|item| item.is_failure())
    }
}

/// Summary of one assembly run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyReport {
    /// Member names in archive order.
    pub members: Vec<String>,
    pub failed_items: usize,
    pub manifest_written: bool,
    /// Per-item write failures that did not abort packaging.
    pub write_errors: Vec<String>,
}
