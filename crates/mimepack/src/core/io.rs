//! Filesystem and naming helpers.

use crate::{MimepackError, Result};
use ahash::AHashSet;
use std::path::{Component, Path, PathBuf};

/// Read an input file, rejecting missing paths.
///
/// # Errors
///
/// Returns `MimepackError::Validation` if the file does not exist and
/// `MimepackError::Io` for any other I/O failure.
pub async fn read_input_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    validate_file_exists(path)?;
    tokio::fs::read(path).await.map_err(MimepackError::Io)
}

pub fn validate_file_exists(path: impl AsRef<Path>) -> Result<()> {
    if !path.as_ref().exists() {
        return Err(MimepackError::validation(format!(
            "File does not exist: {}",
            path.as_ref().display()
        )));
    }
    Ok(())
}

/// All regular files below `dir`, sorted by path.
///
/// Symbolic links are not followed, so an unpacked archive cannot point the
/// traversal outside its own directory.
pub fn traverse_directory(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(MimepackError::validation(format!(
            "Path is not a directory: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    traverse_directory_impl(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn traverse_directory_impl(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            traverse_directory_impl(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

/// Archive-relative member name with `/` separators.
///
/// Backslashes become slashes; empty, `.`, `..` and root components are
/// dropped, as are control characters. An empty result becomes `unnamed`.
pub fn sanitize_archive_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let components: Vec<String> = Path::new(&normalized)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => {
                let cleaned: String = part.to_string_lossy().chars().filter(|c| !c.is_control()).collect();
                let cleaned = cleaned.trim().to_string();
                (!cleaned.is_empty()).then_some(cleaned)
            }
            _ => None,
        })
        .collect();

    if components.is_empty() {
        "unnamed".to_string()
    } else {
        components.join("/")
    }
}

/// Hands out archive names, suffixing repeats as `name-1.ext`, `name-2.ext`, ...
#[derive(Debug, Default)]
pub struct NameAllocator {
    taken: AHashSet<String>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` so it is never handed out.
    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    pub fn allocate(&mut self, name: &str) -> String {
        let name = sanitize_archive_name(name);
        if self.taken.insert(name.clone()) {
            return name;
        }

        let (stem, ext) = split_extension(&name);
        let mut n = 1;
        loop {
            let candidate = format!("{}-{}{}", stem, n, ext);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => name.split_at(file_start + dot),
        _ => (name, ""),
    }
}

/// Whether an archive member path belongs to a well-known noise location.
///
/// Entries ending in `/` match a directory anywhere in the path; other
/// entries match the final path component.
pub fn is_noise_entry(member: &str, noise_entries: &[String]) -> bool {
    let member = member.replace('\\', "/");
    let file_name = member.rsplit('/').next().unwrap_or(&member);
    noise_entries.iter().any(|noise| {
        if let Some(dir) = noise.strip_suffix('/') {
            member.split('/').any(|component| component == dir)
        } else {
            file_name == noise
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_input_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("mail.eml");
        fs::write(&file, b"Subject: x\r\n\r\nbody").unwrap();
        assert_eq!(read_input_file(&file).await.unwrap(), b"Subject: x\r\n\r\nbody");

        let missing = read_input_file(dir.path().join("nope")).await;
        assert!(matches!(missing, Err(MimepackError::Validation { .. })));
    }

    #[test]
    fn test_traverse_directory_sorted() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("b/c/z.txt"), b"z").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let files = traverse_directory(dir.path()).unwrap();
        let rel: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["a.txt", "b/c/z.txt"]);
    }

    #[test]
    fn test_traverse_directory_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"").unwrap();
        assert!(traverse_directory(&file).is_err());
    }

    #[test]
    fn test_sanitize_archive_name() {
        assert_eq!(sanitize_archive_name("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_archive_name("/abs/path.pdf"), "abs/path.pdf");
        assert_eq!(sanitize_archive_name("dir\\file.pdf"), "dir/file.pdf");
        assert_eq!(sanitize_archive_name("a/./b\u{0}.pdf"), "a/b.pdf");
        assert_eq!(sanitize_archive_name(".."), "unnamed");
    }

    #[test]
    fn test_name_allocator_disambiguates() {
        let mut names = NameAllocator::new();
        names.reserve("errors.txt");
        assert_eq!(names.allocate("report.pdf"), "report.pdf");
        assert_eq!(names.allocate("report.pdf"), "report-1.pdf");
        assert_eq!(names.allocate("report.pdf"), "report-2.pdf");
        assert_eq!(names.allocate("errors.txt"), "errors-1.txt");
        assert_eq!(names.allocate("dir.v2/README"), "dir.v2/README");
        assert_eq!(names.allocate("dir.v2/README"), "dir.v2/README-1");
    }

    #[test]
    fn test_noise_entries() {
        let noise: Vec<String> = ["__MACOSX/", ".DS_Store", "Thumbs.db"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(is_noise_entry("__MACOSX/doc.pdf", &noise));
        assert!(is_noise_entry("sub/.DS_Store", &noise));
        assert!(is_noise_entry("a\\Thumbs.db", &noise));
        assert!(!is_noise_entry("docs/report.pdf", &noise));
    }
}
