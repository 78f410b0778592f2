//! Headless LibreOffice invocation.
//!
//! Converts office documents, RTF, text, HTML and images to PDF with
//! `soffice --headless --convert-to pdf`.
//!
//! Concurrent `soffice` processes sharing one user profile fight over its lock
//! file, so every call gets a throwaway profile directory. When
//! `single_instance` is set, calls are serialized through a process-wide lock
//! instead.
//!
//! # System Requirement
//!
//! LibreOffice must be installed:
//! - **macOS**: `brew install --cask libreoffice`
//! - **Linux**: `apt install libreoffice` or `dnf install libreoffice`
//! - **Windows**: `winget install LibreOffice.LibreOffice`

use crate::error::{MimepackError, Result};
use crate::utils::process::run_command;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Serializes access when LibreOffice runs as a single shared instance.
static SINGLE_INSTANCE_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

fn libreoffice_install_message() -> String {
    "LibreOffice (soffice/libreoffice) is required to convert office documents, text and images to PDF. \
Install: macOS: 'brew install --cask libreoffice', \
Linux: 'apt install libreoffice', \
Windows: 'winget install LibreOffice.LibreOffice'. \
If LibreOffice is installed in a custom location, set the MIMEPACK_LIBREOFFICE_PATH environment variable to the soffice executable."
        .to_string()
}

fn soffice_candidates(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let mut push_candidate = |path: PathBuf| {
        if seen.insert(path.clone()) {
            candidates.push(path);
        }
    };

    if let Some(path) = configured {
        push_candidate(path.to_path_buf());
    }

    for var in ["MIMEPACK_LIBREOFFICE_PATH", "SOFFICE_PATH", "LIBREOFFICE_PATH"] {
        if let Some(value) = env::var_os(var).filter(|v| !v.is_empty()) {
            push_candidate(PathBuf::from(value));
        }
    }

    if cfg!(target_os = "macos") {
        push_candidate(PathBuf::from("/Applications/LibreOffice.app/Contents/MacOS/soffice"));
    }

    if cfg!(target_os = "windows") {
        push_candidate(PathBuf::from("C:\\Program Files\\LibreOffice\\program\\soffice.exe"));
    }

    if let Some(prefix) = env::var_os("HOMEBREW_PREFIX") {
        let prefix_path = PathBuf::from(prefix);
        push_candidate(prefix_path.join("bin/soffice"));
        push_candidate(prefix_path.join("bin/libreoffice"));
    }

    if let Some(path_env) = env::var_os("PATH") {
        for dir in env::split_paths(&path_env) {
            push_candidate(dir.join("soffice"));
            push_candidate(dir.join("libreoffice"));
            push_candidate(dir.join("soffice.exe"));
        }
    }

    candidates
}

/// First existing `soffice` binary, starting with `configured`.
pub fn locate_soffice_binary(configured: Option<&Path>) -> Result<PathBuf> {
    for candidate in soffice_candidates(configured) {
        if let Ok(metadata) = std::fs::metadata(&candidate)
            && metadata.is_file()
        {
            return Ok(candidate);
        }
    }

    Err(MimepackError::MissingDependency(libreoffice_install_message()))
}

/// Convert `input_path` to PDF inside `output_dir` and return the produced file.
pub async fn convert_to_pdf(
    soffice: &Path,
    input_path: &Path,
    output_dir: &Path,
    timeout_secs: u64,
    single_instance: bool,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir).await?;

    let mut command = Command::new(soffice);
    command.arg("--headless").arg("--norestore").arg("--nologo");

    // Held for the whole run: either the shared lock or the private profile.
    let _instance_guard;
    let _profile_dir;
    if single_instance {
        _instance_guard = Some(SINGLE_INSTANCE_LOCK.lock().await);
        _profile_dir = None;
    } else {
        let profile = tempfile::Builder::new().prefix("mimepack-lo-profile-").tempdir()?;
        command.arg(format!("-env:UserInstallation={}", file_url(profile.path())));
        _instance_guard = None;
        _profile_dir = Some(profile);
    }

    command
        .arg("--convert-to")
        .arg("pdf")
        .arg("--outdir")
        .arg(output_dir)
        .arg(input_path);

    let started = std::time::Instant::now();
    run_command(command, "libreoffice", timeout_secs, cancel).await?;
    tracing::debug!(
        input = %input_path.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "libreoffice conversion finished"
    );

    let input_stem = input_path
        .file_stem()
        .ok_or_else(|| MimepackError::conversion("libreoffice", "invalid input file name"))?;
    let expected_output = output_dir.join(format!("{}.pdf", input_stem.to_string_lossy()));

    let metadata = tokio::fs::metadata(&expected_output).await.map_err(|e| {
        MimepackError::conversion(
            "libreoffice",
            format!("conversion completed but output file not found: {}", e),
        )
    })?;
    if metadata.len() == 0 {
        return Err(MimepackError::conversion("libreoffice", "conversion produced an empty file"));
    }

    Ok(expected_output)
}

fn file_url(path: &Path) -> String {
    let display = path.to_string_lossy().replace('\\', "/");
    if display.starts_with('/') {
        format!("file://{}", display)
    } else {
        format!("file:///{}", display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_binary_is_first_candidate() {
        let configured = PathBuf::from("/opt/custom/soffice");
        let candidates = soffice_candidates(Some(&configured));
        assert_eq!(candidates[0], configured);
    }

    #[test]
    fn test_candidates_are_unique() {
        let candidates = soffice_candidates(None);
        let unique: HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_locate_existing_configured_binary() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("soffice");
        std::fs::write(&fake, b"#!/bin/sh\n").unwrap();
        assert_eq!(locate_soffice_binary(Some(&fake)).unwrap(), fake);
    }

    #[test]
    fn test_missing_dependency_message() {
        let err = MimepackError::MissingDependency(libreoffice_install_message());
        assert!(err.to_string().contains("soffice"));
    }

    #[test]
    fn test_file_url() {
        assert_eq!(file_url(Path::new("/tmp/profile")), "file:///tmp/profile");
        assert_eq!(file_url(Path::new("C:\\temp\\p")), "file:///C:/temp/p");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_with_fake_soffice() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("soffice");
        // Writes "<outdir>/<stem>.pdf" like the real binary.
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ \"$1\" != \"--outdir\" ]; do shift; done\nout=\"$2\"; in=\"$3\"\nb=$(basename \"$in\"); printf '%%PDF-1.4 fake' > \"$out/${b%.*}.pdf\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("note.txt");
        std::fs::write(&input, b"hello").unwrap();
        let out_dir = dir.path().join("out");

        let produced = convert_to_pdf(&fake, &input, &out_dir, 10, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(produced, out_dir.join("note.pdf"));
        assert!(std::fs::read(&produced).unwrap().starts_with(b"%PDF"));
    }
}
