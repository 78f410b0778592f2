//! Archive assembly.
//!
//! Items arrive in completion order. The assembler sorts them byte-wise by
//! sanitized archive name, so identical input always produces identical member
//! order, and writes them into a ZIP with fixed timestamps and permissions.
//! When anything went wrong a plain-text manifest is appended under the
//! reserved name [`ERRORS_MANIFEST_NAME`].
//!
//! The destination is written through a temporary file in the same directory
//! and moved into place only once the archive is finished, so a failed call
//! never leaves a truncated archive behind.

use crate::core::io::{NameAllocator, sanitize_archive_name};
use crate::core::mime::PDF_MIME_TYPE;
use crate::types::{ArtifactItem, ArtifactSource, AssemblyReport};
use crate::utils::run_command;
use crate::{MimepackError, Result};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::{CompressionMethod, DateTime};

/// Reserved member name of the error manifest.
pub const ERRORS_MANIFEST_NAME: &str = "errors.txt";

fn member_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

/// Messages for the error manifest: the aggregate first, then per-item errors
/// it does not already mention.
fn manifest_lines(items: &[ArtifactItem], aggregate: Option<&MimepackError>) -> (Vec<String>, bool) {
    let (mut lines, truncated) = match aggregate {
        Some(MimepackError::Aggregate { messages, truncated }) => (messages.clone(), *truncated),
        Some(other) => (vec![other.to_string()], false),
        None => (Vec::new(), false),
    };
    for item in items {
        if let Some(error) = &item.error
            && !lines.iter().any(|line| line.contains(error.as_str()))
        {
            lines.push(format!("{}: {}", item.name(), error));
        }
    }
    (lines, truncated)
}

/// Write `items` into a ZIP on `writer`.
///
/// With `continue_on_error` a member that cannot be read is left out and
/// recorded in the report and the manifest; otherwise the first such failure
/// aborts assembly.
pub fn assemble<W: Write + Seek>(
    writer: W,
    items: &[ArtifactItem],
    aggregate: Option<&MimepackError>,
    continue_on_error: bool,
) -> Result<AssemblyReport> {
    let mut ordered: Vec<(String, &ArtifactItem)> =
        items.iter().map(|item| (sanitize_archive_name(&item.name()), item)).collect();
    ordered.sort_by(|(a, item_a), (b, item_b)| {
        a.as_bytes()
            .cmp(b.as_bytes())
            .then_with(|| item_a.content_type.cmp(&item_b.content_type))
            .then_with(|| item_a.error.cmp(&item_b.error))
    });

    let mut names = NameAllocator::new();
    names.reserve(ERRORS_MANIFEST_NAME);

    let mut zip = ZipWriter::new(writer);
    let mut report = AssemblyReport::default();

    for (name, item) in ordered {
        let name = names.allocate(&name);
        match write_member(&mut zip, &name, item) {
            Ok(bytes) => {
                tracing::trace!(member = %name, bytes, "archive member written");
                if item.is_failure() {
                    report.failed_items += 1;
                }
                report.members.push(name);
            }
            Err(e) if continue_on_error => {
                tracing::warn!(member = %name, error = %e, "archive member skipped");
                report.write_errors.push(format!("{}: {}", name, e));
            }
            Err(e) => return Err(e),
        }
    }

    let (mut lines, truncated) = manifest_lines(items, aggregate);
    lines.extend(report.write_errors.iter().cloned());
    if !lines.is_empty() {
        let mut text = lines.join("\n");
        text.push('\n');
        if truncated {
            text.push_str("(further errors truncated)\n");
        }
        zip.start_file(ERRORS_MANIFEST_NAME, member_options())
            .map_err(|e| MimepackError::Other(format!("cannot add error manifest: {}", e)))?;
        zip.write_all(text.as_bytes())?;
        report.members.push(ERRORS_MANIFEST_NAME.to_string());
        report.manifest_written = true;
    }

    zip.finish()
        .map_err(|e| MimepackError::Other(format!("cannot finish archive: {}", e)))?;

    tracing::debug!(
        members = report.members.len(),
        failed_items = report.failed_items,
        write_errors = report.write_errors.len(),
        "archive assembled"
    );
    Ok(report)
}

fn write_member<W: Write + Seek>(zip: &mut ZipWriter<W>, name: &str, item: &ArtifactItem) -> Result<u64> {
    let mut reader = item.open()?;
    zip.start_file(name, member_options())
        .map_err(|e| MimepackError::Other(format!("cannot add {}: {}", name, e)))?;
    match std::io::copy(&mut reader, zip) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            // Drop the half-written entry so the archive stays consistent.
            let _ = zip.abort_file();
            Err(e.into())
        }
    }
}

/// Assemble into a file at `dest`, replacing it only on success.
pub async fn assemble_to_path(
    dest: &Path,
    items: Vec<ArtifactItem>,
    aggregate: Option<MimepackError>,
    continue_on_error: bool,
) -> Result<AssemblyReport> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<AssemblyReport> {
        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        let report = assemble(file.as_file_mut(), &items, aggregate.as_ref(), continue_on_error)?;
        file.as_file().sync_all()?;
        file.persist(&dest).map_err(|e| MimepackError::Io(e.error))?;
        Ok(report)
    })
    .await
    .map_err(|e| MimepackError::Other(format!("assembly task panicked: {}", e)))?
}

/// On-disk location of an item, materializing in-memory bodies into `scratch`.
fn materialize(item: &ArtifactItem, scratch: &Path, index: usize) -> Result<PathBuf> {
    match &item.source {
        ArtifactSource::Path(path) => Ok(path.clone()),
        ArtifactSource::Body(body) => match body.path() {
            Some(path) => Ok(path.to_path_buf()),
            None => {
                let path = scratch.join(format!("merge-{:04}.pdf", index));
                std::fs::write(&path, body.to_vec()?)?;
                Ok(path)
            }
        },
    }
}

/// Merge the successful PDF items into one document at `dest`.
///
/// Inputs are ordered by sanitized archive name. A single PDF is copied as
/// is; more are joined with `merge_command` (`pdfunite`-style: inputs then
/// output). Returns the number of merged documents.
pub async fn merge_pdfs(
    items: &[ArtifactItem],
    dest: &Path,
    scratch: &Path,
    merge_command: &str,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut pdfs: Vec<(String, &ArtifactItem)> = items
        .iter()
        .filter(|item| !item.is_failure() && item.content_type == PDF_MIME_TYPE)
        .map(|item| (sanitize_archive_name(&item.name()), item))
        .collect();
    pdfs.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

    if pdfs.is_empty() {
        return Err(MimepackError::validation("No PDF output to merge"));
    }

    let inputs = pdfs
        .iter()
        .enumerate()
        .map(|(index, (_, item))| materialize(item, scratch, index))
        .collect::<Result<Vec<_>>>()?;

    if let [single] = inputs.as_slice() {
        tokio::fs::copy(single, dest).await?;
        return Ok(1);
    }

    let mut command = tokio::process::Command::new(merge_command);
    command.args(&inputs).arg(dest);
    run_command(command, merge_command, timeout_secs, cancel).await?;

    if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
        return Err(MimepackError::conversion(merge_command, "merge produced no output"));
    }
    tracing::debug!(documents = inputs.len(), dest = %dest.display(), "PDFs merged");
    Ok(inputs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Body;
    use std::io::{Cursor, Read};

    fn ok(name: &str, data: &[u8]) -> ArtifactItem {
        ArtifactItem {
            source: ArtifactSource::Body(Body::from_vec(data.to_vec())),
            archive_name: Some(name.to_string()),
            content_type: PDF_MIME_TYPE.to_string(),
            error: None,
        }
    }

    fn member_names(archive: &[u8]) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        (0..zip.len()).map(|i| zip.by_index(i).unwrap().name().to_string()).collect()
    }

    fn assemble_bytes(items: &[ArtifactItem], aggregate: Option<&MimepackError>) -> (Vec<u8>, AssemblyReport) {
        let mut cursor = Cursor::new(Vec::new());
        let report = assemble(&mut cursor, items, aggregate, true).unwrap();
        (cursor.into_inner(), report)
    }

    #[test]
    fn test_order_independent_of_arrival() {
        let a = vec![ok("0002-b.pdf", b"b"), ok("0001-a.pdf", b"a"), ok("0010-c.pdf", b"c")];
        let b = vec![ok("0010-c.pdf", b"c"), ok("0002-b.pdf", b"b"), ok("0001-a.pdf", b"a")];

        let (first, _) = assemble_bytes(&a, None);
        let (second, _) = assemble_bytes(&b, None);
        assert_eq!(member_names(&first), vec!["0001-a.pdf", "0002-b.pdf", "0010-c.pdf"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_failures_get_manifest() {
        let items = vec![
            ok("0001-a.pdf", b"a"),
            ArtifactItem::failed(Body::from_vec(b"raw".to_vec()), "0002-blob.bin", "application/x-thing", "no converter"),
        ];
        let (archive, report) = assemble_bytes(&items, None);

        assert_eq!(member_names(&archive), vec!["0001-a.pdf", "0002-blob.bin", ERRORS_MANIFEST_NAME]);
        assert_eq!(report.failed_items, 1);
        assert!(report.manifest_written);

        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut manifest = String::new();
        zip.by_name(ERRORS_MANIFEST_NAME).unwrap().read_to_string(&mut manifest).unwrap();
        assert!(manifest.contains("0002-blob.bin: no converter"));
    }

    #[test]
    fn test_reserved_and_duplicate_names() {
        let items = vec![ok("errors.txt", b"x"), ok("dup.pdf", b"1"), ok("dup.pdf", b"2")];
        let (archive, report) = assemble_bytes(&items, None);
        assert_eq!(member_names(&archive), vec!["dup.pdf", "dup-1.pdf", "errors-1.txt"]);
        assert!(!report.manifest_written);
    }

    #[test]
    fn test_unreadable_item_recorded_and_skipped() {
        let items = vec![
            ok("0001-a.pdf", b"a"),
            ArtifactItem::from_path("/nonexistent/mimepack/missing.pdf", "0002-gone.pdf", PDF_MIME_TYPE),
        ];
        let (archive, report) = assemble_bytes(&items, None);
        assert_eq!(member_names(&archive), vec!["0001-a.pdf", ERRORS_MANIFEST_NAME]);
        assert_eq!(report.write_errors.len(), 1);

        let mut cursor = Cursor::new(Vec::new());
        assert!(assemble(&mut cursor, &items, None, false).is_err());
    }

    #[test]
    fn test_truncated_aggregate_noted() {
        let aggregate = MimepackError::Aggregate {
            messages: vec!["first problem".to_string()],
            truncated: true,
        };
        let (archive, report) = assemble_bytes(&[ok("a.pdf", b"a")], Some(&aggregate));
        assert!(report.manifest_written);

        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut manifest = String::new();
        zip.by_name(ERRORS_MANIFEST_NAME).unwrap().read_to_string(&mut manifest).unwrap();
        assert_eq!(manifest, "first problem\n(further errors truncated)\n");
    }

    #[tokio::test]
    async fn test_assemble_to_path_replaces_only_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.zip");
        let report = assemble_to_path(&dest, vec![ok("a.pdf", b"a")], None, true).await.unwrap();
        assert_eq!(report.members, vec!["a.pdf"]);
        assert!(dest.exists());

        let missing = ArtifactItem::from_path(dir.path().join("missing.pdf"), "b.pdf", PDF_MIME_TYPE);
        let before = std::fs::read(&dest).unwrap();
        assert!(assemble_to_path(&dest, vec![missing], None, false).await.is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), before);
    }

    #[tokio::test]
    async fn test_merge_single_pdf_copied() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("merged.pdf");
        let items = vec![
            ok("0001-a.pdf", b"%PDF-1.4 a"),
            ArtifactItem::failed(Body::from_vec(b"x".to_vec()), "0002-x.bin", "application/x", "nope"),
        ];
        let merged = merge_pdfs(&items, &dest, dir.path(), "pdfunite", 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(merged, 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.4 a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_merge_runs_command_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-merge.sh");
        // Concatenates its inputs into the last argument.
        std::fs::write(
            &script,
            "#!/bin/sh\nout=\"\"\nfor a in \"$@\"; do out=\"$a\"; done\n: > \"$out\"\nwhile [ $# -gt 1 ]; do cat \"$1\" >> \"$out\"; shift; done\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dest = dir.path().join("merged.pdf");
        let items = vec![ok("0002-b.pdf", b"B"), ok("0001-a.pdf", b"A")];
        let merged = merge_pdfs(
            &items,
            &dest,
            dir.path(),
            script.to_str().unwrap(),
            5,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(merged, 2);
        assert_eq!(std::fs::read(&dest).unwrap(), b"AB");
    }
}
