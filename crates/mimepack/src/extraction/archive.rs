//! Container member enumeration.
//!
//! Zip, tar and gzip are read in-process; rar and 7z go through an external
//! unpacker (`bsdtar` by default); Outlook `.msg` files are split into a
//! synthetic text part plus one member per attachment.
//!
//! Readers skip noise entries silently and report oversized or unreadable
//! members to the sink without stopping, so one bad member never hides its
//! siblings. Only a container that cannot be opened at all is an error.

use crate::core::config::ArchiveConfig;
use crate::core::io::{is_noise_entry, traverse_directory};
use crate::core::mime::{self, GZIP_MIME_TYPE, MSG_MIME_TYPE, PLAIN_TEXT_MIME_TYPE, TAR_MIME_TYPE};
use crate::core::session::ConversionSession;
use crate::types::{Body, HeaderMap};
use crate::utils::process::run_command;
use crate::{MimepackError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use tokio::process::Command;
use zip::ZipArchive;

/// One member pulled out of a container.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Path inside the container.
    pub name: String,
    /// Type declared by the container, if it records one.
    pub content_type: Option<String>,
    pub body: Body,
}

impl ArchiveMember {
    fn new(name: impl Into<String>, body: Body) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Tar,
    Gzip,
    /// Unpacked by the configured external tool.
    External,
    Msg,
}

impl ContainerKind {
    pub fn of(content_type: &str) -> Option<Self> {
        match content_type {
            mime::ZIP_MIME_TYPE | "application/x-zip-compressed" => Some(Self::Zip),
            TAR_MIME_TYPE | "application/tar" | "application/x-gtar" | "application/x-ustar" => Some(Self::Tar),
            GZIP_MIME_TYPE | "application/x-gzip" => Some(Self::Gzip),
            mime::RAR_MIME_TYPE | "application/x-rar-compressed" | mime::SEVEN_Z_MIME_TYPE => Some(Self::External),
            MSG_MIME_TYPE => Some(Self::Msg),
            _ => None,
        }
    }
}

/// Receives members one at a time. Returning an error stops enumeration.
pub type MemberSink<'a> = dyn FnMut(Result<ArchiveMember>) -> Result<()> + 'a;

/// Enumerate an in-process container (zip, tar or gzip).
pub fn read_members(
    kind: ContainerKind,
    body: &Body,
    file_name: Option<&str>,
    session: &ConversionSession,
    sink: &mut MemberSink<'_>,
) -> Result<()> {
    let limits = &session.config().archive;
    match kind {
        ContainerKind::Zip => match body.path() {
            Some(path) => read_zip(ZipArchive::new(File::open(path)?)?, limits, session, sink),
            None => read_zip(ZipArchive::new(Cursor::new(body.to_vec()?))?, limits, session, sink),
        },
        ContainerKind::Tar => read_tar(body.open()?, limits, session, sink),
        ContainerKind::Gzip => read_gzip(body, file_name, limits, session, sink),
        ContainerKind::External | ContainerKind::Msg => Err(MimepackError::UnsupportedFormat(format!(
            "{:?} containers are not read in-process",
            kind
        ))),
    }
}

fn read_bounded(reader: impl Read, name: &str, limit: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut data)?;
    if data.len() as u64 > limit {
        return Err(oversized(name, limit));
    }
    Ok(data)
}

fn oversized(name: &str, limit: u64) -> MimepackError {
    MimepackError::validation(format!(
        "archive member '{}' exceeds the {} byte limit and was skipped",
        name, limit
    ))
}

fn read_zip<R: Read + Seek>(
    mut archive: ZipArchive<R>,
    limits: &ArchiveConfig,
    session: &ConversionSession,
    sink: &mut MemberSink<'_>,
) -> Result<()> {
    for i in 0..archive.len() {
        session.check_cancelled()?;
        let member = match archive.by_index(i) {
            Ok(mut file) => {
                let name = file.name().to_string();
                if file.is_dir() || is_noise_entry(&name, &limits.noise_entries) {
                    continue;
                }
                if file.size() > limits.max_member_size {
                    Err(oversized(&name, limits.max_member_size))
                } else {
                    read_bounded(&mut file, &name, limits.max_member_size)
                        .and_then(|data| session.body(data))
                        .map(|body| ArchiveMember::new(name, body))
                }
            }
            Err(e) => Err(MimepackError::parsing(format!("zip member {}: {}", i, e))),
        };
        sink(member)?;
    }
    Ok(())
}

fn read_tar(
    reader: impl Read,
    limits: &ArchiveConfig,
    session: &ConversionSession,
    sink: &mut MemberSink<'_>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| MimepackError::parsing_with_source("Failed to read TAR archive", e))?;

    for entry in entries {
        session.check_cancelled()?;
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // A broken header leaves the stream position undefined.
                sink(Err(MimepackError::parsing(format!("tar entry: {}", e))))?;
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                sink(Err(MimepackError::parsing(format!("tar entry path: {}", e))))?;
                continue;
            }
        };
        if is_noise_entry(&name, &limits.noise_entries) {
            continue;
        }
        let member = if entry.size() > limits.max_member_size {
            Err(oversized(&name, limits.max_member_size))
        } else {
            read_bounded(&mut entry, &name, limits.max_member_size)
                .and_then(|data| session.body(data))
                .map(|body| ArchiveMember::new(name, body))
        };
        sink(member)?;
    }
    Ok(())
}

fn read_gzip(
    body: &Body,
    file_name: Option<&str>,
    limits: &ArchiveConfig,
    session: &ConversionSession,
    sink: &mut MemberSink<'_>,
) -> Result<()> {
    let mut decoder = GzDecoder::new(body.open()?);
    let embedded = decoder
        .header()
        .and_then(|h| h.filename())
        .map(|name| String::from_utf8_lossy(name).into_owned());
    let name = embedded.unwrap_or_else(|| gunzipped_name(file_name.unwrap_or("data.gz")));

    let member = read_bounded(&mut decoder, &name, limits.max_member_size)
        .map_err(|e| match e {
            MimepackError::Io(io) => MimepackError::parsing_with_source("Failed to decompress gzip stream", io),
            other => other,
        })
        .and_then(|data| session.body(data))
        .map(|body| ArchiveMember::new(name, body));
    sink(member)
}

/// `report.tar.gz` -> `report.tar`, `report.tgz` -> `report.tar`.
fn gunzipped_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tgz") {
        format!("{}.tar", &name[..name.len() - 4])
    } else if lower.ends_with(".gz") {
        name[..name.len() - 3].to_string()
    } else {
        name.to_string()
    }
}

/// Unpack a container with the configured external tool.
///
/// The tool is invoked as `<unpacker> -xf <source> -C <dir>`. Members are
/// read back from the scratch directory in path order.
pub async fn unpack_external(body: &Body, file_name: Option<&str>, session: &ConversionSession) -> Result<Vec<Result<ArchiveMember>>> {
    let limits = &session.config().archive;
    let source = match body.path() {
        Some(path) => path.to_path_buf(),
        None => {
            let ext = file_name
                .and_then(|n| n.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
                .unwrap_or_else(|| "bin".to_string());
            let path = session.scratch_path(&ext);
            tokio::fs::write(&path, body.to_vec()?).await?;
            path
        }
    };
    let target = session.scratch_dir()?;

    let mut command = Command::new(&limits.external_unpacker);
    command.arg("-xf").arg(&source).arg("-C").arg(&target);
    run_command(
        command,
        &limits.external_unpacker,
        session.config().timeout_secs,
        session.cancel_token(),
    )
    .await?;

    let mut members = Vec::new();
    for path in traverse_directory(&target)? {
        let name = path
            .strip_prefix(&target)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string_lossy().into_owned());
        if is_noise_entry(&name, &limits.noise_entries) {
            continue;
        }
        let member = match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > limits.max_member_size => Err(oversized(&name, limits.max_member_size)),
            Ok(_) => Body::from_path(&path).map(|body| ArchiveMember::new(name, body)),
            Err(e) => Err(e.into()),
        };
        members.push(member);
    }
    Ok(members)
}

/// Split an Outlook message into transport headers and members.
///
/// The first member is the message body as UTF-8 text; attachments follow in
/// their stored order.
pub fn read_msg(body: &Body, session: &ConversionSession) -> Result<(HeaderMap, Vec<Result<ArchiveMember>>)> {
    let data = body.to_vec()?;
    let outlook = msg_parser::Outlook::from_slice(&data)
        .map_err(|e| MimepackError::parsing(format!("Failed to parse MSG file: {}", e)))?;

    let mut header = HeaderMap::new();
    let sender = format_person(&outlook.sender.name, &outlook.sender.email);
    if !sender.is_empty() {
        header.append("From", sender);
    }
    let to = format_people(outlook.to.iter().map(|p| (p.name.as_str(), p.email.as_str())));
    if !to.is_empty() {
        header.append("To", to);
    }
    let cc = format_people(outlook.cc.iter().map(|p| (p.name.as_str(), p.email.as_str())));
    if !cc.is_empty() {
        header.append("Cc", cc);
    }
    if !outlook.subject.is_empty() {
        header.append("Subject", outlook.subject.clone());
    }
    if !outlook.headers.date.is_empty() {
        header.append("Date", outlook.headers.date.clone());
    }

    let mut members = Vec::with_capacity(outlook.attachments.len() + 1);

    let mut text = ArchiveMember::new("message.txt", session.body(outlook.body.clone().into_bytes())?);
    text.content_type = Some(format!("{}; charset=utf-8", PLAIN_TEXT_MIME_TYPE));
    members.push(Ok(text));

    let limit = session.config().archive.max_member_size;
    for (index, attachment) in outlook.attachments.iter().enumerate() {
        let name = if !attachment.file_name.is_empty() {
            attachment.file_name.clone()
        } else if !attachment.display_name.is_empty() {
            attachment.display_name.clone()
        } else {
            format!("attachment{}{}", index + 1, attachment.extension)
        };

        let member = hex::decode(&attachment.payload)
            .map_err(|e| MimepackError::parsing(format!("msg attachment '{}': {}", name, e)))
            .and_then(|data| {
                if data.len() as u64 > limit {
                    Err(oversized(&name, limit))
                } else {
                    session.body(data)
                }
            })
            .map(|body| {
                let mut member = ArchiveMember::new(name, body);
                if !attachment.mime_tag.is_empty() {
                    member.content_type = Some(attachment.mime_tag.clone());
                }
                member
            });
        members.push(member);
    }

    Ok((header, members))
}

fn format_person(name: &str, email: &str) -> String {
    match (name.trim(), email.trim()) {
        ("", "") => String::new(),
        ("", email) => email.to_string(),
        (name, "") => name.to_string(),
        (name, email) if name == email => email.to_string(),
        (name, email) => format!("{} <{}>", name, email),
    }
}

fn format_people<'a>(people: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    people
        .map(|(name, email)| format_person(name, email))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
