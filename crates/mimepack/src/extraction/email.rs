//! Mail tree walker.
//!
//! Decomposes a root document into an ordered stream of [`Part`]s. Input whose
//! leading bytes form a mail header block is parsed with `mail-parser` and its
//! multipart tree is visited depth-first in declaration order; anything else
//! becomes a single opaque leaf.
//!
//! Multipart containers are recorded in the walk's lineage but not emitted,
//! so downstream stages only ever see leaves. Nested `message/rfc822` parts
//! are emitted as leaves carrying the raw nested message; expanding them is
//! the orchestrator's job.
//!
//! Parsing runs on the blocking pool and hands parts over a bounded channel,
//! so the first filter stage starts before the walk finishes.

use crate::core::mime::{EML_MIME_TYPE, OCTET_STREAM_MIME_TYPE, PLAIN_TEXT_MIME_TYPE, is_mail};
use crate::core::session::WalkContext;
use crate::core::sniff::{SNIFF_WINDOW, looks_like_mail, standard_sniffer, starts_with_header_field};
use crate::types::{Body, HeaderMap, MediaType, Part};
use crate::{MimepackError, Result};
use mail_parser::{Addr, Address, HeaderName, HeaderValue, MessageParser, MessagePart, MimeHeaders, PartType};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Parts declaring at most this many bytes may come up short without an error.
const SMALL_PART_BYTES: u64 = 4096;

/// What the walker starts from.
#[derive(Debug, Clone)]
pub struct WalkInput {
    pub body: Body,
    pub media_type: MediaType,
    pub file_name: Option<String>,
}

/// Start walking `input` in the background.
///
/// The returned receiver yields leaves in traversal order and closes when the
/// walk finishes, fails or is cancelled.
pub fn spawn_walk(ctx: Arc<WalkContext>, input: WalkInput, capacity: usize) -> (mpsc::Receiver<Part>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let guard = ctx.session().enter_stage("walker");
    let handle = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        match walk(&ctx, input, &tx) {
            Ok(()) | Err(MimepackError::Cancelled) => {}
            Err(e) => ctx.report(format!("walk failed: {}", e)),
        }
    });
    (rx, handle)
}

/// Walk `input`, sending every leaf to `tx`.
///
/// Only cancellation or a closed receiver stop the walk early; structural
/// problems are reported on the session and the walk goes on.
pub fn walk(ctx: &WalkContext, input: WalkInput, tx: &mpsc::Sender<Part>) -> Result<()> {
    let mut root = Part {
        sequence: ctx.next_sequence(),
        level: 0,
        parent: None,
        media_type: input.media_type,
        header: HeaderMap::new(),
        body: input.body,
        file_name: input.file_name,
        fallback: None,
    };
    ctx.classify(&mut root)?;

    // Descend on what the bytes look like, not on the label they came with.
    let prefix = root.body.prefix(SNIFF_WINDOW)?;
    let declared_mail = is_mail(root.content_type());
    if !looks_like_mail(&prefix) && !(declared_mail && starts_with_header_field(&prefix)) {
        if declared_mail {
            let sniffed = standard_sniffer(ctx.config().sniff_mode)
                .sniff(&prefix)
                .unwrap_or_else(|_| OCTET_STREAM_MIME_TYPE.to_string());
            tracing::debug!(
                sequence = root.sequence,
                resolved = %sniffed,
                "declared message has no header block"
            );
            root.media_type = root.media_type.with_essence(&sniffed);
        }
        return emit(ctx, tx, root);
    }

    let data = root.body.to_vec()?;
    let Some(message) = MessageParser::default().parse(&data[..]) else {
        ctx.report(format!(
            "part {}: declared as {} but could not be parsed as a message",
            root.sequence,
            root.content_type()
        ));
        return emit(ctx, tx, root);
    };
    if message.parts.is_empty() {
        return emit(ctx, tx, root);
    }

    let walker = Walker {
        ctx,
        tx,
        raw: &data,
        parts: &message.parts,
    };
    walker.visit(0, root.sequence, None, 0, false)
}

fn emit(ctx: &WalkContext, tx: &mpsc::Sender<Part>, part: Part) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(MimepackError::Cancelled);
    }
    ctx.lineage().record(&part);
    tracing::trace!(
        sequence = part.sequence,
        level = part.level,
        content_type = part.content_type(),
        "walker emitted part"
    );
    // A closed receiver means the pipeline is shutting down.
    tx.blocking_send(part).map_err(|_| MimepackError::Cancelled)
}

struct Walker<'a, 'x> {
    ctx: &'a WalkContext,
    tx: &'a mpsc::Sender<Part>,
    raw: &'a [u8],
    parts: &'a [MessagePart<'x>],
}

impl Walker<'_, '_> {
    fn visit(&self, id: usize, sequence: u64, parent: Option<u64>, level: u32, in_digest: bool) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Err(MimepackError::Cancelled);
        }
        let Some(part) = self.parts.get(id) else {
            self.ctx.report(format!("part {}: dangling multipart reference {}", sequence, id));
            return Ok(());
        };

        let header = self.header_block(part);
        let default_type = if in_digest { EML_MIME_TYPE } else { PLAIN_TEXT_MIME_TYPE };
        let media_type = header
            .get("Content-Type")
            .map(MediaType::parse)
            .filter(|m| !m.essence.is_empty())
            .unwrap_or_else(|| MediaType::new(default_type));

        if let PartType::Multipart(children) = &part.body {
            let is_digest = media_type.essence == "multipart/digest";
            let container = Part {
                sequence,
                level,
                parent,
                media_type,
                header,
                body: Body::empty(),
                file_name: None,
                fallback: None,
            };
            self.ctx.lineage().record(&container);

            for child in children {
                let child_sequence = self.ctx.next_sequence();
                self.visit(*child as usize, child_sequence, Some(sequence), level + 1, is_digest)?;
            }
            return Ok(());
        }

        let mut leaf = Part {
            sequence,
            level,
            parent,
            media_type,
            header,
            body: Body::empty(),
            file_name: part.attachment_name().map(str::to_string),
            fallback: None,
        };
        leaf.body = self.leaf_body(part, &mut leaf)?;
        self.ctx.classify(&mut leaf)?;
        emit(self.ctx, self.tx, leaf)
    }

    /// Header fields of `part` in declaration order.
    ///
    /// Free text, address and date fields take mail-parser's decoded values, so
    /// encoded words never reach later stages. Everything else keeps its raw
    /// text, unfolded.
    fn header_block(&self, part: &MessagePart<'_>) -> HeaderMap {
        let mut header = HeaderMap::new();
        for field in part.headers() {
            let value = match &field.value {
                HeaderValue::Text(text) if is_free_text(&field.name) => text.to_string(),
                HeaderValue::Address(address) => render_address(address),
                HeaderValue::DateTime(date) => date.to_rfc822(),
                _ => {
                    let raw = self
                        .raw
                        .get(field.offset_start as usize..field.offset_end as usize)
                        .unwrap_or_default();
                    String::from_utf8_lossy(raw).split_whitespace().collect::<Vec<_>>().join(" ")
                }
            };
            header.append(field.name.as_str(), value);
        }
        header
    }

    fn leaf_body(&self, part: &MessagePart<'_>, leaf: &mut Part) -> Result<Body> {
        if part.is_encoding_problem {
            let declared = declared_size(&leaf.header);
            if declared.is_some_and(|size| size <= SMALL_PART_BYTES) {
                return self.ctx.session().body(part.contents().to_vec());
            }
            self.ctx.report(format!(
                "part {}: undecodable {} body skipped",
                leaf.sequence,
                leaf.content_type()
            ));
            return Ok(Body::empty());
        }

        let data = match &part.body {
            PartType::Text(_) | PartType::Html(_) if is_quoted_printable(&leaf.header) => {
                // Decoded by the normalisation stage, in the declared charset.
                let start = part.raw_body_offset() as usize;
                let end = part.raw_end_offset() as usize;
                self.raw.get(start..end).unwrap_or_default().to_vec()
            }
            PartType::Text(text) | PartType::Html(text) => {
                leaf.media_type.set_param("charset", "utf-8");
                leaf.header.remove("Content-Transfer-Encoding");
                text.as_bytes().to_vec()
            }
            PartType::Message(_) => {
                if !is_mail(&leaf.media_type.essence) {
                    leaf.media_type = leaf.media_type.with_essence(EML_MIME_TYPE);
                }
                leaf.header.remove("Content-Transfer-Encoding");
                part.contents().to_vec()
            }
            PartType::Binary(_) | PartType::InlineBinary(_) | PartType::Multipart(_) => {
                leaf.header.remove("Content-Transfer-Encoding");
                part.contents().to_vec()
            }
        };
        self.ctx.session().body(data)
    }
}

fn is_free_text(name: &HeaderName<'_>) -> bool {
    matches!(
        name,
        HeaderName::Subject | HeaderName::Comments | HeaderName::ContentDescription
    )
}

fn render_addr(addr: &Addr<'_>) -> String {
    match (addr.name.as_deref(), addr.address.as_deref()) {
        (Some(name), Some(address)) => format!("{} <{}>", name, address),
        (Some(only), None) | (None, Some(only)) => only.to_string(),
        (None, None) => String::new(),
    }
}

fn render_list(addrs: &[Addr<'_>]) -> String {
    addrs
        .iter()
        .map(render_addr)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_address(address: &Address<'_>) -> String {
    match address {
        Address::List(addrs) => render_list(addrs),
        Address::Group(groups) => groups
            .iter()
            .map(|group| match group.name.as_deref() {
                Some(name) => format!("{}: {};", name, render_list(&group.addresses)),
                None => render_list(&group.addresses),
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn is_quoted_printable(header: &HeaderMap) -> bool {
    header
        .get("Content-Transfer-Encoding")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("quoted-printable"))
}

fn declared_size(header: &HeaderMap) -> Option<u64> {
    header
        .get("Content-Disposition")
        .map(MediaType::parse)
        .and_then(|d| d.param("size").and_then(|s| s.trim().parse().ok()))
        .or_else(|| header.get("Content-Length").and_then(|s| s.trim().parse().ok()))
}
