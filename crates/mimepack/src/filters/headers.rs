//! Header block injection.
//!
//! Converters only see a body, so the message's From/To/Cc/Subject/Date would
//! be lost. This stage writes them into the body itself: as leading lines for
//! plain text, and just inside `<body>` for HTML. HTML without a `<body>` tag
//! is first rebuilt into a doctype/head/body skeleton, since strict renderers
//! drop anything outside the document element.
//!
//! The header source is the part itself when it carries transport headers
//! (a single-part message), else its nearest ancestor that does. Explicit
//! attachments are left alone.

use super::{FilterStage, forward};
use crate::Result;
use crate::core::session::{LineageRecord, WalkContext};
use crate::types::{HeaderMap, Part};
use async_trait::async_trait;
use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;

const INJECTED_HEADERS: [&str; 5] = ["From", "To", "Cc", "Subject", "Date"];

static BODY_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<body\b[^>]*>").expect("Body tag regex pattern is valid and should compile"));

static HEAD_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<head\b[^>]*>.*?</head\s*>").expect("Head element regex pattern is valid and should compile")
});

static DOCUMENT_WRAPPER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<!doctype[^>]*>|</?html\b[^>]*>|</body\s*>")
        .expect("Document wrapper regex pattern is valid and should compile")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderStage;

impl HeaderStage {
    fn inject(&self, ctx: &WalkContext, part: Part) -> Result<Part> {
        let is_html = part.media_type.is_html();
        if !is_html && !part.media_type.is_text() {
            return Ok(part);
        }
        if is_attachment(&part.header) {
            return Ok(part);
        }

        let Some(source) = header_source(ctx, &part) else {
            return Ok(part);
        };
        let lines = header_lines(&source);
        if lines.is_empty() {
            return Ok(part);
        }

        let body = part.body.to_vec()?;
        let mut media_type = part.media_type.clone();
        let injected = if is_html {
            inject_html(&body, &lines)
        } else {
            let block = text_block(&lines);
            let encoded = match media_type.charset().and_then(|c| Encoding::for_label(c.as_bytes())) {
                Some(encoding) if encoding != encoding_rs::UTF_8 => encoding.encode(&block).0.into_owned(),
                _ => {
                    if !block.is_ascii() && media_type.charset().is_none() {
                        media_type.set_param("charset", "utf-8");
                    }
                    block.into_bytes()
                }
            };
            let mut out = encoded;
            out.extend_from_slice(&body);
            out
        };

        tracing::debug!(sequence = part.sequence, headers = lines.len(), html = is_html, "header block injected");
        let mut injected_part = part.with_body(ctx.session().body(injected)?);
        if media_type != part.media_type {
            injected_part.header.set("Content-Type", media_type.to_string());
            injected_part.media_type = media_type;
        }
        Ok(injected_part)
    }
}

#[async_trait]
impl FilterStage for HeaderStage {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn run(&self, ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        while let Some(part) = input.recv().await {
            let sequence = part.sequence;
            let original = part.clone();
            let part = self.inject(&ctx, part).unwrap_or_else(|e| {
                ctx.report(format!("part {}: header injection failed: {}", sequence, e));
                original
            });
            if !forward(&output, part).await {
                break;
            }
        }
        Ok(())
    }
}

fn carries_transport_headers(header: &HeaderMap) -> bool {
    header.contains("From") || header.contains("Subject")
}

fn is_attachment(header: &HeaderMap) -> bool {
    header
        .get("Content-Disposition")
        .and_then(|v| v.split(';').next())
        .is_some_and(|d| d.trim().eq_ignore_ascii_case("attachment"))
}

fn header_source(ctx: &WalkContext, part: &Part) -> Option<HeaderMap> {
    if carries_transport_headers(&part.header) {
        return Some(part.header.clone());
    }
    let matches = |record: &LineageRecord| carries_transport_headers(&record.header);
    let parent = part.parent?;
    let lineage = ctx.lineage();
    match lineage.get(parent) {
        Some(record) if matches(&record) => Some(record.header),
        _ => lineage.nearest_ancestor(parent, matches).map(|record| record.header),
    }
}

/// `(name, value)` for each present header, unfolded.
///
/// Values arrive already decoded from the walker.
fn header_lines(header: &HeaderMap) -> Vec<(&'static str, String)> {
    INJECTED_HEADERS
        .iter()
        .filter_map(|name| {
            let values: Vec<String> = header
                .get_all(name)
                .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|v| !v.is_empty())
                .collect();
            (!values.is_empty()).then(|| (*name, values.join(", ")))
        })
        .collect()
}

fn text_block(lines: &[(&str, String)]) -> String {
    let mut block: String = lines.iter().map(|(name, value)| format!("{}: {}\n", name, value)).collect();
    block.push('\n');
    block
}

/// ASCII-only HTML escaping, so the block fits any ASCII-compatible charset.
fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c if c.is_ascii() => out.push(c),
            c => out.push_str(&format!("&#{};", c as u32)),
        }
    }
    out
}

fn html_block(lines: &[(&str, String)]) -> String {
    let mut block = String::from("<div class=\"mimepack-headers\">\n");
    for (name, value) in lines {
        block.push_str(&format!("<b>{}:</b> {}<br>\n", name, escape_html(value)));
    }
    block.push_str("</div>\n<hr>\n");
    block
}

fn inject_html(document: &[u8], lines: &[(&str, String)]) -> Vec<u8> {
    let block = html_block(lines);

    if let Some(body_tag) = BODY_OPEN.find(document) {
        let mut out = Vec::with_capacity(document.len() + block.len());
        out.extend_from_slice(&document[..body_tag.end()]);
        out.extend_from_slice(block.as_bytes());
        out.extend_from_slice(&document[body_tag.end()..]);
        return out;
    }

    let head = HEAD_ELEMENT.find(document).map(|m| m.as_bytes().to_vec());
    let without_head = HEAD_ELEMENT.replace(document, &b""[..]);
    let content = DOCUMENT_WRAPPER.replace_all(&without_head, &b""[..]);

    let mut out = Vec::with_capacity(document.len() + block.len() + 64);
    out.extend_from_slice(b"<!DOCTYPE html>\n<html>\n");
    out.extend_from_slice(head.as_deref().unwrap_or(&b"<head></head>"[..]));
    out.extend_from_slice(b"\n<body>\n");
    out.extend_from_slice(block.as_bytes());
    out.extend_from_slice(content.trim_ascii());
    out.extend_from_slice(b"\n</body>\n</html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{context, part, run_stage};
    use crate::types::{Body, MediaType};

    fn message_root(ctx: &WalkContext) {
        let mut header = HeaderMap::new();
        header.append("From", "Alice <alice@example.com>");
        header.append("To", "Bob <bob@example.com>");
        header.append("Subject", "Café plans");
        let root = Part {
            sequence: 0,
            level: 0,
            parent: None,
            media_type: MediaType::new("multipart/mixed"),
            header,
            body: Body::empty(),
            file_name: None,
            fallback: None,
        };
        ctx.lineage().record(&root);
    }

    fn text_of(part: &Part) -> String {
        String::from_utf8(part.body.to_vec().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_plain_text_gets_leading_block() {
        let ctx = context();
        message_root(&ctx);
        let out = run_stage(&HeaderStage, ctx, vec![part(1, "text/plain; charset=utf-8", b"See you there.")]).await;
        assert_eq!(
            text_of(&out[0]),
            "From: Alice <alice@example.com>\nTo: Bob <bob@example.com>\nSubject: Café plans\n\nSee you there."
        );
    }

    #[tokio::test]
    async fn test_html_block_inside_body() {
        let ctx = context();
        message_root(&ctx);
        let html = b"<!DOCTYPE html><html><head><title>t</title></head><body class=\"x\"><p>Hi</p></body></html>";
        let out = run_stage(&HeaderStage, ctx, vec![part(1, "text/html", html)]).await;
        let text = text_of(&out[0]);

        let body_at = text.find("<body class=\"x\">").unwrap();
        let block_at = text.find("<div class=\"mimepack-headers\">").unwrap();
        assert!(block_at > body_at);
        assert!(text.contains("Alice &lt;alice@example.com&gt;"));
        assert!(text.contains("Caf&#233; plans"));
        assert!(text.is_ascii());
    }

    #[tokio::test]
    async fn test_legacy_html_rebuilt_into_skeleton() {
        let ctx = context();
        message_root(&ctx);
        let html = b"<HTML><HEAD><TITLE>old</TITLE></HEAD><P>Hello</P></HTML>";
        let out = run_stage(&HeaderStage, ctx, vec![part(1, "text/html", html)]).await;
        let text = text_of(&out[0]);

        assert!(text.starts_with("<!DOCTYPE html>\n<html>\n<HEAD><TITLE>old</TITLE></HEAD>\n<body>\n"));
        assert!(text.contains("</div>\n<hr>\n<P>Hello</P>\n</body>"));
        assert_eq!(text.matches("<HTML>").count(), 0);
    }

    #[tokio::test]
    async fn test_single_part_message_uses_own_header() {
        let ctx = context();
        let mut p = part(0, "text/plain", b"body");
        p.level = 0;
        p.parent = None;
        p.header.append("Subject", "Solo");
        let out = run_stage(&HeaderStage, ctx, vec![p]).await;
        assert_eq!(text_of(&out[0]), "Subject: Solo\n\nbody");
    }

    #[tokio::test]
    async fn test_untouched_without_headers_or_for_attachments() {
        let ctx = context();
        let out = run_stage(&HeaderStage, ctx.clone(), vec![part(1, "text/plain", b"orphan")]).await;
        assert_eq!(text_of(&out[0]), "orphan");

        message_root(&ctx);
        let mut attachment = part(2, "text/plain", b"notes");
        attachment.header.append("Content-Disposition", "attachment; filename=notes.txt");
        let out = run_stage(&HeaderStage, ctx, vec![attachment, part(3, "image/png", b"\x89PNG")]).await;
        assert_eq!(text_of(&out[0]), "notes");
        assert_eq!(out[1].body.to_vec().unwrap(), b"\x89PNG");
    }
}
