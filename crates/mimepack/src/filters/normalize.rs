//! Transfer-encoding and charset normalisation for text leaves.
//!
//! Steps, in order:
//!
//! 1. a declared quoted-printable encoding is decoded, otherwise undeclared
//!    quoted-printable is detected by content;
//! 2. bodies that are base64 text in disguise ("bork") are unwrapped;
//! 3. plain text in any other charset is re-encoded as UTF-8 and its
//!    `charset` parameter updated.
//!
//! HTML keeps its charset since the document may declare it in a `<meta>`
//! tag. Untouched parts pass through as-is; changed parts are new copies.

use super::{FilterStage, forward};
use crate::Result;
use crate::core::config::TextConfig;
use crate::core::session::WalkContext;
use crate::text::{decode_quoted_printable, looks_like_legacy_qp, repair_bork, to_utf8};
use crate::types::Part;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct NormalizeStage {
    config: TextConfig,
}

impl NormalizeStage {
    pub fn from_config(config: &TextConfig) -> Self {
        Self { config: config.clone() }
    }

    fn normalize(&self, ctx: &WalkContext, part: Part) -> Result<Part> {
        if !part.media_type.is_text() && !part.media_type.is_html() {
            return Ok(part);
        }

        let original = part.body.to_vec()?;
        let mut data = original.clone();
        let mut media_type = part.media_type.clone();
        let mut header = part.header.clone();
        let mut steps: Vec<&str> = Vec::new();

        let declared_qp = header
            .get("Content-Transfer-Encoding")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("quoted-printable"));
        if declared_qp {
            data = decode_quoted_printable(&data);
            header.remove("Content-Transfer-Encoding");
            steps.push("quoted-printable");
        } else if looks_like_legacy_qp(&data, self.config.qp_sniff_window, self.config.qp_min_escapes) {
            data = decode_quoted_printable(&data);
            steps.push("legacy-qp");
        }

        if let Some(repaired) = repair_bork(&data, self.config.bork_sniff_window, self.config.bork_min_lines) {
            data = repaired;
            steps.push("bork");
        }

        if !media_type.is_html()
            && let Some(converted) = to_utf8(&data, media_type.charset())
        {
            data = converted;
            media_type.set_param("charset", "utf-8");
            steps.push("charset");
        }

        if steps.is_empty() || (data == original && media_type == part.media_type) {
            return Ok(part);
        }

        tracing::debug!(sequence = part.sequence, steps = ?steps, "text normalized");
        if media_type != part.media_type {
            header.set("Content-Type", media_type.to_string());
        }

        let mut normalized = part.with_body(ctx.session().body(data)?);
        normalized.media_type = media_type;
        normalized.header = header;
        Ok(normalized)
    }
}

#[async_trait]
impl FilterStage for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn run(&self, ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        while let Some(part) = input.recv().await {
            let sequence = part.sequence;
            let fallback = part.clone();
            let part = match self.normalize(&ctx, part) {
                Ok(part) => part,
                Err(e) => {
                    ctx.report(format!("part {}: text normalization failed: {}", sequence, e));
                    fallback
                }
            };
            if !forward(&output, part).await {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::{context, part, run_stage};

    fn stage() -> NormalizeStage {
        NormalizeStage::from_config(&TextConfig::default())
    }

    #[tokio::test]
    async fn test_declared_qp_and_latin1() {
        let mut p = part(1, "text/plain; charset=iso-8859-1", b"caf=E9 cr=E8me");
        p.header.append("Content-Transfer-Encoding", "quoted-printable");
        let original = p.clone();

        let out = run_stage(&stage(), context(), vec![p]).await;
        assert_eq!(out[0].body.to_vec().unwrap(), "café crème".as_bytes());
        assert_eq!(out[0].media_type.charset(), Some("utf-8"));
        assert!(out[0].header.get("Content-Transfer-Encoding").is_none());

        // Copy-on-transform: the input part is untouched.
        assert_eq!(original.body.to_vec().unwrap(), b"caf=E9 cr=E8me");
    }

    #[tokio::test]
    async fn test_bork_repaired() {
        use base64::Engine;
        let text = "This message was wrapped in base64 twice by a broken gateway.\n".repeat(3);
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        let wrapped: String = encoded
            .as_bytes()
            .chunks(60)
            .map(|c| format!("{}\r\n", String::from_utf8_lossy(c)))
            .collect();

        let out = run_stage(&stage(), context(), vec![part(1, "text/plain; charset=utf-8", wrapped.as_bytes())]).await;
        assert_eq!(out[0].body.to_vec().unwrap(), text.as_bytes());
    }

    #[tokio::test]
    async fn test_plain_utf8_and_binary_untouched() {
        let out = run_stage(
            &stage(),
            context(),
            vec![
                part(1, "text/plain; charset=utf-8", "déjà vu".as_bytes()),
                part(2, "image/png", b"\x89PNG=E9=E9=E9=\n"),
            ],
        )
        .await;
        assert_eq!(out[0].body.to_vec().unwrap(), "déjà vu".as_bytes());
        assert_eq!(out[1].body.to_vec().unwrap(), b"\x89PNG=E9=E9=E9=\n");
    }

    #[tokio::test]
    async fn test_html_charset_kept() {
        let mut p = part(1, "text/html; charset=iso-8859-1", b"<p>caf=E9</p>");
        p.header.append("Content-Transfer-Encoding", "quoted-printable");
        let out = run_stage(&stage(), context(), vec![p]).await;
        assert_eq!(out[0].body.to_vec().unwrap(), b"<p>caf\xe9</p>");
        assert_eq!(out[0].media_type.charset(), Some("iso-8859-1"));
    }
}
