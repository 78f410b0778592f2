//! multipart/alternative and multipart/related assembly.
//!
//! Parts under a multipart/alternative or multipart/related container are
//! held until the walk leaves that container; the walker is depth-first, so
//! the first part outside it closes the batch. Other parts pass straight
//! through, except Content-ID images, which wait for a later HTML body until
//! the input closes.
//!
//! - An HTML body and a plain-text body that are alternatives of each other
//!   collapse into the HTML part, with the text kept as its conversion fallback.
//! - `cid:` references in HTML are replaced by `data:` URIs built from the
//!   matching image part. Images nobody references are emitted on their own.

use super::{FilterStage, forward};
use crate::Result;
use crate::core::mime;
use crate::core::sniff::{SNIFF_WINDOW, standard_sniffer};
use crate::core::session::WalkContext;
use crate::types::Part;
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::sync::Arc;
use tokio::sync::mpsc;

const ALTERNATIVE_MIME_TYPE: &str = "multipart/alternative";
const RELATED_MIME_TYPE: &str = "multipart/related";

static CID_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(src|background)(\s*=\s*)(?:"cid:([^"]+)"|'cid:([^']+)'|cid:([^\s>"']+))"#)
        .expect("CID reference regex pattern is valid and should compile")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct RelatedStage;

#[async_trait]
impl FilterStage for RelatedStage {
    fn name(&self) -> &'static str {
        "related"
    }

    async fn run(&self, ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        let mut batch: Vec<Part> = Vec::new();
        let mut batch_group = None;
        let mut loose_images: Vec<Part> = Vec::new();

        while let Some(part) = input.recv().await {
            let group = outer_group(&ctx, &part);
            if group != batch_group && !batch.is_empty() {
                let closed = std::mem::take(&mut batch);
                if !flush(&ctx, closed, &mut loose_images, &output).await {
                    return Ok(());
                }
            }
            batch_group = group;

            if group.is_some() {
                batch.push(part);
            } else if mime::is_image(part.content_type()) && part.content_id().is_some() {
                loose_images.push(part);
            } else if !flush(&ctx, vec![part], &mut loose_images, &output).await {
                return Ok(());
            }
        }
        ctx.session().check_cancelled()?;

        if !flush(&ctx, batch, &mut loose_images, &output).await {
            return Ok(());
        }
        loose_images.sort_by_key(|part| part.sequence);
        for image in loose_images {
            if !forward(&output, image).await {
                break;
            }
        }
        Ok(())
    }
}

/// Assemble `batch` and forward the result. `false` once the receiver is gone.
async fn flush(ctx: &WalkContext, batch: Vec<Part>, loose_images: &mut Vec<Part>, output: &mpsc::Sender<Part>) -> bool {
    if batch.is_empty() {
        return true;
    }
    for part in assemble(ctx, batch, loose_images) {
        if !forward(output, part).await {
            return false;
        }
    }
    true
}

/// Outermost alternative/related container directly enclosing `part`.
fn outer_group(ctx: &WalkContext, part: &Part) -> Option<u64> {
    let mut group = None;
    let mut current = part.parent;
    while let Some(sequence) = current {
        let Some(record) = ctx.lineage().get(sequence) else {
            break;
        };
        if record.content_type != ALTERNATIVE_MIME_TYPE && record.content_type != RELATED_MIME_TYPE {
            break;
        }
        group = Some(sequence);
        current = record.parent;
    }
    group
}

fn is_attachment(part: &Part) -> bool {
    part.header
        .get("Content-Disposition")
        .and_then(|v| v.split(';').next())
        .is_some_and(|d| d.trim().eq_ignore_ascii_case("attachment"))
}

fn is_plain_body(part: &Part) -> bool {
    part.content_type() == mime::PLAIN_TEXT_MIME_TYPE && !is_attachment(part)
}

/// The multipart/alternative container `part` belongs to, looking through
/// one multipart/related wrapper for HTML bodies.
fn alternative_group(ctx: &WalkContext, part: &Part) -> Option<u64> {
    let parent = part.parent?;
    let record = ctx.lineage().get(parent)?;
    match record.content_type.as_str() {
        ALTERNATIVE_MIME_TYPE => Some(parent),
        RELATED_MIME_TYPE if part.media_type.is_html() => {
            let grandparent = record.parent?;
            let outer = ctx.lineage().get(grandparent)?;
            (outer.content_type == ALTERNATIVE_MIME_TYPE).then_some(grandparent)
        }
        _ => None,
    }
}

/// Pair alternatives and inline images within `batch`.
///
/// Held `loose_images` can be referenced too; those used are removed, the
/// rest are handed back.
fn assemble(ctx: &WalkContext, batch: Vec<Part>, loose_images: &mut Vec<Part>) -> Vec<Part> {
    let batch_len = batch.len();
    let mut parts = batch;
    parts.extend(std::mem::take(loose_images));

    // Plain-text alternatives, first one per container.
    let mut plain_by_group: AHashMap<u64, usize> = AHashMap::new();
    for (index, part) in parts.iter().enumerate() {
        if is_plain_body(part)
            && let Some(group) = alternative_group(ctx, part)
        {
            plain_by_group.entry(group).or_insert(index);
        }
    }

    // Content-ID images, by (parent, cid) and by cid alone.
    let mut images_by_sibling: AHashMap<(Option<u64>, String), usize> = AHashMap::new();
    let mut images_by_cid: AHashMap<String, usize> = AHashMap::new();
    for (index, part) in parts.iter().enumerate() {
        if mime::is_image(part.content_type())
            && let Some(cid) = part.content_id()
        {
            images_by_sibling.entry((part.parent, cid.to_string())).or_insert(index);
            images_by_cid.entry(cid.to_string()).or_insert(index);
        }
    }

    let mut consumed: AHashSet<usize> = AHashSet::new();
    let mut replacements: AHashMap<usize, Part> = AHashMap::new();

    for (index, part) in parts.iter().enumerate().take(batch_len) {
        if !part.media_type.is_html() || is_attachment(part) {
            continue;
        }
        let mut html = part.clone();

        if let Some(group) = alternative_group(ctx, part)
            && let Some(&plain_index) = plain_by_group.get(&group)
            && consumed.insert(plain_index)
        {
            tracing::debug!(html = part.sequence, plain = parts[plain_index].sequence, "alternative bodies paired");
            html.fallback = Some(Box::new(parts[plain_index].clone()));
        }

        let lookup = |cid: &str| {
            images_by_sibling
                .get(&(part.parent, cid.to_string()))
                .or_else(|| images_by_cid.get(cid))
                .copied()
        };
        match inline_images(ctx, &html, &parts, lookup) {
            Ok(Some((inlined, used))) => {
                consumed.extend(used);
                html = inlined;
            }
            Ok(None) => {}
            Err(e) => ctx.report(format!("part {}: cannot inline images: {}", part.sequence, e)),
        }

        replacements.insert(index, html);
    }

    let mut out = Vec::with_capacity(batch_len);
    for (index, part) in parts.into_iter().enumerate() {
        if consumed.contains(&index) {
            continue;
        }
        if index >= batch_len {
            loose_images.push(part);
        } else {
            out.push(replacements.remove(&index).unwrap_or(part));
        }
    }
    out.sort_by_key(|part| part.sequence);
    out
}

/// Replace resolvable `cid:` references in `html`.
///
/// Returns the rewritten part and the indices of the images used, or `None`
/// when nothing was replaced.
fn inline_images(
    ctx: &WalkContext,
    html: &Part,
    parts: &[Part],
    lookup: impl Fn(&str) -> Option<usize>,
) -> Result<Option<(Part, Vec<usize>)>> {
    let document = html.body.to_vec()?;
    if !CID_SRC.is_match(&document) {
        return Ok(None);
    }

    let mut used = Vec::new();
    let mut data_uris: AHashMap<usize, String> = AHashMap::new();
    let mut failure = None;

    let rewritten = CID_SRC.replace_all(&document, |caps: &Captures| {
        let whole = caps[0].to_vec();
        let Some(cid) = (3..=5).find_map(|i| caps.get(i)).map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        else {
            return whole;
        };
        let cid = cid.trim().trim_start_matches('<').trim_end_matches('>');
        let Some(index) = lookup(cid) else {
            return whole;
        };

        if !data_uris.contains_key(&index) {
            match data_uri(ctx, &parts[index]) {
                Ok(uri) => {
                    data_uris.insert(index, uri);
                    used.push(index);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                    return whole;
                }
            }
        }

        let mut replaced = caps[1].to_vec();
        replaced.extend_from_slice(&caps[2]);
        replaced.push(b'"');
        replaced.extend_from_slice(data_uris[&index].as_bytes());
        replaced.push(b'"');
        replaced
    });

    if let Some(e) = failure {
        ctx.report(format!("part {}: image not inlined: {}", html.sequence, e));
    }
    if used.is_empty() {
        return Ok(None);
    }

    tracing::debug!(sequence = html.sequence, images = used.len(), "cid images inlined");
    let body = ctx.session().body(rewritten.into_owned())?;
    Ok(Some((html.with_body(body), used)))
}

fn data_uri(ctx: &WalkContext, image: &Part) -> Result<String> {
    let bytes = image.body.to_vec()?;
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let media_type = standard_sniffer(ctx.config().sniff_mode)
        .sniff(window)
        .ok()
        .filter(|found| mime::is_image(found))
        .unwrap_or_else(|| image.content_type().to_string());
    Ok(format!("data:{};base64,{}", media_type, STANDARD.encode(&bytes)))
}
