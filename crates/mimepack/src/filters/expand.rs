//! Container expansion.
//!
//! Archives and Outlook messages are replaced by their members. Members are
//! pushed back onto this stage's own work stack, so nested containers are
//! fully expanded before the next input part is looked at, and emission order
//! follows the containers' own member order.

use super::{FilterStage, forward};
use crate::core::mime::{self, OCTET_STREAM_MIME_TYPE};
use crate::core::session::WalkContext;
use crate::extraction::archive::{self, ArchiveMember, ContainerKind};
use crate::types::{ArtifactItem, HeaderMap, MediaType, Part};
use crate::{MimepackError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default, Clone, Copy)]
pub struct ExpandStage;

type Members = (Option<HeaderMap>, Vec<Result<ArchiveMember>>);

#[async_trait]
impl FilterStage for ExpandStage {
    fn name(&self) -> &'static str {
        "expand"
    }

    async fn run(&self, ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        while let Some(part) = input.recv().await {
            let mut stack = vec![part];

            while let Some(part) = stack.pop() {
                ctx.session().check_cancelled()?;

                let Some(kind) = ContainerKind::of(part.content_type()) else {
                    if !forward(&output, part).await {
                        return Ok(());
                    }
                    continue;
                };

                let depth = ctx.depth() + part.level as usize;
                if depth >= ctx.config().max_depth {
                    fail(&ctx, &part, format!("nesting depth {} exceeds the limit", depth));
                    continue;
                }

                match open(&ctx, &part, kind).await {
                    Ok((header, members)) => {
                        let mut container = part;
                        if let Some(header) = header {
                            container.header = header;
                        }
                        ctx.lineage().record(&container);

                        let children = members_to_parts(&ctx, &container, members);
                        tracing::debug!(
                            sequence = container.sequence,
                            content_type = container.content_type(),
                            members = children.len(),
                            "container expanded"
                        );
                        stack.extend(children.into_iter().rev());
                    }
                    Err(MimepackError::Cancelled) => return Err(MimepackError::Cancelled),
                    Err(e) => fail(&ctx, &part, format!("cannot open {}: {}", part.content_type(), e)),
                }
            }
        }
        Ok(())
    }
}

/// Record an unopenable container as a failure artifact with its original bytes.
fn fail(ctx: &WalkContext, part: &Part, reason: String) {
    let name = ctx.archive_name(part, mime::extension_for(part.content_type()));
    ctx.report(format!("{}: {}", name, reason));
    ctx.emit_artifact(ArtifactItem::failed(part.body.clone(), name, part.content_type(), reason));
}

async fn open(ctx: &Arc<WalkContext>, part: &Part, kind: ContainerKind) -> Result<Members> {
    let session = Arc::clone(ctx.session());
    let body = part.body.clone();
    let file_name = part.file_name.clone();

    match kind {
        ContainerKind::External => {
            let members = archive::unpack_external(&body, file_name.as_deref(), &session).await?;
            Ok((None, members))
        }
        ContainerKind::Msg => tokio::task::spawn_blocking(move || -> Result<Members> {
            archive::read_msg(&body, &session).map(|(header, members)| (Some(header), members))
        })
        .await
        .map_err(|e| MimepackError::Other(format!("msg reader panicked: {}", e)))?,
        kind => tokio::task::spawn_blocking(move || -> Result<Members> {
            let mut members = Vec::new();
            archive::read_members(kind, &body, file_name.as_deref(), &session, &mut |member| {
                members.push(member);
                Ok(())
            })?;
            Ok((None, members))
        })
        .await
        .map_err(|e| MimepackError::Other(format!("archive reader panicked: {}", e)))?,
    }
}

fn members_to_parts(ctx: &WalkContext, container: &Part, members: Vec<Result<ArchiveMember>>) -> Vec<Part> {
    let mut children = Vec::with_capacity(members.len());
    for (index, member) in members.into_iter().enumerate() {
        let member = match member {
            Ok(member) => member,
            Err(e) => {
                ctx.report(format!(
                    "{}: member skipped: {}",
                    ctx.archive_name(container, mime::extension_for(container.content_type())),
                    e
                ));
                continue;
            }
        };

        let media_type = member
            .content_type
            .as_deref()
            .map(MediaType::parse)
            .or_else(|| mime::mime_from_file_name(&member.name).map(MediaType::new))
            .unwrap_or_else(|| MediaType::new(OCTET_STREAM_MIME_TYPE));

        let mut header = HeaderMap::new();
        header.append("Content-Type", media_type.to_string());

        let mut child = Part {
            sequence: ctx.member_sequence(container.sequence, index),
            level: container.level + 1,
            parent: Some(container.sequence),
            media_type,
            header,
            body: member.body,
            file_name: Some(member.name),
            fallback: None,
        };
        if let Err(e) = ctx.classify(&mut child) {
            ctx.report(format!("member {}: {}", child.sequence, e));
        }
        ctx.lineage().record(&child);
        children.push(child);
    }
    children
}
