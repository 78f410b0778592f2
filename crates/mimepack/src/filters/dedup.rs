//! Repetition limit on caller-hashed parts.
//!
//! Parts may carry a content hash in a configurable header. Once a hash has
//! been seen more than `threshold` times in one walk, further parts with it
//! are dropped. Parts without the header always pass.

use super::{FilterStage, forward};
use crate::Result;
use crate::core::config::DedupConfig;
use crate::core::session::WalkContext;
use crate::types::Part;
use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DedupStage {
    header_name: String,
    threshold: usize,
}

impl DedupStage {
    pub fn new(header_name: impl Into<String>, threshold: usize) -> Self {
        Self {
            header_name: header_name.into(),
            threshold,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.header_name.clone(), config.threshold)
    }
}

#[async_trait]
impl FilterStage for DedupStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn run(&self, _ctx: Arc<WalkContext>, mut input: mpsc::Receiver<Part>, output: mpsc::Sender<Part>) -> Result<()> {
        // Counts are per run, so each walk and each instance starts fresh.
        let mut seen: AHashMap<String, usize> = AHashMap::new();

        while let Some(part) = input.recv().await {
            if let Some(hash) = part.header.get(&self.header_name).map(str::trim).filter(|h| !h.is_empty()) {
                let count = seen.entry(hash.to_ascii_lowercase()).or_insert(0);
                *count += 1;
                if *count > self.threshold {
                    tracing::debug!(sequence = part.sequence, hash, occurrences = *count, "duplicate part dropped");
                    continue;
                }
            }
            if !forward(&output, part).await {
                break;
            }
        }
        Ok(())
    }
}
