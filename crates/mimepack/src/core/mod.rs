//! Core conversion machinery.
//!
//! - **Entry points** ([`converter`]): `convert_document`, `convert_to_zip`, `convert_to_pdf`
//! - **Orchestration** ([`orchestrator`]): walker, filter stages and worker pool for one call
//! - **Classification** ([`mime`], [`sniff`], [`resolve`]): declared vs. detected content types
//! - **Per-call state** ([`session`]): scratch space, lineage, error collection
//! - **Configuration** ([`config`]) and file helpers ([`io`])

pub mod config;
pub mod converter;
pub mod io;
pub mod mime;
pub mod orchestrator;
pub mod resolve;
pub mod session;
pub mod sniff;

pub use config::ConversionConfig;
pub use resolve::{Resolution, resolve};
pub use session::{ConversionSession, Lineage, WalkContext};
