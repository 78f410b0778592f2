//! Decomposition of documents into parts.
//!
//! - [`email`]: the MIME tree walker
//! - [`archive`]: container members (zip, tar, gzip, external unpacker, Outlook `.msg`)
//! - [`libreoffice`]: headless `soffice` invocation used by the office converter

pub mod archive;
pub mod email;
pub mod libreoffice;
