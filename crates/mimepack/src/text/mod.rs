//! Text encoding repair.

pub mod encoding;

pub use encoding::{decode_quoted_printable, looks_like_legacy_qp, repair_bork, safe_decode, to_utf8};
