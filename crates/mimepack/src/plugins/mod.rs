//! Plugin system: converter capabilities and their dispatch table.
//!
//! - [`Plugin`]: identity and lifecycle shared by every plugin
//! - [`Converter`]: turns one leaf into the target format
//! - [`ConverterRegistry`]: maps content types to a [`Route`]
//!
//! Converters are stored as `Arc<dyn Converter>` and shared by all workers of
//! a conversion call.
//!
//! ```rust
//! use mimepack::core::config::ConversionConfig;
//! use mimepack::plugins::{ConverterRegistry, Route};
//! use mimepack::types::MediaType;
//!
//! let registry = ConverterRegistry::from_config(&ConversionConfig::default()).unwrap();
//! assert!(matches!(registry.dispatch(&MediaType::new("message/rfc822")), Some(Route::Recurse)));
//! ```

pub mod converter;
pub mod registry;
pub mod traits;

pub use converter::{Converter, SourceReader};
pub use registry::{ConverterRegistry, Route};
pub use traits::Plugin;
