//! Converter dispatch table.
//!
//! Maps a resolved content type to a [`Route`]. Exact rules are consulted
//! before prefix-family rules, and prefix rules in registration order, so the
//! order of registration is significant. A missing route is not an error by
//! itself: the orchestrator packages the original bytes for that leaf.

use crate::core::config::ConversionConfig;
use crate::core::mime;
use crate::converters::{CommandConverter, LibreOfficeConverter, PassthroughConverter};
use crate::plugins::Converter;
use crate::types::MediaType;
use crate::{MimepackError, Result};
use indexmap::IndexMap;
use std::sync::Arc;

/// What to do with a leaf of a given type.
#[derive(Clone)]
pub enum Route {
    Convert(Arc<dyn Converter>),
    /// Run the whole pipeline again on the leaf's body (messages, containers).
    Recurse,
    /// Nothing renderable; drop silently.
    Skip,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Convert(converter) => write!(f, "Convert({})", converter.name()),
            Route::Recurse => f.write_str("Recurse"),
            Route::Skip => f.write_str("Skip"),
        }
    }
}

fn validate_plugin_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MimepackError::validation("Plugin name cannot be empty"));
    }
    if name.contains(char::is_whitespace) {
        return Err(MimepackError::validation(format!(
            "Plugin name '{}' cannot contain whitespace",
            name
        )));
    }
    Ok(())
}

/// `text/` and `text/*` are prefixes; anything else is an exact type.
fn as_prefix(pattern: &str) -> Option<&str> {
    if let Some(stripped) = pattern.strip_suffix('*') {
        return Some(stripped);
    }
    if pattern.ends_with('/') || pattern.ends_with('.') {
        return Some(pattern);
    }
    None
}

/// Ordered exact and prefix rules.
#[derive(Clone, Debug, Default)]
pub struct ConverterRegistry {
    exact: IndexMap<String, Route>,
    prefixes: Vec<(String, Route)>,
    converters: IndexMap<String, Arc<dyn Converter>>,
}

impl std::fmt::Debug for dyn Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Converter({})", self.name())
    }
}

impl ConverterRegistry {
    /// Empty table with no routes at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in routes plus the command converters from `config`, which take
    /// precedence over the built-ins for the types they name.
    pub fn from_config(config: &ConversionConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.install_defaults(config)?;

        for command in &config.commands {
            let converter = Arc::new(CommandConverter::new(command.clone(), config.timeout_secs));
            let patterns: Vec<String> = converter.patterns().to_vec();
            registry.register_converter_first(converter, &patterns)?;
        }
        Ok(registry)
    }

    fn install_defaults(&mut self, config: &ConversionConfig) -> Result<()> {
        for signature in [
            "application/pkcs7-signature",
            "application/x-pkcs7-signature",
            "application/pgp-signature",
            "application/pgp-keys",
            mime::XML_DSIG_MIME_TYPE,
        ] {
            self.route_exact(signature, Route::Skip);
        }

        for nested in [mime::EML_MIME_TYPE, "message/global", mime::MSG_MIME_TYPE] {
            self.route_exact(nested, Route::Recurse);
        }
        for archive in [
            mime::ZIP_MIME_TYPE,
            "application/x-zip-compressed",
            mime::TAR_MIME_TYPE,
            "application/x-gtar",
            mime::GZIP_MIME_TYPE,
            "application/x-gzip",
            mime::RAR_MIME_TYPE,
            "application/x-rar-compressed",
            mime::SEVEN_Z_MIME_TYPE,
        ] {
            self.route_exact(archive, Route::Recurse);
        }

        self.register_converter(Arc::new(PassthroughConverter), &[mime::PDF_MIME_TYPE])?;

        let office: Arc<dyn Converter> = Arc::new(LibreOfficeConverter::new(&config.libreoffice, config.timeout_secs));
        self.register_converter(
            office,
            &[
                mime::PLAIN_TEXT_MIME_TYPE,
                mime::HTML_MIME_TYPE,
                mime::XHTML_MIME_TYPE,
                mime::RTF_MIME_TYPE,
                "text/rtf",
                mime::LEGACY_WORD_MIME_TYPE,
                mime::EXCEL_BINARY_MIME_TYPE,
                mime::LEGACY_POWERPOINT_MIME_TYPE,
                "application/vnd.openxmlformats-officedocument.",
                "application/vnd.oasis.opendocument.",
                "application/vnd.ms-",
                "image/",
                "text/",
            ],
        )?;
        Ok(())
    }

    /// Add an exact rule, replacing an earlier rule for the same type.
    pub fn route_exact(&mut self, content_type: &str, route: Route) {
        self.exact.insert(content_type.to_ascii_lowercase(), route);
    }

    /// Append a prefix rule after the existing ones.
    pub fn route_prefix(&mut self, prefix: &str, route: Route) {
        self.prefixes.push((prefix.to_ascii_lowercase(), route));
    }

    /// Register `converter` for `patterns` (exact types or prefixes), after existing prefix rules.
    pub fn register_converter<S: AsRef<str>>(&mut self, converter: Arc<dyn Converter>, patterns: &[S]) -> Result<()> {
        self.register_inner(converter, patterns, false)
    }

    /// Like [`register_converter`](Self::register_converter) but its prefix
    /// rules are checked before every existing prefix rule.
    pub fn register_converter_first<S: AsRef<str>>(
        &mut self,
        converter: Arc<dyn Converter>,
        patterns: &[S],
    ) -> Result<()> {
        self.register_inner(converter, patterns, true)
    }

    fn register_inner<S: AsRef<str>>(&mut self, converter: Arc<dyn Converter>, patterns: &[S], first: bool) -> Result<()> {
        validate_plugin_name(converter.name())?;
        converter.initialize()?;

        let mut front = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            match as_prefix(pattern) {
                Some(prefix) if first => front.push((prefix.to_ascii_lowercase(), Route::Convert(Arc::clone(&converter)))),
                Some(prefix) => self.route_prefix(prefix, Route::Convert(Arc::clone(&converter))),
                None => self.route_exact(pattern, Route::Convert(Arc::clone(&converter))),
            }
        }
        if !front.is_empty() {
            front.append(&mut self.prefixes);
            self.prefixes = front;
        }

        self.converters.insert(converter.name().to_string(), converter);
        Ok(())
    }

    /// Route for `media_type`: exact match, then prefix families in order.
    ///
    /// A generic type with a `name` parameter is retried under the type implied
    /// by that name's extension.
    pub fn dispatch(&self, media_type: &MediaType) -> Option<Route> {
        if let Some(route) = self.lookup(&media_type.essence) {
            return Some(route);
        }
        if mime::is_generic(&media_type.essence)
            && let Some(name) = media_type.param("name")
            && let Some(implied) = mime::mime_from_file_name(name)
        {
            return self.lookup(&implied);
        }
        None
    }

    fn lookup(&self, content_type: &str) -> Option<Route> {
        if let Some(route) = self.exact.get(content_type) {
            return Some(route.clone());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| content_type.starts_with(prefix.as_str()))
            .map(|(_, route)| route.clone())
    }

    /// Whether any rule claims `content_type`.
    pub fn has_converter(&self, content_type: &str) -> bool {
        self.lookup(content_type).is_some()
    }

    pub fn converter(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.converters.get(name).cloned()
    }

    pub fn converter_names(&self) -> Vec<String> {
        self.converters.keys().cloned().collect()
    }

    /// Call `shutdown` on every registered converter, returning the first failure.
    pub fn shutdown_all(&self) -> Result<()> {
        let mut first_error = None;
        for converter in self.converters.values() {
            if let Err(e) = converter.shutdown() {
                tracing::warn!(converter = converter.name(), error = %e, "converter shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
