//! Identity and lifecycle shared by every converter.
//!
//! Every converter implements [`Plugin`], which carries its identity and the
//! lifecycle hooks the registry calls on registration and shutdown.

use crate::Result;

/// Plugins must be `Send + Sync` because a single instance serves every
/// worker of the conversion pool at once.
pub trait Plugin: Send + Sync {
    /// Unique, whitespace-free identifier (used in error messages and cache keys).
    fn name(&self) -> &str;

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Called once when the plugin is registered. A failure rejects registration.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin is removed or the registry shuts down.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn description(&self) -> &str {
        ""
    }
}
