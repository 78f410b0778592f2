//! Built-in converters.

pub mod command;
pub mod office;
pub mod passthrough;

pub use command::CommandConverter;
pub use office::LibreOfficeConverter;
pub use passthrough::PassthroughConverter;
