pub mod attachments;
pub mod calendar;
pub mod compression;
pub mod config;
pub mod contract;
pub mod errors;
pub mod eth;
pub mod handlers;
pub mod notes;
pub mod pin;
pub mod wallet;

// Re-export commonly used items for easier testing
pub use compression::{compress, CompressionOptions, ImageBytes, ImageCompressor};
pub use config::Config;
pub use errors::*;
pub use handlers::{configure, AppState};
