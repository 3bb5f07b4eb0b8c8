pub mod config;
pub mod error;
pub mod keys;

pub use config::QdsConfig;
pub use error::{QdsError, QdsResult};
pub use keys::{open_key_store, resolve_bundle_path};
