pub mod config;

pub use config::{LlmConfig, ProviderConfig, ProviderKind, SystemConfig};
