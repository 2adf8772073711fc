//! Agent 发现：能力清单与注册表

pub mod manifest;
pub mod registry;

use thiserror::Error;

pub use manifest::{AgentManifest, Skill};
pub use registry::{AgentRegistry, HttpManifestFetcher, ManifestFetcher, StaticManifestFetcher};

/// Agent 发现错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Failed to fetch agent card from {endpoint}: {reason}")]
    Fetch { endpoint: String, reason: String },

    #[error("Invalid agent card from {endpoint}: {reason}")]
    InvalidCard { endpoint: String, reason: String },
}
