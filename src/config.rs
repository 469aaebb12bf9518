use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Resolver configuration merged into the pools via [`crate::dns::configure`].
///
/// `servers` maps a logical resolver name (also used as the TLS SNI when
/// dialing that group) to its endpoint addresses. An address is either
/// `ip-or-host:port` for DoT or an `https://...` URL for DoH.
///
/// `fallbacks` maps a hostname to static IP literals returned when every
/// DoH endpoint fails.
///
/// ```yaml
/// Servers:
///   dns.google:
///     - 8.8.8.8:853
///     - https://dns.google/resolve
/// Fallbacks:
///   huggingface.co:
///     - 18.65.159.2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    #[serde(rename = "Servers")]
    pub servers: HashMap<String, Vec<String>>,
    #[serde(rename = "Fallbacks")]
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl DnsConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a config file, picking the format from the extension.
    /// Unknown extensions are treated as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.fallbacks.is_empty()
    }
}
