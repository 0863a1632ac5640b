//! The `/gvfs/config` document served by the object service.

use serde::{Deserialize, Serialize};

/// Client version range the service accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionRange {
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
}

/// One cache server advertised by the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheServerInfo {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub global_default: bool,
}

/// The full config document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerGvfsConfig {
    #[serde(default)]
    pub allowed_gvfs_client_versions: Vec<VersionRange>,
    #[serde(default)]
    pub cache_servers: Vec<CacheServerInfo>,
}

impl ServerGvfsConfig {
    /// The cache server marked as the global default, if any.
    pub fn default_cache_server(&self) -> Option<&CacheServerInfo> {
        self.cache_servers
            .iter()
            .find(|server| server.global_default)
            .or_else(|| self.cache_servers.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_document() {
        let body = r#"{
            "allowedGvfsClientVersions": [{"min": "0.2", "max": null}],
            "cacheServers": [
                {"url": "https://cache1.example.com/gvfs", "name": "east", "globalDefault": false},
                {"url": "https://cache2.example.com/gvfs", "name": "west", "globalDefault": true}
            ]
        }"#;
        let config: ServerGvfsConfig = serde_json::from_str(body).unwrap();
        assert_eq!(config.cache_servers.len(), 2);
        assert_eq!(config.default_cache_server().unwrap().name, "west");
    }

    #[test]
    fn tolerates_missing_fields() {
        let config: ServerGvfsConfig = serde_json::from_str("{}").unwrap();
        assert!(config.cache_servers.is_empty());
        assert!(config.default_cache_server().is_none());
    }
}
