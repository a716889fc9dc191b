//! YAML configuration loading, per the on-disk layout documented in the
//! design's external interfaces section. Parsing and validation only: TLS
//! material is a path handed to the (out of scope) front-end, never opened
//! here.

use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Deserialize)]
pub struct CertsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributeConfig {
    /// Comma-separated in the YAML source; split during load.
    #[serde(deserialize_with = "deserialize_comma_separated")]
    pub peers: Vec<String>,
    pub token: String,
}

fn deserialize_comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    pub scheme: String,
    #[serde(default)]
    pub parity: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub protection: ProtectionConfig,
    pub remote: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub certs: Option<CertsConfig>,
    pub distribute: DistributeConfig,
    pub buckets: HashMap<String, BucketConfig>,
    pub journal: JournalConfig,
}

impl Config {
    /// Load and validate configuration from a file path, or stdin when
    /// `path == "-"`, matching `radio serve -c <path>`.
    pub fn load(path: &str) -> GatewayResult<Self> {
        let raw = if path == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(GatewayError::Io)?;
            buf
        } else {
            std::fs::read_to_string(path).map_err(GatewayError::Io)?
        };
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| GatewayError::Configuration(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.distribute.peers.is_empty() {
            return Err(GatewayError::Configuration(
                "distribute.peers must name at least this node".into(),
            ));
        }
        if self.distribute.token.is_empty() {
            return Err(GatewayError::Configuration(
                "distribute.token must not be empty".into(),
            ));
        }
        if self.buckets.is_empty() {
            return Err(GatewayError::Configuration(
                "at least one bucket must be configured".into(),
            ));
        }
        for (name, bucket) in &self.buckets {
            if bucket.protection.scheme != "mirror" {
                return Err(GatewayError::Configuration(format!(
                    "bucket {name}: unsupported protection scheme {:?}, only \"mirror\" is supported",
                    bucket.protection.scheme
                )));
            }
            if bucket.remote.len() != 2 {
                return Err(GatewayError::Configuration(format!(
                    "bucket {name}: mirror protection requires exactly 2 remotes, got {}",
                    bucket.remote.len()
                )));
            }
            for (i, remote) in bucket.remote.iter().enumerate() {
                if remote.endpoint.is_empty() || remote.bucket.is_empty() {
                    return Err(GatewayError::Configuration(format!(
                        "bucket {name}: remote[{i}] is missing endpoint or bucket name"
                    )));
                }
                if remote.access_key.is_empty() || remote.secret_key.is_empty() {
                    return Err(GatewayError::Configuration(format!(
                        "bucket {name}: remote[{i}] is missing credentials"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
distribute:
  peers: "node-a:7070,node-b:7070"
  token: shared-secret
journal:
  dir: /var/lib/radio/journal
buckets:
  photos:
    bucket: photos
    access_key: local-ak
    secret_key: local-sk
    protection:
      scheme: mirror
      parity: 0
    remote:
      - bucket: photos-east
        endpoint: https://east.example.com
        access_key: ak0
        secret_key: sk0
      - bucket: photos-west
        endpoint: https://west.example.com
        access_key: ak1
        secret_key: sk1
"#;

    #[test]
    fn parses_valid_config() {
        let config = Config::parse(VALID).expect("should parse");
        assert_eq!(config.buckets.len(), 1);
        assert_eq!(config.buckets["photos"].remote.len(), 2);
    }

    #[test]
    fn splits_comma_separated_peers_and_trims_whitespace() {
        let with_spaces = VALID.replace(
            "peers: \"node-a:7070,node-b:7070\"",
            "peers: \"node-a:7070, node-b:7070\"",
        );
        let config = Config::parse(&with_spaces).expect("should parse");
        assert_eq!(config.distribute.peers, vec!["node-a:7070", "node-b:7070"]);
    }

    #[test]
    fn rejects_wrong_replica_count() {
        let bad = VALID.replacen(
            "      - bucket: photos-west\n        endpoint: https://west.example.com\n        access_key: ak1\n        secret_key: sk1\n",
            "",
            1,
        );
        let err = Config::parse(&bad).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn rejects_non_mirror_scheme() {
        let bad = VALID.replace("scheme: mirror", "scheme: erasure");
        let err = Config::parse(&bad).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
