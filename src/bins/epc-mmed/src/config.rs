//! MME Configuration
//!
//! YAML configuration of the MME core. Every field has a default so a
//! partial file (or no file at all) yields a working configuration.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{EpsTai, PlmnId, MAX_APN_PER_UE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// PLMN as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlmnConf {
    pub mcc: String,
    pub mnc: String,
}

impl Default for PlmnConf {
    fn default() -> Self {
        Self {
            mcc: "001".to_string(),
            mnc: "01".to_string(),
        }
    }
}

impl PlmnConf {
    pub fn plmn_id(&self) -> PlmnId {
        PlmnId::new(&self.mcc, &self.mnc)
    }
}

/// Served tracking area
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaiConf {
    #[serde(default)]
    pub plmn: PlmnConf,
    pub tac: u16,
}

/// Timer durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t3450_ms: u64,
    pub t3460_ms: u64,
    pub t3470_ms: u64,
    pub t3422_ms: u64,
    pub paging_response_ms: u64,
    pub ics_response_ms: u64,
    pub mobile_reachable_ms: u64,
    pub implicit_detach_ms: u64,
    pub s11_bearer_guard_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t3450_ms: 6_000,
            t3460_ms: 6_000,
            t3470_ms: 6_000,
            t3422_ms: 6_000,
            paging_response_ms: 4_000,
            ics_response_ms: 4_000,
            // T3412 (54 min) + 4 min
            mobile_reachable_ms: 58 * 60 * 1000,
            implicit_detach_ms: 58 * 60 * 1000,
            s11_bearer_guard_ms: 10_000,
        }
    }
}

/// NAS security algorithm preference, most preferred first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Integrity algorithms (0..=3 for EIA0..EIA3)
    pub integrity_order: Vec<u8>,
    /// Ciphering algorithms (0..=3 for EEA0..EEA3)
    pub ciphering_order: Vec<u8>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            integrity_order: vec![2, 1, 0],
            ciphering_order: vec![0, 1, 2],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    /// Run an IMEISV identity request after security mode control
    pub request_imeisv: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgsConfig {
    pub enabled: bool,
}

/// MME configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmeConfig {
    pub plmn: PlmnConf,
    pub mme_gid: u16,
    pub mme_code: u8,
    /// Local S11 GTP-C address advertised in Create Session Request
    pub s11_addr: Ipv4Addr,
    pub tai: Vec<TaiConf>,
    pub timers: TimerConfig,
    pub security: SecurityConfig,
    pub nas: NasConfig,
    pub default_apn: String,
    pub sgs: SgsConfig,
    pub max_pdn_per_ue: usize,
    /// New attaches are rejected with congestion above this many UEs
    pub max_ue: usize,
}

impl Default for MmeConfig {
    fn default() -> Self {
        Self {
            plmn: PlmnConf::default(),
            mme_gid: 2,
            mme_code: 1,
            s11_addr: Ipv4Addr::new(127, 0, 0, 2),
            tai: vec![TaiConf {
                plmn: PlmnConf::default(),
                tac: 1,
            }],
            timers: TimerConfig::default(),
            security: SecurityConfig::default(),
            nas: NasConfig::default(),
            default_apn: "internet".to_string(),
            sgs: SgsConfig::default(),
            max_pdn_per_ue: 4,
            max_ue: 1024,
        }
    }
}

/// Top level of the YAML file: `mme: { ... }`
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mme: MmeConfig,
}

impl MmeConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        file.mme.validate()?;
        Ok(file.mme)
    }

    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tai.is_empty() {
            return Err(ConfigError::ValidationError("no served TAI".to_string()));
        }
        if self.max_pdn_per_ue == 0 {
            return Err(ConfigError::ValidationError("max_pdn_per_ue is 0".to_string()));
        }
        if self.security.integrity_order.is_empty() {
            return Err(ConfigError::ValidationError("empty integrity_order".to_string()));
        }
        if let Some(alg) = self
            .security
            .integrity_order
            .iter()
            .chain(self.security.ciphering_order.iter())
            .find(|a| **a > 3)
        {
            return Err(ConfigError::ValidationError(format!("unknown algorithm {}", alg)));
        }
        Ok(())
    }

    pub fn plmn_id(&self) -> PlmnId {
        self.plmn.plmn_id()
    }

    /// Served TAI list
    pub fn served_tai(&self) -> Vec<EpsTai> {
        self.tai
            .iter()
            .map(|t| EpsTai {
                plmn_id: t.plmn.plmn_id(),
                tac: t.tac,
            })
            .collect()
    }

    /// Per-UE PDN limit clamped to the context array size
    pub fn pdn_limit(&self) -> usize {
        self.max_pdn_per_ue.min(MAX_APN_PER_UE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = MmeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.plmn_id().to_bcd(), "00101");
        assert_eq!(cfg.pdn_limit(), 4);
        assert_eq!(cfg.served_tai().len(), 1);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
mme:
  plmn:
    mcc: "310"
    mnc: "410"
  mme_gid: 4
  mme_code: 9
  tai:
    - plmn: { mcc: "310", mnc: "410" }
      tac: 7
  timers:
    t3450_ms: 1000
  nas:
    request_imeisv: true
  sgs:
    enabled: true
  max_pdn_per_ue: 32
"#;
        let cfg = MmeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.plmn_id().to_bcd(), "310410");
        assert_eq!(cfg.mme_gid, 4);
        assert_eq!(cfg.timers.t3450_ms, 1000);
        assert_eq!(cfg.timers.t3460_ms, TimerConfig::default().t3460_ms);
        assert!(cfg.nas.request_imeisv);
        assert!(cfg.sgs.enabled);
        assert_eq!(cfg.pdn_limit(), MAX_APN_PER_UE);
        assert_eq!(cfg.served_tai()[0].tac, 7);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg = MmeConfig::from_yaml_str("mme: {}").unwrap();
        assert_eq!(cfg, MmeConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let err = MmeConfig::from_yaml_str("mme:\n  tai: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = MmeConfig::from_yaml_str("mme:\n  security:\n    integrity_order: [5]\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = MmeConfig::from_yaml_str("mme: [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = MmeConfig::load("/nonexistent/epccore/mme.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
