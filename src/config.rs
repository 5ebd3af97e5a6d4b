//! Optional YAML configuration, overridden by the command line.
//!
//! ```yaml
//! tpm_path: mssim:host=localhost,port=2321
//! pcr_bank: sha256
//! ```

use crate::tpm::pcr::HashAlg;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TPM_PATH: &str = "/dev/tpm0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't open config {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub tpm_path: Option<String>,
    pub pcr_bank: Option<HashAlg>,
}

impl Config {
    /// Reads `path`, or returns the empty config when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Option<Config> =
            serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let config = config.unwrap_or_default();
        log::debug!("loaded {config:?} from {}", path.display());
        Ok(config)
    }

    /// Device path: command line first, then this file, then the default.
    pub fn tpm_path(&self, flag: Option<&str>) -> String {
        flag.or(self.tpm_path.as_deref())
            .unwrap_or(DEFAULT_TPM_PATH)
            .to_string()
    }

    pub fn pcr_bank(&self, flag: Option<HashAlg>) -> HashAlg {
        flag.or(self.pcr_bank).unwrap_or_default()
    }
}
