use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::crypto::asymmetric::KeyType;
use crate::dns::validator::ResolverSettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

mod default;
mod toml;

pub const DEFAULT_CONFIG_FILE: &str = "certstep.toml";
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Operator email, used as ACME contact and to name the account key
    #[serde(default)]
    pub email: String,
    /// Use the Let's Encrypt staging environment instead of production
    #[serde(default)]
    pub staging: bool,
    /// Any other ACME CA. Takes precedence over `staging`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<Url>,
    pub storage_dir: PathBuf,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    /// Used in the file name of stored issuer certificates
    #[serde(default = "default_issuer_label")]
    pub issuer_label: String,
    #[serde(default)]
    pub dns: DnsConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfiguration {
    /// Nameservers to verify challenge records against. Empty means system resolvers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_key_type() -> String {
    "p256".to_string()
}

fn default_issuer_label() -> String {
    "lets_encrypt".to_string()
}

impl Configuration {
    pub fn directory_url(&self) -> anyhow::Result<Url> {
        if let Some(url) = &self.directory_url {
            return Ok(url.clone());
        }
        let url = if self.staging {
            LETS_ENCRYPT_STAGING
        } else {
            LETS_ENCRYPT_PRODUCTION
        };
        Url::parse(url).context("Invalid built-in directory URL")
    }

    pub fn key_type(&self) -> anyhow::Result<KeyType> {
        KeyType::from_str(&self.key_type).context("Invalid key_type in configuration")
    }

    pub fn account_directory(&self) -> PathBuf {
        self.storage_dir.join("cert").join("account")
    }

    pub fn certificate_directory(&self) -> PathBuf {
        self.storage_dir.join("cert").join("certificate")
    }

    pub fn state_directory(&self) -> PathBuf {
        self.storage_dir.join("state")
    }

    pub fn database_file(&self) -> PathBuf {
        self.state_directory().join("challenges.sqlite")
    }

    pub fn lock_directory(&self) -> PathBuf {
        self.state_directory().join("locks")
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            nameservers: self.dns.nameservers.clone(),
            timeout: self.dns.timeout_secs.map(Duration::from_secs),
        }
    }
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

/// Loads the configuration file, writing the defaults to it first if it does not exist yet
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    if file.as_ref().exists() {
        TomlConfiguration::load(file)
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        Ok(default)
    }
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}
