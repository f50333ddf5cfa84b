use crate::config::{ConfigBackend, Configuration, DnsConfiguration, default_issuer_label, default_key_type};
use anyhow::{Error, bail};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct DefaultConfig {}

impl DefaultConfig {
    pub fn get_config(&self) -> Configuration {
        Configuration {
            email: String::new(),
            staging: false,
            directory_url: None,
            storage_dir: PathBuf::from("storage"),
            key_type: default_key_type(),
            issuer_label: default_issuer_label(),
            dns: DnsConfiguration::default(),
        }
    }
}

impl ConfigBackend for DefaultConfig {
    fn load<P: AsRef<Path>>(_file: P) -> Result<Configuration, Error> {
        Ok(Self::default().get_config())
    }

    fn save<P: AsRef<Path>>(_config: &Configuration, _file: P) -> Result<(), Error> {
        bail!("default backend cannot save to file")
    }
}
