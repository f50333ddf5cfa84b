use crate::config::{Configuration, DEFAULT_CONFIG_FILE};
use clap::{Args, Parser, ValueEnum};
use std::fmt::Display;
use std::path::PathBuf;
use strum::VariantArray;

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
pub struct CommandLineArguments {
    /// Path to configuration file (created with defaults if missing)
    #[arg(short, long, env = "CERTSTEP_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[clap(flatten)]
    pub order: OrderCommand,
    /// ACME account email, overrides the configuration file
    #[arg(long, env = "CERTSTEP_EMAIL")]
    pub email: Option<String>,
    /// Use the Let's Encrypt staging environment, overrides the configuration file
    #[arg(long, env = "CERTSTEP_STAGING")]
    pub staging: bool,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTSTEP_LOG` environment variable)
    #[clap(long, short, action)]
    pub verbose: bool,
    /// Force certstep to disable all interactive prompts, even if a terminal was detected
    #[clap(long, action)]
    pub noninteractive: bool,
}

impl CommandLineArguments {
    /// Applies command line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut Configuration) {
        if let Some(email) = &self.email {
            config.email.clone_from(email);
        }
        if self.staging {
            config.staging = true;
        }
    }
}

#[derive(Debug, Args, Default)]
pub struct OrderCommand {
    /// Domain name of the certificate, e.g. `example.com` or `*.example.com`
    #[clap(short, long)]
    pub domain: Option<String>,
    /// Which step of the issuance to run
    #[clap(short, long, value_enum)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, VariantArray)]
pub enum Action {
    /// Create an order and print the DNS record to publish
    Create,
    /// Check whether the DNS record is visible
    Verify,
    /// Have the CA validate the record and download the certificate
    Finish,
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Create => write!(f, "Create a new order (step 1)"),
            Action::Verify => write!(f, "Verify the DNS record (step 2)"),
            Action::Finish => write!(f, "Finish the order and save the certificate (step 3)"),
        }
    }
}
