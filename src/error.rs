use crate::acme;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("account key for {identity} is unusable: {reason}")]
    AccountKey { identity: String, reason: String },
    #[error(transparent)]
    Protocol(#[from] acme::error::Error),
    #[error("no pending challenge for {domain}, create an order first")]
    ChallengeNotFound { domain: String },
    #[error("filesystem operation on {} failed", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("challenge cache failure")]
    Cache(#[source] anyhow::Error),
    #[error("the CA did not offer a dns-01 challenge for {domain}")]
    NoDnsChallenge { domain: String },
    #[error("{domain:?} is not a valid domain name: {reason}")]
    InvalidDomain { domain: String, reason: String },
    /// Key generation, CSR creation or certificate parsing failed
    #[error(transparent)]
    Certificate(anyhow::Error),
}

impl Error {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn account_key(identity: &str, reason: impl ToString) -> Self {
        Error::AccountKey {
            identity: identity.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether running the same phase again later can succeed.
    ///
    /// A rejected authorization needs a fresh order, so it is not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::AccountKey { .. } | Error::InvalidDomain { .. } | Error::Certificate(_) => false,
            Error::Protocol(acme::error::Error::AuthorizationInvalid(_)) => false,
            Error::Protocol(_)
            | Error::ChallengeNotFound { .. }
            | Error::Filesystem { .. }
            | Error::Cache(_)
            | Error::NoDnsChallenge { .. } => true,
        }
    }
}
