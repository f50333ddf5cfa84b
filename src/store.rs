//! On-disk certificate bundles. Every issuance gets its own set of files, nothing is overwritten.

use crate::error::{Error, Result};
use crate::util::sanitize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const ISSUANCE_ID_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second][subsecond digits:6]Z");

/// The three PEM documents produced by one successful issuance
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub private_key_pem: String,
    pub certificate_pem: String,
    pub issuer_certificate_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub issuer_cert_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    certificate_dir: PathBuf,
    issuer_label: String,
}

impl CertificateStore {
    pub fn new(certificate_dir: impl Into<PathBuf>, issuer_label: &str) -> Self {
        Self {
            certificate_dir: certificate_dir.into(),
            issuer_label: sanitize(issuer_label, false),
        }
    }

    pub fn domain_directory(&self, domain: &str) -> PathBuf {
        self.certificate_dir.join(sanitize(domain, true))
    }

    /// Writes `bundle` for `domain` under a fresh issuance id.
    ///
    /// Either all three files appear under their final names, or none of them do.
    pub async fn write(&self, domain: &str, bundle: &CertificateBundle) -> Result<StoredPaths> {
        self.write_at(domain, bundle, OffsetDateTime::now_utc()).await
    }

    async fn write_at(
        &self,
        domain: &str,
        bundle: &CertificateBundle,
        mut issued_at: OffsetDateTime,
    ) -> Result<StoredPaths> {
        let directory = self.domain_directory(domain);
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| Error::filesystem(&directory, e))?;

        let domain_name = sanitize(domain, true);
        let paths = loop {
            let id = issuance_id(issued_at);
            let paths = StoredPaths {
                key_path: directory.join(format!("{id}_{domain_name}.key")),
                cert_path: directory.join(format!("{id}_{domain_name}.pem")),
                issuer_cert_path: directory.join(format!("{id}_{}.pem", self.issuer_label)),
            };
            if !any_exists(&paths).await? {
                break paths;
            }
            debug!("Issuance id {id} is already taken, trying the next one");
            issued_at += time::Duration::microseconds(1);
        };

        let files = [
            (&paths.key_path, bundle.private_key_pem.as_str(), true),
            (&paths.cert_path, bundle.certificate_pem.as_str(), false),
            (&paths.issuer_cert_path, bundle.issuer_certificate_pem.as_str(), false),
        ];
        let mut staged = Vec::with_capacity(files.len());
        for (target, contents, private) in files {
            let staging = staging_path(target);
            let mut file = match create_file(&staging, private).await {
                Ok(file) => file,
                Err(e) => {
                    rollback(&staged, 0).await;
                    return Err(Error::filesystem(staging, e));
                }
            };
            staged.push((staging.clone(), target.clone()));
            if let Err(e) = write_contents(&mut file, contents).await {
                rollback(&staged, 0).await;
                return Err(Error::filesystem(staging, e));
            }
        }
        for (committed, (staging, target)) in staged.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(staging, target).await {
                rollback(&staged, committed).await;
                return Err(Error::filesystem(target, e));
            }
        }
        info!(
            "Stored certificate for {domain} at {}",
            paths.cert_path.display()
        );
        Ok(paths)
    }
}

fn issuance_id(at: OffsetDateTime) -> String {
    // Formatting with a static description into a String cannot fail for UTC timestamps
    at.format(ISSUANCE_ID_FORMAT)
        .unwrap_or_else(|_| at.unix_timestamp_nanos().to_string())
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp"))
}

async fn any_exists(paths: &StoredPaths) -> Result<bool> {
    for path in [&paths.key_path, &paths.cert_path, &paths.issuer_cert_path] {
        match tokio::fs::try_exists(path).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => return Err(Error::filesystem(path, e)),
        }
    }
    Ok(false)
}

async fn create_file(path: &Path, private: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;
    options.open(path).await
}

async fn write_contents(file: &mut File, contents: &str) -> std::io::Result<()> {
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await
}

/// Removes staged files and the first `committed` files already renamed into place
async fn rollback(staged: &[(PathBuf, PathBuf)], committed: usize) {
    for (index, (staging, target)) in staged.iter().enumerate() {
        let path = if index < committed { target } else { staging };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean up {}: {e}", path.display()),
        }
    }
}
