use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{error, info};

async fn domain_lock(lock_file: &Path) -> std::io::Result<File> {
    let lock_file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_file)
        .await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!("Another process is working on the same domain. Waiting for it to finish...");
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Exclusive lock serializing all phases for one domain, across processes.
/// Released on drop.
#[must_use]
#[clippy::has_significant_drop]
#[derive(Debug)]
pub struct DomainLock {
    lock_file: File,
    path: PathBuf,
}

impl DomainLock {
    pub async fn exclusive_lock(lock_directory: &Path, key: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(lock_directory).await?;
        let path = lock_directory.join(format!("{key}.lock"));
        let lock_file = domain_lock(&path).await?;
        Ok(Self { lock_file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DomainLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}
