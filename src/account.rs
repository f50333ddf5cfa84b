//! ACME account keys, one pair per operator identity (usually an email address).

use crate::crypto::asymmetric::{KeyPair, KeyType};
use crate::error::{Error, Result};
use crate::util::sanitize;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

#[derive(Debug, Clone)]
pub struct AccountIdentity {
    account_dir: PathBuf,
    key_type: KeyType,
}

impl AccountIdentity {
    pub fn new(account_dir: impl Into<PathBuf>, key_type: KeyType) -> Self {
        Self {
            account_dir: account_dir.into(),
            key_type,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn private_key_path(&self, identity: &str) -> PathBuf {
        self.account_dir
            .join(format!("{}.private.pem", sanitize(identity, false)))
    }

    pub fn public_key_path(&self, identity: &str) -> PathBuf {
        self.account_dir
            .join(format!("{}.public.pem", sanitize(identity, false)))
    }

    /// Returns the account key for `identity`, generating and persisting a new one on first use.
    ///
    /// Existing key material is never replaced. If only one half is present, or the halves
    /// don't belong together, this fails instead of silently creating a new account.
    pub fn load_or_create(&self, identity: &str) -> Result<KeyPair> {
        if identity.trim().is_empty() {
            return Err(Error::account_key(identity, "no account identity (email) configured"));
        }
        let private_path = self.private_key_path(identity);
        let public_path = self.public_key_path(identity);
        match (private_path.try_exists(), public_path.try_exists()) {
            (Ok(false), Ok(false)) => {
                self.create(identity, &private_path, &public_path)?;
            }
            (Err(e), _) => return Err(Error::filesystem(private_path, e)),
            (_, Err(e)) => return Err(Error::filesystem(public_path, e)),
            _ => {}
        }
        self.load(identity, &private_path, &public_path)
    }

    /// Like [`Self::load_or_create`], but never writes anything. `None` if no key exists yet.
    pub fn load_existing(&self, identity: &str) -> Result<Option<KeyPair>> {
        let private_path = self.private_key_path(identity);
        let public_path = self.public_key_path(identity);
        match (private_path.try_exists(), public_path.try_exists()) {
            (Ok(false), Ok(false)) => Ok(None),
            (Err(e), _) => Err(Error::filesystem(private_path, e)),
            (_, Err(e)) => Err(Error::filesystem(public_path, e)),
            _ => self.load(identity, &private_path, &public_path).map(Some),
        }
    }

    fn create(&self, identity: &str, private_path: &Path, public_path: &Path) -> Result<()> {
        info!("Creating new {} account key for {identity}", self.key_type);
        std::fs::create_dir_all(&self.account_dir).map_err(|e| Error::filesystem(&self.account_dir, e))?;
        let keypair = KeyPair::generate(self.key_type).map_err(|e| Error::account_key(identity, format!("{e:#}")))?;
        let public_pem = keypair
            .public_key_pem()
            .map_err(|e| Error::account_key(identity, format!("{e:#}")))?;

        let private_pem = keypair
            .to_pem()
            .map_err(|e| Error::account_key(identity, e.to_string()))?;
        write_key_files(&[
            (private_path, pem::encode(&private_pem).as_bytes(), true),
            (public_path, pem::encode(&public_pem).as_bytes(), false),
        ])?;
        debug!("Stored account key at {}", private_path.display());
        Ok(())
    }

    fn load(&self, identity: &str, private_path: &Path, public_path: &Path) -> Result<KeyPair> {
        let private_pem = match std::fs::read_to_string(private_path) {
            Ok(private_pem) => private_pem,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::account_key(
                    identity,
                    format!("private key {} is missing", private_path.display()),
                ));
            }
            Err(e) => return Err(Error::filesystem(private_path, e)),
        };
        let keypair = KeyPair::from_pem(&private_pem)
            .map_err(|e| Error::account_key(identity, format!("{}: {e:#}", private_path.display())))?;

        let public_pem = match std::fs::read_to_string(public_path) {
            Ok(public_pem) => public_pem,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::account_key(
                    identity,
                    format!("public key {} is missing", public_path.display()),
                ));
            }
            Err(e) => return Err(Error::filesystem(public_path, e)),
        };
        let public_key = pem::parse(public_pem)
            .map_err(|e| Error::account_key(identity, format!("{}: {e}", public_path.display())))?;
        if public_key.tag() != PUBLIC_KEY_TAG {
            return Err(Error::account_key(
                identity,
                format!("{} does not contain a public key", public_path.display()),
            ));
        }
        let expected = keypair
            .public_key_der()
            .map_err(|e| Error::account_key(identity, format!("{e:#}")))?;
        if public_key.contents() != expected.as_slice() {
            return Err(Error::account_key(
                identity,
                "public key does not belong to the private key",
            ));
        }
        Ok(keypair)
    }
}

/// Writes all files or none. Only files created here are removed again on failure, so a
/// concurrently written key is never deleted.
fn write_key_files(files: &[(&Path, &[u8], bool)]) -> Result<()> {
    let mut created = Vec::with_capacity(files.len());
    let mut result = Ok(());
    for &(path, contents, private) in files {
        let written = create_key_file(path, private).and_then(|mut file| {
            created.push(path);
            file.write_all(contents)?;
            file.sync_all()
        });
        if let Err(e) = written {
            result = Err(Error::filesystem(path, e));
            break;
        }
    }
    if result.is_err() {
        for path in created {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove incomplete key file {}: {e}", path.display());
            }
        }
    }
    result
}

fn create_key_file(path: &Path, private: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;
    options.open(path)
}
