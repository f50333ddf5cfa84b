//! The three phases of a dns-01 issuance: create an order, verify the published TXT record,
//! finish the order. Phases may run in separate processes, hours apart; everything needed
//! in between lives in the [`ChallengeCache`].

use crate::account::AccountIdentity;
use crate::acme::client::RetryPolicy;
use crate::acme::object::{ChallengeStatus, Token};
use crate::cert::create_csr;
use crate::config::Configuration;
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::JsonWebKey;
use crate::crypto::sha256;
use crate::dns::validator::DnsValidator;
use crate::dns::{challenge_record_name, normalize_domain};
use crate::error::{Error, Result};
use crate::issuer::{AcmeIssuer, AcmeIssuerWithAccount};
use crate::state::{ChallengeCache, ChallengeRecord, Database, DomainLock, PendingChallenge};
use crate::store::{CertificateBundle, CertificateStore};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use crate::util::sanitize;

pub const DNS_RECORD_TYPE: &str = "txt";

/// Progress of one domain through the issuance phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum OrderState {
    Idle,
    AuthorizationRequested,
    ChallengePublishedPendingUser,
    ChallengeReady,
    Finalized,
}

fn transition(domain: &str, from: OrderState, to: OrderState) -> OrderState {
    debug!("{domain}: {from} -> {to}");
    to
}

/// The TXT record the operator has to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub typ: String,
    pub name: String,
    pub record: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderCreated {
    pub domain: String,
    pub dns: DnsRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub domain: String,
    pub dns: DnsRecord,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateIssued {
    pub domain: String,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub issuer_cert_path: PathBuf,
}

/// The value of the dns-01 TXT record: the base64url SHA-256 digest of the key authorization
pub fn dns_txt_value(account_key: &JsonWebKey, token: &Token) -> String {
    let thumbprint = account_key.get_acme_thumbprint();
    let key_authorization = format!("{token}.{thumbprint}");
    BASE64_URL_SAFE_NO_PAD.encode(sha256(key_authorization.as_bytes()))
}

pub struct OrderCoordinator {
    email: String,
    issuer: AcmeIssuer,
    cache: Arc<dyn ChallengeCache>,
    validator: DnsValidator,
    accounts: AccountIdentity,
    store: CertificateStore,
    lock_directory: PathBuf,
}

impl OrderCoordinator {
    pub fn new(
        email: impl Into<String>,
        issuer: AcmeIssuer,
        cache: Arc<dyn ChallengeCache>,
        validator: DnsValidator,
        accounts: AccountIdentity,
        store: CertificateStore,
        lock_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            email: email.into(),
            issuer,
            cache,
            validator,
            accounts,
            store,
            lock_directory: lock_directory.into(),
        }
    }

    /// Wires up the production collaborators: SQLite challenge cache, live DNS and the
    /// configured CA.
    pub async fn from_config(config: &Configuration) -> anyhow::Result<Self> {
        let key_type = config.key_type()?;
        let database = Database::open(config.database_file()).await?;
        Ok(Self::new(
            config.email.clone(),
            AcmeIssuer::new(config.directory_url()?, RetryPolicy::default()),
            Arc::new(database),
            DnsValidator::with_resolver(&config.resolver_settings()),
            AccountIdentity::new(config.account_directory(), key_type),
            CertificateStore::new(config.certificate_directory(), &config.issuer_label),
            config.lock_directory(),
        ))
    }

    async fn lock(&self, cache_key: &str) -> Result<DomainLock> {
        DomainLock::exclusive_lock(&self.lock_directory, cache_key)
            .await
            .map_err(|e| Error::filesystem(self.lock_directory.join(format!("{cache_key}.lock")), e))
    }

    async fn account(&self) -> Result<AcmeIssuerWithAccount<'_>> {
        let keypair = self.accounts.load_or_create(&self.email)?;
        self.issuer.with_account(keypair, &self.email).await
    }

    async fn pending_challenge(&self, domain: &str, cache_key: &str) -> Result<PendingChallenge> {
        self.cache
            .get(cache_key)
            .await
            .map_err(Error::Cache)?
            .ok_or_else(|| Error::ChallengeNotFound {
                domain: domain.to_string(),
            })
    }

    /// Requests a dns-01 authorization for `domain` and remembers the challenge.
    ///
    /// Calling this again for the same domain replaces the pending challenge with a new one.
    pub async fn create_order(&self, domain: &str) -> Result<OrderCreated> {
        let domain = normalize_domain(domain)?;
        let cache_key = sanitize(&domain, false);
        let record_name = challenge_record_name(&domain)?;
        let _lock = self.lock(&cache_key).await?;
        let mut state = OrderState::Idle;

        let account = self.account().await?;
        let request = account.request_authorization(&domain).await?;
        state = transition(&domain, state, OrderState::AuthorizationRequested);

        let (challenge, dns_challenge) =
            request
                .authorization
                .dns_challenge()
                .ok_or_else(|| Error::NoDnsChallenge {
                    domain: domain.clone(),
                })?;
        let record = dns_txt_value(account.account_key(), &dns_challenge.token);
        let entry = PendingChallenge {
            domain: domain.clone(),
            account_url: account.account_url().clone(),
            order_url: request.order_url.clone(),
            authorization_url: request.authorization_url.clone(),
            challenge: ChallengeRecord {
                url: challenge.url.clone(),
                typ: challenge.inner_challenge.get_type().to_string(),
                token: dns_challenge.token.clone(),
                status: challenge.status,
            },
            key_authorization: record.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.cache.put(&cache_key, &entry).await.map_err(Error::Cache)?;
        transition(&domain, state, OrderState::ChallengePublishedPendingUser);
        info!("Publish TXT record {record_name} with value {record} to continue");

        Ok(OrderCreated {
            domain,
            dns: DnsRecord {
                typ: DNS_RECORD_TYPE.to_string(),
                name: record_name,
                record,
            },
        })
    }

    /// Checks whether the TXT record for the pending challenge is visible in DNS. Only local
    /// resolvers are consulted, the CA is not contacted.
    pub async fn verify_order(&self, domain: &str) -> Result<VerificationResult> {
        let domain = normalize_domain(domain)?;
        let cache_key = sanitize(&domain, false);
        let entry = self.pending_challenge(&domain, &cache_key).await?;

        let record = entry.key_authorization.clone();
        match self.accounts.load_existing(&self.email) {
            Ok(Some(keypair)) => {
                if dns_txt_value(&JsonWebKey::new(keypair), &entry.challenge.token) != record {
                    warn!("The account key changed since the order for {domain} was created, the CA will reject the challenge");
                }
            }
            Ok(None) => warn!("The account key used to create the order for {domain} is gone"),
            Err(e) => warn!("Could not load the account key to check the order for {domain}: {e}"),
        }
        let record_name = challenge_record_name(&domain)?;
        let matched = self.validator.check(&record_name, &record).await;
        if matched {
            transition(
                &domain,
                OrderState::ChallengePublishedPendingUser,
                OrderState::ChallengeReady,
            );
        } else {
            info!("TXT record {record_name} does not contain {record} (yet)");
        }
        Ok(VerificationResult {
            domain,
            dns: DnsRecord {
                typ: DNS_RECORD_TYPE.to_string(),
                name: record_name,
                record,
            },
            matched,
        })
    }

    /// Has the CA validate the pending challenge, then obtains and stores the certificate.
    ///
    /// The pending challenge is only forgotten once the certificate is on disk, so a failed
    /// attempt can simply be repeated.
    pub async fn finish_order(&self, domain: &str) -> Result<CertificateIssued> {
        let domain = normalize_domain(domain)?;
        let cache_key = sanitize(&domain, false);
        let _lock = self.lock(&cache_key).await?;
        let mut entry = self.pending_challenge(&domain, &cache_key).await?;
        let mut state = OrderState::ChallengePublishedPendingUser;

        let account = self.account().await?;
        if account.account_url() != &entry.account_url {
            warn!(
                "Pending challenge for {domain} belongs to account {}, but the current account is {}",
                entry.account_url,
                account.account_url()
            );
        }
        account
            .notify_challenge_ready(&entry.authorization_url, &entry.challenge.url)
            .await?;
        state = transition(&domain, state, OrderState::ChallengeReady);
        entry.challenge.status = ChallengeStatus::Valid;
        if let Err(e) = self.cache.put(&cache_key, &entry).await {
            warn!("Failed to record validated challenge for {domain}: {e:#}");
        }

        let domain_key = KeyPair::generate(self.accounts.key_type()).map_err(Error::Certificate)?;
        let csr = create_csr(&domain_key, &domain).map_err(Error::Certificate)?;
        let chain = account.finalize_order(&domain, &entry.order_url, csr.der()).await?;
        let private_key_pem = domain_key
            .to_pem()
            .map_err(|e| Error::Certificate(e.into()))?
            .to_string();
        let bundle = CertificateBundle {
            private_key_pem,
            certificate_pem: chain.certificate_pem(),
            issuer_certificate_pem: chain.issuer_certificate_pem(),
        };
        let paths = self.store.write(&domain, &bundle).await?;
        self.cache.forget(&cache_key).await.map_err(Error::Cache)?;
        transition(&domain, state, OrderState::Finalized);

        Ok(CertificateIssued {
            domain,
            key_path: paths.key_path,
            cert_path: paths.cert_path,
            issuer_cert_path: paths.issuer_cert_path,
        })
    }
}
