use crate::acme::object::{ChallengeStatus, Token};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use url::Url;

/// The dns-01 challenge selected for a domain, as offered by the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub url: Url,
    #[serde(rename = "type")]
    pub typ: String,
    pub token: Token,
    pub status: ChallengeStatus,
}

/// Everything that must survive between creating an order and finishing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChallenge {
    pub domain: String,
    pub account_url: Url,
    pub order_url: Url,
    pub authorization_url: Url,
    pub challenge: ChallengeRecord,
    /// Digest of the key authorization, i.e. the expected TXT record value
    pub key_authorization: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Pending challenges by cache key. Entries have no expiry, they are removed explicitly once
/// the certificate has been issued.
#[async_trait]
pub trait ChallengeCache: Send + Sync {
    /// Inserts or replaces the entry for `key`
    async fn put(&self, key: &str, entry: &PendingChallenge) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<PendingChallenge>>;

    /// Removes the entry for `key`. Forgetting an absent key is not an error.
    async fn forget(&self, key: &str) -> anyhow::Result<()>;
}

/// Process-local cache, lost on exit
#[derive(Debug, Default)]
pub struct MemoryChallengeCache {
    entries: Mutex<HashMap<String, PendingChallenge>>,
}

#[async_trait]
impl ChallengeCache for MemoryChallengeCache {
    async fn put(&self, key: &str, entry: &PendingChallenge) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<PendingChallenge>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn forget(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_helper {
    use super::*;
    use std::str::FromStr;
    use time::macros::datetime;

    pub fn pending_challenge(domain: &str) -> PendingChallenge {
        PendingChallenge {
            domain: domain.to_string(),
            account_url: Url::parse("https://acme.example/acct/1").unwrap(),
            order_url: Url::parse("https://acme.example/order/1").unwrap(),
            authorization_url: Url::parse("https://acme.example/authz/1").unwrap(),
            challenge: ChallengeRecord {
                url: Url::parse("https://acme.example/chall/1").unwrap(),
                typ: "dns-01".to_string(),
                token: Token::from_str("evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA").unwrap(),
                status: ChallengeStatus::Pending,
            },
            key_authorization: "LoqXcYV8q5ONbJQxbmR7SCTNo3tiAXDfowyjxAjEuX0".to_string(),
            created_at: datetime!(2025-03-01 12:00:00.123456 UTC),
        }
    }
}
