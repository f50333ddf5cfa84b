use crate::acme::error::{Error, Problem};
use crate::util::serde_helper::optional_offset_date_time;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Directory {
    pub new_nonce: Url,
    pub new_account: Url,
    pub new_order: Url,
    pub new_authz: Option<Url>,
    pub revoke_cert: Option<Url>,
    pub key_change: Option<Url>,
    pub meta: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Metadata {
    pub terms_of_service: Option<Url>,
    pub website: Option<Url>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Nonce(String);

impl Nonce {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for Nonce {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        for char in value.chars() {
            if char.is_ascii_alphanumeric() || char == '_' || char == '-' {
                continue;
            }
            return Err(Error::ProtocolViolation("Invalid nonce value"));
        }
        Ok(Self(value))
    }
}

impl FromStr for Nonce {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Nonce::try_from(s.to_string())
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Token(String);

impl TryFrom<String> for Token {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        for char in value.chars() {
            if char.is_ascii_alphanumeric() || char == '_' || char == '-' {
                continue;
            }
            return Err(Error::ProtocolViolation("Invalid token value"));
        }
        Ok(Self(value))
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Token::try_from(s.to_string())
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    #[serde(default)]
    pub contact: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Account {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<Url>,
    pub orders: Option<Url>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
    #[serde(other)]
    Unknown,
}

impl Display for AccountStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AccountStatus::Valid => "valid",
                AccountStatus::Deactivated => "deactivated",
                AccountStatus::Revoked => "revoked",
                AccountStatus::Unknown => "unknown",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum Identifier {
    Dns {
        value: String,
    },
    #[serde(other)]
    Unknown,
}

impl FromStr for Identifier {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Identifier::dns(s))
    }
}

impl Identifier {
    pub fn dns(name: &str) -> Self {
        Identifier::Dns {
            value: name.to_string(),
        }
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Dns { value } => f.write_str(value),
            Identifier::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub identifiers: Vec<Identifier>,
    #[serde(default, with = "optional_offset_date_time")]
    pub not_before: Option<time::OffsetDateTime>,
    #[serde(default, with = "optional_offset_date_time")]
    pub not_after: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    pub authorizations: Vec<Url>,
    pub finalize: Url,
    pub certificate: Option<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub expires: Option<time::OffsetDateTime>,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Deactivated,
    Expired,
    Revoked,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct Challenge {
    pub url: Url,
    pub status: ChallengeStatus,
    #[serde(default, with = "optional_offset_date_time")]
    pub validated: Option<time::OffsetDateTime>,
    pub error: Option<Problem>,
    #[serde(flatten)]
    pub inner_challenge: InnerChallenge,
}

/// Challenge status, also persisted with a pending challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
#[cfg_attr(test, derive(Serialize))]
pub enum InnerChallenge {
    #[serde(rename = "http-01")]
    Http(HttpChallenge),
    #[serde(rename = "dns-01")]
    Dns(DnsChallenge),
    #[serde(rename = "tls-alpn-01")]
    Alpn(AlpnChallenge),
    #[serde(other)]
    Unknown,
}

impl InnerChallenge {
    pub fn get_type(&self) -> &str {
        match self {
            InnerChallenge::Http(_) => "http-01",
            InnerChallenge::Dns(_) => "dns-01",
            InnerChallenge::Alpn(_) => "tls-alpn-01",
            InnerChallenge::Unknown => "unknown",
        }
    }
}

impl Authorization {
    /// The first `dns-01` challenge offered by the CA, if any
    pub fn dns_challenge(&self) -> Option<(&Challenge, &DnsChallenge)> {
        self.challenges
            .iter()
            .find_map(|challenge| match &challenge.inner_challenge {
                InnerChallenge::Dns(dns) => Some((challenge, dns)),
                _ => None,
            })
    }

    /// The first problem any challenge of this authorization reported
    pub fn challenge_error(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|challenge| challenge.error.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct HttpChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct DnsChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(Serialize))]
pub struct AlpnChallenge {
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub csr: String,
}
