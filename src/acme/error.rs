use crate::acme::http::HttpClient;
use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

pub type ProtocolResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The request never produced a usable HTTP response
    Http(reqwest::Error),
    /// The CA rejected the request (4xx)
    ClientProblem(Problem),
    /// The CA failed to handle the request (5xx)
    ServerProblem(Problem),
    RateLimited(RateLimitError),
    /// The authorization ended up `invalid`. Carries the problem the CA attached to the challenge.
    AuthorizationInvalid(Problem),
    ProtocolViolation(&'static str),
    CryptoFailure(SignatureError),
    DeserializationFailed(serde::de::value::Error),
    TimedOut(&'static str),
}

impl Error {
    pub async fn get_error_from_http(err_response: reqwest::Response) -> Error {
        let retry_after = HttpClient::extract_backoff(&err_response);
        let status = err_response.status();
        let problem = err_response.json::<Problem>().await.unwrap_or_else(|_| Problem {
            typ: "unknown".to_string(),
            detail: Some(format!("HTTP error: {status}")),
            subproblems: vec![],
        });
        Self::from_problem(status, problem, retry_after)
    }

    fn from_problem(status: StatusCode, problem: Problem, retry_after: Option<SystemTime>) -> Error {
        if problem.is_rate_limit() || status == StatusCode::TOO_MANY_REQUESTS {
            RateLimitError {
                problem,
                retry_after,
            }
            .into()
        } else if status.is_server_error() || problem.is_server_failure() {
            Error::ServerProblem(problem)
        } else {
            Error::ClientProblem(problem)
        }
    }

    /// Whether sending the same request again later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::ServerProblem(_) | Error::RateLimited(_) | Error::TimedOut(_) => true,
            Error::ClientProblem(problem) => problem.is_bad_nonce(),
            Error::AuthorizationInvalid(_)
            | Error::ProtocolViolation(_)
            | Error::CryptoFailure(_)
            | Error::DeserializationFailed(_) => false,
        }
    }

    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Error::ClientProblem(problem) | Error::ServerProblem(problem) | Error::AuthorizationInvalid(problem) => {
                Some(problem)
            }
            Error::RateLimited(rate_limit) => Some(&rate_limit.problem),
            Error::Http(_)
            | Error::ProtocolViolation(_)
            | Error::CryptoFailure(_)
            | Error::DeserializationFailed(_)
            | Error::TimedOut(_) => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Http(err)
    }
}

impl From<serde::de::value::Error> for Error {
    fn from(err: serde::de::value::Error) -> Error {
        Error::DeserializationFailed(err)
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Error {
        Error::CryptoFailure(err)
    }
}

impl From<RateLimitError> for Error {
    fn from(err: RateLimitError) -> Error {
        Error::RateLimited(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Http(e) => {
                write!(f, "HTTP error: {e}")
            }
            Error::ClientProblem(e) => {
                write!(f, "The CA rejected the request: {e}")
            }
            Error::ServerProblem(e) => {
                write!(f, "The CA reported an internal problem: {e}")
            }
            Error::AuthorizationInvalid(e) => {
                write!(f, "The CA could not validate the DNS challenge: {e}")
            }
            Error::ProtocolViolation(e) => write!(f, "ACME protocol specification violated: {e}"),
            Error::CryptoFailure(msg) => {
                write!(f, "error during cryptographic operation: {msg}")
            }
            Error::DeserializationFailed(serde) => {
                write!(f, "parsing server response failed: {serde}")
            }
            Error::RateLimited(rate_limit) => {
                write!(f, "{rate_limit}")
            }
            Error::TimedOut(msg) => {
                write!(f, "timeout: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // Skip one level (i.e. directly call source on the embedded error)
        // because we already print the higher-level error during Display, so don't duplicate it in the chain.
        match &self {
            Error::Http(e) => e.source(),
            Error::DeserializationFailed(serde) => serde.source(),
            Error::CryptoFailure(crypto) => crypto.source(),
            Error::RateLimited(rate_limit) => rate_limit.source(),
            Error::ClientProblem(_)
            | Error::ServerProblem(_)
            | Error::AuthorizationInvalid(_)
            | Error::ProtocolViolation(_)
            | Error::TimedOut(_) => None,
        }
    }
}

pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
pub const ACME_SERVER_INTERNAL: &str = "urn:ietf:params:acme:error:serverInternal";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    #[serde(default)]
    pub subproblems: Vec<Subproblem>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE || self.subproblems.iter().any(Subproblem::is_bad_nonce)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED || self.subproblems.iter().any(Subproblem::is_rate_limit)
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
            || self.subproblems.iter().any(Subproblem::is_server_failure)
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        } else {
            write!(f, "{typ}")?;
        }
        for subproblem in &self.subproblems {
            write!(f, "\nadditionally, the server reported:\n{subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl Subproblem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE
    }

    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED
    }

    pub fn is_server_failure(&self) -> bool {
        self.typ == ACME_SERVER_INTERNAL
    }
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let typ = &self.typ;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}")?;
        } else {
            write!(f, "{typ}")?;
        }
        if let Some(identifier) = &self.identifier {
            write!(f, "(for identifier: {identifier})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimitError {
    pub problem: Problem,
    pub retry_after: Option<SystemTime>,
}

impl std::error::Error for RateLimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl Display for RateLimitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let problem = &self.problem;
        write!(f, "The CA enforced a rate limit: {problem}")?;
        if let Some(retry_after) = self.retry_after {
            let retry_after = time::OffsetDateTime::from(retry_after);
            write!(f, ", and asked to us to retry after: {retry_after}")?;
        }
        Ok(())
    }
}
