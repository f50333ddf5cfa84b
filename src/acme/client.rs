use crate::acme::error::ProtocolResult;
use crate::acme::error::Error;
use crate::acme::http::HttpClient;
use crate::acme::object::{
    Account, AccountRequest, Authorization, AuthorizationStatus, Challenge, Directory, EmptyObject, FinalizeRequest,
    NewOrderRequest, Nonce, Order, OrderStatus,
};
use crate::crypto::jws::{EMPTY_PAYLOAD, JsonWebKey, ProtectedHeader};
use crate::util::serde_helper::PassthroughBytes;
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::de::value::BytesDeserializer;
use std::any::TypeId;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use url::Url;

/// How often and how long the client retries failed requests and polls pending resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of retries we do, per request
    pub max_retries: usize,
    /// The default time we wait between retries, if a retry is needed
    pub default_backoff: Duration,
    /// The maximum amount of time we're willing to wait in between retries.
    /// A rate limit lifted later than this is reported instead of waited out.
    pub max_backoff: Duration,
    /// Wait between two polls, unless the server asks for a different interval
    pub poll_interval: Duration,
    /// Maximum number of polls while waiting for the server to progress in the state machine
    pub max_poll_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_secs(3),
            max_poll_attempts: 100,
        }
    }
}

impl RetryPolicy {
    fn backoff_from_retry_after(&self, retry_after: Option<SystemTime>) -> Duration {
        retry_after
            .and_then(|date| date.duration_since(SystemTime::now()).ok())
            .map_or(self.default_backoff, |backoff| backoff.min(self.max_backoff))
    }

    fn poll_wait(&self, retry_after: Option<SystemTime>) -> Duration {
        retry_after
            .and_then(|date| date.duration_since(SystemTime::now()).ok())
            .map_or(self.poll_interval, |backoff| backoff.min(self.max_backoff))
    }

    /// A rate limit is waited out only if the server names a time within our maximum backoff
    fn rate_limit_wait(&self, retry_after: Option<SystemTime>) -> Option<Duration> {
        let wait = retry_after?
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        (wait <= self.max_backoff).then_some(wait)
    }
}

pub struct AcmeClientBuilder {
    server_url: Url,
    retry_policy: RetryPolicy,
}

impl AcmeClientBuilder {
    pub fn new(acme_server_url: Url) -> AcmeClientBuilder {
        Self {
            server_url: acme_server_url,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub async fn try_build(self) -> ProtocolResult<AcmeClient> {
        AcmeClient::try_new(self).await
    }
}

#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct AcmeClient {
    http_client: HttpClient,
    directory: Directory,
    nonce_pool: Mutex<VecDeque<Nonce>>,
    retry_policy: RetryPolicy,
}

impl AcmeClient {
    async fn try_new(builder: AcmeClientBuilder) -> ProtocolResult<Self> {
        let http_client = HttpClient::try_new()?;
        debug!("Fetching ACME directory from {}", builder.server_url);
        let directory_response = http_client.get(builder.server_url).await?;
        let directory = match directory_response.status() {
            StatusCode::OK => directory_response.json().await?,
            _ => return Err(Error::get_error_from_http(directory_response).await),
        };
        Ok(Self {
            http_client,
            directory,
            nonce_pool: Mutex::new(VecDeque::default()),
            retry_policy: builder.retry_policy,
        })
    }

    pub async fn get_nonce(&self) -> ProtocolResult<Nonce> {
        let mut last_error;
        let mut retry = 0;
        loop {
            let pooled_nonce = self.nonce_pool.lock().pop_front();
            if let Some(pooled_nonce) = pooled_nonce {
                return Ok(pooled_nonce);
            }

            // Ask ACME server for new nonce, retrying if necessary
            let retry_after = match self.http_client.head(self.directory.new_nonce.clone()).await {
                Ok(response) => {
                    if let Some(nonce) = HttpClient::extract_nonce(&response) {
                        return Ok(nonce);
                    }
                    let retry_after = HttpClient::extract_backoff(&response);
                    last_error = Error::get_error_from_http(response).await;
                    retry_after
                }
                Err(transport) => {
                    last_error = transport;
                    None
                }
            };
            retry += 1;
            if retry > self.retry_policy.max_retries {
                break;
            }
            let backoff = self.retry_policy.backoff_from_retry_after(retry_after);
            debug!("Could not get a nonce ({last_error}), retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
        }
        Err(last_error)
    }

    fn try_store_nonce(&self, maybe_nonce: Option<Nonce>) {
        if let Some(nonce) = maybe_nonce {
            self.nonce_pool.lock().push_back(nonce);
        }
    }

    async fn post_with_retry<T: Serialize, R: DeserializeOwned + 'static>(
        &self,
        target_url: &Url,
        key: &JsonWebKey,
        payload: Option<&T>,
    ) -> ProtocolResult<AcmeResponse<R>> {
        let policy = &self.retry_policy;
        let mut last_error;
        let mut retry = 0;
        let mut header = ProtectedHeader::new(
            key.get_algorithm(),
            self.get_nonce().await?,
            target_url.clone(),
            key.get_parameters().clone(),
        );
        loop {
            let signed = key.sign(&header, payload)?;
            let response = match self.http_client.post(target_url.clone(), &signed).await {
                Ok(response) => response,
                Err(transport) => {
                    // The nonce may or may not have been consumed, so always fetch a fresh one
                    retry += 1;
                    if retry > policy.max_retries {
                        return Err(transport);
                    }
                    warn!("Request to {target_url} failed: {transport}. Retrying...");
                    tokio::time::sleep(policy.default_backoff).await;
                    header.nonce = self.get_nonce().await?;
                    continue;
                }
            };
            let retry_after = HttpClient::extract_backoff(&response);
            let new_nonce = HttpClient::extract_nonce(&response);
            let location = HttpClient::extract_location(&response);
            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    self.try_store_nonce(new_nonce);
                    // Weird hack: The ACME protocol uses JSON for every (POST) request and response,
                    // except when downloading a certificate. To avoid unnecessary redundancy, we always
                    // deserialize JSON here, except if the caller requests a PassthroughBytes
                    // struct, where we just pass the received bytes as-is.
                    // This condition is resolved at compile-time, depending on `R`.
                    let body: R = if TypeId::of::<R>() == TypeId::of::<PassthroughBytes>() {
                        let bytes = response.bytes().await?;
                        let deserializer = BytesDeserializer::<'_, serde::de::value::Error>::new(&bytes);
                        R::deserialize(deserializer)?
                    } else {
                        response.json().await?
                    };
                    return Ok(AcmeResponse {
                        status,
                        location,
                        retry_after,
                        body,
                    });
                }
                _ => {
                    last_error = Error::get_error_from_http(response).await;
                    if last_error.problem().is_some_and(|problem| problem.is_bad_nonce()) {
                        header.nonce = new_nonce.ok_or(Error::ProtocolViolation(
                            "Server did not provide a (valid) Replay-Nonce on a badNonce error",
                        ))?;
                        retry += 1;
                        if retry > policy.max_retries {
                            break;
                        }
                        // Immediate retry with new nonce
                        continue;
                    }
                    self.try_store_nonce(new_nonce);

                    if let Error::RateLimited(rate_limit) = &last_error {
                        match policy.rate_limit_wait(rate_limit.retry_after) {
                            Some(wait) if retry < policy.max_retries => {
                                warn!("Rate limited by the CA, waiting {wait:?} before retrying");
                                retry += 1;
                                tokio::time::sleep(wait).await;
                                header.nonce = self.get_nonce().await?;
                                continue;
                            }
                            _ => break,
                        }
                    }
                }
            }
            retry += 1;
            // Give up if the request doesn't seem salvageable
            if status.is_client_error() || retry > policy.max_retries {
                break;
            }
            let backoff = policy.backoff_from_retry_after(retry_after);
            debug!("CA responded with {status}, retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
            header.nonce = self.get_nonce().await?;
        }
        Err(last_error)
    }

    pub fn get_directory(&self) -> &Directory {
        &self.directory
    }

    /// Registers `key` with the CA, or looks up the existing registration. CAs answer 200
    /// instead of 201 for a key that is already registered, both are fine.
    pub async fn register_account(
        &self,
        key: JsonWebKey,
        options: AccountRegisterOptions,
    ) -> ProtocolResult<(JsonWebKey, Url, Account)> {
        let target_url = &self.get_directory().new_account;
        let payload = AccountRequest {
            contact: options.contact,
            terms_of_service_agreed: options.terms_of_service_agreed,
            only_return_existing: None,
        };
        let response = self.post_with_retry(target_url, &key, Some(&payload)).await?;
        let account_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an account URL for created account",
        ))?;
        let account: Account = response.body;
        if response.status == StatusCode::OK {
            debug!("Reusing existing ACME account {account_url}");
        } else {
            debug!("Registered new ACME account {account_url}");
        }
        Ok((key.into_existing(account_url.clone()), account_url, account))
    }

    pub async fn new_order(&self, account_key: &JsonWebKey, request: &NewOrderRequest) -> ProtocolResult<(Url, Order)> {
        let target_url = &self.get_directory().new_order;
        let response = self.post_with_retry(target_url, account_key, Some(request)).await?;
        let order_url = response.location.ok_or(Error::ProtocolViolation(
            "ACME server did not provide an order URL for created order",
        ))?;
        Ok((order_url, response.body))
    }

    pub async fn get_order(&self, account_key: &JsonWebKey, order_url: &Url) -> ProtocolResult<Order> {
        let response = self.post_with_retry(order_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    pub async fn get_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let response = self.post_with_retry(authz_url, account_key, EMPTY_PAYLOAD).await?;
        Ok(response.body)
    }

    pub async fn download_certificate(
        &self,
        account_key: &JsonWebKey,
        certificate_url: &Url,
    ) -> ProtocolResult<PassthroughBytes> {
        let response = self
            .post_with_retry(certificate_url, account_key, EMPTY_PAYLOAD)
            .await?;
        Ok(response.body)
    }

    /// Tells the CA that the challenge response is in place. Does not wait for validation.
    pub async fn respond_to_challenge(
        &self,
        account_key: &JsonWebKey,
        challenge_url: &Url,
    ) -> ProtocolResult<Challenge> {
        let response = self
            .post_with_retry(challenge_url, account_key, Some(&EmptyObject {}))
            .await?;
        Ok(response.body)
    }

    /// Polls the authorization until the CA has decided on it.
    ///
    /// Returns the authorization once it is `valid`. An `invalid` authorization yields
    /// [`Error::AuthorizationInvalid`] with the problem the CA reported on the challenge,
    /// any other terminal status a protocol error.
    pub async fn poll_authorization(&self, account_key: &JsonWebKey, authz_url: &Url) -> ProtocolResult<Authorization> {
        let mut retry_after = None;
        for attempt in 0..self.retry_policy.max_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_policy.poll_wait(retry_after)).await;
            }
            let response: AcmeResponse<Authorization> =
                self.post_with_retry(authz_url, account_key, EMPTY_PAYLOAD).await?;
            retry_after = response.retry_after;
            let authz = response.body;
            debug!("Authorization {authz_url} is {}", authz.status);
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => return Ok(authz),
                AuthorizationStatus::Invalid => {
                    let problem = authz.challenge_error().cloned().ok_or(Error::ProtocolViolation(
                        "authorization is invalid, but CA did not provide an error message why",
                    ))?;
                    return Err(Error::AuthorizationInvalid(problem));
                }
                AuthorizationStatus::Deactivated | AuthorizationStatus::Expired | AuthorizationStatus::Revoked => {
                    return Err(Error::ProtocolViolation(
                        "authorization was deactivated, expired or revoked while waiting for validation",
                    ));
                }
            }
        }
        // Authorization never reached acceptable state
        Err(Error::TimedOut("Timed out waiting for challenge validation"))
    }

    /// Submits the CSR and waits for the order to become `valid`
    pub async fn finalize_order(&self, account_key: &JsonWebKey, order_url: &Url, order: &Order, csr_der: &[u8]) -> ProtocolResult<Order> {
        let request = FinalizeRequest {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };
        let response: AcmeResponse<Order> = self
            .post_with_retry(&order.finalize, account_key, Some(&request))
            .await?;
        // Some CAs answer with the order URL in Location, fall back to the one we know otherwise
        let order_url = response.location.unwrap_or_else(|| order_url.clone());
        self.poll_order(account_key, response.body, &order_url, response.retry_after)
            .await
    }

    pub async fn poll_order(
        &self,
        account_key: &JsonWebKey,
        mut order: Order,
        order_url: &Url,
        mut retry_after: Option<SystemTime>,
    ) -> ProtocolResult<Order> {
        for _ in 0..self.retry_policy.max_poll_attempts {
            match order.status {
                OrderStatus::Pending => {
                    return Err(Error::ProtocolViolation(
                        "BUG: Requested finalized order polling but CA reported order is still pending",
                    ));
                }
                OrderStatus::Ready => {
                    return Err(Error::ProtocolViolation(
                        "BUG: Requested finalized order polling but CA reported order has not been finalized yet",
                    ));
                }
                OrderStatus::Processing => {
                    tokio::time::sleep(self.retry_policy.poll_wait(retry_after)).await;
                    let response: AcmeResponse<Order> =
                        self.post_with_retry(order_url, account_key, EMPTY_PAYLOAD).await?;
                    retry_after = response.retry_after;
                    order = response.body;
                }
                OrderStatus::Valid => {
                    return Ok(order);
                }
                OrderStatus::Invalid => {
                    return if let Some(err) = order.error {
                        Err(Error::ClientProblem(err))
                    } else {
                        Err(Error::ProtocolViolation(
                            "Order is invalid, but CA did not provide an error message",
                        ))
                    };
                }
            }
        }
        Err(Error::TimedOut("Timed out waiting for order finalization"))
    }
}

#[derive(Debug)]
pub struct AcmeResponse<T: DeserializeOwned> {
    pub status: StatusCode,
    pub location: Option<Url>,
    pub retry_after: Option<SystemTime>,
    pub body: T,
}

#[derive(Debug)]
pub struct AccountRegisterOptions {
    pub contact: Vec<Url>,
    pub terms_of_service_agreed: Option<bool>,
}


#[cfg(test)]
mod tests {
    use super::test_helper::*;
    use super::*;
    use crate::crypto::asymmetric::{KeyPair, KeyType};
    use mockito::ServerGuard;
    use serde_json::json;
    use std::str::FromStr;

    const ACCOUNT_URL: &str = "http://localhost/account-url";

    fn test_jwk() -> JsonWebKey {
        JsonWebKey::new(KeyPair::generate(KeyType::P256).unwrap()).into_existing(Url::parse(ACCOUNT_URL).unwrap())
    }

    async fn build_acme_client(server: &ServerGuard) -> AcmeClient {
        AcmeClientBuilder::new(server_url(server, "/directory"))
            .with_retry_policy(fast_retry_policy())
            .try_build()
            .await
            .unwrap()
    }

    fn authz_json(server: &ServerGuard, status: &str, challenge_status: &str) -> String {
        json!({
            "status": status,
            "identifier": {"type": "dns", "value": "example.com"},
            "challenges": [{
                "type": "dns-01",
                "url": server_url(server, "/chall/1"),
                "status": challenge_status,
                "token": "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA",
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_try_new() {
        let server = create_acme_server().await;
        let client = build_acme_client(&server).await;
        assert_eq!(client.get_directory().new_order, server_url(&server, "/new-order"));
    }

    #[tokio::test]
    async fn test_try_new_with_broken_directory() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/directory")
            .with_status(500)
            .create_async()
            .await;
        let err = AcmeClientBuilder::new(server_url(&server, "/directory"))
            .try_build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerProblem(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn test_new_nonce() {
        let server = create_acme_server().await;
        let client = build_acme_client(&server).await;
        let nonce = client.get_nonce().await.unwrap();
        assert_eq!(nonce.to_string(), NONCE_VALUE);
    }

    #[tokio::test]
    async fn test_new_nonce_with_retry() {
        let mut server = create_acme_server().await;
        // Served before the default nonce mock until exhausted
        let limited = server
            .mock("HEAD", "/new-nonce")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("HEAD", "/new-nonce")
            .with_status(200)
            .with_header("Replay-Nonce", NONCE_VALUE)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let nonce = client.get_nonce().await.unwrap();
        assert_eq!(nonce.to_string(), NONCE_VALUE);
        limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_when_bad_nonce_retries() {
        let mut server = create_acme_server().await;
        let bad_nonce_error = json!({
            "type": "urn:ietf:params:acme:error:badNonce",
        })
        .to_string();
        let rejected = server
            .mock("POST", "/retry-test")
            .with_status(400)
            .with_header("Replay-Nonce", "ThisNonceIsValid")
            .with_header("Content-Type", "application/problem+json")
            .with_body(bad_nonce_error)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/retry-test")
            .with_status(200)
            .with_body("null")
            .expect(1)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let jwk = test_jwk();
        let response: AcmeResponse<()> = client
            .post_with_retry(&server_url(&server, "/retry-test"), &jwk, EMPTY_PAYLOAD)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_does_not_retry_client_errors() {
        let mut server = create_acme_server().await;
        let rejected = server
            .mock("POST", "/reject")
            .with_status(403)
            .with_header("Content-Type", "application/problem+json")
            .with_body(r#"{"type":"urn:ietf:params:acme:error:unauthorized","detail":"nope"}"#)
            .expect(1)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let err = client
            .post_with_retry::<_, ()>(&server_url(&server, "/reject"), &test_jwk(), EMPTY_PAYLOAD)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientProblem(_)), "unexpected error {err:?}");
        assert_eq!(err.to_string(), "The CA rejected the request: nope");
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_retries_server_errors() {
        let mut server = create_acme_server().await;
        let failing = server
            .mock("POST", "/flaky")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;
        let recovered = server
            .mock("POST", "/flaky")
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let response: AcmeResponse<()> = client
            .post_with_retry(&server_url(&server, "/flaky"), &test_jwk(), EMPTY_PAYLOAD)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        failing.assert_async().await;
        recovered.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_waits_out_short_rate_limit() {
        let mut server = create_acme_server().await;
        let limited = server
            .mock("POST", "/limited")
            .with_status(429)
            .with_header("Retry-After", "0")
            .with_header("Content-Type", "application/problem+json")
            .with_body(r#"{"type":"urn:ietf:params:acme:error:rateLimited"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/limited")
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let response: AcmeResponse<()> = client
            .post_with_retry(&server_url(&server, "/limited"), &test_jwk(), EMPTY_PAYLOAD)
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_with_retry_reports_long_rate_limit() {
        let mut server = create_acme_server().await;
        server
            .mock("POST", "/limited")
            .with_status(429)
            .with_header("Retry-After", "86400")
            .with_header("Content-Type", "application/problem+json")
            .with_body(r#"{"type":"urn:ietf:params:acme:error:rateLimited","detail":"too many certificates"}"#)
            .expect(1)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let err = client
            .post_with_retry::<_, ()>(&server_url(&server, "/limited"), &test_jwk(), EMPTY_PAYLOAD)
            .await
            .unwrap_err();
        let Error::RateLimited(rate_limit) = err else {
            panic!("expected rate limit error, got {err:?}");
        };
        assert!(rate_limit.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_register_account() {
        let mut server = create_acme_server().await;
        let account_mock = server
            .mock("POST", "/new-account")
            .match_header("content-type", "application/jose+json")
            .with_status(201)
            .with_header("Location", "/acct/1")
            .with_header("Replay-Nonce", NONCE_VALUE)
            .with_body(r#"{"status":"valid","contact":["mailto:admin@example.org"]}"#)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let key = JsonWebKey::new(KeyPair::generate(KeyType::P256).unwrap());
        let (key, account_url, account) = client
            .register_account(
                key,
                AccountRegisterOptions {
                    contact: vec![Url::parse("mailto:admin@example.org").unwrap()],
                    terms_of_service_agreed: Some(true),
                },
            )
            .await
            .unwrap();
        assert_eq!(account_url, server_url(&server, "/acct/1"));
        assert_eq!(key.account_url(), Some(&account_url));
        assert_eq!(account.contact.len(), 1);
        account_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_authorization_until_valid() {
        let mut server = create_acme_server().await;
        let pending = server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(authz_json(&server, "pending", "processing"))
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(authz_json(&server, "valid", "valid"))
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let authz = client
            .poll_authorization(&test_jwk(), &server_url(&server, "/authz/1"))
            .await
            .unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Valid);
        pending.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_authorization_invalid_carries_challenge_problem() {
        let mut server = create_acme_server().await;
        let body = json!({
            "status": "invalid",
            "identifier": {"type": "dns", "value": "example.com"},
            "challenges": [{
                "type": "dns-01",
                "url": server_url(&server, "/chall/1"),
                "status": "invalid",
                "token": "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA",
                "error": {
                    "type": "urn:ietf:params:acme:error:unauthorized",
                    "detail": "No TXT record found at _acme-challenge.example.com",
                }
            }]
        });
        server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let err = client
            .poll_authorization(&test_jwk(), &server_url(&server, "/authz/1"))
            .await
            .unwrap_err();
        let Error::AuthorizationInvalid(problem) = err else {
            panic!("expected invalid authorization, got {err:?}");
        };
        assert_eq!(
            problem.detail.as_deref(),
            Some("No TXT record found at _acme-challenge.example.com")
        );
    }

    #[tokio::test]
    async fn test_poll_authorization_times_out() {
        let mut server = create_acme_server().await;
        let pending = server
            .mock("POST", "/authz/1")
            .with_status(200)
            .with_body(authz_json(&server, "pending", "pending"))
            .expect(fast_retry_policy().max_poll_attempts)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let err = client
            .poll_authorization(&test_jwk(), &server_url(&server, "/authz/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)), "unexpected error {err:?}");
        pending.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_certificate_keeps_bytes() {
        let mut server = create_acme_server().await;
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        server
            .mock("POST", "/cert/1")
            .with_status(200)
            .with_header("Content-Type", "application/pem-certificate-chain")
            .with_body(pem)
            .create_async()
            .await;
        let client = build_acme_client(&server).await;
        let downloaded = client
            .download_certificate(&test_jwk(), &server_url(&server, "/cert/1"))
            .await
            .unwrap();
        assert_eq!(downloaded.as_slice(), pem.as_bytes());
    }

    #[test]
    fn test_backoff_from_retry_after_future_time() {
        let policy = RetryPolicy::default();
        let future = SystemTime::now() + Duration::from_secs(2);
        let backoff = policy.backoff_from_retry_after(Some(future));
        assert!(backoff.as_secs_f64() >= 1.0);
    }

    #[test]
    fn test_backoff_from_retry_after_is_capped() {
        let policy = RetryPolicy::default();
        let far_future = SystemTime::now() + Duration::from_secs(24 * 60 * 60);
        assert_eq!(policy.backoff_from_retry_after(Some(far_future)), policy.max_backoff);
        assert_eq!(policy.rate_limit_wait(Some(far_future)), None);
    }

    #[test]
    fn test_backoff_from_retry_after_nothing_or_past() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_from_retry_after(None), policy.default_backoff);
        let past = SystemTime::now() - Duration::from_secs(2);
        assert_eq!(policy.backoff_from_retry_after(Some(past)), policy.default_backoff);
        assert_eq!(policy.rate_limit_wait(Some(past)), Some(Duration::ZERO));
    }

    #[test]
    fn test_nonce_value_is_valid() {
        assert!(Nonce::from_str(NONCE_VALUE).is_ok());
    }
}
