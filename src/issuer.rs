use crate::acme::client::{AccountRegisterOptions, AcmeClient, AcmeClientBuilder, RetryPolicy};
use crate::acme::error::{Error as ProtocolError, ProtocolResult};
use crate::acme::object::{Authorization, AuthorizationStatus, Identifier, NewOrderRequest, Order, OrderStatus};
use crate::cert::{IssuedChain, split_chain};
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::jws::JsonWebKey;
use crate::error::{Error, Result};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

/// An ACME CA, identified by its directory URL. The directory is fetched on first use.
#[derive(Debug)]
pub struct AcmeIssuer {
    directory_url: Url,
    retry_policy: RetryPolicy,
    client: OnceCell<AcmeClient>,
}

impl AcmeIssuer {
    pub fn new(directory_url: Url, retry_policy: RetryPolicy) -> Self {
        Self {
            directory_url,
            retry_policy,
            client: OnceCell::new(),
        }
    }

    pub fn directory_url(&self) -> &Url {
        &self.directory_url
    }

    pub async fn client(&self) -> ProtocolResult<&AcmeClient> {
        self.client
            .get_or_try_init(|| async {
                debug!("Fetching ACME directory {}", self.directory_url);
                AcmeClientBuilder::new(self.directory_url.clone())
                    .with_retry_policy(self.retry_policy)
                    .try_build()
                    .await
            })
            .await
    }

    /// Registers the account key with the CA (or finds the existing registration) and
    /// returns a handle for account-bound operations.
    pub async fn with_account(&self, keypair: KeyPair, email: &str) -> Result<AcmeIssuerWithAccount<'_>> {
        let contact = Url::parse(&format!("mailto:{email}"))
            .map_err(|e| Error::account_key(email, format!("invalid contact address: {e}")))?;
        let client = self.client().await?;
        let options = AccountRegisterOptions {
            contact: vec![contact],
            terms_of_service_agreed: Some(true),
        };
        let (jwk, account_url, _account) = client.register_account(JsonWebKey::new(keypair), options).await?;
        debug!("Using ACME account {account_url}");
        Ok(AcmeIssuerWithAccount {
            client,
            jwk,
            account_url,
        })
    }
}

/// A freshly created order, reduced to the parts needed to complete it later
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub order_url: Url,
    pub authorization_url: Url,
    pub authorization: Authorization,
}

#[derive(Debug)]
pub struct AcmeIssuerWithAccount<'a> {
    client: &'a AcmeClient,
    jwk: JsonWebKey,
    account_url: Url,
}

impl AcmeIssuerWithAccount<'_> {
    pub fn account_key(&self) -> &JsonWebKey {
        &self.jwk
    }

    pub fn account_url(&self) -> &Url {
        &self.account_url
    }

    async fn new_order(&self, domain: &str) -> Result<(Url, Order)> {
        let request = NewOrderRequest {
            identifiers: vec![Identifier::dns(domain)],
        };
        let (order_url, order) = self.client.new_order(&self.jwk, &request).await?;
        debug!("Order URL: {order_url} ({})", order.status);
        Ok((order_url, order))
    }

    /// Creates an order for `domain` and fetches its (single) authorization
    pub async fn request_authorization(&self, domain: &str) -> Result<AuthorizationRequest> {
        info!("Requesting authorization for {domain}");
        let (order_url, order) = self.new_order(domain).await?;
        if order.status == OrderStatus::Invalid {
            return Err(invalid_order(order).into());
        }
        let authorization_url = match order.authorizations.as_slice() {
            [authorization_url] => authorization_url.clone(),
            [] => {
                return Err(ProtocolError::ProtocolViolation("CA created an order without authorizations").into());
            }
            _ => {
                return Err(ProtocolError::ProtocolViolation(
                    "CA requires multiple authorizations for a single domain",
                )
                .into());
            }
        };
        let authorization = self.client.get_authorization(&self.jwk, &authorization_url).await?;
        debug!(
            "Authorization {authorization_url} for {domain} is {}",
            authorization.status
        );
        Ok(AuthorizationRequest {
            order_url,
            authorization_url,
            authorization,
        })
    }

    /// Asks the CA to validate the challenge and waits until it has decided.
    ///
    /// An authorization that is already valid (e.g. from an earlier, interrupted attempt) is
    /// accepted without contacting the challenge again.
    pub async fn notify_challenge_ready(&self, authorization_url: &Url, challenge_url: &Url) -> Result<()> {
        let authorization = self.client.get_authorization(&self.jwk, authorization_url).await?;
        match authorization.status {
            AuthorizationStatus::Valid => {
                debug!("Authorization {authorization_url} is already valid");
                return Ok(());
            }
            AuthorizationStatus::Invalid => {
                let problem = authorization.challenge_error().cloned().ok_or(ProtocolError::ProtocolViolation(
                    "authorization is invalid, but CA did not provide an error message why",
                ))?;
                return Err(ProtocolError::AuthorizationInvalid(problem).into());
            }
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Deactivated | AuthorizationStatus::Expired | AuthorizationStatus::Revoked => {
                return Err(ProtocolError::ProtocolViolation(
                    "authorization is deactivated, expired or revoked, create a new order",
                )
                .into());
            }
        }
        debug!("Asking CA to validate challenge {challenge_url}");
        let challenge = self.client.respond_to_challenge(&self.jwk, challenge_url).await?;
        debug!("Challenge {challenge_url} is {}", challenge.status);
        self.client.poll_authorization(&self.jwk, authorization_url).await?;
        info!("The CA validated the challenge");
        Ok(())
    }

    /// Submits `csr_der` for the order at `order_url` and returns the issued chain.
    ///
    /// An order that was already finalized belongs to a certificate key from an earlier
    /// attempt. In that case a fresh order is placed, which the CA can mark ready right away
    /// because the authorization is still valid.
    pub async fn finalize_order(&self, domain: &str, order_url: &Url, csr_der: &[u8]) -> Result<IssuedChain> {
        let mut order_url = order_url.clone();
        let mut order = self.client.get_order(&self.jwk, &order_url).await?;
        debug!("Order {order_url} is {}", order.status);
        if order.status == OrderStatus::Processing {
            debug!("Order is still being processed from an earlier attempt, waiting for it");
            order = self.client.poll_order(&self.jwk, order, &order_url, None).await?;
        }
        match order.status {
            OrderStatus::Ready => {}
            OrderStatus::Valid => {
                info!("Order for {domain} was already finalized, placing a new order for the new key");
                let (fresh_url, fresh_order) = self.new_order(domain).await?;
                if fresh_order.status != OrderStatus::Ready {
                    return Err(ProtocolError::ProtocolViolation(
                        "new order for an already authorized domain is not ready for finalization",
                    )
                    .into());
                }
                order_url = fresh_url;
                order = fresh_order;
            }
            OrderStatus::Pending => {
                return Err(ProtocolError::ProtocolViolation(
                    "order is still pending, the challenge has not been validated",
                )
                .into());
            }
            OrderStatus::Invalid => return Err(invalid_order(order).into()),
            OrderStatus::Processing => {
                return Err(ProtocolError::TimedOut("Timed out waiting for order finalization").into());
            }
        }

        info!("Finalizing order for {domain}");
        let final_order = self
            .client
            .finalize_order(&self.jwk, &order_url, &order, csr_der)
            .await?;
        let certificate_url = final_order.certificate.ok_or(ProtocolError::ProtocolViolation(
            "CA did not provide a certificate URL for final order",
        ))?;
        debug!("Final certificate available @ {certificate_url}");
        let downloaded = self
            .client
            .download_certificate(&self.jwk, &certificate_url)
            .await?;
        let chain = split_chain(downloaded.into_inner()).map_err(Error::Certificate)?;
        info!("Successfully issued a certificate for {domain}");
        Ok(chain)
    }
}

fn invalid_order(order: Order) -> ProtocolError {
    match order.error {
        Some(problem) => ProtocolError::ClientProblem(problem),
        None => ProtocolError::ProtocolViolation("Order is invalid, but CA did not provide an error message"),
    }
}


#[cfg(test)]
mod tests {
    use super::test_helper::{MockCa, TOKEN};
    use super::*;
    use crate::acme::client::test_helper::fast_retry_policy;
    use crate::cert::test_helper::issue_chain;
    use crate::crypto::asymmetric::{KeyPair, KeyType};

    const DOMAIN: &str = "example.com";
    const EMAIL: &str = "admin@example.org";

    fn issuer(ca: &MockCa) -> AcmeIssuer {
        AcmeIssuer::new(ca.directory_url(), fast_retry_policy())
    }

    fn account_key() -> KeyPair {
        KeyPair::generate(KeyType::default()).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_with_account() {
        let ca = MockCa::start().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();
        assert_eq!(account.account_url(), &ca.url("/acct/1"));
        assert_eq!(account.account_key().account_url(), Some(&ca.url("/acct/1")));
    }

    #[test_log::test(tokio::test)]
    async fn test_request_authorization() {
        let mut ca = MockCa::start().await;
        ca.new_order_mock(DOMAIN, "pending").create_async().await;
        ca.authz_mock(DOMAIN, "pending", "pending").create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let request = account.request_authorization(DOMAIN).await.unwrap();

        assert_eq!(request.order_url, ca.url("/order/1"));
        assert_eq!(request.authorization_url, ca.url("/authz/1"));
        let (challenge, dns) = request.authorization.dns_challenge().unwrap();
        assert_eq!(challenge.url, ca.url("/chall/1"));
        assert_eq!(dns.token.as_str(), TOKEN);
    }

    #[tokio::test]
    async fn test_request_authorization_without_authorizations() {
        let mut ca = MockCa::start().await;
        let body = serde_json::json!({
            "status": "pending",
            "identifiers": [{"type": "dns", "value": DOMAIN}],
            "authorizations": [],
            "finalize": ca.url("/order/1/finalize"),
        })
        .to_string();
        let location = ca.url("/order/1").to_string();
        ca.server
            .mock("POST", "/new-order")
            .with_status(201)
            .with_header("Location", &location)
            .with_body(body)
            .create_async()
            .await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let err = account.request_authorization(DOMAIN).await.unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ProtocolError::ProtocolViolation(_))),
            "unexpected error {err:?}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_notify_challenge_ready() {
        let mut ca = MockCa::start().await;
        // Initial check and first poll see a pending authorization
        let pending = ca.authz_mock(DOMAIN, "pending", "pending").expect(2).create_async().await;
        ca.authz_mock(DOMAIN, "valid", "valid").create_async().await;
        let challenge = ca.challenge_mock().expect(1).create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        account
            .notify_challenge_ready(&ca.url("/authz/1"), &ca.url("/chall/1"))
            .await
            .unwrap();

        pending.assert_async().await;
        challenge.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_challenge_ready_when_already_valid() {
        let mut ca = MockCa::start().await;
        ca.authz_mock(DOMAIN, "valid", "valid").create_async().await;
        let challenge = ca.challenge_mock().expect(0).create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        account
            .notify_challenge_ready(&ca.url("/authz/1"), &ca.url("/chall/1"))
            .await
            .unwrap();
        challenge.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_challenge_ready_with_expired_authorization() {
        let mut ca = MockCa::start().await;
        ca.authz_mock(DOMAIN, "expired", "pending").create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let err = account
            .notify_challenge_ready(&ca.url("/authz/1"), &ca.url("/chall/1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(
            matches!(err, Error::Protocol(ProtocolError::ProtocolViolation(_))),
            "unexpected error {err:?}"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_finalize_ready_order() {
        let mut ca = MockCa::start().await;
        ca.order_mock(DOMAIN, "ready").create_async().await;
        let finalize = ca.finalize_mock(DOMAIN).expect(1).create_async().await;
        ca.certificate_mock(&issue_chain(DOMAIN)).create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let chain = account
            .finalize_order(DOMAIN, &ca.url("/order/1"), b"not really a CSR")
            .await
            .unwrap();

        assert_eq!(chain.certificate.dns_names, vec![DOMAIN.to_string()]);
        finalize.assert_async().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_finalize_already_valid_order_places_new_order() {
        let mut ca = MockCa::start().await;
        ca.order_mock(DOMAIN, "valid").create_async().await;
        let new_order = ca.new_order_mock(DOMAIN, "ready").expect(1).create_async().await;
        let finalize = ca.finalize_mock(DOMAIN).expect(1).create_async().await;
        ca.certificate_mock(&issue_chain(DOMAIN)).create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        account
            .finalize_order(DOMAIN, &ca.url("/order/1"), b"not really a CSR")
            .await
            .unwrap();

        new_order.assert_async().await;
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_finalize_pending_order() {
        let mut ca = MockCa::start().await;
        ca.order_mock(DOMAIN, "pending").create_async().await;
        let finalize = ca.finalize_mock(DOMAIN).expect(0).create_async().await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let err = account
            .finalize_order(DOMAIN, &ca.url("/order/1"), b"not really a CSR")
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ProtocolError::ProtocolViolation(_))),
            "unexpected error {err:?}"
        );
        finalize.assert_async().await;
    }

    #[tokio::test]
    async fn test_finalize_invalid_order() {
        let mut ca = MockCa::start().await;
        let body = serde_json::json!({
            "status": "invalid",
            "identifiers": [{"type": "dns", "value": DOMAIN}],
            "authorizations": [ca.url("/authz/1")],
            "finalize": ca.url("/order/1/finalize"),
            "error": {"type": "urn:ietf:params:acme:error:unauthorized", "detail": "authorization failed"},
        })
        .to_string();
        ca.server
            .mock("POST", "/order/1")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let err = account
            .finalize_order(DOMAIN, &ca.url("/order/1"), b"not really a CSR")
            .await
            .unwrap_err();
        let Error::Protocol(ProtocolError::ClientProblem(problem)) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(problem.detail.as_deref(), Some("authorization failed"));
    }

    #[tokio::test]
    async fn test_finalize_with_broken_chain() {
        let mut ca = MockCa::start().await;
        ca.order_mock(DOMAIN, "ready").create_async().await;
        ca.finalize_mock(DOMAIN).create_async().await;
        ca.certificate_mock("-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n")
            .create_async()
            .await;
        let issuer = issuer(&ca);
        let account = issuer.with_account(account_key(), EMAIL).await.unwrap();

        let err = account
            .finalize_order(DOMAIN, &ca.url("/order/1"), b"not really a CSR")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)), "unexpected error {err:?}");
    }
}
