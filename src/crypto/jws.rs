use crate::acme::object::Nonce;
use crate::crypto::asymmetric::{KeyPair, KeyType};
use crate::crypto::{SignatureError, sha256};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

#[derive(Debug, Serialize)]
pub struct ProtectedHeader {
    #[serde(rename = "alg")]
    algorithm: Algorithm,
    #[serde(skip_serializing_if = "Nonce::is_empty")]
    pub nonce: Nonce,
    #[serde(rename = "url")]
    target_url: Url,
    #[serde(flatten)]
    key: KeyParameters,
}

impl ProtectedHeader {
    pub fn new(algorithm: Algorithm, nonce: Nonce, target_url: Url, key: KeyParameters) -> Self {
        Self {
            algorithm,
            nonce,
            target_url,
            key,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    #[serde(rename = "ES256")]
    EcdsaP256Sha256,
    #[serde(rename = "ES384")]
    EcdsaP384Sha384,
}

/// How a request identifies its signer: the full public key (newAccount only) or the account URL
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum KeyParameters {
    #[serde(rename = "jwk")]
    FullKey(JsonWebKeyParameters),
    #[serde(rename = "kid")]
    AccountUrl(Url),
}

/// Public half of an EC key in JWK form (RFC 7518 §6.2.1)
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JsonWebKeyParameters {
    kty: &'static str,
    crv: KeyType,
    x: String,
    y: String,
}

impl JsonWebKeyParameters {
    pub fn new(curve: KeyType, x: String, y: String) -> Self {
        Self {
            kty: "EC",
            crv: curve,
            x,
            y,
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the required members in lexicographic order, no whitespace
    fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv.curve_name(),
            self.kty,
            self.x,
            self.y
        );
        BASE64_URL_SAFE_NO_PAD.encode(sha256(canonical.as_bytes()))
    }
}

pub const EMPTY_PAYLOAD: Option<&()> = None;

/// An account key as used for signing ACME requests. Before registration, requests carry the full
/// public key (`jwk`); afterward, they reference the account URL (`kid`).
///
/// Cloning is cheap, the key pair itself is shared.
#[derive(Debug, Clone)]
pub struct JsonWebKey {
    keypair: Arc<KeyPair>,
    parameters: KeyParameters,
    thumbprint: String,
}

impl JsonWebKey {
    pub fn new(keypair: KeyPair) -> Self {
        let jwk = keypair.jwk_parameters().clone();
        let thumbprint = jwk.thumbprint();
        Self {
            keypair: Arc::new(keypair),
            parameters: KeyParameters::FullKey(jwk),
            thumbprint,
        }
    }

    #[must_use]
    pub fn into_existing(self, account_url: Url) -> Self {
        Self {
            parameters: KeyParameters::AccountUrl(account_url),
            ..self
        }
    }

    /// The account URL, if this key has been bound to a registered account
    pub fn account_url(&self) -> Option<&Url> {
        match &self.parameters {
            KeyParameters::AccountUrl(url) => Some(url),
            KeyParameters::FullKey(_) => None,
        }
    }

    pub fn get_algorithm(&self) -> Algorithm {
        self.keypair.jws_algorithm()
    }

    pub fn get_parameters(&self) -> &KeyParameters {
        &self.parameters
    }

    /// Produces the flattened JSON serialization. `None` as payload yields the empty payload of
    /// POST-as-GET requests.
    pub fn sign<T: Serialize>(
        &self,
        header: &ProtectedHeader,
        payload: Option<&T>,
    ) -> Result<FlatJsonWebSignature, SignatureError> {
        let header = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let payload = match payload {
            Some(payload) => BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?),
            None => String::new(),
        };
        let signature = self.keypair.sign(format!("{header}.{payload}").as_bytes())?;
        Ok(FlatJsonWebSignature {
            header,
            payload,
            signature: BASE64_URL_SAFE_NO_PAD.encode(signature),
        })
    }

    pub fn get_acme_thumbprint(&self) -> &str {
        &self.thumbprint
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlatJsonWebSignature {
    #[serde(rename = "protected")]
    header: String,
    payload: String,
    signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_json(value: &str) -> serde_json::Value {
        serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(value).unwrap()).unwrap()
    }

    fn rfc7638_example_key() -> JsonWebKeyParameters {
        JsonWebKeyParameters::new(
            KeyType::P256,
            "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4".to_string(),
            "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM".to_string(),
        )
    }

    #[test]
    fn test_serialize_protected_header_with_jwk() {
        let header = ProtectedHeader::new(
            Algorithm::EcdsaP256Sha256,
            Nonce::try_from("QWERTZ".to_string()).unwrap(),
            Url::parse("https://example.com/protected-header-test").unwrap(),
            KeyParameters::FullKey(rfc7638_example_key()),
        );
        let expected_header = r#"{
  "alg": "ES256",
  "nonce": "QWERTZ",
  "url": "https://example.com/protected-header-test",
  "jwk": {
    "kty": "EC",
    "crv": "P-256",
    "x": "MKBCTNIcKUSDii11ySs3526iDZ8AiTo7Tu6KPAqv7D4",
    "y": "4Etl6SRW2YiLUrN5vfvVHuhp7x8PxltmWWlbbM4IFyM"
  }
}"#;
        assert_eq!(serde_json::to_string_pretty(&header).unwrap(), expected_header);
    }

    #[test]
    fn test_thumbprint() {
        assert_eq!(
            rfc7638_example_key().thumbprint(),
            "cn-I_WNMClehiVp51i_0VpOENW1upEerA8sEam5hn-s"
        );
    }

    #[test]
    fn test_into_existing_keeps_thumbprint_and_switches_to_kid() {
        let jwk = JsonWebKey::new(KeyPair::generate(KeyType::P256).unwrap());
        let thumbprint = jwk.get_acme_thumbprint().to_string();
        assert!(jwk.account_url().is_none());

        let account_url = Url::parse("https://ca.example/acct/17").unwrap();
        let existing = jwk.into_existing(account_url.clone());

        assert_eq!(existing.get_acme_thumbprint(), thumbprint);
        assert_eq!(existing.account_url(), Some(&account_url));
        assert_eq!(existing.get_parameters(), &KeyParameters::AccountUrl(account_url));
    }

    #[test]
    fn test_sign_post_as_get_has_empty_payload() {
        let jwk = JsonWebKey::new(KeyPair::generate(KeyType::P384).unwrap())
            .into_existing(Url::parse("https://ca.example/acct/1").unwrap());
        let header = ProtectedHeader::new(
            jwk.get_algorithm(),
            Nonce::try_from("bm9uY2U".to_string()).unwrap(),
            Url::parse("https://ca.example/order/1").unwrap(),
            jwk.get_parameters().clone(),
        );

        let signed = jwk.sign(&header, EMPTY_PAYLOAD).unwrap();

        let header_json = decode_json(&signed.header);
        assert_eq!(header_json["alg"], "ES384");
        assert_eq!(header_json["kid"], "https://ca.example/acct/1");
        assert_eq!(header_json["nonce"], "bm9uY2U");
        assert!(header_json.get("jwk").is_none());
        assert!(signed.payload.is_empty());
        assert_eq!(BASE64_URL_SAFE_NO_PAD.decode(&signed.signature).unwrap().len(), 96);
    }
}
