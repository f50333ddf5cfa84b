//! ECDSA key pairs for ACME accounts and issued certificates.

use crate::crypto::SignatureError;
use crate::crypto::jws::{Algorithm, JsonWebKeyParameters};
use anyhow::{Context, anyhow, bail};
use aws_lc_rs::encoding::{AsBigEndian, EcPublicKeyUncompressedBin};
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature;
use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING};
use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use pem::Pem;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// Uncompressed SEC1 point marker, followed by the x and y coordinates
const UNCOMPRESSED_POINT: u8 = 0x04;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub enum KeyType {
    #[default]
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl KeyType {
    // JOSE wants fixed-size r||s signatures, not ASN.1 encoded ones
    fn signing_algorithm(self) -> &'static signature::EcdsaSigningAlgorithm {
        match self {
            KeyType::P256 => &ECDSA_P256_SHA256_FIXED_SIGNING,
            KeyType::P384 => &ECDSA_P384_SHA384_FIXED_SIGNING,
        }
    }

    fn coordinate_len(self) -> usize {
        match self {
            KeyType::P256 => 32,
            KeyType::P384 => 48,
        }
    }

    pub fn curve_name(self) -> &'static str {
        match self {
            KeyType::P256 => "P-256",
            KeyType::P384 => "P-384",
        }
    }
}

impl FromStr for KeyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "p256" | "p-256" | "ecdsa" => KeyType::P256,
            "p384" | "p-384" => KeyType::P384,
            other => bail!("Unknown key type {other} (expected p256 or p384)"),
        })
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ECDSA {}", self.curve_name())
    }
}

#[derive(Debug)]
pub struct KeyPair {
    key_type: KeyType,
    inner: signature::EcdsaKeyPair,
    jwk: JsonWebKeyParameters,
}

impl KeyPair {
    pub fn generate(key_type: KeyType) -> anyhow::Result<Self> {
        let inner = signature::EcdsaKeyPair::generate(key_type.signing_algorithm())
            .map_err(|_| anyhow!("Could not generate {key_type} key"))?;
        Self::from_parts(key_type, inner)
    }

    /// Reads a PKCS#8 or SEC1 private key
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        // rcgen detects the algorithm for us
        let parsed = rcgen::KeyPair::from_pem(pem).context("Reading private key from PEM failed")?;
        let key_type = if parsed.algorithm() == &rcgen::PKCS_ECDSA_P256_SHA256 {
            KeyType::P256
        } else if parsed.algorithm() == &rcgen::PKCS_ECDSA_P384_SHA384 {
            KeyType::P384
        } else {
            bail!("Unsupported private key algorithm, only ECDSA P-256 and P-384 keys are supported")
        };
        let inner = signature::EcdsaKeyPair::from_pkcs8(key_type.signing_algorithm(), parsed.serialized_der())
            .map_err(|_| anyhow!("ECDSA private key is corrupted or invalid"))?;
        Self::from_parts(key_type, inner)
    }

    fn from_parts(key_type: KeyType, inner: signature::EcdsaKeyPair) -> anyhow::Result<Self> {
        let public_key = signature::KeyPair::public_key(&inner);
        let point = AsBigEndian::<EcPublicKeyUncompressedBin>::as_be_bytes(public_key)
            .map_err(|_| anyhow!("Exporting the {key_type} public key failed"))?;
        let coordinate_len = key_type.coordinate_len();
        let jwk = match point.as_ref().split_first() {
            Some((&UNCOMPRESSED_POINT, coordinates)) if coordinates.len() == 2 * coordinate_len => {
                let (x, y) = coordinates.split_at(coordinate_len);
                JsonWebKeyParameters::new(
                    key_type,
                    BASE64_URL_SAFE_NO_PAD.encode(x),
                    BASE64_URL_SAFE_NO_PAD.encode(y),
                )
            }
            _ => bail!("Unexpected encoding of the {key_type} public key"),
        };
        Ok(Self { key_type, inner, jwk })
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn jws_algorithm(&self) -> Algorithm {
        match self.key_type {
            KeyType::P256 => Algorithm::EcdsaP256Sha256,
            KeyType::P384 => Algorithm::EcdsaP384Sha384,
        }
    }

    pub fn jwk_parameters(&self) -> &JsonWebKeyParameters {
        &self.jwk
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let signature = self
            .inner
            .sign(&SystemRandom::new(), message)
            .map_err(|_| SignatureError::SignatureGeneration("ECDSA signing failed"))?;
        Ok(signature.as_ref().to_vec())
    }

    /// The private key as PKCS#8 PEM
    pub fn to_pem(&self) -> Result<Pem, SignatureError> {
        let pkcs8 = self
            .inner
            .to_pkcs8v1()
            .map_err(|_| SignatureError::EncodingFailed("Serializing ECDSA key pair failed"))?;
        Ok(Pem::new(PRIVATE_KEY_TAG, pkcs8.as_ref()))
    }

    pub fn to_rcgen_keypair(&self) -> anyhow::Result<rcgen::KeyPair> {
        let pem = self.to_pem()?;
        Ok(rcgen::KeyPair::from_pem(&pem.to_string())?)
    }

    /// The DER-encoded `SubjectPublicKeyInfo`
    pub fn public_key_der(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.to_rcgen_keypair()?.public_key_der())
    }

    pub fn public_key_pem(&self) -> anyhow::Result<Pem> {
        Ok(Pem::new(PUBLIC_KEY_TAG, self.public_key_der()?))
    }
}
