use crate::crypto::asymmetric::KeyPair;
use anyhow::{Context, Error, bail};
use rcgen::{CertificateSigningRequest, DnType, DistinguishedName};
use std::io::{BufRead, Cursor, Seek};
use tracing::{debug, warn};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

/// The maximum number of certificates we will parse in a PEM-array of certificates
const MAX_CERTIFICATE_CHAIN_LENGTH: usize = 100;

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Builds a CSR for a single domain, carrying it both as common name and as the only SAN.
pub fn create_csr(cert_key: &KeyPair, domain: &str) -> Result<CertificateSigningRequest, Error> {
    let rcgen_keypair = cert_key.to_rcgen_keypair()?;
    let mut cert_params =
        rcgen::CertificateParams::new(vec![domain.to_string()]).context("CSR generation failed")?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, domain);
    cert_params.distinguished_name = distinguished_name;
    let csr = cert_params
        .serialize_request(&rcgen_keypair)
        .context("Signing CSR failed")?;
    Ok(csr)
}

/// A downloaded chain, split into the leaf and the certificate that issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChain {
    pub certificate: ParsedX509Certificate,
    pub issuer_certificate: ParsedX509Certificate,
}

impl IssuedChain {
    pub fn certificate_pem(&self) -> String {
        self.certificate.to_pem()
    }

    pub fn issuer_certificate_pem(&self) -> String {
        self.issuer_certificate.to_pem()
    }
}

/// Splits a `application/pem-certificate-chain` document. The first certificate is the leaf,
/// the second its issuer; anything after that (cross-signs, roots) is ignored.
pub fn split_chain<B: AsRef<[u8]>>(pem_chain: B) -> anyhow::Result<IssuedChain> {
    let mut certificates = load_certificates_from_memory(pem_chain, Some(MAX_CERTIFICATE_CHAIN_LENGTH))?;
    if certificates.len() < 2 {
        bail!(
            "Expected a certificate chain with an issuer certificate, got {} certificate(s)",
            certificates.len()
        );
    }
    if certificates.len() > 2 {
        debug!(
            "Ignoring {} additional certificate(s) in the chain",
            certificates.len() - 2
        );
    }
    let issuer_certificate = certificates.remove(1);
    let certificate = certificates.remove(0);
    if certificate.issuer != issuer_certificate.subject {
        warn!(
            "Issued certificate names {} as issuer, but the chain contains {}",
            certificate.issuer, issuer_certificate.subject
        );
    }
    Ok(IssuedChain {
        certificate,
        issuer_certificate,
    })
}

pub fn load_certificates_from_memory<B: AsRef<[u8]>>(
    pem_bytes: B,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let reader = Cursor::new(pem_bytes);
    load_certificates_from_reader(reader, limit)
}

fn load_certificates_from_reader<R: BufRead + Seek>(
    reader: R,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ParsedX509Certificate>> {
    let mut certificates = Vec::new();
    for pem in Pem::iter_from_reader(reader).take(limit.unwrap_or(MAX_CERTIFICATE_CHAIN_LENGTH)) {
        let pem = pem.context("Reading PEM block failed")?;
        if pem.label != CERTIFICATE_TAG {
            bail!("Unexpected PEM block {} in certificate chain", pem.label);
        }
        let parsed_x509 = ParsedX509Certificate::try_from(pem.contents)?;
        certificates.push(parsed_x509);
    }
    Ok(certificates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedX509Certificate {
    pub serial: BigUint,
    pub subject: String,
    pub issuer: String,
    pub validity: Validity,
    pub dns_names: Vec<String>,
    pub raw_bytes: Vec<u8>,
}

impl TryFrom<Vec<u8>> for ParsedX509Certificate {
    type Error = Error;

    fn try_from(der_bytes: Vec<u8>) -> anyhow::Result<ParsedX509Certificate> {
        let (_extra_bytes, cert) = x509_parser::certificate::X509Certificate::from_der(&der_bytes)
            .context("Reading X.509 structure: Decoding DER failed")?;
        let serial = cert.serial.clone();
        let subject = cert.subject.to_string();
        let issuer = cert.issuer.to_string();
        let validity = (&cert.validity).into();
        let mut dns_names = Vec::new();
        for extension in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns_name) => dns_names.push((*dns_name).to_string()),
                        unsupported => {
                            warn!("Found unsupported general name {unsupported} in certificate");
                        }
                    }
                }
            }
        }
        Ok(Self {
            serial,
            subject,
            issuer,
            validity,
            dns_names,
            raw_bytes: der_bytes,
        })
    }
}

impl ParsedX509Certificate {
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(CERTIFICATE_TAG, self.raw_bytes.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validity {
    pub not_before: time::OffsetDateTime,
    pub not_after: time::OffsetDateTime,
}

impl From<&x509_parser::certificate::Validity> for Validity {
    fn from(value: &x509_parser::certificate::Validity) -> Self {
        Self {
            not_before: value.not_before.to_datetime(),
            not_after: value.not_after.to_datetime(),
        }
    }
}
