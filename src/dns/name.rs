use crate::error::{Error, Result};
use hickory_resolver::Name;

const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Checks that `domain` is a usable DNS identifier and returns it in canonical form
/// (lowercase ASCII, no trailing dot). Internationalized names come back as punycode, the
/// only form ACME identifiers and certificate names accept. A single leading wildcard label
/// is allowed.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidDomain {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(invalid("empty domain name"));
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    if trimmed.rfind('*').is_some_and(|pos| pos != 0) || trimmed.starts_with("*") && !trimmed.starts_with("*.") {
        return Err(invalid("wildcards are only allowed as the leftmost label"));
    }
    let name = Name::from_utf8(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if name.num_labels() < 2 {
        return Err(invalid("not a fully qualified domain name"));
    }
    let ascii = name.to_ascii();
    Ok(ascii.strip_suffix('.').unwrap_or(&ascii).to_ascii_lowercase())
}

/// The name of the TXT record a dns-01 challenge for `domain` is validated against.
///
/// For `*.example.com` this is `_acme-challenge.example.com`. Internationalized names are
/// returned in their ASCII (punycode) form, which is what resolvers are queried with.
pub fn challenge_record_name(domain: &str) -> Result<String> {
    let invalid = |reason: String| Error::InvalidDomain {
        domain: domain.to_string(),
        reason,
    };
    let name = Name::from_utf8(domain).map_err(|e| invalid(e.to_string()))?;
    let base = if name.is_wildcard() { name.base_name() } else { name };
    let challenge_name = base
        .prepend_label(ACME_CHALLENGE_LABEL)
        .map_err(|e| invalid(e.to_string()))?;
    let ascii = challenge_name.to_ascii();
    Ok(ascii.strip_suffix('.').map(ToString::to_string).unwrap_or(ascii))
}
