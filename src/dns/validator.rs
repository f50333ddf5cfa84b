use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::ProtoError;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Name, Resolver, TokioResolver};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the domain does not exist (NXDOMAIN)")]
    NxDomain,
    #[error("no TXT records found")]
    NoRecords,
    #[error("DNS resolution failed")]
    LookupFailure(#[from] hickory_resolver::ResolveError),
    #[error("invalid record name")]
    InvalidName(#[from] ProtoError),
}

/// Source of TXT records. Multi-string records are returned concatenated.
#[async_trait]
pub trait TxtLookup: Send + Sync {
    async fn lookup_txt(&self, record_name: &str) -> Result<Vec<Vec<u8>>, Error>;
}

#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    /// Nameservers to query (empty = system configuration)
    pub nameservers: Vec<IpAddr>,
    pub timeout: Option<Duration>,
}

/// TXT lookups against live DNS, without caching so that every check sees fresh data.
#[derive(Debug)]
pub struct HickoryTxtLookup {
    resolver: TokioResolver,
}

impl HickoryTxtLookup {
    pub fn new(settings: &ResolverSettings) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = settings.timeout.unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
        opts.attempts = 1;
        opts.cache_size = 0;

        let builder = if settings.nameservers.is_empty() {
            Resolver::builder_tokio().unwrap_or_else(|e| {
                warn!("Failed to create DNS resolver using system configuration, using default servers instead: {e:#}");
                Resolver::builder_with_config(ResolverConfig::cloudflare(), TokioConnectionProvider::default())
            })
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &settings.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
        };
        Self {
            resolver: builder.with_options(opts).build(),
        }
    }
}

#[async_trait]
impl TxtLookup for HickoryTxtLookup {
    async fn lookup_txt(&self, record_name: &str) -> Result<Vec<Vec<u8>>, Error> {
        let lookup = match self.resolver.txt_lookup(fully_qualified(record_name)?).await {
            Ok(lookup) => lookup,
            // Note: Order matters, because is_no_records_found includes is_nx_domain
            Err(e) if e.is_nx_domain() => return Err(Error::NxDomain),
            Err(e) if e.is_no_records_found() => return Err(Error::NoRecords),
            Err(e) => return Err(e.into()),
        };
        Ok(lookup
            .iter()
            .map(|txt| txt.txt_data().iter().flat_map(|part| part.iter().copied()).collect())
            .collect())
    }
}

/// Record names are absolute, search domains from the system configuration must not apply
fn fully_qualified(record_name: &str) -> Result<Name, ProtoError> {
    let mut name = Name::from_ascii(record_name)?;
    name.set_fqdn(true);
    Ok(name)
}

/// Checks whether the challenge TXT record is visible in DNS
pub struct DnsValidator {
    lookup: Box<dyn TxtLookup>,
}

impl DnsValidator {
    pub fn new(lookup: Box<dyn TxtLookup>) -> Self {
        Self { lookup }
    }

    pub fn with_resolver(settings: &ResolverSettings) -> Self {
        Self::new(Box::new(HickoryTxtLookup::new(settings)))
    }

    /// True iff at least one TXT record at `record_name` equals `expected` exactly.
    /// Lookup failures count as "not found".
    pub async fn check(&self, record_name: &str, expected: &str) -> bool {
        let records = match self.lookup.lookup_txt(record_name).await {
            Ok(records) => records,
            Err(e @ (Error::NxDomain | Error::NoRecords)) => {
                debug!("No TXT record at {record_name}: {e}");
                return false;
            }
            Err(e) => {
                warn!("TXT lookup for {record_name} failed: {e:#}");
                return false;
            }
        };
        records.iter().any(|record| {
            trace!(
                "Found TXT record at {record_name}: {}",
                String::from_utf8_lossy(record)
            );
            record.as_slice() == expected.as_bytes()
        })
    }
}

#[cfg(test)]
pub(crate) mod test_helper {
    use super::{Error, TxtLookup};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Answers TXT lookups from a map. Names without an entry are NXDOMAIN.
    #[derive(Debug, Clone, Default)]
    pub struct StaticTxtLookup {
        records: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
    }

    impl StaticTxtLookup {
        pub fn publish(&self, name: &str, value: &str) {
            self.records
                .lock()
                .entry(name.to_string())
                .or_default()
                .push(value.as_bytes().to_vec());
        }

        pub fn publish_split(&self, name: &str, parts: &[&str]) {
            self.publish(name, &parts.concat());
        }
    }

    #[async_trait]
    impl TxtLookup for StaticTxtLookup {
        async fn lookup_txt(&self, record_name: &str) -> Result<Vec<Vec<u8>>, Error> {
            match self.records.lock().get(record_name) {
                Some(records) if records.is_empty() => Err(Error::NoRecords),
                Some(records) => Ok(records.clone()),
                None => Err(Error::NxDomain),
            }
        }
    }
}
