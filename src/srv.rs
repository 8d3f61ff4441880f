use std::time::Duration;

use crate::{
    error::Result,
    options::ServerAddress,
};

#[cfg(feature = "dns-resolver")]
use crate::error::ErrorKind;

/// The outcome of an SRV lookup: the addresses the records point at and the minimum TTL among
/// them, which paces the polling interval.
#[derive(Debug, Clone)]
pub(crate) struct LookupHosts {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
}

#[cfg(feature = "dns-resolver")]
pub(crate) struct SrvResolver {
    resolver: hickory_resolver::TokioResolver,
    srv_service_name: Option<String>,
}

#[cfg(feature = "dns-resolver")]
impl SrvResolver {
    pub(crate) fn new(srv_service_name: Option<String>) -> Result<Self> {
        let resolver = hickory_resolver::TokioResolver::builder_tokio()
            .map_err(|e| ErrorKind::DnsResolve {
                message: format!("failed to create DNS resolver: {}", e),
            })?
            .build();

        Ok(Self {
            resolver,
            srv_service_name,
        })
    }

    /// Looks up the SRV records for the given hostname and returns the addresses they point
    /// at, validating each against the original hostname's domain.
    pub(crate) async fn get_srv_hosts(&self, original_hostname: &str) -> Result<LookupHosts> {
        let hostname_parts: Vec<_> = original_hostname.split('.').collect();

        if hostname_parts.len() < 3 {
            return Err(ErrorKind::DnsResolve {
                message: "a hostname used for an SRV lookup must have at least three domain \
                          levels"
                    .into(),
            }
            .into());
        }

        let service_name = self.srv_service_name.as_deref().unwrap_or("mongodb");
        let lookup_hostname = format!("_{}._tcp.{}", service_name, original_hostname);

        let srv_lookup = self
            .resolver
            .srv_lookup(lookup_hostname.as_str())
            .await
            .map_err(|e| ErrorKind::DnsResolve {
                message: format!("SRV lookup for {} failed: {}", original_hostname, e),
            })?;

        let mut hosts = Vec::new();
        let mut min_ttl = u32::MAX;

        for record in srv_lookup.as_lookup().record_iter() {
            let srv = match record.data() {
                hickory_proto::rr::RData::SRV(srv) => srv,
                _ => continue,
            };

            let hostname = srv.target().to_utf8();
            let hostname = hostname.trim_end_matches('.');
            let port = Some(srv.port());

            // Each returned host must be a child of the domain the lookup was performed
            // against, to prevent the DNS server from redirecting the driver elsewhere.
            let domain_name = &hostname_parts[1..];
            let host_parts: Vec<_> = hostname.split('.').collect();
            if host_parts.len() <= domain_name.len()
                || !host_parts.ends_with(domain_name)
            {
                return Err(ErrorKind::DnsResolve {
                    message: format!(
                        "SRV lookup for {} returned result {} which is not a subdomain of the \
                         queried domain",
                        original_hostname, hostname,
                    ),
                }
                .into());
            }

            hosts.push(ServerAddress::Tcp {
                host: hostname.to_lowercase(),
                port,
            });
            min_ttl = min_ttl.min(record.ttl());
        }

        if hosts.is_empty() {
            return Err(ErrorKind::DnsResolve {
                message: format!("SRV lookup for {} returned no records", original_hostname),
            }
            .into());
        }

        Ok(LookupHosts {
            hosts,
            min_ttl: Duration::from_secs(min_ttl.into()),
        })
    }
}
