//! Caching DNS lookups in front of dialing.

use heart_api::*;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Entry = (Instant, Vec<SocketAddr>);

/// Resolves `host:port` pairs, remembering answers for `ttl`.
pub struct DnsCache {
    ttl: Duration,
    resolver: Mutex<Option<hickory_resolver::TokioResolver>>,
    cache: Mutex<HashMap<(String, u16), Entry>>,
}

impl std::fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsCache").field("ttl", &self.ttl).finish()
    }
}

impl DnsCache {
    /// Construct a cache with the given ttl.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            resolver: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Seed or override an entry. Also used by tests to avoid real lookups.
    pub fn insert(&self, host: &str, port: u16, addrs: Vec<SocketAddr>) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((host.to_string(), port), (Instant::now(), addrs));
    }

    fn resolver(&self) -> hickory_resolver::TokioResolver {
        self.resolver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_or_insert_with(|| {
                let (config, options) =
                    hickory_resolver::system_conf::read_system_conf()
                        .unwrap_or_default();
                hickory_resolver::Resolver::builder_with_config(
                    config,
                    hickory_resolver::name_server::TokioConnectionProvider::default(),
                )
                .with_options(options)
                .build()
            })
            .clone()
    }

    /// Resolve, answering ip literals directly.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> HeartResult<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let key = (host.to_string(), port);
        if let Some((at, addrs)) = self
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
        {
            if at.elapsed() < self.ttl {
                return Ok(addrs.clone());
            }
        }

        let lookup = self.resolver().lookup_ip(host).await.map_err(|e| {
            HeartError::unavailable_src(format!("resolve {host}"), e)
        })?;
        let addrs: Vec<SocketAddr> =
            lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
        if addrs.is_empty() {
            return Err(HeartError::kind(
                ErrorKind::TransportUnavailable,
                format!("no addresses for {host}"),
            ));
        }
        tracing::debug!(%host, ?addrs, "resolved");

        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, (Instant::now(), addrs.clone()));
        Ok(addrs)
    }
}
