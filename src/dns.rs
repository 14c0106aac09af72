//! Reverse-DNS (PTR) lookups for connection logging. This is the only DNS
//! concern the delivery session itself needs — MX resolution belongs to
//! the route manager.

use crate::collab::PtrResolver;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use tracing::{debug, warn};

/// `PtrResolver` backed by `hickory-resolver`.
pub struct HickoryPtrResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryPtrResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for HickoryPtrResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PtrResolver for HickoryPtrResolver {
    async fn resolve_ptr(&self, addr: IpAddr) -> Option<String> {
        debug!("looking up PTR record for {}", addr);
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => {
                let name = lookup.iter().next().map(|n| n.to_string().trim_end_matches('.').to_string());
                if name.is_none() {
                    warn!("PTR lookup for {} returned no names", addr);
                }
                name
            }
            Err(e) => {
                warn!("PTR lookup failed for {}: {}", addr, e);
                None
            }
        }
    }
}
