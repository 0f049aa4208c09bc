//! Peer discovery sources: DNS seeds and the hard-coded fallback list.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::params::NetworkParameters;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("discovery timed out")]
    Timeout,

    #[error("no peers discovered")]
    Empty,
}

/// A source of candidate peer addresses.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn peers(
        &self,
        services: u64,
        timeout: Duration,
    ) -> Result<Vec<SocketAddr>, DiscoveryError>;
}

/// Resolve the network's DNS seeds and return shuffled results.
pub struct DnsDiscovery {
    seeds: Vec<&'static str>,
    port: u16,
}

impl DnsDiscovery {
    pub fn new(params: &NetworkParameters) -> Self {
        DnsDiscovery {
            seeds: params.dns_seeds.clone(),
            port: params.default_port,
        }
    }
}

#[async_trait]
impl PeerDiscovery for DnsDiscovery {
    async fn peers(
        &self,
        _services: u64,
        timeout: Duration,
    ) -> Result<Vec<SocketAddr>, DiscoveryError> {
        if self.seeds.is_empty() {
            return Err(DiscoveryError::Empty);
        }
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        let lookups = self.seeds.iter().map(|seed| {
            let resolver = resolver.clone();
            let seed = *seed;
            async move {
                match resolver.lookup_ip(seed).await {
                    Ok(response) => response.iter().collect::<Vec<_>>(),
                    Err(e) => {
                        log::debug!("dns seed {} failed: {}", seed, e);
                        Vec::new()
                    }
                }
            }
        });

        let all = tokio::time::timeout(timeout, futures::future::join_all(lookups))
            .await
            .map_err(|_| DiscoveryError::Timeout)?;

        let mut addrs: Vec<SocketAddr> = all
            .into_iter()
            .flatten()
            .map(|ip| SocketAddr::new(ip, self.port))
            .collect();
        if addrs.is_empty() {
            return Err(DiscoveryError::Empty);
        }
        addrs.shuffle(&mut rand::thread_rng());
        addrs.dedup();
        Ok(addrs)
    }
}

/// The hard-coded seed IPs, used when DNS yields nothing.
pub struct FixedSeeds {
    addrs: Vec<SocketAddr>,
}

impl FixedSeeds {
    pub fn new(params: &NetworkParameters) -> Self {
        FixedSeeds {
            addrs: params
                .fixed_seeds
                .iter()
                .map(|ip| SocketAddr::new(*ip, params.default_port))
                .collect(),
        }
    }
}

#[async_trait]
impl PeerDiscovery for FixedSeeds {
    async fn peers(
        &self,
        _services: u64,
        _timeout: Duration,
    ) -> Result<Vec<SocketAddr>, DiscoveryError> {
        if self.addrs.is_empty() {
            return Err(DiscoveryError::Empty);
        }
        let mut addrs = self.addrs.clone();
        addrs.shuffle(&mut rand::thread_rng());
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_seeds_return_configured_addresses() {
        let params = NetworkParameters::regtest();
        let seeds = FixedSeeds::new(&params);
        let peers = seeds.peers(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), params.default_port);
    }

    #[tokio::test]
    async fn empty_fixed_seeds_is_typed_error() {
        let params = NetworkParameters::testnet();
        let seeds = FixedSeeds::new(&params);
        assert!(matches!(
            seeds.peers(0, Duration::from_secs(1)).await,
            Err(DiscoveryError::Empty)
        ));
    }
}
