use crate::{
    TARGET_CHAIN_ID,
    chain::{
        Connector,
        Transport,
        TransportError,
    },
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{
    info,
    warn,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no public endpoint available{}", last_error_suffix(.last_error))]
    NoEndpointAvailable { last_error: Option<TransportError> },
}

fn last_error_suffix(last_error: &Option<TransportError>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => " (no endpoints configured)".to_owned(),
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub transport: Arc<dyn Transport>,
}

/// Picks the first reachable endpoint from an ordered fallback list.
pub struct EndpointResolver {
    endpoints: Vec<String>,
    connector: Arc<dyn Connector>,
}

impl EndpointResolver {
    pub fn new(endpoints: Vec<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoints,
            connector,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Tries each endpoint strictly in order. The probe is a chain id read; an
    /// endpoint serving another network counts as unreachable.
    pub async fn resolve(&self) -> Result<ResolvedEndpoint, ResolveError> {
        let mut last_error = None;
        for url in &self.endpoints {
            match self.probe(url).await {
                Ok(transport) => {
                    info!(endpoint = %url, "public endpoint selected");
                    return Ok(ResolvedEndpoint {
                        url: url.clone(),
                        transport,
                    });
                }
                Err(err) => {
                    warn!(endpoint = %url, %err, "endpoint probe failed");
                    last_error = Some(err);
                }
            }
        }
        Err(ResolveError::NoEndpointAvailable { last_error })
    }

    async fn probe(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = self.connector.open(url).await?;
        let chain_id = transport.chain_id().await?;
        if chain_id != TARGET_CHAIN_ID {
            return Err(TransportError::Transport(format!(
                "endpoint serves chain {chain_id}"
            )));
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeChain,
        FakeConnector,
    };

    #[tokio::test]
    async fn resolve__returns_first_reachable_endpoint_in_order() {
        // given
        let connector = FakeConnector::default();
        connector.fail("https://a", TransportError::Transport("down".to_owned()));
        connector.serve("https://b", FakeChain::mainnet());
        connector.serve("https://c", FakeChain::mainnet());
        let resolver = EndpointResolver::new(
            vec!["https://a".into(), "https://b".into(), "https://c".into()],
            Arc::new(connector.clone()),
        );

        // when
        let resolved = resolver.resolve().await.unwrap();

        // then
        assert_eq!(resolved.url, "https://b");
        assert_eq!(connector.opened(), vec!["https://a", "https://b"]);
    }

    #[tokio::test]
    async fn resolve__skips_endpoint_on_another_network() {
        // given
        let connector = FakeConnector::default();
        connector.serve("https://sepolia", FakeChain::with_chain_id(11_155_111));
        connector.serve("https://main", FakeChain::mainnet());
        let resolver = EndpointResolver::new(
            vec!["https://sepolia".into(), "https://main".into()],
            Arc::new(connector),
        );

        // when
        let resolved = resolver.resolve().await.unwrap();

        // then
        assert_eq!(resolved.url, "https://main");
    }

    #[tokio::test]
    async fn resolve__fails_with_last_error_when_every_endpoint_fails() {
        // given
        let connector = FakeConnector::default();
        connector.fail("https://a", TransportError::Transport("a down".to_owned()));
        let unreachable = FakeChain::mainnet();
        unreachable.set_offline(true);
        connector.serve("https://b", unreachable);
        let resolver = EndpointResolver::new(
            vec!["https://a".into(), "https://b".into()],
            Arc::new(connector),
        );

        // when
        let result = resolver.resolve().await;

        // then
        assert_eq!(
            result.unwrap_err(),
            ResolveError::NoEndpointAvailable {
                last_error: Some(TransportError::Transport("node offline".to_owned())),
            }
        );
    }

    #[tokio::test]
    async fn resolve__fails_immediately_for_empty_list() {
        // given
        let resolver = EndpointResolver::new(vec![], Arc::new(FakeConnector::default()));

        // when
        let result = resolver.resolve().await;

        // then
        assert_eq!(
            result.unwrap_err(),
            ResolveError::NoEndpointAvailable { last_error: None }
        );
    }
}
