//! Concrete collaborators for identifier resolution and market data.

mod openfigi;
mod yahoo;

pub use openfigi::{is_cusip, OpenFigiResolver};
pub use yahoo::{YahooMarketData, YahooSearchResolver};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::enricher::IdentifierResolver;
use crate::error::Result;
use crate::types::SecurityWeight;

/// Tries each resolver in order and stops at the first ticker found.
///
/// A resolver that errors does not stop the chain. The last error is only
/// returned when no resolver produced a ticker and at least one failed, so a
/// transient outage stays retryable instead of being reported as "not found".
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn IdentifierResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn IdentifierResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl IdentifierResolver for ResolverChain {
    async fn resolve(&self, security: &SecurityWeight) -> Result<Option<String>> {
        let mut last_error = None;
        for (position, resolver) in self.resolvers.iter().enumerate() {
            match resolver.resolve(security).await {
                Ok(Some(ticker)) => return Ok(Some(ticker)),
                Ok(None) => {}
                Err(error) => {
                    debug!(resolver = position, error = %error, "resolver failed, trying next");
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookThroughError;

    struct Fixed(Option<&'static str>);
    struct Failing;

    #[async_trait]
    impl IdentifierResolver for Fixed {
        async fn resolve(&self, _security: &SecurityWeight) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    #[async_trait]
    impl IdentifierResolver for Failing {
        async fn resolve(&self, _security: &SecurityWeight) -> Result<Option<String>> {
            Err(LookThroughError::Collaborator("down".into()))
        }
    }

    fn apple() -> SecurityWeight {
        SecurityWeight::new("Apple Inc", "037833100", 5.0)
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_next_resolver() {
        let resolvers: Vec<Arc<dyn IdentifierResolver>> = vec![
            Arc::new(Fixed(None)),
            Arc::new(Failing),
            Arc::new(Fixed(Some("AAPL"))),
        ];
        let chain = ResolverChain::new(resolvers);
        assert_eq!(chain.resolve(&apple()).await.unwrap().as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn test_chain_reports_failure_over_not_found() {
        let resolvers: Vec<Arc<dyn IdentifierResolver>> =
            vec![Arc::new(Fixed(None)), Arc::new(Failing)];
        let chain = ResolverChain::new(resolvers);
        assert!(chain.resolve(&apple()).await.is_err());

        let chain = ResolverChain::new(vec![Arc::new(Fixed(None)) as Arc<dyn IdentifierResolver>]);
        assert_eq!(chain.resolve(&apple()).await.unwrap(), None);
    }
}
