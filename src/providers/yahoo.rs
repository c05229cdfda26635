use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;
use yahoo_finance_api::YahooConnector;

use crate::enricher::{IdentifierResolver, MarketDataSource};
use crate::error::{LookThroughError, Result};
use crate::types::{SecurityAttributes, SecurityWeight};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const COOKIE_URL: &str = "https://fc.yahoo.com";
const CRUMB_URL: &str = "https://query1.finance.yahoo.com/v1/test/getcrumb";
const SUMMARY_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";

#[derive(Debug, Clone)]
struct Crumb {
    cookie: String,
    crumb: String,
}

/// Sector, country and market cap from Yahoo's quote summary.
pub struct YahooMarketData {
    client: Client,
    crumb: RwLock<Option<Crumb>>,
}

impl std::fmt::Debug for YahooMarketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "YahooMarketData {{ endpoint: {} }}", SUMMARY_URL)
    }
}

impl Default for YahooMarketData {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooMarketData {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            crumb: RwLock::new(None),
        }
    }

    async fn crumb(&self) -> Result<Crumb> {
        if let Some(crumb) = self.crumb.read().await.as_ref() {
            return Ok(crumb.clone());
        }

        let response = self.client.get(COOKIE_URL).send().await?;
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split_once(';').map(|(value, _)| value.to_string()))
            .ok_or_else(|| LookThroughError::Collaborator("no Yahoo session cookie".into()))?;

        let crumb = self
            .client
            .get(CRUMB_URL)
            .header(header::COOKIE, &cookie)
            .send()
            .await?
            .text()
            .await?;

        let fresh = Crumb { cookie, crumb };
        *self.crumb.write().await = Some(fresh.clone());
        Ok(fresh)
    }
}

#[async_trait]
impl MarketDataSource for YahooMarketData {
    async fn fetch(&self, ticker: &str) -> Result<Option<SecurityAttributes>> {
        let crumb = self.crumb().await?;
        let url = format!("{}/{}", SUMMARY_URL, ticker);
        let response = self
            .client
            .get(&url)
            .query(&[("modules", "price,summaryProfile"), ("crumb", crumb.crumb.as_str())])
            .header(header::COOKIE, &crumb.cookie)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Session expired; the next attempt negotiates a new crumb.
                *self.crumb.write().await = None;
                return Err(LookThroughError::Collaborator(format!(
                    "Yahoo rejected session for {}",
                    ticker
                )));
            }
            status if !status.is_success() => {
                return Err(LookThroughError::Collaborator(format!(
                    "Yahoo quote summary {} for {}",
                    status, ticker
                )));
            }
            _ => {}
        }

        let summary: QuoteSummaryEnvelope = response.json().await?;
        let attributes = attributes_from_summary(summary);
        debug!(ticker, found = attributes.is_some(), "fetched quote summary");
        Ok(attributes)
    }
}

fn attributes_from_summary(envelope: QuoteSummaryEnvelope) -> Option<SecurityAttributes> {
    let result = envelope.quote_summary.result?.into_iter().next()?;
    let profile = result.summary_profile.unwrap_or_default();
    let attributes = SecurityAttributes {
        sector: profile.sector.filter(|s| !s.is_empty()),
        country: profile.country.filter(|c| !c.is_empty()),
        market_cap: result
            .price
            .and_then(|p| p.market_cap)
            .and_then(|m| m.raw)
            .filter(|m| m.is_finite()),
    };
    (!attributes.is_empty()).then_some(attributes)
}

/// Falls back on Yahoo's symbol search by company name.
pub struct YahooSearchResolver {
    connector: YahooConnector,
}

impl Default for YahooSearchResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooSearchResolver {
    pub fn new() -> Self {
        Self {
            connector: YahooConnector::new(),
        }
    }
}

#[async_trait]
impl IdentifierResolver for YahooSearchResolver {
    async fn resolve(&self, security: &SecurityWeight) -> Result<Option<String>> {
        let name = security.security_name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        let found = self
            .connector
            .search_ticker(name)
            .await
            .map_err(|e| LookThroughError::Collaborator(format!("Yahoo search '{}': {}", name, e)))?;

        let symbol = found
            .quotes
            .iter()
            .find(|q| q.quote_type.eq_ignore_ascii_case("EQUITY"))
            .or_else(|| found.quotes.first())
            .map(|q| q.symbol.clone());
        debug!(name, symbol = ?symbol, "searched Yahoo by name");
        Ok(symbol)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteSummaryEnvelope {
    quote_summary: QuoteSummary,
}

#[derive(Debug, Deserialize)]
struct QuoteSummary {
    #[serde(default)]
    result: Option<Vec<QuoteSummaryResult>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteSummaryResult {
    #[serde(default)]
    price: Option<Price>,
    #[serde(default)]
    summary_profile: Option<SummaryProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Price {
    #[serde(default)]
    market_cap: Option<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    #[serde(default)]
    raw: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct SummaryProfile {
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_from_summary() {
        let envelope: QuoteSummaryEnvelope = serde_json::from_str(
            r#"{"quoteSummary":{"result":[{
                "price":{"marketCap":{"raw":2950000000000.0,"fmt":"2.95T"}},
                "summaryProfile":{"sector":"Technology","country":"United States","industry":"Consumer Electronics"}
            }],"error":null}}"#,
        )
        .unwrap();
        let attributes = attributes_from_summary(envelope).unwrap();
        assert_eq!(attributes.sector.as_deref(), Some("Technology"));
        assert_eq!(attributes.country.as_deref(), Some("United States"));
        assert_eq!(attributes.market_cap, Some(2.95e12));
    }

    #[test]
    fn test_fund_summary_without_profile() {
        let envelope: QuoteSummaryEnvelope = serde_json::from_str(
            r#"{"quoteSummary":{"result":[{"price":{"marketCap":{}}}],"error":null}}"#,
        )
        .unwrap();
        assert_eq!(attributes_from_summary(envelope), None);
    }

    #[test]
    fn test_empty_result() {
        let envelope: QuoteSummaryEnvelope = serde_json::from_str(
            r#"{"quoteSummary":{"result":null,"error":{"code":"Not Found"}}}"#,
        )
        .unwrap();
        assert_eq!(attributes_from_summary(envelope), None);
    }
}
