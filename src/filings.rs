//! Fund compositions from SEC Form N-PORT filings.

use std::collections::HashSet;

use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, error, info};

use crate::error::{Diagnostics, LookThroughError, Result};
use crate::repository::Loaded;
use crate::types::{FundComposition, HoldingType, Position, SecurityWeight};

const NPORT_URL: &str = "https://api.sec-api.io/form-nport";
const PAGE_SIZE: usize = 10;
const MAX_PAGES: usize = 5;

pub struct NportClient {
    client: Client,
    token: String,
}

impl NportClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        let token = token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| LookThroughError::Config("SEC_API_TOKEN is not set".to_string()))?;
        Ok(Self {
            client: Client::new(),
            token,
        })
    }

    async fn query_page(&self, cik: &str, page: usize) -> Result<Vec<Filing>> {
        let body = json!({
            "query": { "query_string": { "query": format!("genInfo.regCik:{}", cik) } },
            "from": (page * PAGE_SIZE).to_string(),
            "size": PAGE_SIZE.to_string(),
        });
        let response = self
            .client
            .post(NPORT_URL)
            .query(&[("token", self.token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| LookThroughError::unavailable(NPORT_URL, e))?;

        if !response.status().is_success() {
            return Err(LookThroughError::unavailable(
                NPORT_URL,
                format!("status {}", response.status()),
            ));
        }
        let page: FilingsPage = response.json().await?;
        Ok(page.filings)
    }

    /// Latest filing of `series` registered under `cik`, looking through the
    /// first few pages of results only. Without a series the latest filing of
    /// the registrant is taken.
    pub async fn find_filing(&self, cik: &str, series: Option<&str>) -> Result<Option<Filing>> {
        for page in 0..MAX_PAGES {
            let filings = self.query_page(cik, page).await?;
            let exhausted = filings.len() < PAGE_SIZE;
            debug!(cik, page, filings = filings.len(), "queried N-PORT filings");
            if let Some(filing) = select_filing(filings, series) {
                return Ok(Some(filing));
            }
            if exhausted {
                break;
            }
        }
        error!(cik, series = ?series, "unable to locate N-PORT filing");
        Ok(None)
    }

    pub async fn fetch_composition(
        &self,
        fund_id: &str,
        cik: &str,
        series: Option<&str>,
    ) -> Result<Option<Loaded<FundComposition>>> {
        let Some(filing) = self.find_filing(cik, series).await? else {
            return Ok(None);
        };
        let loaded = filing_to_composition(fund_id, filing);
        info!(
            fund_id,
            holdings = loaded.data.holdings.len(),
            skipped = loaded.diagnostics.malformed,
            "fetched fund composition"
        );
        Ok(Some(loaded))
    }
}

fn select_filing(filings: Vec<Filing>, series: Option<&str>) -> Option<Filing> {
    let mut filings = filings.into_iter();
    match series {
        Some(series) => filings.find(|f| f.gen_info.series_id.as_deref() == Some(series)),
        None => filings.next(),
    }
}

/// A fund position that names where its filings live.
#[derive(Debug, Clone, PartialEq)]
pub struct FundRequest {
    pub fund_id: String,
    pub cik: String,
    pub series: Option<String>,
}

/// Every fund position carrying a CIK, once per fund.
pub fn fund_requests(positions: &[Position]) -> Vec<FundRequest> {
    let mut seen = HashSet::new();
    positions
        .iter()
        .filter(|p| p.holding_type == HoldingType::Fund)
        .filter_map(|p| {
            let cik = p.cik.as_ref()?;
            seen.insert(p.holding_id.to_ascii_uppercase()).then(|| FundRequest {
                fund_id: p.holding_id.clone(),
                cik: cik.clone(),
                series: p.series.clone(),
            })
        })
        .collect()
}

pub fn filing_to_composition(fund_id: &str, filing: Filing) -> Loaded<FundComposition> {
    let source = format!("N-PORT {}", fund_id);
    let mut diagnostics = Diagnostics::default();
    let mut holdings = Vec::with_capacity(filing.invst_or_secs.len());

    for (index, security) in filing.invst_or_secs.into_iter().enumerate() {
        let Some(percent) = security.pct_val.filter(|p| (0.0..=100.0).contains(p)) else {
            diagnostics.record(&LookThroughError::malformed(
                &source,
                index + 1,
                format!("percent of fund {:?} is not within 0..=100", security.pct_val),
            ));
            continue;
        };
        let cusip = security
            .cusip
            .filter(|c| !c.trim().is_empty() && !c.eq_ignore_ascii_case("N/A"))
            .unwrap_or_default();

        holdings.push(SecurityWeight {
            balance: security.balance,
            value_usd: security.val_usd,
            country: security.inv_country,
            ..SecurityWeight::new(&security.name.unwrap_or_default(), &cusip, percent)
        });
    }

    Loaded {
        data: FundComposition::new(fund_id, holdings),
        diagnostics,
    }
}

#[derive(Debug, Deserialize)]
struct FilingsPage {
    #[serde(default)]
    filings: Vec<Filing>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filing {
    #[serde(default)]
    gen_info: GenInfo,
    #[serde(default)]
    invst_or_secs: Vec<InvestmentOrSecurity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenInfo {
    #[serde(default)]
    series_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvestmentOrSecurity {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cusip: Option<String>,
    #[serde(default, deserialize_with = "number_or_text")]
    balance: Option<f64>,
    #[serde(default, rename = "valUSD", deserialize_with = "number_or_text")]
    val_usd: Option<f64>,
    #[serde(default, deserialize_with = "number_or_text")]
    pct_val: Option<f64>,
    #[serde(default)]
    inv_country: Option<String>,
}

/// Filings carry some numbers as JSON strings.
fn number_or_text<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "total": {"value": 2},
        "filings": [
            {"genInfo": {"seriesId": "S000002594"}, "invstOrSecs": []},
            {"genInfo": {"seriesId": "S000002848"}, "invstOrSecs": [
                {"name": "Apple Inc", "cusip": "037833100", "balance": 1000, "valUSD": "175000.5", "pctVal": 6.1, "invCountry": "US"},
                {"name": "Cash Collateral", "cusip": "N/A", "balance": "0", "valUSD": 10, "pctVal": "0.2", "invCountry": "US"},
                {"name": "Short Future", "cusip": "000000000", "pctVal": -0.4},
                {"name": "No Percent", "cusip": "111111111"}
            ]}
        ]
    }"#;

    #[test]
    fn test_select_filing_by_series() {
        let page: FilingsPage = serde_json::from_str(PAGE).unwrap();
        let filing = select_filing(page.filings, Some("S000002848")).unwrap();
        assert_eq!(filing.invst_or_secs.len(), 4);

        let page: FilingsPage = serde_json::from_str(PAGE).unwrap();
        assert!(select_filing(page.filings, Some("S999")).is_none());

        let page: FilingsPage = serde_json::from_str(PAGE).unwrap();
        let latest = select_filing(page.filings, None).unwrap();
        assert_eq!(latest.gen_info.series_id.as_deref(), Some("S000002594"));
    }

    #[test]
    fn test_fund_requests_from_positions() {
        let positions = vec![
            Position::stock("AAPL", 100.0, "Technology", "US"),
            Position::fund("VTI", 1000.0).with_filing("36405", Some("S000002848")),
            Position::fund("vti", 50.0).with_filing("36405", Some("S000002848")),
            Position::fund("VXUS", 500.0).with_filing("36405", None),
            Position::fund("ARKK", 250.0),
        ];

        let requests = fund_requests(&positions);
        assert_eq!(
            requests,
            vec![
                FundRequest {
                    fund_id: "VTI".into(),
                    cik: "36405".into(),
                    series: Some("S000002848".into()),
                },
                FundRequest {
                    fund_id: "VXUS".into(),
                    cik: "36405".into(),
                    series: None,
                },
            ]
        );
    }

    #[test]
    fn test_filing_to_composition() {
        let page: FilingsPage = serde_json::from_str(PAGE).unwrap();
        let filing = select_filing(page.filings, Some("S000002848")).unwrap();
        let loaded = filing_to_composition("VTI", filing);

        assert_eq!(loaded.data.fund_id, "VTI");
        assert_eq!(loaded.data.holdings.len(), 2);
        let apple = &loaded.data.holdings[0];
        assert_eq!(apple.security_id, "037833100");
        assert_eq!(apple.value_usd, Some(175000.5));
        assert_eq!(apple.resolved_ticker, None);
        assert_eq!(loaded.data.holdings[1].security_id, "");
        assert!((loaded.data.holdings[1].percent_of_fund - 0.2).abs() < 1e-12);
        assert_eq!(loaded.diagnostics.malformed, 2);
    }

    #[test]
    fn test_client_requires_token() {
        assert!(matches!(
            NportClient::new(None),
            Err(LookThroughError::Config(_))
        ));
        assert!(NportClient::new(Some("abc".into())).is_ok());
    }
}
