use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::enricher::IdentifierResolver;
use crate::error::{LookThroughError, Result};
use crate::types::SecurityWeight;

const BASE_URL: &str = "https://api.openfigi.com/v3";

/// CUSIP to ticker resolution through the OpenFIGI mapping API.
pub struct OpenFigiResolver {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenFigiResolver {
    pub fn new(api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            base_url: BASE_URL.to_string(),
        }
    }

    async fn map_cusip(&self, cusip: &str) -> Result<Option<String>> {
        let url = format!("{}/mapping", self.base_url);
        let jobs = vec![MappingJob {
            id_type: "ID_CUSIP".to_string(),
            id_value: cusip.to_string(),
            exch_code: Some("US".to_string()),
        }];

        let mut request = self.client.post(&url).json(&jobs);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-OPENFIGI-APIKEY", api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LookThroughError::Collaborator(
                "OpenFIGI rate limit exceeded".to_string(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookThroughError::Collaborator(format!(
                "OpenFIGI error {}: {}",
                status, body
            )));
        }

        let results: Vec<MappingResponse> = response.json().await?;
        ticker_from_mapping(cusip, results)
    }
}

#[async_trait]
impl IdentifierResolver for OpenFigiResolver {
    async fn resolve(&self, security: &SecurityWeight) -> Result<Option<String>> {
        let cusip = security.security_id.trim();
        if !is_cusip(cusip) {
            debug!(security_id = %cusip, name = %security.security_name, "not a CUSIP, skipping OpenFIGI");
            return Ok(None);
        }
        self.map_cusip(cusip).await
    }
}

pub fn is_cusip(id: &str) -> bool {
    id.len() == 9 && id.chars().all(|c| c.is_ascii_alphanumeric()) && id != "000000000"
}

fn ticker_from_mapping(cusip: &str, results: Vec<MappingResponse>) -> Result<Option<String>> {
    let Some(first) = results.into_iter().next() else {
        return Ok(None);
    };
    if let Some(error) = first.error {
        return Err(LookThroughError::Collaborator(format!(
            "OpenFIGI error for {}: {}",
            cusip, error
        )));
    }
    if let Some(warning) = first.warning {
        debug!(cusip, warning = %warning, "OpenFIGI has no mapping");
        return Ok(None);
    }
    Ok(first
        .data
        .unwrap_or_default()
        .into_iter()
        .find_map(|figi| figi.ticker.filter(|t| !t.trim().is_empty())))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MappingJob {
    id_type: String,
    id_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exch_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    #[serde(default)]
    data: Option<Vec<FigiResult>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warning: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FigiResult {
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    exch_code: Option<String>,
}
