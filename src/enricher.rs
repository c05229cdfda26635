//! Attaches descriptive attributes to aggregated rows through external
//! collaborators, and resolves raw fund identifiers to tickers.
//!
//! Every collaborator call gets its own wall-clock budget around a bounded
//! retry; one slow or failing lookup never affects the others. Rows are
//! processed in batches and the partial table is checkpointed to disk so an
//! interrupted pass can resume without refetching.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Diagnostics, LookThroughError, Result};
use crate::repository::{read_exposures, write_exposures, write_fund_composition};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::types::{
    AggregatedExposure, FundComposition, SecurityAttributes, SecurityKey, SecurityWeight,
};

/// Maps a raw fund identifier (CUSIP) to a trading symbol.
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    /// `Ok(None)` when the identifier is unknown to the service.
    async fn resolve(&self, security: &SecurityWeight) -> Result<Option<String>>;
}

/// Looks up sector, country and market capitalization for a ticker.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch(&self, ticker: &str) -> Result<Option<SecurityAttributes>>;
}

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// Collaborator calls in flight at once.
    pub concurrency: usize,
    /// Wall-clock budget per ticker, retries included.
    pub ticker_timeout: Duration,
    pub retry: RetryConfig,
    pub batch_size: usize,
    /// Write the checkpoint after this many batches.
    pub checkpoint_every: usize,
    pub checkpoint_path: Option<PathBuf>,
    /// Where compositions carrying newly resolved tickers are written back.
    pub compositions_dir: Option<PathBuf>,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            ticker_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            batch_size: 25,
            checkpoint_every: 1,
            checkpoint_path: None,
            compositions_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    pub attempted: usize,
    pub resolved: usize,
    pub unresolved: usize,
    /// Identifiers not looked up because the pass was cancelled.
    pub skipped: usize,
    pub batches: usize,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub compositions: HashMap<String, FundComposition>,
    pub report: ResolutionReport,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentReport {
    pub fetched: usize,
    pub from_checkpoint: usize,
    /// Resolved rows left without attributes after the budget ran out or nothing was found.
    pub missing: usize,
    /// Rows still carrying a raw identifier, passed through without lookup.
    pub unresolved: usize,
    pub batches: usize,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub exposures: Vec<AggregatedExposure>,
    pub report: EnrichmentReport,
    pub cancelled: bool,
}

pub struct ExposureEnricher {
    resolver: Arc<dyn IdentifierResolver>,
    market_data: Arc<dyn MarketDataSource>,
    config: EnricherConfig,
    retry: RetryPolicy,
}

impl ExposureEnricher {
    pub fn new(
        resolver: Arc<dyn IdentifierResolver>,
        market_data: Arc<dyn MarketDataSource>,
        config: EnricherConfig,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            resolver,
            market_data,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &EnricherConfig {
        &self.config
    }

    /// Returns new compositions with `resolved_ticker` filled wherever the
    /// resolver knows the identifier. Each distinct identifier is looked up once,
    /// in batches; cancellation is honoured between batches. When
    /// `compositions_dir` is set, the compositions that gained tickers are
    /// written back there so later runs do not look them up again.
    pub async fn resolve_compositions(
        &self,
        compositions: &HashMap<String, FundComposition>,
        cancel: &CancellationToken,
    ) -> Resolution {
        let mut pending: BTreeMap<String, SecurityWeight> = BTreeMap::new();
        for weight in compositions.values().flat_map(|c| c.holdings.iter()) {
            if let SecurityKey::Unresolved(id) = weight.key() {
                pending.entry(id).or_insert_with(|| weight.clone());
            }
        }
        let pending: Vec<(String, SecurityWeight)> = pending.into_iter().collect();

        let mut report = ResolutionReport::default();
        let mut resolved: HashMap<String, String> = HashMap::new();
        let batch_size = self.config.batch_size.max(1);
        let mut cancelled = cancel.is_cancelled();

        for batch in pending.chunks(batch_size) {
            if cancel.is_cancelled() {
                warn!(
                    remaining = pending.len() - report.attempted,
                    "identifier resolution cancelled"
                );
                cancelled = true;
                break;
            }

            let results: Vec<(String, Result<Option<String>>)> = stream::iter(batch.iter())
                .map(|(id, weight)| async move {
                    let result = self
                        .within_budget(id, || self.resolver.resolve(weight))
                        .await;
                    (id.clone(), result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for (id, result) in results {
                report.attempted += 1;
                match result {
                    Ok(Some(ticker)) if !ticker.trim().is_empty() => {
                        debug!(security_id = %id, ticker = %ticker, "resolved identifier");
                        resolved.insert(id, ticker.trim().to_ascii_uppercase());
                    }
                    Ok(_) => {
                        report.unresolved += 1;
                        report
                            .diagnostics
                            .record(&LookThroughError::UnresolvedIdentifier { security_id: id });
                    }
                    Err(error) => {
                        report.unresolved += 1;
                        report.diagnostics.record(&error);
                    }
                }
            }

            report.batches += 1;
            if report.batches % self.config.checkpoint_every.max(1) == 0 {
                self.save_compositions(compositions, &resolved, &mut report.diagnostics);
            }
        }
        report.resolved = resolved.len();
        report.skipped = pending.len() - report.attempted;
        self.save_compositions(compositions, &resolved, &mut report.diagnostics);

        info!(
            attempted = report.attempted,
            resolved = report.resolved,
            unresolved = report.unresolved,
            skipped = report.skipped,
            cancelled,
            "resolved fund identifiers"
        );
        Resolution {
            compositions: apply_tickers(compositions, &resolved).0,
            report,
            cancelled,
        }
    }

    /// Attaches market data to every resolved row. Keys and exposures are never
    /// changed. Cancellation is honoured between batches; rows not yet reached
    /// are returned as they came in.
    pub async fn enrich(
        &self,
        exposures: &[AggregatedExposure],
        cancel: &CancellationToken,
    ) -> EnrichmentOutcome {
        let mut rows: Vec<AggregatedExposure> = exposures.to_vec();
        let mut report = EnrichmentReport::default();
        let checkpointed = self.load_checkpoint(&mut report.diagnostics);

        let mut pending = Vec::new();
        for (index, row) in rows.iter_mut().enumerate() {
            let Some(ticker) = row.key().as_ticker().map(str::to_string) else {
                report.unresolved += 1;
                continue;
            };
            if let Some(attributes) = checkpointed.get(row.key()) {
                *row = row.with_attributes(attributes);
            }
            if row.attributes.is_complete() {
                report.from_checkpoint += 1;
            } else {
                pending.push((index, ticker));
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let mut cancelled = cancel.is_cancelled();
        for batch in pending.chunks(batch_size) {
            if cancel.is_cancelled() {
                warn!(
                    remaining = pending.len() - report.batches * batch_size,
                    "enrichment cancelled"
                );
                cancelled = true;
                break;
            }

            let results: Vec<(usize, String, Result<Option<SecurityAttributes>>)> =
                stream::iter(batch.iter().cloned())
                    .map(|(index, ticker)| async move {
                        let result = self
                            .within_budget(&ticker, || self.market_data.fetch(&ticker))
                            .await;
                        (index, ticker, result)
                    })
                    .buffer_unordered(self.config.concurrency.max(1))
                    .collect()
                    .await;

            for (index, ticker, result) in results {
                match result {
                    Ok(Some(attributes)) => {
                        rows[index] = rows[index].with_attributes(&attributes);
                        report.fetched += 1;
                    }
                    Ok(None) => {
                        debug!(ticker = %ticker, "no market data");
                        report.missing += 1;
                    }
                    Err(error) => {
                        report.missing += 1;
                        report.diagnostics.record(&error);
                    }
                }
            }

            report.batches += 1;
            if report.batches % self.config.checkpoint_every.max(1) == 0 {
                self.save_checkpoint(&rows, &mut report.diagnostics);
            }
        }
        self.save_checkpoint(&rows, &mut report.diagnostics);

        info!(
            fetched = report.fetched,
            from_checkpoint = report.from_checkpoint,
            missing = report.missing,
            unresolved = report.unresolved,
            cancelled,
            "enriched exposures"
        );
        EnrichmentOutcome {
            exposures: rows,
            report,
            cancelled,
        }
    }

    async fn within_budget<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.config.ticker_timeout, self.retry.run(label, operation))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LookThroughError::CollaboratorTimeout {
                ticker: label.to_string(),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Attributes already fetched by an earlier pass, complete or not.
    fn load_checkpoint(
        &self,
        diagnostics: &mut Diagnostics,
    ) -> HashMap<SecurityKey, SecurityAttributes> {
        let Some(path) = self.config.checkpoint_path.as_ref().filter(|p| p.exists()) else {
            return HashMap::new();
        };
        match read_exposures(path) {
            Ok(loaded) => {
                diagnostics.merge(loaded.diagnostics);
                loaded
                    .data
                    .into_iter()
                    .filter(|row| !row.attributes.is_empty())
                    .map(|row| (row.key().clone(), row.attributes))
                    .collect()
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "ignoring unreadable checkpoint");
                HashMap::new()
            }
        }
    }

    fn save_checkpoint(&self, rows: &[AggregatedExposure], diagnostics: &mut Diagnostics) {
        let Some(path) = self.config.checkpoint_path.as_ref() else {
            return;
        };
        match write_exposures(path, rows) {
            Ok(()) => debug!(path = %path.display(), rows = rows.len(), "checkpoint written"),
            Err(error) => diagnostics.record(&error),
        }
    }

    fn save_compositions(
        &self,
        compositions: &HashMap<String, FundComposition>,
        resolved: &HashMap<String, String>,
        diagnostics: &mut Diagnostics,
    ) {
        let Some(dir) = self.config.compositions_dir.as_ref() else {
            return;
        };
        let (updated, changed) = apply_tickers(compositions, resolved);
        for fund_id in changed {
            match write_fund_composition(dir, &updated[&fund_id]) {
                Ok(path) => debug!(fund_id = %fund_id, path = %path.display(), "saved resolved tickers"),
                Err(error) => diagnostics.record(&error),
            }
        }
    }
}

/// New compositions with `resolved` tickers filled in, and the ids of the funds that changed.
fn apply_tickers(
    compositions: &HashMap<String, FundComposition>,
    resolved: &HashMap<String, String>,
) -> (HashMap<String, FundComposition>, Vec<String>) {
    let mut changed = Vec::new();
    let updated = compositions
        .iter()
        .map(|(fund_id, composition)| {
            let mut touched = false;
            let holdings = composition
                .holdings
                .iter()
                .map(|weight| match weight.key() {
                    SecurityKey::Unresolved(id) => match resolved.get(&id) {
                        Some(ticker) => {
                            touched = true;
                            weight.clone().with_ticker(ticker)
                        }
                        None => weight.clone(),
                    },
                    SecurityKey::Ticker(_) => weight.clone(),
                })
                .collect();
            if touched {
                changed.push(fund_id.clone());
            }
            (fund_id.clone(), FundComposition::new(fund_id, holdings))
        })
        .collect();
    changed.sort();
    (updated, changed)
}
