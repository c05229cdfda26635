use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::{Aggregation, LookThroughAggregator};
use crate::enricher::{EnrichmentReport, ExposureEnricher, ResolutionReport};
use crate::error::{Diagnostics, Result};
use crate::repository::HoldingsRepository;
use crate::types::AggregatedExposure;

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Final rows, enriched when an enricher was supplied.
    pub exposures: Vec<AggregatedExposure>,
    pub aggregation: Aggregation,
    pub load_diagnostics: Diagnostics,
    pub resolution: Option<ResolutionReport>,
    pub enrichment: Option<EnrichmentReport>,
    pub cancelled: bool,
}

impl PipelineOutcome {
    pub fn diagnostics(&self) -> Diagnostics {
        let mut all = self.load_diagnostics.clone();
        if let Some(resolution) = &self.resolution {
            all.merge(resolution.diagnostics.clone());
        }
        if let Some(enrichment) = &self.enrichment {
            all.merge(enrichment.diagnostics.clone());
        }
        all
    }
}

/// Load, flatten and (optionally) resolve and enrich. Only an unreachable
/// source aborts the run; everything else ends up in the diagnostics. A
/// cancelled resolution pass skips enrichment and reports the rows as they stand.
pub async fn run<R: HoldingsRepository>(
    repository: &R,
    enricher: Option<&ExposureEnricher>,
    cancel: &CancellationToken,
) -> Result<PipelineOutcome> {
    let positions = repository.load_positions()?;
    let compositions = repository.load_fund_compositions()?;
    let mut load_diagnostics = positions.diagnostics;
    load_diagnostics.merge(compositions.diagnostics);

    let aggregator = LookThroughAggregator::new();
    let Some(enricher) = enricher else {
        let aggregation = aggregator.aggregate(&positions.data, &compositions.data);
        return Ok(PipelineOutcome {
            exposures: aggregation.exposures.clone(),
            aggregation,
            load_diagnostics,
            resolution: None,
            enrichment: None,
            cancelled: false,
        });
    };

    let resolution = enricher
        .resolve_compositions(&compositions.data, cancel)
        .await;
    let aggregation = aggregator.aggregate(&positions.data, &resolution.compositions);
    if resolution.cancelled {
        info!(rows = aggregation.exposures.len(), "look-through run cancelled before enrichment");
        return Ok(PipelineOutcome {
            exposures: aggregation.exposures.clone(),
            aggregation,
            load_diagnostics,
            resolution: Some(resolution.report),
            enrichment: None,
            cancelled: true,
        });
    }
    let outcome = enricher.enrich(&aggregation.exposures, cancel).await;

    info!(
        rows = outcome.exposures.len(),
        cancelled = outcome.cancelled,
        "look-through run finished"
    );
    Ok(PipelineOutcome {
        exposures: outcome.exposures,
        aggregation,
        load_diagnostics,
        resolution: Some(resolution.report),
        enrichment: Some(outcome.report),
        cancelled: outcome.cancelled,
    })
}
