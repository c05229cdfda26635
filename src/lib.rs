//! Look-through exposure for portfolios that hold securities both directly
//! and through funds.
//!
//! [`repository`] loads positions and fund compositions, [`aggregator`]
//! flattens them into one exposure per security, and [`enricher`] resolves
//! fund identifiers and attaches market data through pluggable collaborators.

pub mod aggregator;
pub mod config;
pub mod enricher;
pub mod error;
pub mod filings;
pub mod money;
pub mod pipeline;
pub mod providers;
pub mod repository;
pub mod retry;
pub mod types;

pub use aggregator::{Aggregation, AllocationGap, LookThroughAggregator};
pub use enricher::{ExposureEnricher, IdentifierResolver, MarketDataSource};
pub use error::{Diagnostics, LookThroughError, Result};
pub use money::Usd;
pub use types::{
    AggregatedExposure, FundComposition, HoldingType, Position, SecurityAttributes, SecurityKey,
    SecurityWeight,
};
