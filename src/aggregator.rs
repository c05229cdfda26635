//! Look-through aggregation: flattens portfolio -> fund -> security into
//! portfolio -> security.

use std::collections::HashMap;

use polars::prelude::DataFrame;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::money::{Usd, TOLERANCE};
use crate::repository::exposures_to_dataframe;
use crate::types::{
    AggregatedExposure, FundComposition, HoldingType, Position, SecurityAttributes, SecurityKey,
};

/// Fund position whose composition was not available.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationGap {
    pub fund_id: String,
    pub invested: Usd,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub exposures: Vec<AggregatedExposure>,
    pub allocation_gaps: Vec<AllocationGap>,
    /// Capital in funds without a composition.
    pub unallocated_total: Usd,
    /// Capital in funds whose weights sum below 100%, left unattributed.
    pub residual_total: Usd,
    pub invested_total: Usd,
}

impl Aggregation {
    pub fn total_exposure(&self) -> Usd {
        self.exposures.iter().map(|e| e.total_exposure()).sum()
    }

    pub fn get(&self, key: &SecurityKey) -> Option<&AggregatedExposure> {
        self.exposures.iter().find(|e| e.key() == key)
    }

    pub fn exposure_of(&self, ticker: &str) -> Option<Usd> {
        self.get(&SecurityKey::ticker(ticker))
            .map(|e| e.total_exposure())
    }

    pub fn to_map(&self) -> HashMap<SecurityKey, Usd> {
        self.exposures
            .iter()
            .map(|e| (e.key().clone(), e.total_exposure()))
            .collect()
    }

    /// Share of the attributed exposure each row represents.
    pub fn weights(&self) -> HashMap<SecurityKey, f64> {
        let total = self.total_exposure().amount();
        if total <= TOLERANCE {
            return HashMap::new();
        }
        self.exposures
            .iter()
            .map(|e| (e.key().clone(), e.total_exposure().amount() / total))
            .collect()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &AggregatedExposure> {
        self.exposures.iter().filter(|e| !e.key().is_resolved())
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        exposures_to_dataframe(&self.exposures)
    }
}

#[derive(Debug, Default)]
struct Partial {
    totals: HashMap<SecurityKey, Usd>,
    seeds: HashMap<SecurityKey, SecurityAttributes>,
}

impl Partial {
    fn add(&mut self, key: SecurityKey, amount: Usd) {
        *self.totals.entry(key).or_default() += amount;
    }

    fn seed(&mut self, key: SecurityKey, attributes: SecurityAttributes) {
        self.seeds.entry(key).or_default().fill_from(&attributes);
    }

    /// Merge by key. Summation makes this associative and commutative.
    fn merge(mut self, other: Partial) -> Partial {
        for (key, amount) in other.totals {
            self.add(key, amount);
        }
        for (key, attributes) in other.seeds {
            self.seed(key, attributes);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LookThroughAggregator;

impl LookThroughAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Sums the dollar exposure to every security reachable from `positions`,
    /// directly or through a fund in `compositions`. Inputs are left untouched,
    /// so the same call can be repeated after tickers have been resolved.
    pub fn aggregate(
        &self,
        positions: &[Position],
        compositions: &HashMap<String, FundComposition>,
    ) -> Aggregation {
        let (direct, indirect): (Vec<&Position>, Vec<&Position>) = positions
            .iter()
            .partition(|p| p.holding_type == HoldingType::Stock);

        let mut allocation_gaps = Vec::new();
        let mut residual_total = Usd::ZERO;

        let fund_partials: Vec<Partial> = indirect
            .iter()
            .filter_map(|position| {
                match find_composition(compositions, &position.holding_id) {
                    Some(composition) => {
                        let (partial, residual) =
                            fund_contribution(position.investment_amount, composition);
                        residual_total += residual;
                        Some(partial)
                    }
                    None => {
                        warn!(
                            fund_id = %position.holding_id,
                            invested = %position.investment_amount,
                            "no composition for fund, capital left unallocated"
                        );
                        allocation_gaps.push(AllocationGap {
                            fund_id: position.holding_id.clone(),
                            invested: position.investment_amount,
                        });
                        None
                    }
                }
            })
            .collect();

        let mut direct_partial = Partial::default();
        for position in &direct {
            let key = SecurityKey::ticker(&position.holding_id);
            direct_partial.add(key.clone(), position.investment_amount);
            direct_partial.seed(
                key,
                SecurityAttributes {
                    sector: position.sector.clone(),
                    country: position.country.clone(),
                    market_cap: None,
                },
            );
        }

        // Direct holdings merge first so their descriptive fields win over fund-level ones.
        let merged = fund_partials
            .into_iter()
            .fold(direct_partial, |acc, partial| acc.merge(partial));

        let Partial { totals, mut seeds } = merged;
        let mut exposures: Vec<AggregatedExposure> = totals
            .into_iter()
            .map(|(key, total)| {
                let attributes = seeds.remove(&key).unwrap_or_default();
                AggregatedExposure::new(key, total).with_attributes(&attributes)
            })
            .collect();
        exposures.sort_by(|a, b| {
            b.total_exposure()
                .amount()
                .total_cmp(&a.total_exposure().amount())
                .then_with(|| a.key().cmp(b.key()))
        });

        let unallocated_total = allocation_gaps.iter().map(|g| g.invested).sum();
        let invested_total = positions.iter().map(|p| p.investment_amount).sum();

        info!(
            rows = exposures.len(),
            direct = direct.len(),
            funds = indirect.len(),
            gaps = allocation_gaps.len(),
            unallocated = %unallocated_total,
            residual = %residual_total,
            "aggregated look-through exposure"
        );

        Aggregation {
            exposures,
            allocation_gaps,
            unallocated_total,
            residual_total,
            invested_total,
        }
    }
}

fn find_composition<'a>(
    compositions: &'a HashMap<String, FundComposition>,
    fund_id: &str,
) -> Option<&'a FundComposition> {
    // Ids differing only in case fall back to the lexically smallest one.
    compositions.get(fund_id).or_else(|| {
        compositions
            .iter()
            .filter(|(id, _)| id.eq_ignore_ascii_case(fund_id))
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, c)| c)
    })
}

/// Contribution of one fund position, plus the residual its weights leave unattributed.
fn fund_contribution(invested: Usd, composition: &FundComposition) -> (Partial, Usd) {
    let mut partial = Partial::default();
    for weight in &composition.holdings {
        let key = weight.key();
        partial.add(key.clone(), invested.percent(weight.percent_of_fund));
        if weight.country.is_some() {
            partial.seed(
                key,
                SecurityAttributes {
                    country: weight.country.clone(),
                    ..Default::default()
                },
            );
        }
    }

    let covered = composition.total_percent();
    let residual = if covered < 100.0 {
        invested.percent(100.0 - covered)
    } else {
        Usd::ZERO
    };
    if covered > 100.0 + TOLERANCE {
        warn!(
            fund_id = %composition.fund_id,
            covered,
            "fund weights sum above 100%"
        );
    }
    debug!(
        fund_id = %composition.fund_id,
        securities = composition.holdings.len(),
        covered,
        residual = %residual,
        "flattened fund"
    );
    (partial, residual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityWeight;
    use approx::assert_relative_eq;

    fn compositions(funds: Vec<FundComposition>) -> HashMap<String, FundComposition> {
        funds.into_iter().map(|f| (f.fund_id.clone(), f)).collect()
    }

    fn scenario() -> (Vec<Position>, HashMap<String, FundComposition>) {
        let positions = vec![
            Position::stock("T1", 100.0, "Technology", "US"),
            Position::fund("F1", 1000.0),
        ];
        let funds = compositions(vec![FundComposition::new(
            "F1",
            vec![
                SecurityWeight::new("Tee One", "000000001", 10.0).with_ticker("T1"),
                SecurityWeight::new("Tee Two", "000000002", 30.0).with_ticker("T2"),
            ],
        )]);
        (positions, funds)
    }

    #[test]
    fn test_scenario_merges_direct_and_fund_paths() {
        let (positions, funds) = scenario();
        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);

        assert_eq!(aggregation.exposures.len(), 2);
        assert!(aggregation.exposure_of("T1").unwrap().approx_eq(Usd::new(200.0)));
        assert!(aggregation.exposure_of("T2").unwrap().approx_eq(Usd::new(300.0)));
        // rows come out largest first
        assert_eq!(aggregation.exposures[0].ticker(), "T2");
        assert!(aggregation.residual_total.approx_eq(Usd::new(600.0)));
        assert!(aggregation.allocation_gaps.is_empty());
    }

    #[test]
    fn test_security_in_two_funds_and_direct_is_one_row() {
        let positions = vec![
            Position::stock("AAPL", 50.0, "Technology", "US"),
            Position::fund("F1", 1000.0),
            Position::fund("F2", 2000.0),
        ];
        let funds = compositions(vec![
            FundComposition::new(
                "F1",
                vec![SecurityWeight::new("Apple", "037833100", 5.0).with_ticker("AAPL")],
            ),
            FundComposition::new(
                "F2",
                vec![SecurityWeight::new("Apple", "037833100", 2.5).with_ticker("aapl")],
            ),
        ]);

        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        assert_eq!(aggregation.exposures.len(), 1);
        assert!(aggregation.exposure_of("AAPL").unwrap().approx_eq(Usd::new(150.0)));
        assert_eq!(
            aggregation.exposures[0].attributes.sector.as_deref(),
            Some("Technology")
        );
    }

    #[test]
    fn test_missing_composition_is_reported_as_gap() {
        let positions = vec![Position::fund("F1", 1000.0), Position::fund("GHOST", 750.0)];
        let funds = compositions(vec![FundComposition::new(
            "F1",
            vec![SecurityWeight::new("Tee Two", "000000002", 100.0).with_ticker("T2")],
        )]);

        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        assert_eq!(
            aggregation.allocation_gaps,
            vec![AllocationGap {
                fund_id: "GHOST".into(),
                invested: Usd::new(750.0),
            }]
        );
        assert!(aggregation.unallocated_total.approx_eq(Usd::new(750.0)));
        assert!(aggregation.total_exposure().approx_eq(Usd::new(1000.0)));
        assert!(aggregation.invested_total.approx_eq(Usd::new(1750.0)));
    }

    #[test]
    fn test_case_insensitive_fund_lookup_is_deterministic() {
        let positions = vec![Position::fund("VTI", 100.0)];
        let funds = compositions(vec![
            FundComposition::new(
                "vti",
                vec![SecurityWeight::new("Lower", "1", 100.0).with_ticker("LOW")],
            ),
            FundComposition::new(
                "Vti",
                vec![SecurityWeight::new("Mixed", "2", 100.0).with_ticker("MIX")],
            ),
        ]);

        let aggregator = LookThroughAggregator::new();
        for _ in 0..20 {
            let aggregation = aggregator.aggregate(&positions, &funds);
            assert_eq!(aggregation.exposures.len(), 1);
            assert!(aggregation.exposure_of("MIX").is_some());
        }

        // an exact match always wins
        let exact = vec![Position::fund("vti", 100.0)];
        let aggregation = aggregator.aggregate(&exact, &funds);
        assert!(aggregation.exposure_of("LOW").is_some());
    }

    #[test]
    fn test_zero_amount_positions_produce_zero_rows() {
        let positions = vec![
            Position::stock("ZERO", 0.0, "Utilities", "US"),
            Position::fund("F1", 0.0),
        ];
        let funds = compositions(vec![FundComposition::new(
            "F1",
            vec![SecurityWeight::new("Tee Two", "000000002", 40.0).with_ticker("T2")],
        )]);

        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        assert_eq!(aggregation.exposures.len(), 2);
        assert!(aggregation.exposure_of("ZERO").unwrap().is_zero());
        assert!(aggregation.exposure_of("T2").unwrap().is_zero());
    }

    #[test]
    fn test_unresolved_securities_keyed_by_identifier_then_merged_after_resolution() {
        let positions = vec![
            Position::stock("MSFT", 100.0, "Technology", "US"),
            Position::fund("F1", 1000.0),
        ];
        let unresolved = compositions(vec![FundComposition::new(
            "F1",
            vec![
                SecurityWeight::new("Microsoft", "594918104", 10.0),
                SecurityWeight::new("Mystery", "", 5.0),
            ],
        )]);

        let aggregator = LookThroughAggregator::new();
        let before = aggregator.aggregate(&positions, &unresolved);
        assert_eq!(before.exposures.len(), 3);
        assert_eq!(before.unresolved().count(), 2);
        assert!(before
            .get(&SecurityKey::Unresolved("594918104".into()))
            .is_some());

        let mut resolved = unresolved.clone();
        resolved.get_mut("F1").unwrap().holdings[0].resolved_ticker = Some("MSFT".into());
        let after = aggregator.aggregate(&positions, &resolved);
        assert_eq!(after.exposures.len(), 2);
        assert!(after.exposure_of("MSFT").unwrap().approx_eq(Usd::new(200.0)));
        assert!(after.total_exposure().approx_eq(before.total_exposure()));
        // the input used for the first run is unchanged
        assert_eq!(unresolved["F1"].holdings[0].resolved_ticker, None);
    }

    #[test]
    fn test_conservation_with_complete_funds() {
        let positions = vec![
            Position::stock("A", 123.45, "Energy", "US"),
            Position::fund("F1", 1000.0),
            Position::fund("F2", 333.33),
        ];
        let funds = compositions(vec![
            FundComposition::new(
                "F1",
                vec![
                    SecurityWeight::new("A", "1", 33.3).with_ticker("A"),
                    SecurityWeight::new("B", "2", 33.3).with_ticker("B"),
                    SecurityWeight::new("C", "3", 33.4).with_ticker("C"),
                ],
            ),
            FundComposition::new(
                "F2",
                vec![
                    SecurityWeight::new("B", "2", 70.0).with_ticker("B"),
                    SecurityWeight::new("D", "4", 30.0).with_ticker("D"),
                ],
            ),
        ]);

        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        assert_relative_eq!(
            aggregation.total_exposure().amount(),
            aggregation.invested_total.amount(),
            epsilon = TOLERANCE
        );
        assert!(aggregation.residual_total.is_zero());

        let weights = aggregation.weights();
        let total: f64 = weights.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_partial_funds_never_exceed_invested() {
        let (positions, funds) = scenario();
        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        assert!(aggregation.total_exposure().amount() <= aggregation.invested_total.amount());
        assert!((aggregation.total_exposure() + aggregation.residual_total)
            .approx_eq(aggregation.invested_total));
    }

    #[test]
    fn test_aggregate_is_idempotent_and_order_independent() {
        let (mut positions, funds) = scenario();
        positions.push(Position::stock("T3", 42.0, "Health Care", "CA"));
        let aggregator = LookThroughAggregator::new();

        let first = aggregator.aggregate(&positions, &funds);
        let second = aggregator.aggregate(&positions, &funds);
        assert_eq!(first.exposures, second.exposures);

        positions.reverse();
        let reversed = aggregator.aggregate(&positions, &funds).to_map();
        let original = first.to_map();
        assert_eq!(reversed.len(), original.len());
        for (key, amount) in original {
            assert!(reversed[&key].approx_eq(amount));
        }
    }

    #[test]
    fn test_country_seeded_from_fund_rows() {
        let positions = vec![Position::fund("F1", 100.0)];
        let mut weight = SecurityWeight::new("Shell", "780259305", 100.0).with_ticker("SHEL");
        weight.country = Some("GB".into());
        let funds = compositions(vec![FundComposition::new("F1", vec![weight])]);

        let aggregation = LookThroughAggregator::new().aggregate(&positions, &funds);
        let row = aggregation.get(&SecurityKey::ticker("SHEL")).unwrap();
        assert_eq!(row.attributes.country.as_deref(), Some("GB"));
        assert_eq!(row.attributes.sector, None);
    }

    #[test]
    fn test_to_dataframe_columns() {
        let (positions, funds) = scenario();
        let df = LookThroughAggregator::new()
            .aggregate(&positions, &funds)
            .to_dataframe()
            .unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(
            df.get_column_names(),
            vec!["ticker", "portfolio_holdings", "country", "sector", "market_cap"]
        );
    }
}
