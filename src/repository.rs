//! Loading and persisting the tabular inputs and outputs of a look-through run.
//!
//! Every column is read as text and coerced record by record, so a single
//! malformed row is skipped (and counted) instead of failing the whole load.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Diagnostics, LookThroughError, Result};
use crate::money::Usd;
use crate::types::{
    AggregatedExposure, FundComposition, HoldingType, Position, SecurityKey, SecurityWeight,
};

const HOLDING_ID_COLUMNS: [&str; 4] = ["holding", "holding_id", "ticker", "fund_id"];
const AMOUNT_COLUMNS: [&str; 2] = ["investment_amt", "investment_amount"];
const PERCENT_COLUMNS: [&str; 2] = ["percent_of_portfolio", "percent_of_fund"];

/// Data returned by a load together with the records that were skipped.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub data: T,
    pub diagnostics: Diagnostics,
}

pub trait HoldingsRepository {
    fn load_positions(&self) -> Result<Loaded<Vec<Position>>>;
    fn load_fund_compositions(&self) -> Result<Loaded<HashMap<String, FundComposition>>>;
}

/// Positions file plus a directory holding one composition file per fund.
#[derive(Debug, Clone)]
pub struct CsvHoldingsRepository {
    positions_file: PathBuf,
    funds_dir: PathBuf,
}

impl CsvHoldingsRepository {
    pub fn new(positions_file: impl Into<PathBuf>, funds_dir: impl Into<PathBuf>) -> Self {
        Self {
            positions_file: positions_file.into(),
            funds_dir: funds_dir.into(),
        }
    }

    pub fn funds_dir(&self) -> &Path {
        &self.funds_dir
    }
}

impl HoldingsRepository for CsvHoldingsRepository {
    fn load_positions(&self) -> Result<Loaded<Vec<Position>>> {
        let source = self.positions_file.display().to_string();
        let df = read_text_frame(&self.positions_file)?;
        let loaded = positions_from_frame(&source, &df)?;
        info!(
            source = %source,
            positions = loaded.data.len(),
            skipped = loaded.diagnostics.malformed,
            "loaded positions"
        );
        Ok(loaded)
    }

    fn load_fund_compositions(&self) -> Result<Loaded<HashMap<String, FundComposition>>> {
        let dir = &self.funds_dir;
        let entries = fs::read_dir(dir)
            .map_err(|e| LookThroughError::unavailable(&dir.display().to_string(), e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map_or(false, |e| e.eq_ignore_ascii_case("csv"))
            })
            .collect();
        paths.sort();

        let mut compositions = HashMap::new();
        let mut diagnostics = Diagnostics::default();
        for path in paths {
            let Some(fund_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = path.display().to_string();
            let parsed = read_text_frame(&path)
                .and_then(|df| composition_from_frame(fund_id, &source, &df));
            match parsed {
                Ok(loaded) => {
                    debug!(
                        fund_id,
                        holdings = loaded.data.holdings.len(),
                        "loaded fund composition"
                    );
                    diagnostics.merge(loaded.diagnostics);
                    compositions.insert(fund_id.to_string(), loaded.data);
                }
                Err(e) if e.is_recoverable() => diagnostics.record(&e),
                Err(e) => return Err(e),
            }
        }

        info!(
            dir = %dir.display(),
            funds = compositions.len(),
            skipped = diagnostics.malformed,
            "loaded fund compositions"
        );
        Ok(Loaded {
            data: compositions,
            diagnostics,
        })
    }
}

fn read_text_frame(path: &Path) -> Result<DataFrame> {
    let source = path.display().to_string();
    let reader = CsvReader::from_path(path).map_err(|e| LookThroughError::unavailable(&source, e))?;
    // A schema inferred from zero rows reads every column as text.
    reader
        .has_header(true)
        .infer_schema(Some(0))
        .finish()
        .map_err(|e| LookThroughError::malformed(&source, 0, e.to_string()))
}

fn find_column<'a>(df: &'a DataFrame, names: &[&str]) -> Option<&'a StringChunked> {
    df.get_columns()
        .iter()
        .find(|s| names.iter().any(|n| s.name().trim().eq_ignore_ascii_case(n)))
        .and_then(|s| s.str().ok())
}

fn require_column<'a>(
    df: &'a DataFrame,
    source: &str,
    names: &[&str],
) -> Result<&'a StringChunked> {
    find_column(df, names).ok_or_else(|| {
        LookThroughError::malformed(source, 0, format!("missing required column '{}'", names[0]))
    })
}

fn cell(column: Option<&StringChunked>, row: usize) -> Option<String> {
    column
        .and_then(|c| c.get(row))
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("N/A") && !v.eq_ignore_ascii_case("nan"))
        .map(str::to_string)
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .trim_start_matches('$')
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn positions_from_frame(source: &str, df: &DataFrame) -> Result<Loaded<Vec<Position>>> {
    let ids: Vec<&StringChunked> = HOLDING_ID_COLUMNS
        .iter()
        .filter_map(|name| find_column(df, &[*name]))
        .collect();
    if ids.is_empty() {
        return Err(LookThroughError::malformed(
            source,
            0,
            "missing required column 'holding'",
        ));
    }
    let amounts = require_column(df, source, &AMOUNT_COLUMNS)?;
    let types = require_column(df, source, &["holding_type"])?;
    let sectors = find_column(df, &["sector"]);
    let countries = find_column(df, &["country"]);
    let ciks = find_column(df, &["CIK"]);
    let series = find_column(df, &["series", "series_id"]);

    let mut positions = Vec::with_capacity(df.height());
    let mut seen = HashSet::new();
    let mut diagnostics = Diagnostics::default();

    for row in 0..df.height() {
        let record = row + 1;
        let parsed = (|| -> Result<Position> {
            let holding_id = ids
                .iter()
                .find_map(|c| cell(Some(*c), row))
                .ok_or_else(|| LookThroughError::malformed(source, record, "empty holding id"))?;
            let amount_raw = cell(Some(amounts), row).ok_or_else(|| {
                LookThroughError::malformed(source, record, "empty investment amount")
            })?;
            let amount = parse_number(&amount_raw)
                .filter(|a| *a >= 0.0)
                .ok_or_else(|| {
                    LookThroughError::malformed(
                        source,
                        record,
                        format!("invalid investment amount '{}'", amount_raw),
                    )
                })?;
            let holding_type: HoldingType = cell(Some(types), row)
                .unwrap_or_default()
                .parse()
                .map_err(|e: String| LookThroughError::malformed(source, record, e))?;

            let (sector, country, cik, series) = match holding_type {
                HoldingType::Stock => {
                    let sector = cell(sectors, row).ok_or_else(|| {
                        LookThroughError::malformed(source, record, "stock row without sector")
                    })?;
                    let country = cell(countries, row).ok_or_else(|| {
                        LookThroughError::malformed(source, record, "stock row without country")
                    })?;
                    (Some(sector), Some(country), None, None)
                }
                HoldingType::Fund => (None, None, cell(ciks, row), cell(series, row)),
            };

            Ok(Position {
                holding_id,
                investment_amount: Usd::new(amount),
                holding_type,
                sector,
                country,
                cik,
                series,
            })
        })();

        match parsed {
            Ok(position) => {
                let identity = (position.holding_id.to_ascii_uppercase(), position.holding_type);
                if seen.insert(identity) {
                    positions.push(position);
                } else {
                    diagnostics.record(&LookThroughError::malformed(
                        source,
                        record,
                        format!(
                            "duplicate {} position '{}'",
                            position.holding_type, position.holding_id
                        ),
                    ));
                }
            }
            Err(e) => diagnostics.record(&e),
        }
    }

    Ok(Loaded {
        data: positions,
        diagnostics,
    })
}

fn composition_from_frame(
    fund_id: &str,
    source: &str,
    df: &DataFrame,
) -> Result<Loaded<FundComposition>> {
    let names = require_column(df, source, &["company_name"])?;
    let cusips = require_column(df, source, &["CUSIP"])?;
    let percents = require_column(df, source, &PERCENT_COLUMNS)?;
    let balances = find_column(df, &["num_holdings"]);
    let values = find_column(df, &["invested_amt_usd"]);
    let countries = find_column(df, &["country"]);
    let tickers = find_column(df, &["ticker"]);

    let mut holdings = Vec::with_capacity(df.height());
    let mut diagnostics = Diagnostics::default();

    for row in 0..df.height() {
        let record = row + 1;
        let security_name = cell(Some(names), row).unwrap_or_default();
        let security_id = cell(Some(cusips), row).unwrap_or_default();
        let resolved_ticker = cell(tickers, row);
        if security_name.is_empty() && security_id.is_empty() && resolved_ticker.is_none() {
            diagnostics.record(&LookThroughError::malformed(
                source,
                record,
                "holding without name, CUSIP or ticker",
            ));
            continue;
        }

        let percent_raw = cell(Some(percents), row).unwrap_or_default();
        let Some(percent_of_fund) = parse_number(&percent_raw).filter(|p| (0.0..=100.0).contains(p))
        else {
            diagnostics.record(&LookThroughError::malformed(
                source,
                record,
                format!("percent of fund '{}' is not within 0..=100", percent_raw),
            ));
            continue;
        };

        holdings.push(SecurityWeight {
            security_name,
            security_id,
            resolved_ticker,
            percent_of_fund,
            country: cell(countries, row),
            balance: cell(balances, row).as_deref().and_then(parse_number),
            value_usd: cell(values, row).as_deref().and_then(parse_number),
        });
    }

    Ok(Loaded {
        data: FundComposition::new(fund_id, holdings),
        diagnostics,
    })
}

/// Writes `composition` to `<dir>/<fund_id>.csv`.
pub fn write_fund_composition(dir: &Path, composition: &FundComposition) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| LookThroughError::unavailable(&dir.display().to_string(), e))?;
    let path = dir.join(format!("{}.csv", composition.fund_id));
    let h = &composition.holdings;

    let mut df = df!(
        "company_name" => h.iter().map(|w| w.security_name.clone()).collect::<Vec<_>>(),
        "CUSIP" => h.iter().map(|w| w.security_id.clone()).collect::<Vec<_>>(),
        "num_holdings" => h.iter().map(|w| w.balance).collect::<Vec<_>>(),
        "invested_amt_usd" => h.iter().map(|w| w.value_usd).collect::<Vec<_>>(),
        "percent_of_portfolio" => h.iter().map(|w| w.percent_of_fund).collect::<Vec<_>>(),
        "country" => h.iter().map(|w| w.country.clone()).collect::<Vec<_>>(),
        "ticker" => h.iter().map(|w| w.resolved_ticker.clone()).collect::<Vec<_>>()
    )?;
    write_frame(&path, &mut df)?;
    Ok(path)
}

pub fn exposures_to_dataframe(rows: &[AggregatedExposure]) -> Result<DataFrame> {
    Ok(df!(
        "ticker" => rows.iter().map(|r| r.ticker()).collect::<Vec<_>>(),
        "portfolio_holdings" => rows.iter().map(|r| r.total_exposure().amount()).collect::<Vec<_>>(),
        "country" => rows.iter().map(|r| r.attributes.country.clone()).collect::<Vec<_>>(),
        "sector" => rows.iter().map(|r| r.attributes.sector.clone()).collect::<Vec<_>>(),
        "market_cap" => rows.iter().map(|r| r.attributes.market_cap).collect::<Vec<_>>()
    )?)
}

/// Writes the exposure report. Missing attributes are left as empty cells.
pub fn write_exposures(path: &Path, rows: &[AggregatedExposure]) -> Result<()> {
    let mut df = exposures_to_dataframe(rows)?;
    write_frame(path, &mut df)
}

pub fn read_exposures(path: &Path) -> Result<Loaded<Vec<AggregatedExposure>>> {
    let source = path.display().to_string();
    let df = read_text_frame(path)?;
    let tickers = require_column(&df, &source, &["ticker"])?;
    let amounts = require_column(&df, &source, &["portfolio_holdings"])?;
    let countries = find_column(&df, &["country"]);
    let sectors = find_column(&df, &["sector"]);
    let caps = find_column(&df, &["market_cap"]);

    let mut rows = Vec::with_capacity(df.height());
    let mut diagnostics = Diagnostics::default();
    for row in 0..df.height() {
        let (Some(ticker), Some(amount)) = (
            cell(Some(tickers), row),
            cell(Some(amounts), row).as_deref().and_then(parse_number),
        ) else {
            diagnostics.record(&LookThroughError::malformed(&source, row + 1, "bad exposure row"));
            continue;
        };
        let key: SecurityKey = match ticker.parse() {
            Ok(key) => key,
            Err(never) => match never {},
        };
        let mut exposure = AggregatedExposure::new(key, Usd::new(amount));
        exposure.attributes.country = cell(countries, row);
        exposure.attributes.sector = cell(sectors, row);
        exposure.attributes.market_cap = cell(caps, row).as_deref().and_then(parse_number);
        rows.push(exposure);
    }

    Ok(Loaded {
        data: rows,
        diagnostics,
    })
}

fn write_frame(path: &Path, df: &mut DataFrame) -> Result<()> {
    let source = path.display().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| LookThroughError::unavailable(&source, e))?;
    }
    // Write to a sibling file first so a crash never leaves a truncated report behind.
    let tmp = path.with_extension("csv.tmp");
    let mut file = File::create(&tmp).map_err(|e| LookThroughError::unavailable(&source, e))?;
    if let Err(error) = CsvWriter::new(&mut file).finish(df) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), error = %cleanup, "could not remove partial file");
        }
        return Err(error.into());
    }
    fs::rename(&tmp, path).map_err(|e| LookThroughError::unavailable(&source, e))?;
    if df.height() == 0 {
        warn!(path = %source, "wrote an empty table");
    }
    Ok(())
}
