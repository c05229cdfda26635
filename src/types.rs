use std::fmt;
use std::str::FromStr;

use crate::money::Usd;

/// Sentinel rendered in place of a ticker when a security could not be resolved.
pub const UNRESOLVED: &str = "UNRESOLVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldingType {
    Stock,
    Fund,
}

impl FromStr for HoldingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stock" => Ok(HoldingType::Stock),
            "fund" => Ok(HoldingType::Fund),
            other => Err(format!("unknown holding type '{}'", other)),
        }
    }
}

impl fmt::Display for HoldingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldingType::Stock => write!(f, "stock"),
            HoldingType::Fund => write!(f, "fund"),
        }
    }
}

/// One row of the investor's own portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Ticker for a stock, fund identifier for a fund.
    pub holding_id: String,
    pub investment_amount: Usd,
    pub holding_type: HoldingType,
    pub sector: Option<String>,
    pub country: Option<String>,
    /// Registrant CIK of a fund, for fetching its filings.
    pub cik: Option<String>,
    /// Series identifier of a fund within its registrant.
    pub series: Option<String>,
}

impl Position {
    pub fn stock(ticker: &str, amount: f64, sector: &str, country: &str) -> Self {
        Self {
            holding_id: ticker.to_string(),
            investment_amount: Usd::new(amount),
            holding_type: HoldingType::Stock,
            sector: Some(sector.to_string()),
            country: Some(country.to_string()),
            cik: None,
            series: None,
        }
    }

    pub fn fund(fund_id: &str, amount: f64) -> Self {
        Self {
            holding_id: fund_id.to_string(),
            investment_amount: Usd::new(amount),
            holding_type: HoldingType::Fund,
            sector: None,
            country: None,
            cik: None,
            series: None,
        }
    }

    pub fn with_filing(mut self, cik: &str, series: Option<&str>) -> Self {
        self.cik = Some(cik.to_string());
        self.series = series.map(str::to_string);
        self
    }

    pub fn identity(&self) -> (&str, HoldingType) {
        (&self.holding_id, self.holding_type)
    }
}

/// A single line of a fund's composition.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityWeight {
    pub security_name: String,
    /// Raw identifier as filed, usually a CUSIP.
    pub security_id: String,
    pub resolved_ticker: Option<String>,
    /// Percentage of the fund, 0 to 100.
    pub percent_of_fund: f64,
    pub country: Option<String>,
    pub balance: Option<f64>,
    pub value_usd: Option<f64>,
}

impl SecurityWeight {
    pub fn new(security_name: &str, security_id: &str, percent_of_fund: f64) -> Self {
        Self {
            security_name: security_name.to_string(),
            security_id: security_id.to_string(),
            resolved_ticker: None,
            percent_of_fund,
            country: None,
            balance: None,
            value_usd: None,
        }
    }

    pub fn with_ticker(mut self, ticker: &str) -> Self {
        self.resolved_ticker = Some(ticker.to_string());
        self
    }

    /// Key this security aggregates under.
    pub fn key(&self) -> SecurityKey {
        match &self.resolved_ticker {
            Some(ticker) => SecurityKey::ticker(ticker),
            None if !self.security_id.trim().is_empty() => {
                SecurityKey::Unresolved(self.security_id.trim().to_string())
            }
            None => SecurityKey::Unresolved(self.security_name.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundComposition {
    pub fund_id: String,
    pub holdings: Vec<SecurityWeight>,
}

impl FundComposition {
    pub fn new(fund_id: &str, holdings: Vec<SecurityWeight>) -> Self {
        Self {
            fund_id: fund_id.to_string(),
            holdings,
        }
    }

    pub fn total_percent(&self) -> f64 {
        self.holdings.iter().map(|w| w.percent_of_fund).sum()
    }
}

/// Identity of an aggregated row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecurityKey {
    Ticker(String),
    /// Raw identifier (CUSIP, or name when no identifier was filed) awaiting resolution.
    Unresolved(String),
}

impl SecurityKey {
    pub fn ticker(ticker: &str) -> Self {
        SecurityKey::Ticker(ticker.trim().to_ascii_uppercase())
    }

    pub fn as_ticker(&self) -> Option<&str> {
        match self {
            SecurityKey::Ticker(t) => Some(t),
            SecurityKey::Unresolved(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, SecurityKey::Ticker(_))
    }
}

impl fmt::Display for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityKey::Ticker(t) => write!(f, "{}", t),
            SecurityKey::Unresolved(id) if id.is_empty() => write!(f, "{}", UNRESOLVED),
            SecurityKey::Unresolved(id) => write!(f, "{}:{}", UNRESOLVED, id),
        }
    }
}

impl FromStr for SecurityKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == UNRESOLVED {
            return Ok(SecurityKey::Unresolved(String::new()));
        }
        match s.strip_prefix(UNRESOLVED).and_then(|r| r.strip_prefix(':')) {
            Some(id) => Ok(SecurityKey::Unresolved(id.to_string())),
            None => Ok(SecurityKey::ticker(s)),
        }
    }
}

/// Descriptive attributes attached during enrichment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityAttributes {
    pub sector: Option<String>,
    pub country: Option<String>,
    pub market_cap: Option<f64>,
}

impl SecurityAttributes {
    pub fn is_empty(&self) -> bool {
        self.sector.is_none() && self.country.is_none() && self.market_cap.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.sector.is_some() && self.country.is_some() && self.market_cap.is_some()
    }

    /// Fills fields missing here from `other`. Present fields are never replaced.
    pub fn fill_from(&mut self, other: &SecurityAttributes) {
        if self.sector.is_none() {
            self.sector = other.sector.clone();
        }
        if self.country.is_none() {
            self.country = other.country.clone();
        }
        if self.market_cap.is_none() {
            self.market_cap = other.market_cap;
        }
    }
}

/// One row of the look-through view.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedExposure {
    key: SecurityKey,
    total_exposure: Usd,
    pub attributes: SecurityAttributes,
}

impl AggregatedExposure {
    pub fn new(key: SecurityKey, total_exposure: Usd) -> Self {
        Self {
            key,
            total_exposure,
            attributes: SecurityAttributes::default(),
        }
    }

    pub fn key(&self) -> &SecurityKey {
        &self.key
    }

    pub fn ticker(&self) -> String {
        self.key.to_string()
    }

    pub fn total_exposure(&self) -> Usd {
        self.total_exposure
    }

    /// Returns a copy carrying `attributes` merged over the current ones.
    pub fn with_attributes(&self, attributes: &SecurityAttributes) -> Self {
        let mut merged = attributes.clone();
        merged.fill_from(&self.attributes);
        Self {
            key: self.key.clone(),
            total_exposure: self.total_exposure,
            attributes: merged,
        }
    }
}
