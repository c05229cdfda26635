use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use look_through::config::Config;
use look_through::enricher::{ExposureEnricher, IdentifierResolver};
use look_through::filings::{fund_requests, NportClient};
use look_through::pipeline;
use look_through::providers::{OpenFigiResolver, ResolverChain, YahooMarketData, YahooSearchResolver};
use look_through::repository::{
    write_exposures, write_fund_composition, CsvHoldingsRepository, HoldingsRepository,
};

/// Look-through exposure of a portfolio holding stocks directly and through funds
#[derive(Parser)]
#[command(name = "look-through", version, about)]
struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flatten the portfolio into one exposure per security
    Aggregate(AggregateArgs),
    /// Download a fund's composition from its latest N-PORT filing
    FetchFund(FetchFundArgs),
    /// Download the composition of every fund in the portfolio that names a CIK
    FetchFunds(FetchFundsArgs),
}

#[derive(Args)]
struct AggregateArgs {
    /// Portfolio positions file
    #[arg(long)]
    positions: PathBuf,

    /// Directory with one composition file per fund
    #[arg(long, default_value = "./funds")]
    funds: PathBuf,

    /// Exposure report to write
    #[arg(long, default_value = "exposures.csv")]
    output: PathBuf,

    /// Resolve CUSIPs and attach sector, country and market cap
    #[arg(long)]
    enrich: bool,

    /// Partial enrichment results, reused on the next run
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Concurrent collaborator calls
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct FetchFundsArgs {
    /// Portfolio positions file with CIK and series columns on fund rows
    #[arg(long)]
    positions: PathBuf,

    #[arg(long, default_value = "./funds")]
    funds: PathBuf,
}

#[derive(Args)]
struct FetchFundArgs {
    /// Identifier the portfolio file uses for this fund
    #[arg(long)]
    fund_id: String,

    /// Registrant CIK
    #[arg(long)]
    cik: String,

    /// Series identifier of the fund within the registrant
    #[arg(long)]
    series: String,

    #[arg(long, default_value = "./funds")]
    funds: PathBuf,
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Aggregate(args) => aggregate(args, config).await,
        Commands::FetchFund(args) => fetch_fund(args, config).await,
        Commands::FetchFunds(args) => fetch_funds(args, config).await,
    }
}

async fn aggregate(args: AggregateArgs, config: Config) -> Result<()> {
    let repository = CsvHoldingsRepository::new(&args.positions, &args.funds);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let enricher = args.enrich.then(|| {
        let mut enricher_config = config.enricher.clone();
        enricher_config.checkpoint_path = args.checkpoint.clone();
        enricher_config.compositions_dir = Some(args.funds.clone());
        if let Some(concurrency) = args.concurrency.filter(|c| *c > 0) {
            enricher_config.concurrency = concurrency;
        }
        let resolvers: Vec<Arc<dyn IdentifierResolver>> = vec![
            Arc::new(OpenFigiResolver::new(config.openfigi_api_key.clone())),
            Arc::new(YahooSearchResolver::new()),
        ];
        let resolver = ResolverChain::new(resolvers);
        ExposureEnricher::new(
            Arc::new(resolver),
            Arc::new(YahooMarketData::new()),
            enricher_config,
        )
    });

    let start_time = std::time::Instant::now();
    let outcome = pipeline::run(&repository, enricher.as_ref(), &cancel).await?;
    write_exposures(&args.output, &outcome.exposures)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let aggregation = &outcome.aggregation;
    for gap in &aggregation.allocation_gaps {
        println!("No composition for fund {}: {} unallocated", gap.fund_id, gap.invested);
    }
    println!("Invested:        {}", aggregation.invested_total);
    println!("Attributed:      {}", aggregation.total_exposure());
    println!("Unallocated:     {}", aggregation.unallocated_total);
    println!("Fund residuals:  {}", aggregation.residual_total);
    println!("Unresolved rows: {}", aggregation.unresolved().count());
    for row in outcome.exposures.iter().take(10) {
        println!(
            "{:<24} {:>18} {:<24} {}",
            row.ticker(),
            row.total_exposure().to_string(),
            row.attributes.sector.as_deref().unwrap_or("-"),
            row.attributes.country.as_deref().unwrap_or("-"),
        );
    }

    let diagnostics = outcome.diagnostics();
    info!(
        rows = outcome.exposures.len(),
        output = %args.output.display(),
        malformed = diagnostics.malformed,
        unresolved = diagnostics.unresolved,
        timeouts = diagnostics.timeouts,
        collaborator_failures = diagnostics.collaborator_failures,
        cancelled = outcome.cancelled,
        elapsed = ?start_time.elapsed(),
        "wrote exposure report"
    );
    Ok(())
}

async fn fetch_fund(args: FetchFundArgs, config: Config) -> Result<()> {
    let client = NportClient::new(config.sec_api_token)?;
    let Some(loaded) = client
        .fetch_composition(&args.fund_id, &args.cik, Some(&args.series))
        .await?
    else {
        bail!(
            "no N-PORT filing found for CIK {} series {}",
            args.cik,
            args.series
        );
    };
    let path = write_fund_composition(&args.funds, &loaded.data)?;
    println!(
        "Wrote {} holdings of {} to {}",
        loaded.data.holdings.len(),
        args.fund_id,
        path.display()
    );
    Ok(())
}

async fn fetch_funds(args: FetchFundsArgs, config: Config) -> Result<()> {
    let client = NportClient::new(config.sec_api_token)?;
    let repository = CsvHoldingsRepository::new(&args.positions, &args.funds);
    let positions = repository.load_positions()?;
    let requests = fund_requests(&positions.data);
    if requests.is_empty() {
        bail!("no fund rows with a CIK in {}", args.positions.display());
    }

    let mut written = 0;
    for request in &requests {
        let fetched = client
            .fetch_composition(&request.fund_id, &request.cik, request.series.as_deref())
            .await;
        match fetched {
            Ok(Some(loaded)) => {
                let path = write_fund_composition(&args.funds, &loaded.data)?;
                println!(
                    "Wrote {} holdings of {} to {}",
                    loaded.data.holdings.len(),
                    request.fund_id,
                    path.display()
                );
                written += 1;
            }
            Ok(None) => warn!(fund_id = %request.fund_id, cik = %request.cik, "no N-PORT filing found"),
            Err(error) => warn!(fund_id = %request.fund_id, error = %error, "fund fetch failed"),
        }
    }

    info!(requested = requests.len(), written, "fetched fund compositions");
    Ok(())
}
