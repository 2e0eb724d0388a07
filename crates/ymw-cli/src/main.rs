use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ymw_catalog::EnrichError;
use ymw_core::{AggregateRow, Granularity, PeriodScope};
use ymw_sync::{inspect_file, write_reports, AnalysisSnapshot, WrapConfig, WrapPipeline};

#[derive(Debug, Parser)]
#[command(name = "ymw")]
#[command(about = "Music Wrapped from a YouTube watch-history archive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// Takeout `watch-history.html`
    #[arg(long)]
    archive: PathBuf,
    /// YAML file with extra month spellings
    #[arg(long, env = "YMW_MONTH_ALIASES")]
    month_aliases: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[arg(long, env = "YOUTUBE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Catalog requests per minute (0 disables pacing)
    #[arg(long, env = "YMW_LOOKUP_RATE")]
    lookup_rate: Option<u32>,
    #[arg(long)]
    min_duration_secs: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full pipeline, print the top lists and write reports
    Analyze {
        #[command(flatten)]
        archive: ArchiveArgs,
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
        #[arg(long, default_value = "overall")]
        scope: PeriodScope,
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Run the pipeline and print the audit tables with the discrepancy view
    Diagnose {
        #[command(flatten)]
        archive: ArchiveArgs,
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(long, default_value = "month")]
        granularity: Granularity,
    },
    /// Parse and classify only; no catalog traffic
    Parse {
        #[command(flatten)]
        archive: ArchiveArgs,
    },
    /// Run the pipeline once and serve the JSON API from memory
    Serve {
        #[command(flatten)]
        archive: ArchiveArgs,
        #[command(flatten)]
        catalog: CatalogArgs,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ymw_cli=info,ymw_sync=info,ymw_catalog=info,ymw_fetch=info,ymw_archive=info,ymw_web=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn config_for(archive: &ArchiveArgs, catalog: Option<&CatalogArgs>) -> WrapConfig {
    let mut config = WrapConfig::from_env();
    if archive.month_aliases.is_some() {
        config.month_aliases_path = archive.month_aliases.clone();
    }
    if let Some(catalog) = catalog {
        if catalog.api_key.is_some() {
            config.api_key = catalog.api_key.clone();
        }
        if let Some(concurrency) = catalog.concurrency {
            config.lookup_concurrency = concurrency.max(1);
        }
        if let Some(rate) = catalog.lookup_rate {
            config.lookup_rate_per_minute = (rate > 0).then_some(rate);
        }
        if let Some(min) = catalog.min_duration_secs {
            config.min_duration_seconds = min;
        }
    }
    config
}

/// Cancels enrichment on Ctrl-C; resolved metadata is kept.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping catalog enrichment");
            token.cancel();
        }
    });
    cancel
}

async fn run_pipeline(archive: &ArchiveArgs, config: WrapConfig) -> Result<AnalysisSnapshot> {
    let pipeline = WrapPipeline::with_youtube_catalog(config)?;
    info!(run_id = %pipeline.run_id(), archive = %archive.archive.display(), "starting analysis");

    let mut progress = pipeline.subscribe_progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow();
            info!(processed = current.processed, total = current.total, "catalog lookup progress");
        }
    });

    pipeline.analyze_file(&archive.archive, &cancel_on_ctrl_c()).await
}

/// Non-zero, distinguishable exit codes when enrichment did not complete.
fn enrichment_exit_code(snapshot: &AnalysisSnapshot) -> ExitCode {
    match &snapshot.enrichment.fatal {
        Some(err) => {
            eprintln!("catalog enrichment stopped: {err}");
            eprintln!("hint: {}", err.remediation());
            match err {
                EnrichError::CredentialRejected { .. } => ExitCode::from(2),
                EnrichError::QuotaExceeded { .. } => ExitCode::from(3),
            }
        }
        None if snapshot.enrichment.cancelled => {
            eprintln!("catalog enrichment cancelled; results cover resolved items only");
            ExitCode::from(130)
        }
        None => ExitCode::SUCCESS,
    }
}

fn print_rows(title: &str, rows: &[AggregateRow]) {
    println!("{title}");
    if rows.is_empty() {
        println!("  (none)");
    }
    for (i, row) in rows.iter().enumerate() {
        let by = row
            .artist_channel
            .as_deref()
            .map(|artist| format!(" by {artist}"))
            .unwrap_or_default();
        println!(
            "  {:>2}. {}{}  plays={} minutes={:.1} score={:.1}",
            i + 1,
            row.entity_name,
            by,
            row.play_count,
            row.total_capped_minutes,
            row.listen_score
        );
    }
}

async fn analyze(
    archive: ArchiveArgs,
    catalog: CatalogArgs,
    reports_dir: Option<PathBuf>,
    scope: PeriodScope,
    top: usize,
) -> Result<ExitCode> {
    let mut config = config_for(&archive, Some(&catalog));
    if let Some(dir) = reports_dir {
        config.reports_dir = dir;
    }
    let reports_root = config.reports_dir.clone();
    let snapshot = run_pipeline(&archive, config).await?;
    let report = write_reports(&snapshot, &reports_root).await?;

    match snapshot.summary(scope, top) {
        Some(summary) => {
            println!("{} ({})", summary.label, summary.scope);
            println!("  total minutes: {:.1} across {} listens", summary.total_minutes, summary.listen_count);
            if let Some(growth) = &summary.growth_text {
                println!("  {growth}");
            }
            print_rows("Top songs", &summary.top_songs);
            print_rows("Top artists", &summary.top_artists);
        }
        None => println!("no qualified listens in {scope}"),
    }
    println!("reports: {}", report.reports_dir);
    Ok(enrichment_exit_code(&snapshot))
}

async fn diagnose(archive: ArchiveArgs, catalog: CatalogArgs, granularity: Granularity) -> Result<ExitCode> {
    let snapshot = run_pipeline(&archive, config_for(&archive, Some(&catalog))).await?;
    let funnel = snapshot.funnel;
    println!("Pipeline funnel");
    println!("  raw entries parsed:      {}", funnel.raw_entries);
    println!("  music listens:           {}", funnel.music_listens);
    println!("  listens with metadata:   {}", funnel.listens_with_metadata);
    println!("  final qualified listens: {}", funnel.qualified_listens);
    println!("  malformed entries:       {}", snapshot.malformed_records);

    let audit = snapshot.audit(granularity);
    println!("Raw entries per period (unparsed timestamps: {})", audit.unparsed_timestamps);
    for row in snapshot.discrepancies(granularity) {
        println!(
            "  {:<9} raw={:>6} aggregated={:>6}",
            row.period.to_string(),
            row.raw_entries,
            row.aggregated_listens
        );
    }
    if !snapshot.enrichment.unresolved.is_empty() {
        println!("Unresolved items: {}", snapshot.enrichment.unresolved.len());
    }
    Ok(enrichment_exit_code(&snapshot))
}

async fn parse(archive: ArchiveArgs) -> Result<ExitCode> {
    let config = config_for(&archive, None);
    let overview = inspect_file(&archive.archive, &config.classifier()?).await?;
    println!("records:             {}", overview.records);
    println!("malformed (skipped): {}", overview.malformed);
    println!("music listens:       {}", overview.music_listens);
    println!("distinct music ids:  {}", overview.distinct_music_ids);
    println!("unparsed timestamps: {}", overview.unparsed_timestamps);
    for row in &overview.month_audit.rows {
        println!("  {} {:>6}", row.period, row.raw_entry_count);
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(archive: ArchiveArgs, catalog: CatalogArgs, port: Option<u16>) -> Result<ExitCode> {
    let config = config_for(&archive, Some(&catalog));
    let port = port.unwrap_or(config.web_port);
    let snapshot = run_pipeline(&archive, config).await?;
    if let Some(err) = &snapshot.enrichment.fatal {
        warn!(error = %err, hint = err.remediation(), "serving partial results");
    }
    ymw_web::serve(snapshot, port).await?;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Analyze {
            archive,
            catalog,
            reports_dir,
            scope,
            top,
        } => analyze(archive, catalog, reports_dir, scope, top).await,
        Commands::Diagnose {
            archive,
            catalog,
            granularity,
        } => diagnose(archive, catalog, granularity).await,
        Commands::Parse { archive } => parse(archive).await,
        Commands::Serve { archive, catalog, port } => serve(archive, catalog, port).await,
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
