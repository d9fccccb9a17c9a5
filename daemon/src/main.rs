use anyhow::Context;
use clap::Parser;
use scanhive_daemon::api::{self, AppState};
use scanhive_daemon::config::Config;
use scanhive_daemon::db::Db;
use scanhive_daemon::executor::{Executor, ExecutorConfig};
use scanhive_daemon::metrics::MetricsCollector;
use scanhive_daemon::store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scanhive-daemon", about = "Scan job orchestration daemon")]
struct Args {
    /// Path to a YAML or TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address, e.g. 0.0.0.0:5050
    #[arg(long)]
    bind: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.server.data_dir = data_dir;
    }

    setup_logging(&config)?;
    log::info!("Starting scanhive-daemon...");

    std::fs::create_dir_all(config.jobs_dir())
        .with_context(|| format!("Failed to create data directory {:?}", config.jobs_dir()))?;

    let db = Db::new(&config.db_path())
        .with_context(|| format!("Failed to open database at {:?}", config.db_path()))?;
    let store = Arc::new(JobStore::open(db)?);

    let catalog = Arc::new(common::Catalog::load(
        config.catalog.tools_file.as_deref(),
        config.catalog.profiles_file.as_deref(),
    )?);
    log::info!(
        "Catalog loaded: {} tools, {} profiles",
        catalog.tools.len(),
        catalog.profiles.len()
    );

    let metrics = Arc::new(MetricsCollector::new());
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        Arc::clone(&metrics),
        ExecutorConfig {
            jobs_dir: config.jobs_dir(),
            per_job_units: config.server.per_job_units,
            max_total_units: config.server.max_total_units,
            default_tool_timeout: Duration::from_secs(config.server.default_tool_timeout_secs),
            job_timeout: config.server.job_timeout_secs.map(Duration::from_secs),
        },
    ));

    let state = AppState {
        store,
        executor,
        catalog,
        metrics,
    };
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    log::info!("Listening on {}", config.server.bind_addr);

    axum::serve(listener, router).await?;
    Ok(())
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let level = config
        .logging
        .level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // Main log: filter OUT job_output
    let mut main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "job_output")
        .chain(std::io::stdout());
    if let Some(path) = &config.logging.output {
        main_log = main_log.chain(fern::log_file(path)?);
    }

    // Jobs log: filter IN job_output
    let mut dispatch = base_config.chain(main_log);
    if let Some(path) = &config.logging.job_output {
        let jobs_log = fern::Dispatch::new()
            .filter(|metadata| metadata.target() == "job_output")
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(jobs_log);
    }

    dispatch.apply()?;
    Ok(())
}
