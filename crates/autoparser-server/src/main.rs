//! Autoparser Server - Main entry point

use anyhow::Result;
use autoparser_common::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use autoparser_server::{
    collaborators::{HttpExtractor, HttpFetcher, HttpSearch, SchemaValidator},
    config::Config,
    db,
    features::{measures, runs},
    pipeline::{ExecutionModeKind, StageTable},
    store::{PgStore, Store},
    AppError, Collaborators, Pipeline,
};

/// Support-measure extraction pipeline
#[derive(Parser, Debug)]
#[command(name = "autoparser-server")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trigger a run for a region
    Start {
        /// Free-text region token, e.g. "Татарстан"
        region: String,

        /// Override EXECUTION_MODE for this trigger (queued or sync)
        #[arg(short, long)]
        mode: Option<ExecutionModeKind>,
    },

    /// Execute queued runs until interrupted
    Worker,

    /// List recent runs
    Runs {
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Show one run with its counters
    Run { run_id: Uuid },

    /// List the steps of a run
    Steps { run_id: Uuid },

    /// Show one step with its payload
    Step { run_id: Uuid, step_id: Uuid },

    /// Show the page snapshot captured by a FETCH step
    Snapshot { run_id: Uuid, step_id: Uuid },

    /// List the measures a run saved
    Measures { run_id: Uuid },

    /// Show one stored measure
    Measure { intlid: String },

    /// Apply pending database migrations
    Migrate,

    /// Check database connectivity
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("autoparser-server")
        .filter_directives("autoparser_server=info,sqlx=warn,reqwest=info")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    if let Err(e) = execute_command(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        let code = e.downcast_ref::<AppError>().map(AppError::exit_code).unwrap_or(1);
        process::exit(code);
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let pool = db::create_pool(&config.database)
        .await
        .map_err(AppError::from)?;
    let store = Arc::new(PgStore::new(pool));

    match cli.command {
        Commands::Start { region, mode } => {
            migrate(&store).await?;
            let kind = mode.unwrap_or(config.pipeline.execution_mode);
            let pipeline = build_pipeline(&config, store)?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_shutdown(cancel.clone()));

            let mode = pipeline.mode(kind, cancel);
            let response = runs::commands::start_run::handle(
                mode.as_ref(),
                runs::commands::StartRunCommand { region },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&response)
        },

        Commands::Worker => {
            migrate(&store).await?;
            let pipeline = build_pipeline(&config, store)?;
            let worker = pipeline.worker(config.worker_settings());

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_shutdown(cancel.clone()));

            worker.run(cancel).await?;
            info!("Worker shut down gracefully");
            Ok(())
        },

        Commands::Runs { limit } => {
            let response =
                runs::queries::list_runs::handle(store.as_ref(), runs::queries::ListRunsQuery { limit })
                    .await
                    .map_err(AppError::from)?;
            print_json(&response)
        },

        Commands::Run { run_id } => {
            let run = runs::queries::get_run::handle(store.as_ref(), runs::queries::GetRunQuery { run_id })
                .await
                .map_err(AppError::from)?;
            print_json(&run)
        },

        Commands::Steps { run_id } => {
            let response = runs::queries::list_steps::handle(
                store.as_ref(),
                runs::queries::ListStepsQuery { run_id },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&response)
        },

        Commands::Step { run_id, step_id } => {
            let step = runs::queries::get_step::handle(
                store.as_ref(),
                runs::queries::GetStepQuery { run_id, step_id },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&step)
        },

        Commands::Snapshot { run_id, step_id } => {
            let snapshot = runs::queries::get_step_snapshot::handle(
                store.as_ref(),
                runs::queries::GetStepSnapshotQuery { run_id, step_id },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&snapshot)
        },

        Commands::Measures { run_id } => {
            let response = measures::queries::list_measures_for_run::handle(
                store.as_ref(),
                measures::queries::ListMeasuresForRunQuery { run_id },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&response)
        },

        Commands::Measure { intlid } => {
            let measure = measures::queries::get_measure::handle(
                store.as_ref(),
                measures::queries::GetMeasureQuery { intlid },
            )
            .await
            .map_err(AppError::from)?;
            print_json(&measure)
        },

        Commands::Migrate => {
            migrate(&store).await?;
            info!("Database migrations completed");
            Ok(())
        },

        Commands::Health => {
            db::health_check(store.pool()).await.map_err(AppError::from)?;
            print_json(&serde_json::json!({ "status": "healthy", "database": "connected" }))
        },
    }
}

/// Wire HTTP collaborators and the embedded schemas into a pipeline
fn build_pipeline(config: &Config, store: Arc<PgStore>) -> Result<Pipeline> {
    let c = &config.collaborators;
    let collaborators = Collaborators {
        search: Arc::new(
            HttpSearch::new(
                c.search_endpoint.clone(),
                Duration::from_secs(c.search_timeout_secs),
                &c.user_agent,
            )
            .map_err(AppError::from)?,
        ),
        fetcher: Arc::new(
            HttpFetcher::new(Duration::from_secs(c.fetch_timeout_secs), &c.user_agent)
                .map_err(AppError::from)?,
        ),
        extractor: Arc::new(
            HttpExtractor::new(
                c.extractor_endpoint.clone(),
                c.extractor_api_key.clone(),
                Duration::from_secs(c.extraction_timeout_secs),
            )
            .map_err(AppError::from)?,
        ),
        validator: Arc::new(SchemaValidator::embedded(&StageTable::standard()).map_err(AppError::from)?),
    };

    let store: Arc<dyn Store> = store;
    let pipeline = Pipeline::new(store, collaborators, config.pipeline_settings()?)
        .map_err(AppError::from)?;

    info!(mode = %config.pipeline.execution_mode, "Pipeline ready");
    Ok(pipeline)
}

async fn migrate(store: &PgStore) -> Result<()> {
    store
        .migrate()
        .await
        .map_err(|e| AppError::from(db::DbError::from(e)))?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM
///
/// Running runs stop before their next source and are finished with status `error`.
async fn cancel_on_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    token.cancel();
}
