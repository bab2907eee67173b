use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use plugin_scheduler::{
    DatabaseConfig, HttpPluginExecutor, SchedulerConfig, TickOrchestrator, create_scheduler,
};

#[derive(Parser)]
#[command(name = "plugin-scheduler")]
#[command(about = "Periodic plugin execution scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
    db_url: String,
}

#[derive(Args)]
struct ExecutorArgs {
    /// Base URL of the plugin execution service
    #[arg(long, env = "PLUGIN_EXECUTOR_URL", default_value = "http://127.0.0.1:8090")]
    executor_url: String,
    /// Per-call executor timeout in seconds
    #[arg(long, env = "PLUGIN_EXECUTOR_TIMEOUT_SECONDS", default_value_t = 120)]
    executor_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop and the admin API
    Serve {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        executor: ExecutorArgs,
        /// Bind address for the admin API (internal / trusted only)
        #[arg(long, env = "PLUGIN_SCHEDULER_ADMIN_BIND", default_value = "127.0.0.1:8081")]
        admin_bind: String,
        /// Override PLUGIN_SCHEDULER_INTERVAL_SECONDS
        #[arg(long)]
        interval_seconds: Option<u64>,
        /// Override PLUGIN_SCHEDULER_BATCH_LIMIT
        #[arg(long)]
        batch_limit: Option<u32>,
    },
    /// Run a single tick and print its summary
    Tick {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        executor: ExecutorArgs,
    },
    /// Initialize the database
    Init {
        #[command(flatten)]
        store: StoreArgs,
    },
}

fn db_config(store: StoreArgs) -> DatabaseConfig {
    DatabaseConfig {
        url: store.db_url,
        ..Default::default()
    }
}

fn http_executor(args: &ExecutorArgs) -> Result<Arc<HttpPluginExecutor>> {
    info!("Using plugin executor at {}", args.executor_url);
    let executor = HttpPluginExecutor::new(
        args.executor_url.clone(),
        Duration::from_secs(args.executor_timeout),
    )?;
    Ok(Arc::new(executor))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("plugin_scheduler=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            store,
            executor,
            admin_bind,
            interval_seconds,
            batch_limit,
        } => {
            let mut config = SchedulerConfig::default();
            if let Some(interval) = interval_seconds {
                config.interval_seconds = interval;
            }
            if let Some(limit) = batch_limit {
                config.batch_limit = limit;
            }

            let db_config = db_config(store);
            info!("Using database url for scheduler: {}", db_config.url);
            if db_config.url == "memory" {
                warn!("In-memory store is private to this process; racing schedulers need a shared server");
            }

            let scheduler = create_scheduler(db_config, http_executor(&executor)?, config).await?;

            let loop_handle = if scheduler.config().enabled {
                Some(TickOrchestrator::new(scheduler.clone()).spawn())
            } else {
                info!("Scheduler disabled; serving admin API only");
                None
            };

            let admin_app = plugin_scheduler::api::create_admin_router(scheduler.clone());
            let admin_listener = tokio::net::TcpListener::bind(&admin_bind).await?;
            info!("Admin server listening on http://{}", admin_bind);

            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutdown requested");
                })
                .await?;

            if let Some(handle) = loop_handle {
                handle.shutdown().await?;
            }
        }
        Commands::Tick { store, executor } => {
            let db_config = db_config(store);
            info!("Using database url for tick: {}", db_config.url);

            let scheduler =
                create_scheduler(db_config, http_executor(&executor)?, SchedulerConfig::default())
                    .await?;
            let summary = scheduler.tick().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Init { store } => {
            let db_config = db_config(store);
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = plugin_scheduler::create_connection(db_config).await?;
            plugin_scheduler::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}
