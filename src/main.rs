use std::sync::Arc;

use clap::Parser;
use floodgate::*;
use miette::Result;
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "floodgate",
    version,
    about = "Stateful ABAC authorization engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Sync principals and roles from a JSON file (idempotent)
    SyncPrincipals {
        /// Path to JSON file containing the realm definition
        #[arg(short, long)]
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database)
        .await
        .map_err(|e| miette::miette!("{e}"))?;

    // run migrations
    migration::Migrator::up(&db, None)
        .await
        .map_err(|e| miette::miette!("Migration failed: {e}"))?;
    tracing::info!("Database migrations applied successfully");

    // shared name→id cache
    let cache = Arc::new(authz::cache::AuthzCache::new(settings.cache_ttl()));

    match cli.command {
        Some(Command::SyncPrincipals { file }) => {
            principal_sync::sync_from_file(&db, &cache, &file).await?;
            tracing::info!("Principal sync completed successfully");
            Ok(())
        }
        None => {
            // audit queue + drain worker
            let (audit_sink, audit_rx) = audit::AuditSink::new(settings.audit.queue_capacity);
            tokio::spawn(audit::run_drain(db.clone(), audit_rx));

            // background jobs
            let _scheduler = jobs::init_scheduler(db.clone(), settings.audit.retention_days)
                .await
                .map_err(|e| miette::miette!("{e}"))?;

            // engine + web server
            let engine = web::build_engine(&settings, db, cache, audit_sink);
            web::serve(settings, engine).await
        }
    }
}
