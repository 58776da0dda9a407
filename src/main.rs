use anyhow::Result;
use clap::Parser;
use shopsched::executor::CopyExecutor;
use shopsched::marketplace::{HttpTransport, SignedClient};
use shopsched::{config, db, scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/shopsched.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let transport = Arc::new(HttpTransport::new(
        cfg.marketplace.http_timeout_secs,
        cfg.marketplace.proxy_base.as_deref(),
    )?);
    let client = SignedClient::new(pool.clone(), transport, &cfg.marketplace)?;
    let executor = CopyExecutor::new(client);

    let interval = Duration::from_millis(cfg.app.sweep_interval_ms);
    let batch_size = cfg.app.sweep_batch_size;

    info!("starting scheduled-job sweeper");
    loop {
        match scheduler::sweep(&pool, &executor, batch_size).await {
            Ok(executed) => {
                if executed > 0 {
                    info!(executed, "sweep executed due jobs");
                }
                tokio::time::sleep(interval).await;
            }
            Err(err) => {
                error!(?err, "sweep failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
