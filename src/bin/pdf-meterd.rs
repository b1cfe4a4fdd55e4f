use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use pdf_metering::http::{MeterHttpState, router};
use pdf_metering::telemetry::{TelemetryOptions, init_tracing};
use pdf_metering::{Env, Meter, MeterConfig, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "pdf-meterd", about = "Metering and billing service for PDF operations")]
struct Args {
    /// JSON or TOML config file (YAML with the `config-yaml` feature).
    #[arg(long, env = "PDF_METER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PDF_METER_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    #[arg(long, env = "PDF_METER_SQLITE", default_value = "pdf-meter.sqlite")]
    sqlite: PathBuf,

    /// Shares rate-limit windows across instances.
    #[cfg(feature = "store-redis")]
    #[arg(long, env = "PDF_METER_REDIS_URL")]
    redis: Option<String>,

    #[cfg(feature = "store-redis")]
    #[arg(long, default_value = "pdf_meter")]
    redis_prefix: String,

    /// Enables the `/admin` routes.
    #[arg(long, env = "PDF_METER_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    #[arg(long)]
    dotenv: Option<PathBuf>,

    #[arg(long)]
    json_logs: bool,

    #[arg(long, env = "PDF_METER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let _telemetry = init_tracing(&TelemetryOptions {
        service_name: "pdf-meterd".to_string(),
        json_logs: args.json_logs,
        otlp_endpoint: args.otlp_endpoint.clone(),
    })?;

    let mut config = match args.config.as_deref() {
        Some(path) => MeterConfig::from_path(path)?,
        None => MeterConfig::default(),
    };
    let env = match args.dotenv.as_deref() {
        Some(path) => Env::from_dotenv(&tokio::fs::read_to_string(path).await?),
        None => Env::from_process(),
    };
    config.apply_env(&env)?;

    let store = SqliteStore::new(&args.sqlite);
    store.init().await?;
    info!(path = %args.sqlite.display(), "sqlite store ready");

    #[allow(unused_mut)]
    let mut builder = Meter::builder(Arc::new(store), config.clone());
    #[cfg(feature = "store-redis")]
    if let Some(url) = args.redis.as_deref() {
        let limiter = pdf_metering::RedisRateLimiter::new(url, config.tiers.clone())?
            .with_prefix(args.redis_prefix.clone());
        limiter.ping().await?;
        info!(prefix = limiter.prefix(), "redis rate limiter ready");
        builder = builder.rate_limiter(Arc::new(limiter));
    }
    let meter = Arc::new(builder.build());
    let sweeper = meter.cache().start();

    let mut state = MeterHttpState::new(meter);
    if let Some(token) = args.admin_token {
        state = state.with_admin_token(token);
    }
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "pdf-meterd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    sweeper.stop();
    Ok(())
}
