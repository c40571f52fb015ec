use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratelimit_io::config::RatelimitIoConfig;
use ratelimit_io::ratelimit::{AsyncQuotaStore, CheckRequest, LimitSpec, Mode};
use ratelimit_io::store::{AsyncRedisStore, MemoryStore};
use ratelimit_io::{AdmissionEngine, RatelimitError};

/// Issue admission checks against a shared quota store.
#[derive(Parser, Debug)]
#[command(name = "ratelimit-io", version)]
struct Args {
    /// Path to YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store URL, overriding the configuration.
    #[arg(long)]
    store_url: Option<String>,

    /// Use an in-process store instead of connecting to one.
    #[arg(long)]
    memory: bool,

    /// Key to charge.
    #[arg(long)]
    key: Option<String>,

    /// Call-site key, used when --key is absent.
    #[arg(long)]
    unique_key: Option<String>,

    /// Requests allowed per window.
    #[arg(long, requires = "window_secs")]
    requests: Option<u64>,

    /// Window length in seconds.
    #[arg(long, requires = "requests")]
    window_secs: Option<f64>,

    /// "incoming" (fail fast) or "outgoing" (wait).
    #[arg(long)]
    mode: Option<Mode>,

    /// Number of checks to issue.
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Issue all checks at once instead of one after another.
    #[arg(long)]
    concurrent: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatelimitIoConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.store_url {
        config.store.url = url.clone();
    }
    if let Some(mode) = args.mode {
        config.limiter.mode = mode;
    }

    let limit = match (args.requests, args.window_secs) {
        (Some(requests), Some(seconds)) => Some(LimitSpec::from_secs_f64(requests, seconds)?),
        _ => None,
    };

    let mut request = CheckRequest::new();
    if let Some(key) = &args.key {
        request = request.key(key.clone());
    }
    if let Some(key) = &args.unique_key {
        request = request.unique_key(key.clone());
    }
    if let Some(limit) = limit {
        request = request.limit(limit);
    }

    if args.memory {
        info!("Using in-process store");
        let engine = AdmissionEngine::new(MemoryStore::new(), config.limiter);
        run(Arc::new(engine), request, &args).await
    } else {
        info!(url = %config.store.url, "Connecting to store");
        let store = AsyncRedisStore::connect_with(&config.store).await?;
        let engine = AdmissionEngine::new(store, config.limiter);
        run(Arc::new(engine), request, &args).await
    }
}

async fn run<S>(engine: Arc<AdmissionEngine<S>>, request: CheckRequest, args: &Args) -> anyhow::Result<()>
where
    S: AsyncQuotaStore + 'static,
{
    let outcomes = if args.concurrent {
        let calls = (0..args.count).map(|_| {
            let engine = engine.clone();
            let request = request.clone();
            async move { engine.check_request_async(&request).await }
        });
        futures::future::join_all(calls).await
    } else {
        let mut outcomes = Vec::with_capacity(args.count as usize);
        for _ in 0..args.count {
            outcomes.push(engine.check_request_async(&request).await);
        }
        outcomes
    };

    let mut admitted = 0;
    let mut rejected = 0;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(admission) => {
                admitted += 1;
                info!(
                    call = index + 1,
                    key = %admission.key,
                    limit = %admission.limit,
                    attempts = admission.attempts,
                    waited_ms = admission.waited.as_millis() as u64,
                    "Admitted"
                );
            }
            Err(RatelimitError::RateLimitExceeded { key, retry_after, .. }) => {
                rejected += 1;
                warn!(
                    call = index + 1,
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rejected"
                );
            }
            Err(err) => {
                error!(call = index + 1, error = %err, "Admission check failed");
                return Err(err.into());
            }
        }
    }

    info!(admitted, rejected, "Done");
    Ok(())
}
