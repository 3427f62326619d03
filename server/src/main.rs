use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tourney_server::{
    fast::DEFAULT_KEY_PREFIX, Api, Clock, FastStore, MemoryFastStore, RedisFastStore, SqliteStore,
    Tournament, TournamentConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "tourney-server";

/// OTLP export settings, taken from the standard `OTEL_*` variables.
#[derive(Debug, PartialEq)]
struct OtlpSettings {
    endpoint: String,
    service_name: String,
    sampling_rate: f64,
}

impl OtlpSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| SERVICE_NAME.to_string());
        let sampling_rate = lookup("OTEL_SAMPLING_RATE")
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        Some(Self {
            endpoint,
            service_name,
            sampling_rate,
        })
    }

    fn tracer_provider(self) -> Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(self.endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        // Requests that arrive with a sampled parent stay sampled.
        let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            self.sampling_rate,
        )));
        Ok(SdkTracerProvider::builder()
            .with_sampler(sampler)
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([
                        opentelemetry::KeyValue::new("service.name", self.service_name),
                        opentelemetry::KeyValue::new(
                            "service.version",
                            env!("CARGO_PKG_VERSION"),
                        ),
                    ])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build())
    }
}

/// Flushes buffered spans when the server exits.
struct TelemetryGuard(Option<SdkTracerProvider>);

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to flush spans: {err}");
            }
        }
    }
}

/// Logs to stdout under `RUST_LOG` (default `info`), and also exports spans over
/// OTLP when an endpoint is configured.
fn init_tracing() -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = OtlpSettings::from_lookup(|key| std::env::var(key).ok())
        .map(OtlpSettings::tracer_provider)
        .transpose()?;
    let otlp = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otlp)
        .init();
    if let Some(provider) = &provider {
        opentelemetry::global::set_tracer_provider(provider.clone());
    }
    Ok(TelemetryGuard(provider))
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Matchmaking tick in milliseconds. Joiners poll at half this interval.
    #[arg(long)]
    matchmaking_interval_ms: Option<u64>,

    /// How long a joining player waits for a group, in milliseconds.
    #[arg(long)]
    join_timeout_ms: Option<u64>,

    /// Idle TTL of live group leaderboards, in seconds.
    #[arg(long)]
    group_ttl_seconds: Option<u64>,

    /// Idle TTL of player to group pointers, in seconds.
    #[arg(long)]
    pointer_ttl_seconds: Option<u64>,

    /// Put popped players back into their queues when their group cannot be created.
    #[arg(long)]
    requeue_on_formation_failure: Option<bool>,

    /// Capacity of the formation worker channel (0 keeps the default).
    #[arg(long)]
    formation_buffer: Option<usize>,

    /// Capacity of the score sync worker channel (0 keeps the default).
    #[arg(long)]
    score_sync_buffer: Option<usize>,

    /// Redis URL for the fast store (in-process store when omitted).
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix for every Redis key.
    #[arg(long, default_value = DEFAULT_KEY_PREFIX)]
    redis_prefix: String,

    /// Path to the SQLite database (in-memory when omitted).
    #[arg(long)]
    database_path: Option<PathBuf>,
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => v, None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(arg: Option<T>, default: T) -> T {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => v,
        None => default,
    }
}

fn build_config(args: &Args) -> Result<TournamentConfig> {
    let defaults = TournamentConfig::default();
    let config = TournamentConfig {
        matchmaking_interval: args
            .matchmaking_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.matchmaking_interval),
        join_timeout: args
            .join_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.join_timeout),
        group_ttl: args
            .group_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.group_ttl),
        pointer_ttl: args
            .pointer_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.pointer_ttl),
        requeue_on_formation_failure: args
            .requeue_on_formation_failure
            .unwrap_or(defaults.requeue_on_formation_failure),
        formation_buffer: map_optional_default_on_zero(
            args.formation_buffer,
            defaults.formation_buffer,
        ),
        score_sync_buffer: map_optional_default_on_zero(
            args.score_sync_buffer,
            defaults.score_sync_buffer,
        ),
    };
    config.validate().context("invalid tournament config")?;
    Ok(config)
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(?err, "failed to listen for ctrl-c");
            }
        }
        _ = cancel.cancelled() => {}
    }
    info!("Shutting down");
    cancel.cancel();
}

async fn serve<F: FastStore>(
    args: &Args,
    config: TournamentConfig,
    fast: F,
    durable: SqliteStore,
) -> Result<()> {
    let tournament = Arc::new(
        Tournament::new(config, Arc::new(fast), Arc::new(durable), Clock::system())
            .context("failed to start tournament")?,
    );

    // Absence of cache state reads as "not in the tournament", so rebuild before serving.
    let rebuild = tournament
        .rebuild()
        .await
        .context("failed to rebuild fast store")?;
    info!(
        groups = rebuild.groups,
        players = rebuild.players,
        "Fast store rebuilt"
    );

    let cancel = CancellationToken::new();
    let background = tournament.spawn_background(cancel.clone());
    let app = Api::new(tournament).router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("axum server error")?;

    cancel.cancel();
    for handle in background {
        if let Err(err) = handle.await {
            warn!(?err, "background task ended abnormally");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    let _telemetry = init_tracing()?;

    let config = build_config(&args)?;
    info!(?config, "tournament config loaded");

    let durable = match &args.database_path {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open database at {}", path.display()))?;
            info!(path = %path.display(), "SQLite durable store enabled");
            store
        }
        None => {
            warn!("No database path configured; using an in-memory database");
            SqliteStore::open_in_memory().context("failed to open in-memory database")?
        }
    };

    match &args.redis_url {
        Some(url) => {
            let fast = RedisFastStore::new(url, args.redis_prefix.clone())
                .context("invalid redis url")?;
            info!(prefix = %args.redis_prefix, "Redis fast store enabled");
            serve(&args, config, fast, durable).await
        }
        None => {
            warn!("No redis url configured; using the in-process fast store (single instance only)");
            serve(&args, config, MemoryFastStore::new(), durable).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tournament_config_fields() {
        let args = Args::parse_from([
            "tourney-server",
            "--matchmaking-interval-ms",
            "200",
            "--join-timeout-ms",
            "5000",
            "--requeue-on-formation-failure",
            "false",
            "--formation-buffer",
            "0",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.matchmaking_interval, Duration::from_millis(200));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.max_polls(), 50);
        assert!(!config.requeue_on_formation_failure);
        assert_eq!(config.formation_buffer, 1_024);
        assert_eq!(args.redis_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn otlp_settings_need_an_endpoint() {
        assert_eq!(OtlpSettings::from_lookup(|_| None), None);
        assert_eq!(
            OtlpSettings::from_lookup(|key| {
                (key == "OTEL_EXPORTER_OTLP_ENDPOINT").then(|| "  ".to_string())
            }),
            None
        );

        let settings = OtlpSettings::from_lookup(|key| match key {
            "OTEL_EXPORTER_OTLP_ENDPOINT" => Some(" http://collector:4318 ".to_string()),
            "OTEL_SAMPLING_RATE" => Some("7".to_string()),
            _ => None,
        })
        .expect("endpoint configured");
        assert_eq!(settings.endpoint, "http://collector:4318");
        assert_eq!(settings.service_name, SERVICE_NAME);
        assert_eq!(settings.sampling_rate, 1.0);
    }

    #[test]
    fn rejects_zero_join_timeout() {
        let args = Args::parse_from(["tourney-server", "--join-timeout-ms", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(
            format!("{err:#}").contains("join_timeout"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn rejects_timeout_shorter_than_poll() {
        let args = Args::parse_from([
            "tourney-server",
            "--matchmaking-interval-ms",
            "1000",
            "--join-timeout-ms",
            "100",
        ]);
        assert!(build_config(&args).is_err());
    }
}
