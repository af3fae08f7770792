use network_path_tracer::config::{Config, RequestArgs};
use network_path_tracer::routes::parse_prefix;
use network_path_tracer::{
    DecoderRegistry, DirectorySource, Exclusion, PathEngine, Snapshot, SnapshotSource,
    SnapshotStore, TraceRequest, TracerError, TracerResult,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::interval;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    tracing::info!("Network path tracer starting...");

    let source: Arc<dyn SnapshotSource> =
        Arc::new(DirectorySource::new(&config.inventory_path, &config.snapshot_dir));
    let settings = config.snapshot_settings();
    let initial = {
        let source = source.clone();
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || Snapshot::load(source.as_ref(), &settings)).await??
    };
    for warning in initial.load_warnings() {
        tracing::warn!("{}", warning);
    }
    let store = Arc::new(SnapshotStore::new(initial, settings));
    let decoders = Arc::new(DecoderRegistry::new().with(Arc::new(config.site_decoder.clone())));

    let engine = |snapshot: Arc<Snapshot>| PathEngine::new(snapshot, decoders.clone(), config.walk.clone());
    run_once(&engine(store.current()), &config.request)?;

    let Some(period) = config.reload_interval else {
        return Ok(());
    };

    tracing::info!("Watching for new snapshot generations every {}s", period.as_secs());
    let reload = store.clone().start_reload_task(source, period);
    let mut last: Uuid = store.current().generation();
    let mut check = interval(period);
    loop {
        tokio::select! {
            _ = check.tick() => {
                let snapshot = store.current();
                if snapshot.generation() != last {
                    last = snapshot.generation();
                    run_once(&engine(snapshot), &config.request)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                reload.abort();
                return Ok(());
            }
        }
    }
}

/// Run the requested operation and print it as JSON. Input errors are reported and do
/// not stop a watch loop.
fn run_once(engine: &PathEngine, request: &RequestArgs) -> anyhow::Result<()> {
    match dispatch(engine, request) {
        Ok(json) => {
            println!("{}", json);
            Ok(())
        }
        Err(e) if e.is_input_error() => {
            tracing::error!("{}", e);
            eprintln!("{}", e.user_message());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn dispatch(engine: &PathEngine, request: &RequestArgs) -> TracerResult<String> {
    let (Some(prefix), Some(start)) = (&request.prefix, &request.start) else {
        return to_json(&engine.snapshot().summary());
    };
    let vrf = request.vrf.as_deref();

    if request.origin {
        return to_json(&engine.origin(prefix, start, vrf)?);
    }

    let forward = trace_request(prefix, start, vrf)?;
    if let (Some(reverse_prefix), Some(reverse_start)) = (&request.reverse_prefix, &request.reverse_start) {
        let reverse = trace_request(reverse_prefix, reverse_start, vrf)?;
        return to_json(&engine.trace_reverse(&forward, &reverse)?);
    }

    let baseline = engine.trace_request(&forward)?;
    if request.exclude.is_empty() {
        return to_json(&baseline);
    }
    let exclusion = Exclusion::of_devices(request.exclude.iter().map(String::as_str));
    to_json(&engine.simulate_failure(&baseline, &exclusion)?)
}

fn trace_request(prefix: &str, start: &str, vrf: Option<&str>) -> TracerResult<TraceRequest> {
    let prefix = parse_prefix(prefix).ok_or_else(|| TracerError::MalformedPrefix(prefix.to_string()))?;
    let request = TraceRequest::new(prefix, start);
    Ok(match vrf {
        Some(vrf) => request.in_vrf(vrf),
        None => request,
    })
}

fn to_json<T: Serialize>(value: &T) -> TracerResult<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
