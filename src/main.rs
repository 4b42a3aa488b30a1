use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use homestream::config::Config;
use homestream::encoder::capabilities::HwCapabilities;
use homestream::hls::manager::{SessionConfig, SessionManager};
use homestream::jobs::queue::JobQueue;
use homestream::jobs::store::JobStore;
use homestream::media::probe::ProbeCache;
use homestream::subtitles::service::{TranscribeJobHandler, TranslateJobHandler};
use homestream::web::{run_server, AppState};

#[derive(Debug, Parser)]
#[command(name = "homestream", about = "Self-hosted media streaming server")]
struct Args {
    /// Override HTTP_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Override MEDIA_ROOT.
    #[arg(long)]
    media_root: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(media_root) = args.media_root {
        config.media_root = media_root;
    }
    let config = Arc::new(config);

    info!(media_root = %config.media_root.display(), "starting homestream");

    // One-shot hardware probe; everything downstream takes the result by
    // value so tests can substitute fakes.
    let caps = Arc::new(HwCapabilities::detect_cached(&config.ffmpeg_path).clone());
    info!(
        hwaccel = caps.hwaccel.as_str(),
        hw_decode = caps.hw_decode,
        encoders = caps.encoders.len(),
        "encoder capabilities detected"
    );

    tokio::fs::create_dir_all(&config.transcode_dir).await?;

    let sessions = SessionManager::new(
        SessionConfig::new(config.transcode_dir.clone(), config.ffmpeg_path.clone()),
        caps.hw_decode,
    );
    sessions.spawn_reaper();

    let store = JobStore::open(&config.job_db_path)?;
    let queue = JobQueue::start(
        store,
        Arc::new(TranscribeJobHandler::new(config.clone())),
        Arc::new(TranslateJobHandler::new(config.clone())),
    )
    .await?;

    let probe_cache = Arc::new(ProbeCache::new(config.ffprobe_path.clone()));

    let state = AppState {
        config,
        caps,
        probe_cache,
        sessions,
        queue,
    };

    run_server(state).await
}
