use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::command::{build_session_args, Tier, TranscodeParams};
use crate::error::StreamError;
use crate::hls::session::{
    open_session_log, signal_process, HlsSession, SessionView, SIG_PAUSE, SIG_RESUME,
};
use crate::media::codecs::CodecFamily;

/// Timings and paths of the session manager. Tests compress the durations.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub output_base: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub reap_interval: Duration,
    /// Hard cap on session lifetime.
    pub max_session_age: Duration,
    /// Idle timeout while the transcoder is still producing.
    pub active_idle_timeout: Duration,
    /// Idle timeout once the transcoder finished, letting clients drain.
    pub done_idle_timeout: Duration,
    /// A paused session must still heartbeat at least this often.
    pub paused_heartbeat_timeout: Duration,
    /// Longest a session may stay paused regardless of heartbeats.
    pub max_paused_duration: Duration,
    /// Exits faster than this count as startup failures and trigger fallback.
    pub fallback_window: Duration,
    pub fallback_cache_ttl: Duration,
    /// How long get_or_create waits for the first playlist write.
    pub playlist_wait: Duration,
    pub playlist_poll: Duration,
}

impl SessionConfig {
    pub fn new(output_base: PathBuf, ffmpeg_path: PathBuf) -> Self {
        Self {
            output_base,
            ffmpeg_path,
            reap_interval: Duration::from_secs(15),
            max_session_age: Duration::from_secs(30 * 60),
            active_idle_timeout: Duration::from_secs(45),
            done_idle_timeout: Duration::from_secs(5 * 60),
            paused_heartbeat_timeout: Duration::from_secs(2 * 60),
            max_paused_duration: Duration::from_secs(5 * 60),
            fallback_window: Duration::from_secs(5),
            fallback_cache_ttl: Duration::from_secs(30 * 60),
            playlist_wait: Duration::from_secs(10),
            playlist_poll: Duration::from_millis(100),
        }
    }
}

/// Which tier a session id last had to fall back to, so recreations after a
/// reap skip the tiers that already failed.
#[derive(Debug, Clone)]
struct FallbackEntry {
    tier: Tier,
    encoder: String,
    updated: Instant,
}

impl FallbackEntry {
    fn label(&self) -> String {
        format!("{}:{}", self.tier.as_str(), self.encoder)
    }
}

/// Handle returned to the web layer.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub output_dir: PathBuf,
}

impl SessionHandle {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join("playlist.m3u8")
    }
}

/// Owns the session table and the per-session transcoder processes.
///
/// A single mutex guards the table. Runner tasks block on the child process
/// without holding it; they re-acquire it briefly to update flags.
pub struct SessionManager {
    config: SessionConfig,
    hw_decode: bool,
    sessions: Arc<Mutex<HashMap<String, HlsSession>>>,
    fallback: Arc<Mutex<HashMap<String, FallbackEntry>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, hw_decode: bool) -> Arc<Self> {
        Arc::new(Self {
            config,
            hw_decode,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Return the existing session for `id` or spawn a new one. The first
    /// spawn failure is surfaced to the caller; the fallback chain only
    /// covers processes that started and then died.
    pub async fn get_or_create_session(
        &self,
        id: &str,
        input: &Path,
        start_secs: f64,
        quality: &str,
        params: TranscodeParams,
    ) -> Result<SessionHandle, StreamError> {
        if let Some(handle) = self.existing_handle(id) {
            return Ok(handle);
        }

        let output_dir = self.config.output_base.join(id);

        let tier = match self.cached_tier(id) {
            Some(cached) => {
                info!(session_id = %id, tier = cached.as_str(), "resuming at cached fallback tier");
                cached
            }
            None => params.initial_tier(self.hw_decode),
        };

        tokio::fs::create_dir_all(&output_dir).await?;

        let child = match spawn_transcoder(
            &self.config.ffmpeg_path,
            &params,
            tier,
            input,
            start_secs,
            &output_dir,
        ) {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&output_dir).await;
                return Err(StreamError::EncoderStartup(e.to_string()));
            }
        };
        let pid = child.id();

        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(id) {
                if !existing.stopped {
                    // Lost a creation race; the winner's session stands.
                    drop(sessions);
                    kill_child(child);
                    return Ok(SessionHandle {
                        id: id.to_string(),
                        output_dir,
                    });
                }
            }
            sessions.insert(
                id.to_string(),
                HlsSession {
                    id: id.to_string(),
                    input: input.to_path_buf(),
                    quality: quality.to_string(),
                    codec: params.video_codec,
                    audio_index: params.audio_index,
                    output_dir: output_dir.clone(),
                    created_at: Instant::now(),
                    last_heartbeat: Instant::now(),
                    paused: false,
                    paused_at: None,
                    stopped: false,
                    ffmpeg_done: false,
                    exited: false,
                    tier,
                    pid,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            session_id = %id,
            input = %input.display(),
            quality,
            tier = tier.as_str(),
            "transcode session started"
        );

        self.spawn_runner(
            id.to_string(),
            input.to_path_buf(),
            start_secs,
            params,
            tier,
            output_dir.clone(),
            cancel,
            child,
        );

        self.wait_for_playlist(&output_dir).await;

        Ok(SessionHandle {
            id: id.to_string(),
            output_dir,
        })
    }

    fn existing_handle(&self, id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock();
        sessions.get(id).filter(|s| !s.stopped).map(|s| SessionHandle {
            id: s.id.clone(),
            output_dir: s.output_dir.clone(),
        })
    }

    /// Refresh a session's heartbeat. Returns false for unknown sessions.
    pub fn heartbeat(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(s) if !s.stopped => {
                s.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Freeze the transcoder in place. It keeps its GPU context but stops
    /// consuming cycles until resumed.
    pub fn pause(&self, id: &str) -> Result<(), StreamError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .filter(|s| !s.stopped)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;

        if !session.paused {
            session.paused = true;
            session.paused_at = Some(Instant::now());
            if let Some(pid) = session.pid {
                signal_process(pid, SIG_PAUSE);
            }
            debug!(session_id = %id, "session paused");
        }
        Ok(())
    }

    /// Thaw a paused transcoder and refresh the heartbeat.
    pub fn resume(&self, id: &str) -> Result<(), StreamError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .filter(|s| !s.stopped)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;

        if session.paused {
            session.paused = false;
            session.paused_at = None;
            session.last_heartbeat = Instant::now();
            if let Some(pid) = session.pid {
                signal_process(pid, SIG_RESUME);
            }
            debug!(session_id = %id, "session resumed");
        }
        Ok(())
    }

    /// Stop a session explicitly (seek, quality change, navigation away):
    /// unfreeze it if paused so the kill can be delivered, cancel the
    /// runner, drop the table entry and the fallback cache.
    pub async fn stop_session(&self, id: &str) -> Result<(), StreamError> {
        self.stop_session_inner(id, true).await
    }

    /// Reaper stops keep the fallback cache: a viewer who comes back after
    /// a heartbeat timeout must land on the tier that last worked.
    async fn stop_session_inner(&self, id: &str, purge_fallback: bool) -> Result<(), StreamError> {
        let (was_paused, pid, cancel, output_dir, exited) = {
            let mut sessions = self.sessions.lock();
            let mut session = sessions
                .remove(id)
                .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;
            session.stopped = true;
            session.paused = false;
            (
                session.paused_at.is_some(),
                session.pid,
                session.cancel.clone(),
                session.output_dir.clone(),
                session.exited,
            )
        };

        if was_paused {
            if let Some(pid) = pid {
                // A stopped process cannot receive SIGKILL's wait loop
                // cleanly; continue it first.
                signal_process(pid, SIG_RESUME);
            }
        }

        cancel.cancel();
        if purge_fallback {
            self.fallback.lock().remove(id);
        }

        if exited {
            // The runner already returned; nobody else will sweep the dir.
            let _ = tokio::fs::remove_dir_all(&output_dir).await;
        }

        info!(session_id = %id, "session stopped");
        Ok(())
    }

    /// Stop every session for the same (path, quality, codec) except the
    /// excluded id. Seeks create a new session id and reap the old one here.
    pub async fn stop_sessions_for_path(
        &self,
        input: &Path,
        quality: &str,
        codec: CodecFamily,
        exclude_id: &str,
    ) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .filter(|s| {
                    s.id != exclude_id
                        && s.input == input
                        && s.quality == quality
                        && s.codec == codec
                })
                .map(|s| s.id.clone())
                .collect()
        };

        for id in ids {
            debug!(session_id = %id, "stopping superseded session");
            let _ = self.stop_session(&id).await;
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        let sessions = self.sessions.lock();
        let mut views: Vec<SessionView> = sessions.values().map(SessionView::from_session).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Resolve a file inside a session's output directory.
    pub fn session_file(&self, id: &str, name: &str) -> Result<PathBuf, StreamError> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(id)
            .filter(|s| !s.stopped)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;
        session
            .file_path(name)
            .ok_or_else(|| StreamError::InvalidParam(format!("bad segment name: {}", name)))
    }

    /// The cached fallback label for a session id ("hybrid:hevc_vaapi"),
    /// if a fresh entry exists.
    pub fn fallback_state(&self, id: &str) -> Option<String> {
        let fallback = self.fallback.lock();
        fallback
            .get(id)
            .filter(|e| e.updated.elapsed() < self.config.fallback_cache_ttl)
            .map(|e| e.label())
    }

    fn cached_tier(&self, id: &str) -> Option<Tier> {
        let mut fallback = self.fallback.lock();
        match fallback.get(id) {
            Some(entry) if entry.updated.elapsed() < self.config.fallback_cache_ttl => {
                Some(entry.tier)
            }
            Some(_) => {
                fallback.remove(id);
                None
            }
            None => None,
        }
    }

    /// Periodic sweep: enforce the lifetime cap, idle timeouts, and paused
    /// limits; expire stale fallback entries.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_once().await;
            }
        })
    }

    pub async fn reap_once(&self) {
        let cfg = &self.config;
        let expired: Vec<(String, &'static str)> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .filter_map(|s| {
                    let heartbeat_age = s.last_heartbeat.elapsed();
                    if s.created_at.elapsed() > cfg.max_session_age {
                        return Some((s.id.clone(), "max-age"));
                    }
                    if s.paused {
                        let paused_for = s.paused_at.map(|p| p.elapsed()).unwrap_or_default();
                        if heartbeat_age > cfg.paused_heartbeat_timeout {
                            return Some((s.id.clone(), "paused-no-heartbeat"));
                        }
                        if paused_for > cfg.max_paused_duration {
                            return Some((s.id.clone(), "paused-too-long"));
                        }
                        return None;
                    }
                    let limit = if s.ffmpeg_done {
                        cfg.done_idle_timeout
                    } else {
                        cfg.active_idle_timeout
                    };
                    if heartbeat_age > limit {
                        return Some((s.id.clone(), "idle"));
                    }
                    None
                })
                .collect()
        };

        for (id, reason) in expired {
            info!(session_id = %id, reason, "reaping session");
            let _ = self.stop_session_inner(&id, false).await;
        }

        let ttl = cfg.fallback_cache_ttl;
        self.fallback.lock().retain(|_, e| e.updated.elapsed() < ttl);
    }

    /// Stop everything; used on shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.stop_session(&id).await;
        }
    }

    async fn wait_for_playlist(&self, output_dir: &Path) {
        let playlist = output_dir.join("playlist.m3u8");
        let deadline = Instant::now() + self.config.playlist_wait;
        while Instant::now() < deadline {
            if playlist.exists() {
                return;
            }
            tokio::time::sleep(self.config.playlist_poll).await;
        }
        warn!(path = %playlist.display(), "playlist did not appear before the wait deadline");
    }

    fn record_fallback(
        fallback: &Mutex<HashMap<String, FallbackEntry>>,
        id: &str,
        tier: Tier,
        encoder: String,
    ) {
        fallback.lock().insert(
            id.to_string(),
            FallbackEntry {
                tier,
                encoder,
                updated: Instant::now(),
            },
        );
    }

    /// The runner owns the child process for the session's whole life,
    /// restarting it down the tier chain on early non-zero exits. It never
    /// holds the table lock across an await.
    #[allow(clippy::too_many_arguments)]
    fn spawn_runner(
        &self,
        id: String,
        input: PathBuf,
        start_secs: f64,
        params: TranscodeParams,
        tier: Tier,
        output_dir: PathBuf,
        cancel: CancellationToken,
        child: Child,
    ) {
        let sessions = Arc::clone(&self.sessions);
        let fallback = Arc::clone(&self.fallback);
        let ffmpeg_path = self.config.ffmpeg_path.clone();
        let fallback_window = self.config.fallback_window;

        tokio::spawn(async move {
            let mut child = child;
            let mut tier = tier;
            let mut started = Instant::now();

            enum Decision {
                Exit,
                Cleanup,
                Fallback(Tier),
            }

            loop {
                let waited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = cancel.cancelled() => None,
                };

                let Some(status) = waited else {
                    // Stopped: thaw the process in case it is frozen so the
                    // kill is delivered, reap it, sweep the directory.
                    if let Some(pid) = child.id() {
                        signal_process(pid, SIG_RESUME);
                    }
                    kill_and_reap(child).await;
                    let _ = tokio::fs::remove_dir_all(&output_dir).await;
                    debug!(session_id = %id, "runner cancelled and cleaned up");
                    return;
                };

                let elapsed = started.elapsed();
                let success = matches!(&status, Ok(s) if s.success());

                let decision = {
                    let mut map = sessions.lock();
                    match map.get_mut(&id) {
                        // Stopped concurrently; entry is gone, the
                        // directory is ours to sweep.
                        None => Decision::Cleanup,
                        Some(s) if s.stopped => Decision::Cleanup,
                        Some(s) if success => {
                            s.ffmpeg_done = true;
                            s.exited = true;
                            s.pid = None;
                            Decision::Exit
                        }
                        Some(s) => {
                            if elapsed < fallback_window {
                                match tier.next() {
                                    Some(next) => Decision::Fallback(next),
                                    None => {
                                        s.exited = true;
                                        s.pid = None;
                                        Decision::Exit
                                    }
                                }
                            } else {
                                s.exited = true;
                                s.pid = None;
                                Decision::Exit
                            }
                        }
                    }
                };

                let next = match decision {
                    Decision::Exit => {
                        if success {
                            info!(session_id = %id, "transcode finished");
                        } else {
                            warn!(
                                session_id = %id,
                                tier = tier.as_str(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "transcoder exited abnormally, session left for the reaper"
                            );
                        }
                        return;
                    }
                    Decision::Cleanup => {
                        let _ = tokio::fs::remove_dir_all(&output_dir).await;
                        return;
                    }
                    Decision::Fallback(next) => next,
                };

                warn!(
                    session_id = %id,
                    from = tier.as_str(),
                    to = next.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "startup failure, falling back"
                );

                let _ = tokio::fs::remove_dir_all(&output_dir).await;
                if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
                    error!(session_id = %id, error = %e, "cannot recreate output dir");
                    mark_exited(&sessions, &id);
                    return;
                }

                Self::record_fallback(&fallback, &id, next, params.encoder_at(next));

                match spawn_transcoder(&ffmpeg_path, &params, next, &input, start_secs, &output_dir)
                {
                    Ok(new_child) => {
                        let pid = new_child.id();
                        let mut stop_now = false;
                        {
                            let mut map = sessions.lock();
                            match map.get_mut(&id) {
                                Some(s) if !s.stopped => {
                                    s.tier = next;
                                    s.pid = pid;
                                    s.last_heartbeat = Instant::now();
                                }
                                _ => stop_now = true,
                            }
                        }
                        if stop_now {
                            kill_and_reap(new_child).await;
                            let _ = tokio::fs::remove_dir_all(&output_dir).await;
                            return;
                        }
                        child = new_child;
                        tier = next;
                        started = Instant::now();
                    }
                    Err(e) => {
                        error!(
                            session_id = %id,
                            tier = next.as_str(),
                            error = %e,
                            "fallback spawn failed"
                        );
                        mark_exited(&sessions, &id);
                        return;
                    }
                }
            }
        });
    }
}

fn mark_exited(sessions: &Mutex<HashMap<String, HlsSession>>, id: &str) {
    let mut map = sessions.lock();
    if let Some(s) = map.get_mut(id) {
        s.exited = true;
        s.pid = None;
    }
}

fn kill_child(mut child: Child) {
    let _ = child.start_kill();
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

async fn kill_and_reap(mut child: Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Spawn the transcoder with stderr tee'd to the session's ffmpeg.log.
fn spawn_transcoder(
    ffmpeg_path: &Path,
    params: &TranscodeParams,
    tier: Tier,
    input: &Path,
    start_secs: f64,
    output_dir: &Path,
) -> std::io::Result<Child> {
    let args = build_session_args(params, tier, input, start_secs, output_dir);
    let log_file = open_session_log(output_dir)?;

    debug!(tier = tier.as_str(), ?args, "spawning transcoder");

    Command::new(ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log_file))
        .kill_on_drop(true)
        .spawn()
}
