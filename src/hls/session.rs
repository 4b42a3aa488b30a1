use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::encoder::command::Tier;
use crate::media::codecs::CodecFamily;

/// One tracked transcoding session. The table entry does not own the child
/// process; the runner task does, and the entry keeps the pid for signals.
#[derive(Debug)]
pub struct HlsSession {
    pub id: String,
    pub input: PathBuf,
    pub quality: String,
    pub codec: CodecFamily,
    pub audio_index: usize,
    pub output_dir: PathBuf,
    pub created_at: Instant,
    pub last_heartbeat: Instant,
    pub paused: bool,
    pub paused_at: Option<Instant>,
    pub stopped: bool,
    /// The transcoder finished writing all segments (exit 0). Idle viewers
    /// get extended grace to drain their buffers.
    pub ffmpeg_done: bool,
    /// The runner task has reaped the child and returned; cleanup on stop is
    /// the caller's job from here on.
    pub exited: bool,
    pub tier: Tier,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
}

impl HlsSession {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join("playlist.m3u8")
    }

    /// Resolve a client-requested file inside the session directory.
    /// Rejects anything that is not a bare segment/init/playlist name.
    pub fn file_path(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return None;
        }
        Some(self.output_dir.join(name))
    }
}

/// Client-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub input: String,
    pub quality: String,
    pub codec: String,
    pub tier: String,
    pub paused: bool,
    pub ffmpeg_done: bool,
    pub age_secs: u64,
    pub idle_secs: u64,
}

impl SessionView {
    pub fn from_session(session: &HlsSession) -> Self {
        Self {
            id: session.id.clone(),
            input: session.input.to_string_lossy().into_owned(),
            quality: session.quality.clone(),
            codec: session.codec.as_str().to_string(),
            tier: session.tier.as_str().to_string(),
            paused: session.paused,
            ffmpeg_done: session.ffmpeg_done,
            age_secs: session.created_at.elapsed().as_secs(),
            idle_secs: session.last_heartbeat.elapsed().as_secs(),
        }
    }
}

/// Send a signal to a process. Freezing and thawing transcoders uses
/// SIGSTOP/SIGCONT directly; a frozen process holds its GPU context but
/// consumes no cycles.
#[cfg(unix)]
pub fn signal_process(pid: u32, signal: libc::c_int) {
    // kill(2) on an already-gone pid just returns ESRCH.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
pub fn signal_process(_pid: u32, _signal: i32) {}

#[cfg(unix)]
pub const SIG_PAUSE: libc::c_int = libc::SIGSTOP;
#[cfg(unix)]
pub const SIG_RESUME: libc::c_int = libc::SIGCONT;
#[cfg(not(unix))]
pub const SIG_PAUSE: i32 = 0;
#[cfg(not(unix))]
pub const SIG_RESUME: i32 = 0;

/// Write the transcoder's stderr tail next to its output for diagnostics.
pub fn open_session_log(output_dir: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(output_dir.join("ffmpeg.log"))
}
