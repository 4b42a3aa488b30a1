//! homestream — self-hosted media streaming server.
//!
//! Browses a filesystem media tree as-is and streams video to browsers over
//! HLS with on-demand transcoding: codec negotiation, an adaptive quality
//! ladder, per-viewer sessions with a three-tier hardware fallback, and a
//! persistent job queue for subtitle transcription and translation.

pub mod config;
pub mod encoder;
pub mod error;
pub mod hls;
pub mod jobs;
pub mod media;
pub mod subtitles;
pub mod web;

pub use config::Config;
pub use error::{ConfigError, HandlerError, JobError, ProbeError, StreamError};
