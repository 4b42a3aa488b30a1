pub mod codecs;
pub mod probe;

pub use codecs::{container_token, normalize_audio_codec, normalize_video_codec, BrowserCodecs, CodecFamily};
pub use probe::{AudioTrack, Chapter, MediaInfo, ProbeCache};
