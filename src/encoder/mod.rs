pub mod capabilities;
pub mod command;
pub mod presets;

pub use capabilities::{negotiate_codec, CodecChoice, EncoderInfo, HwAccelKind, HwCapabilities};
pub use command::{build_session_args, SegmentFormat, Tier, TranscodeParams};
pub use presets::{generate_presets, QualityOption};
