pub mod args;
pub mod backend;
pub mod capture;
pub mod collect;
pub mod hardware;
pub mod native;
pub mod session;
pub mod transcoder;
pub mod vfs;

pub use backend::{
    BackendKind, Capabilities, EncodeConfig, EncodeProgress, EncodeProgressFn, EncodedOutput,
    EncoderBackend,
};
pub use capture::{CaptureBackend, CaptureSource, CaptureTap, capture_stream};
pub use collect::{CollectorProbe, CollectorState, FrameCollector};
pub use hardware::HardwareBackend;
pub use native::NativeBackend;
pub use transcoder::TranscoderBackend;
pub use vfs::Vfs;
