//! Audio capture pipeline: RTP tap → transcoder → speech recognition.

pub mod machine;
pub mod ports;
pub mod recognizer;
pub mod sdp;
pub mod transcoder;

pub use machine::{
    CaptureEvent, CaptureMachine, CapturePhase, CaptureServices, CaptureStatus,
    RecordingRegistry,
};
pub use ports::{PortAllocator, PortLease};
pub use recognizer::{
    HttpStreamingRecognizer, RecognitionConfig, RecognitionStream, SpeechRecognizer,
    TranscriptSegment,
};
pub use transcoder::{
    FfmpegTranscoder, ProcessControl, TranscodeRequest, Transcoder, TranscoderProcess,
};
