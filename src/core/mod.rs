pub mod codec;
pub mod realtime;
pub mod registry;
pub mod session;
pub mod transcript;

// Re-export commonly used types for convenience
pub use codec::{AudioCodecAdapter, AudioEncoding, CodecError};
pub use realtime::{
    BackendEvent, BackendSession, ErrorPolicy, OpenAIRealtime, OpenAIRealtimeConfig,
    OpenAIRealtimeFactory, RealtimeError, RealtimeFactory, RealtimeResult, SessionSetup,
    SharedBackend, TranscriptRole,
};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{AudioBuffers, BusinessProfile, CallSession, SessionError, SessionState};
pub use transcript::{TranscriptReconciler, TranscriptTurn};
