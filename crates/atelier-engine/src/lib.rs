pub mod compositor;
pub mod error;
pub mod mask;
pub mod orchestrator;
pub mod request;
pub mod stream;
pub mod transport;

pub use compositor::{compose, fetch_and_compose, Composite};
pub use error::{EngineError, EngineResult};
pub use mask::{build_mask, Mask, MaskError};
pub use orchestrator::{DerivationOrchestrator, PendingState, UploadOutcome};
pub use stream::{CompletionResult, StreamDecoder};
pub use transport::{HttpTransport, ServiceTransport, UploadedImage};
