//! Inference Gateway Common Types
//!
//! Wire types shared by the gateway and its clients.

pub mod error;
pub mod inference;
pub mod stream;

pub use error::{ErrorBody, ErrorDetail};
pub use inference::{ChatMessage, Completion, GenerationParameters, InferenceRequest, Role, Usage};
pub use stream::StreamFragment;
