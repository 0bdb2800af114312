mod completions;

pub use completions::{Message, ResponseShape, Role, render_prompt};
pub(crate) use completions::{
    CompletionRequest, CompletionResponse, DeltaChoice, FrameChoice, StreamChunk, TextChoice,
};
