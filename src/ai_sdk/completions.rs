use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Documents,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Documents => "documents",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Renders one line of the flattened prompt: `"<role>: <content>\n"`.
    pub fn render(&self) -> String {
        format!("{}: {}\n", self.role, self.content)
    }
}

/// Flattens the conversation into the completion prompt, in order.
pub fn render_prompt(messages: &[Message]) -> String {
    messages.iter().map(Message::render).collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CompletionRequest {
    pub(crate) model: String,
    pub(crate) prompt: String,
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
    pub(crate) stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    pub(crate) choices: Vec<CompletionChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CompletionChoice {
    #[serde(default)]
    pub(crate) text: String,
}

/// Which streaming frame layout a backend deployment emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ResponseShape {
    /// `{"choices":[{"delta":{"content":"..."},"finish_reason":...}]}`
    #[default]
    ChatDelta,
    /// `{"choices":[{"text":"...","finish_reason":...}]}`
    CompletionText,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunk<C> {
    #[serde(default = "Vec::new")]
    pub(crate) choices: Vec<C>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeltaChoice {
    #[serde(default)]
    pub(crate) delta: Delta,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Delta {
    #[serde(default)]
    pub(crate) content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TextChoice {
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

/// Text and finish reason of the first choice in a frame, whatever its shape.
pub(crate) trait FrameChoice {
    fn text(&self) -> &str;
    fn finish_reason(&self) -> Option<&str>;
}

impl FrameChoice for DeltaChoice {
    fn text(&self) -> &str {
        self.delta.content.as_deref().unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

impl FrameChoice for TextChoice {
    fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}
