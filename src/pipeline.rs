//! Two-stage retrieval-grounded chat.
//!
//! The first backend call picks the relevant reference documents, the second
//! answers the question with that selection appended as an assistant turn.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ai_sdk::{Message, Role};
use crate::backend::{CompletionBackend, DeltaSink};
use crate::error::BackendError;
use crate::stream::StreamEnd;

pub const RELEVANCE_TEMPERATURE: f32 = 0.0;
pub const ANSWER_TEMPERATURE: f32 = 0.3;

// The backend echoes role labels into its answers.
const ECHOED_ROLE: &str = "assistant";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Your task is to answer the user's questions using only the information from the provided documents. Give two answers to each question: one with a list of relevant document identifiers and the second with the answer to the question itself, using documents with these identifiers.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDocument {
    #[serde(rename = "doc_id")]
    pub id: i64,
    pub title: String,
    #[serde(rename = "content")]
    pub body: String,
}

impl ReferenceDocument {
    pub fn new(id: i64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
        }
    }
}

pub fn default_documents() -> Vec<ReferenceDocument> {
    vec![
        ReferenceDocument::new(
            0,
            "Глобальное потепление: ледники",
            "За последние 50 лет объем ледников в мире уменьшился на 30%",
        ),
        ReferenceDocument::new(
            1,
            "Глобальное потепление: Уровень моря",
            "Уровень мирового океана повысился на 20 см с 1880 года и продолжает расти на 3,3 мм в год",
        ),
    ]
}

/// System instruction plus the fixed reference set, with the documents
/// message rendered once up front.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    system_prompt: String,
    documents: Vec<ReferenceDocument>,
    documents_json: String,
}

impl KnowledgeBase {
    pub fn new(
        system_prompt: impl Into<String>,
        documents: Vec<ReferenceDocument>,
    ) -> serde_json::Result<Self> {
        let documents_json = serde_json::to_string(&documents)?;
        Ok(Self {
            system_prompt: system_prompt.into(),
            documents,
            documents_json,
        })
    }

    pub fn documents(&self) -> &[ReferenceDocument] {
        &self.documents
    }
}

/// Append-only prompt history: one system message, one documents message,
/// then user/assistant turns.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn seed(knowledge: &KnowledgeBase, user_text: &str) -> Self {
        Self {
            messages: vec![
                Message::new(Role::System, knowledge.system_prompt.clone()),
                Message::new(Role::Documents, knowledge.documents_json.clone()),
                Message::new(Role::User, user_text),
            ],
        }
    }

    pub fn push_assistant(&mut self, content: String) {
        self.messages.push(Message::new(Role::Assistant, content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResult {
    pub response_text: String,
}

#[derive(Clone)]
pub struct ChatUseCase {
    backend: Arc<dyn CompletionBackend>,
    knowledge: Arc<KnowledgeBase>,
}

impl ChatUseCase {
    pub fn new(backend: Arc<dyn CompletionBackend>, knowledge: Arc<KnowledgeBase>) -> Self {
        Self { backend, knowledge }
    }

    /// Runs both stages and returns the answer with echoed role labels removed.
    pub async fn execute_sync(&self, message: &str) -> Result<ChatResult, BackendError> {
        let conversation = self.ground(message).await?;

        let answer = self
            .backend
            .complete(conversation.messages(), ANSWER_TEMPERATURE)
            .await?;

        Ok(ChatResult {
            response_text: answer.replace(ECHOED_ROLE, ""),
        })
    }

    /// Runs the relevance pass, then streams the answer into `sink` as is.
    pub async fn execute_stream(
        &self,
        message: &str,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, BackendError> {
        let conversation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            conversation = self.ground(message) => conversation?,
        };

        self.backend
            .complete_stream(conversation.messages(), ANSWER_TEMPERATURE, sink, cancel)
            .await
    }

    async fn ground(&self, message: &str) -> Result<Conversation, BackendError> {
        let mut conversation = Conversation::seed(&self.knowledge, message);

        let relevance = self
            .backend
            .complete(conversation.messages(), RELEVANCE_TEMPERATURE)
            .await?;
        tracing::debug!(%relevance, "relevance pass complete");

        conversation.push_assistant(relevance);
        Ok(conversation)
    }
}
