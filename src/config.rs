use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Args;

use crate::ai_sdk::ResponseShape;
use crate::backend::BackendConfig;
use crate::pipeline::{
    DEFAULT_SYSTEM_PROMPT, KnowledgeBase, ReferenceDocument, default_documents,
};
use crate::server::ServerConfig;

pub const DEFAULT_MODEL: &str = "Vikhrmodels/Vikhr-Nemo-12B-Instruct-R-21-09-24";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Args)]
pub struct BackendArgs {
    /// Base URL of the completion backend
    #[arg(long = "backend-url", env = "OPENAPIURL", default_value = "localhost")]
    pub url: String,

    /// Static bearer credential sent to the backend
    #[arg(long = "backend-token", env = "BACKEND_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, env = "BACKEND_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "BACKEND_MAX_TOKENS", default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    /// Frame layout of the backend's streaming responses
    #[arg(long, env = "BACKEND_STREAM_SHAPE", value_enum, default_value_t = ResponseShape::ChatDelta)]
    pub stream_shape: ResponseShape,
}

impl BackendArgs {
    pub fn into_config(self) -> BackendConfig {
        BackendConfig {
            base_url: normalize_backend_url(&self.url),
            token: self.token,
            model: self.model,
            max_tokens: self.max_tokens,
            shape: self.stream_shape,
        }
    }
}

#[derive(Debug, Args)]
pub struct KnowledgeArgs {
    /// JSON file holding an array of {doc_id, title, content}
    #[arg(long, env = "RAGBRIDGE_DOCUMENTS")]
    pub documents: Option<PathBuf>,

    #[arg(long, env = "RAGBRIDGE_SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,
}

impl KnowledgeArgs {
    pub fn load(self) -> ConfigResult<KnowledgeBase> {
        let documents = match &self.documents {
            Some(path) => read_documents(path)?,
            None => default_documents(),
        };
        let system_prompt = self
            .system_prompt
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        Ok(KnowledgeBase::new(system_prompt, documents)?)
    }
}

#[derive(Debug, Args)]
pub struct ListenArgs {
    #[arg(long, env = "RAGBRIDGE_LISTEN", default_value = "0.0.0.0:3001")]
    pub listen: String,

    /// Require this bearer token on inbound chat requests
    #[arg(long = "auth-token", env = "RAGBRIDGE_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,
}

impl ListenArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            auth_token: self.auth_token,
        }
    }
}

fn read_documents(path: &Path) -> ConfigResult<Vec<ReferenceDocument>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("Failed to read documents from {}: {}", path.display(), err))?;
    parse_documents(&raw)
        .map_err(|err| format!("Invalid documents in {}: {}", path.display(), err).into())
}

fn parse_documents(raw: &str) -> serde_json::Result<Vec<ReferenceDocument>> {
    serde_json::from_str(raw)
}

/// Trims trailing slashes and assumes `http://` when no scheme is given.
fn normalize_backend_url(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}
