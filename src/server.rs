use crate::backend::DeltaSink;
use crate::error::{BackendError, Stop};
use crate::pipeline::ChatUseCase;
use crate::protocol::{ChatEvent, ChatRequest, ChatResponse, ErrorResponse};
use crate::stream::StreamEnd;
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures::StreamExt;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const STREAM_BUFFER: usize = 64;

pub struct ServerConfig {
    pub listen: String,
    pub auth_token: Option<String>,
}

struct ServerState {
    chat: ChatUseCase,
    auth_token: Option<String>,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn run(config: ServerConfig, chat: ChatUseCase) -> ServerResult<()> {
    let state = Arc::new(ServerState {
        chat,
        auth_token: config.auth_token,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "ragbridge server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/stream", post(chat_stream))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    authorize(&headers, state.auth_token.as_deref())
        .map_err(|status| api_error(status, "unauthorized".to_string()))?;

    let request_id = Uuid::new_v4();
    async move {
        tracing::info!("chat request received");
        match state.chat.execute_sync(&payload.message).await {
            Ok(result) => {
                tracing::info!("chat completed");
                Ok(Json(ChatResponse {
                    message: result.response_text,
                }))
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat failed");
                Err(backend_failure(&err))
            }
        }
    }
    .instrument(tracing::info_span!("chat", %request_id, mode = "unary"))
    .await
}

async fn chat_stream(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&headers, state.auth_token.as_deref())?;

    let (events, receiver) = mpsc::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    // Dropped together with the response stream when the caller goes away.
    let guard = cancel.clone().drop_guard();

    let request_id = Uuid::new_v4();
    tokio::spawn(
        relay_chat(state.chat.clone(), payload.message, events, cancel)
            .instrument(tracing::info_span!("chat", %request_id, mode = "stream")),
    );

    let stream = ReceiverStream::new(receiver).map(move |event| {
        let _guard = &guard;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn relay_chat(
    chat: ChatUseCase,
    message: String,
    events: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
) {
    tracing::info!("chat stream opened");
    let mut sink = EventSink {
        events: events.clone(),
    };

    match chat.execute_stream(&message, &mut sink, &cancel).await {
        Ok(StreamEnd::Finished | StreamEnd::EndOfStream) => {
            tracing::info!("chat stream completed");
            let _ = events.send(ChatEvent::Done).await;
        }
        Ok(end) => {
            tracing::info!(?end, "chat stream abandoned by caller");
        }
        Err(err) => {
            tracing::warn!(error = %err, "chat stream failed");
            let _ = events
                .send(ChatEvent::Error {
                    message: err.to_string(),
                })
                .await;
        }
    }
}

struct EventSink {
    events: mpsc::Sender<ChatEvent>,
}

#[async_trait]
impl DeltaSink for EventSink {
    async fn push(&mut self, delta: &str) -> Result<(), Stop> {
        self.events
            .send(ChatEvent::Chunk {
                text: delta.to_string(),
            })
            .await
            .map_err(|_| Stop)
    }
}

fn backend_failure(err: &BackendError) -> ApiError {
    api_error(StatusCode::BAD_GATEWAY, err.to_string())
}

fn api_error(status: StatusCode, error: String) -> ApiError {
    (status, Json(ErrorResponse { error }))
}

fn authorize(headers: &HeaderMap, token: Option<&str>) -> Result<(), StatusCode> {
    let Some(token) = token else {
        return Ok(());
    };

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header {
        Some(value) if value == format!("Bearer {}", token) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
