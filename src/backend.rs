use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::ai_sdk::{
    CompletionRequest, CompletionResponse, Message, ResponseShape, render_prompt,
};
use crate::error::{BackendError, Stop};
use crate::stream::{EventDecoder, StreamEnd};

/// Receives streamed deltas in arrival order. Returning [`Stop`] ends the stream.
#[async_trait]
pub trait DeltaSink: Send {
    async fn push(&mut self, delta: &str) -> Result<(), Stop>;
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// One buffered completion; returns the text of the first choice.
    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
    ) -> Result<String, BackendError>;

    /// One streamed completion, relayed delta by delta into `sink`.
    async fn complete_stream(
        &self,
        messages: &[Message],
        temperature: f32,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, BackendError>;
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub shape: ResponseShape,
}

pub struct BackendClient {
    http: Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/completions", self.config.base_url)
    }

    fn build_request(
        &self,
        messages: &[Message],
        temperature: f32,
        stream: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.config.model.clone(),
            prompt: render_prompt(messages),
            max_tokens: self.config.max_tokens,
            temperature: temperature.clamp(0.0, 1.0),
            stream,
        }
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, BackendError> {
        let mut builder = self.http.post(self.completions_url()).json(request);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionBackend for BackendClient {
    async fn complete(
        &self,
        messages: &[Message],
        temperature: f32,
    ) -> Result<String, BackendError> {
        let request = self.build_request(messages, temperature, false);
        tracing::debug!(temperature = request.temperature, "sending completion request");

        let response = self.send(&request).await?;
        let body = response.bytes().await?;
        let decoded: CompletionResponse =
            serde_json::from_slice(&body).map_err(|err| BackendError::Decode(err.to_string()))?;

        decoded
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or(BackendError::EmptyResult)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        temperature: f32,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, BackendError> {
        let request = self.build_request(messages, temperature, true);
        tracing::debug!(temperature = request.temperature, "opening completion stream");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            response = self.send(&request) => response?,
        };

        let decoder = EventDecoder::new(response.bytes_stream(), self.config.shape);
        let end = decoder.relay(sink, cancel).await?;
        tracing::debug!(?end, "completion stream closed");
        Ok(end)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_sdk::Role;
    use axum::Json;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        bodies: Arc<Mutex<Vec<Value>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
    }

    async fn spawn_backend(reply: fn(&Value) -> Response) -> (String, Seen) {
        let seen = Seen::default();
        let recorded = seen.clone();
        let app = axum::Router::new().route(
            "/v1/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let recorded = recorded.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    recorded.auth.lock().unwrap().push(auth);
                    let response = reply(&body);
                    recorded.bodies.lock().unwrap().push(body);
                    response
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), seen)
    }

    fn client(base_url: String, shape: ResponseShape) -> BackendClient {
        BackendClient::new(BackendConfig {
            base_url,
            token: Some("secret".to_string()),
            model: "test-model".to_string(),
            max_tokens: 2048,
            shape,
        })
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message::new(Role::System, "answer from documents"),
            Message::new(Role::Documents, "[]"),
            Message::new(Role::User, "What changed in sea level?"),
        ]
    }

    #[derive(Default)]
    struct Collect(Vec<String>);

    #[async_trait]
    impl DeltaSink for Collect {
        async fn push(&mut self, delta: &str) -> Result<(), Stop> {
            self.0.push(delta.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn complete_sends_flattened_prompt_and_returns_first_choice() {
        let (url, seen) = spawn_backend(|_| {
            Json(json!({"choices": [{"text": "[1]"}, {"text": "ignored"}]})).into_response()
        })
        .await;

        let text = client(url, ResponseShape::ChatDelta)
            .complete(&conversation(), 0.0)
            .await
            .unwrap();

        assert_eq!(text, "[1]");
        let bodies = seen.bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            json!({
                "model": "test-model",
                "prompt": "system: answer from documents\ndocuments: []\nuser: What changed in sea level?\n",
                "max_tokens": 2048,
                "temperature": 0.0,
                "stream": false,
            })
        );
        assert_eq!(
            seen.auth.lock().unwrap()[0].as_deref(),
            Some("Bearer secret")
        );
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_body() {
        let (url, _) = spawn_backend(|_| {
            (StatusCode::SERVICE_UNAVAILABLE, "model loading").into_response()
        })
        .await;

        let err = client(url, ResponseShape::ChatDelta)
            .complete(&conversation(), 0.0)
            .await
            .unwrap_err();

        match err {
            BackendError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model loading");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_choices_is_an_empty_result() {
        let (url, _) = spawn_backend(|_| Json(json!({"choices": []})).into_response()).await;

        let err = client(url, ResponseShape::ChatDelta)
            .complete(&conversation(), 0.0)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::EmptyResult));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let (url, _) = spawn_backend(|_| "<html>oops</html>".into_response()).await;

        let err = client(url, ResponseShape::ChatDelta)
            .complete(&conversation(), 0.0)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{addr}"), ResponseShape::ChatDelta)
            .complete(&conversation(), 0.0)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn complete_stream_relays_deltas_until_stop() {
        let (url, seen) = spawn_backend(|_| {
            let frames = concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Sea\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\" level\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\" rose\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"},\"finish_reason\":null}]}\n\n",
            );
            Response::new(Body::from(frames))
        })
        .await;
        let mut sink = Collect::default();

        let end = client(url, ResponseShape::ChatDelta)
            .complete_stream(&conversation(), 0.3, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Finished);
        assert_eq!(sink.0, vec!["Sea", " level", " rose"]);
        let bodies = seen.bodies.lock().unwrap();
        assert_eq!(bodies[0]["stream"], json!(true));
        assert_eq!(bodies[0]["temperature"], json!(0.3));
    }

    #[tokio::test]
    async fn complete_stream_uses_configured_shape() {
        let (url, _) = spawn_backend(|_| {
            let frames = concat!(
                "{\"choices\":[{\"text\":\"Sea\",\"finish_reason\":null}]}\n",
                "{\"choices\":[{\"text\":\" level\",\"finish_reason\":\"stop\"}]}\n",
            );
            Response::new(Body::from(frames))
        })
        .await;
        let mut sink = Collect::default();

        let end = client(url, ResponseShape::CompletionText)
            .complete_stream(&conversation(), 0.3, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Finished);
        assert_eq!(sink.0, vec!["Sea", " level"]);
    }

    #[tokio::test]
    async fn complete_stream_fails_on_error_status() {
        let (url, _) =
            spawn_backend(|_| (StatusCode::UNAUTHORIZED, "bad token").into_response()).await;
        let mut sink = Collect::default();

        let err = client(url, ResponseShape::ChatDelta)
            .complete_stream(&conversation(), 0.3, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Status { status: 401, .. }));
        assert!(sink.0.is_empty());
    }

    #[tokio::test]
    async fn temperature_is_clamped() {
        let (url, seen) =
            spawn_backend(|_| Json(json!({"choices": [{"text": "ok"}]})).into_response()).await;

        client(url, ResponseShape::ChatDelta)
            .complete(&conversation(), 1.7)
            .await
            .unwrap();

        assert_eq!(seen.bodies.lock().unwrap()[0]["temperature"], json!(1.0));
    }
}
