use crate::protocol::{ChatEvent, ChatRequest, ChatResponse};
use futures::StreamExt;
use reqwest::{Client as HttpClient, RequestBuilder};
use std::error::Error;

pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    fn post(&self, path: &str, message: String) -> RequestBuilder {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&ChatRequest { message });

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn chat(&self, message: String) -> ClientResult<String> {
        let response = self.post("/v1/chat", message).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Chat failed: {} - {}", status, body).into());
        }

        let body: ChatResponse = response.json().await?;
        Ok(body.message)
    }

    /// Streams the answer, calling `on_chunk` for each delta until the server
    /// reports completion. An error from `on_chunk` ends the stream and is
    /// returned as is.
    pub async fn chat_stream<F>(&self, message: String, mut on_chunk: F) -> ClientResult<()>
    where
        F: FnMut(String) -> ClientResult<()>,
    {
        let response = self.post("/v1/chat/stream", message).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to open stream: {} - {}", status, body).into());
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

            while let Some(raw_event) = take_sse_event(&mut buffer) {
                let Some(data) = extract_sse_data(&raw_event) else {
                    continue;
                };
                match serde_json::from_str::<ChatEvent>(&data) {
                    Ok(ChatEvent::Chunk { text }) => on_chunk(text)?,
                    Ok(ChatEvent::Done) => return Ok(()),
                    Ok(ChatEvent::Error { message }) => return Err(message.into()),
                    Err(err) => tracing::warn!(error = %err, %data, "ignoring unreadable event"),
                }
            }
        }

        Err("Stream closed before the answer completed".into())
    }
}

/// Splits one complete `\n\n`-terminated event off the front of `buffer`.
/// Only whole events are decoded, so characters split across chunks survive.
fn take_sse_event(buffer: &mut Vec<u8>) -> Option<String> {
    let idx = buffer.windows(2).position(|pair| pair == b"\n\n")?;
    let raw: Vec<u8> = buffer.drain(..idx + 2).collect();
    Some(String::from_utf8_lossy(&raw[..idx]).into_owned())
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_sse_data_joins_data_lines() {
        let raw = "event: message\ndata: {\"type\":\ndata: \"done\"}";
        assert_eq!(
            extract_sse_data(raw).as_deref(),
            Some("{\"type\":\n\"done\"}")
        );
    }

    #[test]
    fn take_sse_event_waits_for_split_characters() {
        let frame = "data: {\"type\":\"chunk\",\"text\":\"Уровень\"}\n\n".as_bytes();
        // Byte 35 falls inside the third letter.
        let mut buffer = frame[..35].to_vec();
        assert_eq!(take_sse_event(&mut buffer), None);

        buffer.extend_from_slice(&frame[35..]);
        let raw = take_sse_event(&mut buffer).unwrap();
        assert_eq!(
            extract_sse_data(&raw).as_deref(),
            Some("{\"type\":\"chunk\",\"text\":\"Уровень\"}")
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_sse_event_leaves_partial_event_buffered() {
        let mut buffer = b"data: 1\n\ndata: 2".to_vec();
        assert_eq!(take_sse_event(&mut buffer).as_deref(), Some("data: 1"));
        assert_eq!(take_sse_event(&mut buffer), None);
        assert_eq!(buffer, b"data: 2");
    }

    #[test]
    fn extract_sse_data_ignores_comments() {
        assert_eq!(extract_sse_data(": keep-alive"), None);
    }

    #[test]
    fn base_url_loses_trailing_slashes() {
        assert_eq!(
            normalize_base_url("http://127.0.0.1:3001//"),
            "http://127.0.0.1:3001"
        );
    }
}
