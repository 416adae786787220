//! Streaming chat generation against an OpenAI-compatible endpoint.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use concierge_shared::{ConciergeError, Result};

/// Streams answer text. Deltas are sent into `tx` as they arrive; a dropped
/// receiver cancels the stream without error.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn stream_chat(&self, system: &str, user: &str, tx: mpsc::Sender<String>)
    -> Result<()>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint with
/// `stream: true`.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: &str, base_url: &str, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ConciergeError::config("generation API key is empty"));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            ConciergeError::config("generation API key contains invalid characters")
        })?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ConciergeError::Generation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn stream_chat(
        &self,
        system: &str,
        user: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        let body = json!({
            "model": self.model,
            "stream": true,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConciergeError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".into());
            return Err(ConciergeError::Generation(format!(
                "chat request failed ({status}): {body}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ConciergeError::Generation(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are newline-delimited; keep any trailing partial line.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return Ok(());
                }

                let Ok(value) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                let Some(content) = value
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if !content.is_empty() && tx.send(content.to_string()).await.is_err() {
                    // Receiver gone: the caller stopped listening.
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for delta in deltas {
            body.push_str(&format!(
                "data: {}\n\n",
                json!({ "choices": [{ "delta": { "content": delta } }] })
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[tokio::test]
    async fn streams_deltas_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(sse_body(&["Green ", "chile ", "stew"])),
            )
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new("key", &server.uri(), "gpt-4.1-mini").unwrap();
        let (tx, mut rx) = mpsc::channel(32);

        generator.stream_chat("system", "user", tx).await.unwrap();

        let mut collected = String::new();
        while let Some(delta) = rx.recv().await {
            collected.push_str(&delta);
        }
        assert_eq!(collected, "Green chile stew");
    }

    #[tokio::test]
    async fn http_error_is_a_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new("key", &server.uri(), "gpt-4.1-mini").unwrap();
        let (tx, _rx) = mpsc::channel(32);
        let result = generator.stream_chat("system", "user", tx).await;
        assert!(matches!(result, Err(ConciergeError::Generation(_))));
    }

    #[tokio::test]
    async fn dropped_receiver_ends_the_stream_cleanly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["a", "b", "c", "d", "e", "f"])),
            )
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new("key", &server.uri(), "gpt-4.1-mini").unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        // No panic and no error: cancellation is a normal outcome.
        generator.stream_chat("system", "user", tx).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let server = MockServer::start().await;
        let body = format!(
            "data: not-json\n\n: comment line\n\n{}",
            sse_body(&["answer"])
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::new("key", &server.uri(), "gpt-4.1-mini").unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        generator.stream_chat("system", "user", tx).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("answer"));
        assert!(rx.recv().await.is_none());
    }
}
