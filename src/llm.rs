use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::screening::{Classifier, ClassifierError, Prompt};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Classifier backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatClassifier {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl ChatClassifier {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| {
            ClassifierError::Api {
                status: 0,
                message: format!("invalid API key header: {}", e),
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Classifier for ChatClassifier {
    async fn classify(&self, prompt: &Prompt) -> Result<String, ClassifierError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        tracing::debug!(model = %self.model, "Chat classification request");
        let response = self.http.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Api { status, message });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ClassifierError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".into(),
            user: "user".into(),
        }
    }

    #[tokio::test]
    async fn test_returns_first_choice_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"readingDecision\":true}"}}]}"#;
        let base = serve_once(http_response("200 OK", body)).await;
        let classifier = ChatClassifier::new("key", DEFAULT_MODEL, Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base);
        let reply = classifier.classify(&prompt()).await.unwrap();
        assert_eq!(reply, r#"{"readingDecision":true}"#);
    }

    #[tokio::test]
    async fn test_error_status_and_empty_reply() {
        let base = serve_once(http_response("401 Unauthorized", "bad key")).await;
        let classifier = ChatClassifier::new("key", DEFAULT_MODEL, Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base);
        match classifier.classify(&prompt()).await {
            Err(ClassifierError::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let base = serve_once(http_response("200 OK", r#"{"choices":[]}"#)).await;
        let classifier = ChatClassifier::new("key", DEFAULT_MODEL, Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base);
        assert!(matches!(
            classifier.classify(&prompt()).await,
            Err(ClassifierError::Empty)
        ));
    }
}
