//! HTTP image-generation adapter.
//!
//! Speaks the common `images/generations` shape: a bearer-authenticated JSON
//! POST answered with `{"data": [{"url": ...}]}`.
//!
//! ## Fault Mapping
//!
//! | Response | SynthesisFault |
//! |----------|----------------|
//! | 401, 403 | `Unauthorized` |
//! | body mentions a moderation marker | `ContentRejected` |
//! | 400, 404, 413, 422 | `InvalidRequest` |
//! | 408, 504, client timeout | `Timeout` |
//! | 429 | `RateLimited` |
//! | 500, 502, 503, connect failure | `Unavailable` |
//! | anything else | `Unknown` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use mintforge_core::SynthesisFault;

use super::{SynthesisRequest, Synthesizer};

/// Body substrings that identify a moderation rejection.
const CONTENT_POLICY_MARKERS: [&str; 3] = ["content_policy_violation", "moderation_blocked", "safety"];

/// Longest slice of a response body quoted in a fault message.
const MAX_BODY_EXCERPT: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpSynthesizerConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Requested image size, e.g. `1024x1024`.
    pub image_size: String,
    pub timeout: Duration,
}

/// Synthesizer backed by a remote HTTP image-generation API.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    config: HttpSynthesizerConfig,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(config: HttpSynthesizerConfig) -> Result<Self, SynthesisFault> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SynthesisFault::Unknown(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    #[instrument(skip(self, request), fields(model = request.model), err(Display))]
    async fn synthesize(&self, request: SynthesisRequest<'_>) -> Result<String, SynthesisFault> {
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": self.config.image_size,
            "response_format": "url",
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_status(status, &text));
        }

        let parsed: ImagesResponse = serde_json::from_str(&text)
            .map_err(|e| SynthesisFault::Unknown(format!("malformed response body: {e}")))?;

        let url = parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SynthesisFault::Unknown("response carried no image url".to_string()))?;

        debug!(result_ref = %url, "synthesis succeeded");
        Ok(url)
    }
}

fn map_transport_error(err: reqwest::Error) -> SynthesisFault {
    if err.is_timeout() {
        SynthesisFault::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        SynthesisFault::Unavailable(err.to_string())
    } else {
        SynthesisFault::Unknown(err.to_string())
    }
}

/// Map a non-success response to a fault.
pub(crate) fn map_status(status: StatusCode, body: &str) -> SynthesisFault {
    let message = format!("HTTP {}: {}", status.as_u16(), error_message(body));

    match status.as_u16() {
        401 | 403 => SynthesisFault::Unauthorized(message),
        _ if is_content_rejection(body) => SynthesisFault::ContentRejected(message),
        400 | 404 | 413 | 422 => SynthesisFault::InvalidRequest(message),
        408 | 504 => SynthesisFault::Timeout(message),
        429 => SynthesisFault::RateLimited(message),
        500 | 502 | 503 => SynthesisFault::Unavailable(message),
        _ => SynthesisFault::Unknown(message),
    }
}

fn is_content_rejection(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    CONTENT_POLICY_MARKERS.iter().any(|m| body.contains(m))
}

fn error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if let Some(message) = envelope.error.message {
            return message;
        }
    }
    body.chars().take(MAX_BODY_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mintforge_core::{FaultClass, classify};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn synthesizer(server: &MockServer, timeout: Duration) -> HttpSynthesizer {
        HttpSynthesizer::new(HttpSynthesizerConfig {
            endpoint: format!("{}/v1/images/generations", server.uri()),
            api_key: "sk-test".to_string(),
            image_size: "1024x1024".to_string(),
            timeout,
        })
        .unwrap()
    }

    fn request(prompt: &str) -> SynthesisRequest<'_> {
        SynthesisRequest {
            prompt,
            model: "dall-e-3",
        }
    }

    #[tokio::test]
    async fn returns_first_image_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "dall-e-3",
                "prompt": "a red fox",
                "size": "1024x1024",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created": 1,
                "data": [{"url": "https://cdn.example/fox.png"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = synthesizer(&server, Duration::from_secs(5))
            .synthesize(request("a red fox"))
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/fox.png");
    }

    #[tokio::test]
    async fn maps_error_statuses() {
        let cases = [
            (401, json!({"error": {"message": "bad key"}}), FaultClass::Permanent),
            (
                400,
                json!({"error": {"message": "rejected", "code": "content_policy_violation"}}),
                FaultClass::ContentPolicy,
            ),
            (400, json!({"error": {"message": "bad size"}}), FaultClass::Permanent),
            (429, json!({"error": {"message": "slow down"}}), FaultClass::Transient),
            (503, json!({"error": {"message": "overloaded"}}), FaultClass::Transient),
            (418, json!({"error": {"message": "teapot"}}), FaultClass::Permanent),
        ];

        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_json(body))
                .mount(&server)
                .await;

            let fault = synthesizer(&server, Duration::from_secs(5))
                .synthesize(request("p"))
                .await
                .unwrap_err();
            assert_eq!(classify(&fault), expected, "status {status}: {fault}");
            assert!(fault.to_string().contains(&format!("HTTP {status}")));
        }
    }

    #[tokio::test]
    async fn slow_response_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"url": "late"}]}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let fault = synthesizer(&server, Duration::from_millis(50))
            .synthesize(request("p"))
            .await
            .unwrap_err();
        assert!(matches!(fault, SynthesisFault::Timeout(_)), "{fault}");
    }

    #[tokio::test]
    async fn empty_data_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let fault = synthesizer(&server, Duration::from_secs(5))
            .synthesize(request("p"))
            .await
            .unwrap_err();
        assert!(matches!(fault, SynthesisFault::Unknown(_)));
    }

    #[test]
    fn status_mapping_prefers_auth_over_markers() {
        let fault = map_status(StatusCode::FORBIDDEN, r#"{"error":{"message":"safety system"}}"#);
        assert!(matches!(fault, SynthesisFault::Unauthorized(_)));

        let fault = map_status(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        assert!(matches!(fault, SynthesisFault::Timeout(_)));
    }
}
