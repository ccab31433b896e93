use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::{ApiError, ApiResponse, AppError, ErrorCode, PeerConfig};

pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// JSON client for internal calls to another service.
///
/// Requests carry the shared internal key and a short timeout. Transport
/// failures and 5xx responses count against a circuit breaker; business
/// rejections (4xx with an [`ApiError`] body) come back as the matching
/// [`AppError`] and leave the breaker alone.
#[derive(Clone)]
pub struct PeerClient {
    service: String,
    http: Client,
    config: PeerConfig,
    breaker: Arc<CircuitBreaker>,
}

/// Outcome of a request that reached the peer.
enum Reply<T> {
    Data(T),
    Rejected(AppError),
}

impl PeerClient {
    pub fn new(service: &str, config: PeerConfig) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            service: service.to_string(),
            http,
            config,
            breaker: Arc::new(CircuitBreaker::new(service, CircuitBreakerConfig::default())),
        })
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(&self.service, config));
        self
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AppError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let outcome = self
            .breaker
            .call(async {
                let response = self
                    .http
                    .post(&url)
                    .header(INTERNAL_KEY_HEADER, &self.config.internal_key)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| AppError::ExternalService(format!("{} request failed: {e}", self.service)))?;

                Self::read_reply::<T>(&self.service, response).await
            })
            .await;

        match outcome {
            Ok(Reply::Data(data)) => Ok(data),
            Ok(Reply::Rejected(err)) => Err(err),
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::warn!(peer = %self.service, path, "Skipping call, circuit open");
                Err(AppError::ExternalService(format!("{} unavailable", self.service)))
            }
            Err(CircuitBreakerError::Failed(err)) => {
                tracing::warn!(peer = %self.service, path, error = %err, "Peer call failed");
                Err(err)
            }
        }
    }

    async fn read_reply<T: DeserializeOwned>(
        service: &str,
        response: reqwest::Response,
    ) -> Result<Reply<T>, AppError> {
        let status = response.status();

        if status.is_server_error() {
            return Err(AppError::ExternalService(format!("{service} responded {status}")));
        }

        if status.is_success() {
            let envelope: ApiResponse<T> = response
                .json()
                .await
                .map_err(|e| AppError::ExternalService(format!("{service} sent an unreadable body: {e}")))?;
            return match envelope.data {
                Some(data) => Ok(Reply::Data(data)),
                None => Err(AppError::ExternalService(format!(
                    "{service} returned no data: {}",
                    envelope.error.unwrap_or_default()
                ))),
            };
        }

        let body: Option<ApiError> = response.json().await.ok();
        Ok(Reply::Rejected(rejection(status, body)))
    }
}

/// Maps a peer's 4xx response back onto the local error type.
fn rejection(status: StatusCode, body: Option<ApiError>) -> AppError {
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| status.to_string());

    if let Some(code) = body.as_ref().and_then(|b| ErrorCode::parse(&b.error_code)) {
        return AppError::Rejected(code, message);
    }

    match status {
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        StatusCode::CONFLICT => AppError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized(message),
        _ => AppError::Validation(message),
    }
}
