use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// JSON request body whose rejections surface as `validation_error` responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::header};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        booking_id: String,
        amount: i64,
    }

    fn request(body: &str) -> Request {
        Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn well_formed_bodies_deserialize() {
        let JsonBody(body) = JsonBody::<Payload>::from_request(request(r#"{"bookingId":"b-1","amount":100}"#), &())
            .await
            .unwrap();
        assert_eq!(body.booking_id, "b-1");
        assert_eq!(body.amount, 100);
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let err = JsonBody::<Payload>::from_request(request(r#"{"amount":100}"#), &())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.error_code(), "validation_error");
        assert!(err.to_string().contains("bookingId"));
    }

    #[tokio::test]
    async fn malformed_amounts_and_syntax_are_validation_errors() {
        for body in [r#"{"bookingId":"b-1","amount":"ten"}"#, "{not json"] {
            let err = JsonBody::<Payload>::from_request(request(body), &()).await.unwrap_err();
            assert_eq!(err.error_code(), "validation_error");
        }
    }
}
