use crate::errors::ServiceError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

/// Standard success envelope: `{"status": "success", "data": ...}`.
pub fn success_response<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "data": data })),
    )
        .into_response()
}

/// Success envelope with 201 Created.
pub fn created_response<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({ "status": "success", "data": data })),
    )
        .into_response()
}

/// Validate request input, mapping failures to the error taxonomy.
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}

/// The authenticated user owning the request.
///
/// Authentication itself is an external collaborator; the routing layer in
/// front of this service resolves the token and forwards the user id in the
/// `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ServiceError::ValidationError("Missing x-user-id header".to_string())
            })?;

        let user_id = Uuid::parse_str(header).map_err(|_| {
            ServiceError::ValidationError("Invalid x-user-id header".to_string())
        })?;

        Ok(UserId(user_id))
    }
}
