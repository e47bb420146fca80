use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use limn_core::{portrait, ChatModelLike, Error, GenerationRequest, ImageModelLike};

/// Preloaded models, shared across requests for the process lifetime.
#[derive(Clone)]
pub struct AppState {
    pub image: Arc<dyn ImageModelLike>,
    pub chat: Arc<dyn ChatModelLike>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_images_handler))
        .route("/v1/characters/description", get(describe_character_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct DescribeParams {
    book: String,
    character: String,
}

/// POST: `{prompt, samples, steps, batch_size}` -> JSON array of base64 PNGs.
async fn generate_images_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    match portrait::generate_images(state.image.as_ref(), &request, None) {
        Ok(images) => Json(images).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET: `?book=..&character=..` -> plain-text description.
async fn describe_character_handler(
    State(state): State<AppState>,
    Query(params): Query<DescribeParams>,
) -> Response {
    match portrait::describe_character(state.chat.as_ref(), &params.book, &params.character) {
        Ok(description) => description.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: Error) -> Response {
    error!("request failed: {err}");
    (status_for(&err), err.to_string()).into_response()
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::Extraction => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Configuration(_) | Error::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::status_for;
    use axum::http::StatusCode;
    use limn_core::Error;

    #[test]
    fn errors_map_to_expected_status_codes() {
        assert_eq!(
            status_for(&Error::InvalidRequest("samples".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Error::Extraction), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_for(&Error::Inference("oom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&Error::Configuration("no cache".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
