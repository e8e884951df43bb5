//! Binary image serving.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::error::HttpError;
use crate::state::AppState;

/// `GET /images/{id}`: the stored binary with its recorded MIME type.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, HttpError> {
    let image = state.jobs.get_image(id).await?;
    Ok((
        [(header::CONTENT_TYPE, image.mime_type)],
        image.data,
    )
        .into_response())
}
