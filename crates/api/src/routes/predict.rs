//! Prediction Route
//!
//! Every outcome, including a failed upload, is a 200 with either a
//! prediction body or an `error` field.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    Json,
};
use inference_engine::{PredictError, Prediction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::AppState;

/// Multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Request-tier failures
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid upload: {0}")]
    Rejected(#[from] MultipartRejection),
    #[error("Invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("No file uploaded (expected multipart field 'file')")]
    MissingFile,
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error("Prediction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Response for the predict endpoint
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Prediction(Prediction),
    Error { error: String },
}

impl From<Result<Prediction, UploadError>> for PredictResponse {
    fn from(result: Result<Prediction, UploadError>) -> Self {
        match result {
            Ok(prediction) => PredictResponse::Prediction(prediction),
            Err(e) => {
                warn!("Prediction failed: {}", e);
                PredictResponse::Error {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Classify an uploaded image
pub async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Json<PredictResponse> {
    Json(classify_upload(&state, multipart).await.into())
}

async fn classify_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Prediction, UploadError> {
    if !state.engine.is_loaded() {
        return Err(PredictError::ModelNotLoaded.into());
    }

    let image = read_file_field(multipart?).await?;
    debug!("Received upload of {} bytes", image.len());

    let engine = state.engine.clone();
    let prediction = tokio::task::spawn_blocking(move || engine.predict(&image)).await??;
    Ok(prediction)
}

async fn read_file_field(mut multipart: Multipart) -> Result<Vec<u8>, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?.to_vec());
        }
    }
    Err(UploadError::MissingFile)
}
