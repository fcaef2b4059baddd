//! Admission Handlers
//!
//! Axum routes answering the orchestrator's admission reviews for Drive and
//! Volume records.

use crate::controlplane::validation::{validate_drive, validate_volume, Rejection};
use crate::crd::{Drive, Volume};
use axum::{
    body::Bytes,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
};
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Message of the response to a review that cannot be decoded
pub const INVALID_REVIEW: &str = "invalid admission review";

/// Admission router builder
pub struct AdmissionRouter;

impl AdmissionRouter {
    /// Build the Axum router
    pub fn build() -> Router {
        Router::new()
            .route("/validatedrive", post(validate_drive_review))
            .route("/validatevolume", post(validate_volume_review))
            .route("/healthz", get(health_check))
            .layer(TraceLayer::new_for_http())
    }
}

fn decode<K>(body: &[u8]) -> Result<AdmissionRequest<K>, String>
where
    K: Resource + DeserializeOwned,
{
    let review: AdmissionReview<K> = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    review
        .try_into()
        .map_err(|e: ConvertAdmissionReviewError| e.to_string())
}

/// Decode the review, run `check` over (old, new) and answer
fn review<K, F>(body: &[u8], check: F) -> Json<AdmissionReview<DynamicObject>>
where
    K: Resource + DeserializeOwned,
    F: FnOnce(Option<&K>, &K) -> Result<(), Rejection>,
{
    let request: AdmissionRequest<K> = match decode(body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "undecodable admission review");
            return Json(AdmissionResponse::invalid(INVALID_REVIEW).into_review());
        }
    };

    let response = AdmissionResponse::from(&request);
    let Some(object) = request.object.as_ref() else {
        // Deletes carry no new object.
        return Json(response.into_review());
    };

    let name = object.name_any();
    match check(request.old_object.as_ref(), object) {
        Ok(()) => {
            debug!(%name, operation = ?request.operation, "admitted");
            Json(response.into_review())
        }
        Err(rejection) => {
            info!(%name, reason = %rejection, "admission denied");
            Json(response.deny(rejection.reason()).into_review())
        }
    }
}

async fn validate_drive_review(body: Bytes) -> impl IntoResponse {
    review::<Drive, _>(&body, validate_drive)
}

async fn validate_volume_review(body: Bytes) -> impl IntoResponse {
    review::<Volume, _>(&body, validate_volume)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
