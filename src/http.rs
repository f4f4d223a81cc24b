use crate::error::SpeakError;
use crate::speaker_box::{SpeakRequest, SpeakerBox};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(speaker_box: Arc<SpeakerBox>) -> Router {
    Router::new()
        .route("/speak", post(speak))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(speaker_box)
}

pub async fn serve(speaker_box: Arc<SpeakerBox>, host: &str, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(address = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(speaker_box)).await
}

async fn speak(
    State(speaker_box): State<Arc<SpeakerBox>>,
    payload: Result<Json<SpeakRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    // Dropping this handler (client gone) cancels the request.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let task = tokio::spawn(async move { speaker_box.process(request, &cancel).await });
    let joined = task.await;
    guard.disarm();

    match joined {
        Ok(Ok(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(Err(e @ SpeakError::EmptyInput)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Ok(Err(e @ SpeakError::Overloaded)) => {
            error_response(StatusCode::TOO_MANY_REQUESTS, e.to_string())
        }
        Ok(Err(e @ SpeakError::Cancelled)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Ok(Err(e @ SpeakError::Lease(_))) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "speak task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "request processing failed")
        }
    }
}

async fn health(State(speaker_box): State<Arc<SpeakerBox>>) -> Response {
    let report = speaker_box.health().await;
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn status(State(speaker_box): State<Arc<SpeakerBox>>) -> Response {
    Json(speaker_box.status()).into_response()
}
