use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use super::upload::{is_image, UploadSnapshot};
use crate::{
    error::{ApiResult, AppError},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct UploadStarted {
    pub id: Uuid,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/uploads", post(start_upload))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 20MB
        .route("/api/uploads/:id", get(upload_status).delete(cancel_upload))
        .route("/api/uploads/:id/resume", post(resume_upload))
}

/// POST /api/uploads (multipart, field `file`)
#[instrument(skip(state, mp))]
pub async fn start_upload(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> ApiResult<(StatusCode, Json<UploadStarted>)> {
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".into());
        if !is_image(&content_type) {
            return Err(AppError::BadRequest(format!(
                "unsupported content type {content_type}"
            )));
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let body = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        let id = state.uploads.start(&file_name, &content_type, body).await;
        return Ok((StatusCode::ACCEPTED, Json(UploadStarted { id })));
    }
    Err(AppError::BadRequest("file is required".into()))
}

#[instrument(skip(state))]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<UploadSnapshot>> {
    state
        .uploads
        .snapshot(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("upload {id}")))
}

#[instrument(skip(state))]
pub async fn resume_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.uploads.resume(id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::NotFound(format!("upload {id}")))
    }
}

#[instrument(skip(state))]
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.uploads.cancel(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("upload {id}")))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
        response::Response,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{app::build_app, config::AppConfig};

    use super::*;

    const BOUNDARY: &str = "menuboard-boundary";

    fn multipart(file_name: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::post("/api/uploads")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_runs_in_background_and_resolves_url() {
        let (state, _, objects) = AppState::fake_with_stores(AppConfig::memory());
        let uploads = state.uploads.clone();
        let res = build_app(state)
            .oneshot(multipart("tacos.png", "image/png", b"\x89PNG fake"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let id: Uuid = body_json(res).await["id"].as_str().unwrap().parse().unwrap();

        let mut rx = uploads.subscribe(id).await.unwrap();
        let done = rx.wait_for(|s| !s.uploading).await.unwrap().clone();
        assert_eq!(done.url.as_deref(), Some("memory://dishes/dishes/tacos.png"));
        assert_eq!(done.progress, 100.0);
        assert_eq!(&objects.object("dishes/tacos.png").unwrap().body[..], b"\x89PNG fake");
    }

    #[tokio::test]
    async fn status_reports_the_snapshot() {
        let state = AppState::fake();
        let id = state
            .uploads
            .start("flan.jpg", "image/jpeg", bytes::Bytes::from_static(b"flan"))
            .await;
        let mut rx = state.uploads.subscribe(id).await.unwrap();
        rx.wait_for(|s| s.is_complete()).await.unwrap();

        let res = build_app(state)
            .oneshot(
                Request::get(format!("/api/uploads/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let snap = body_json(res).await;
        assert_eq!(snap["progress"], 100.0);
        assert_eq!(snap["uploading"], false);
        assert_eq!(snap["total_bytes"], 4);
        assert_eq!(snap["url"], "memory://dishes/dishes/flan.jpg");
    }

    #[tokio::test]
    async fn non_images_are_rejected() {
        let res = build_app(AppState::fake())
            .oneshot(multipart("notes.txt", "text/plain", b"hola"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let app = build_app(AppState::fake());
        let id = Uuid::new_v4();
        for req in [
            Request::get(format!("/api/uploads/{id}")).body(Body::empty()).unwrap(),
            Request::delete(format!("/api/uploads/{id}")).body(Body::empty()).unwrap(),
            Request::post(format!("/api/uploads/{id}/resume")).body(Body::empty()).unwrap(),
        ] {
            let res = app.clone().oneshot(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn delete_cancels_and_forgets_the_session() {
        let state = AppState::fake();
        let id = state
            .uploads
            .start("flan.jpg", "image/jpeg", bytes::Bytes::from_static(b"flan"))
            .await;
        let app = build_app(state);

        let res = app
            .clone()
            .oneshot(Request::delete(format!("/api/uploads/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app
            .oneshot(Request::get(format!("/api/uploads/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
