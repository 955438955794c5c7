use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    card::DishCard,
    dto::{
        AvailabilityResponse, CreatedDish, NewDishInput, RevisionQuery, RevisionResponse,
        ValidateRequest, ValidateResponse,
    },
    form::{DishForm, DishFormValues, SubmitOutcome, MENU_ROUTE},
    list::MenuList,
    model::Dish,
    repo, views,
};
use crate::{
    error::{ApiResult, AppError},
    state::AppState,
};

/// Longest a revision poll waits for a change before answering.
const REVISION_WAIT: Duration = Duration::from_secs(25);

pub fn page_routes() -> Router<AppState> {
    Router::new()
        // Home and /menu render the same list.
        .route("/", get(menu_page))
        .route("/menu", get(menu_page))
        .route("/menu/:id/toggle", post(toggle_from_page))
        .route("/new-dish", get(new_dish_page).post(submit_new_dish))
}

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/dishes", get(list_dishes).post(create_dish))
        .route("/api/dishes/validate", post(validate_dish))
        .route(
            "/api/dishes/:id/availability/toggle",
            post(toggle_availability),
        )
        .route("/api/menu/revision", get(menu_revision))
}

// --- pages ---

#[instrument(skip(state))]
pub async fn menu_page(State(state): State<AppState>) -> Html<String> {
    let list = MenuList::mount(
        &state.backend,
        state.config.availability_policy,
        &state.feed,
        state.shutdown.child_token(),
    )
    .await;
    if list.is_stale(&state.feed) {
        // The embedded revision is behind, so the page's long-poll reloads it at once.
        debug!(
            revision = list.revision(),
            current = state.feed.current(),
            "menu changed while loading"
        );
    }
    Html(views::menu_page(&list))
}

pub async fn new_dish_page() -> Html<String> {
    Html(views::new_dish_page(&DishForm::default(), None))
}

#[instrument(skip(state, input))]
pub async fn submit_new_dish(
    State(state): State<AppState>,
    Form(input): Form<NewDishInput>,
) -> Response {
    let (values, upload_id) = input.into_parts();
    let (form, outcome) = submit(&state, values, upload_id).await;
    let upload_field = upload_id.map(|id| id.to_string());

    match outcome {
        SubmitOutcome::Created { redirect, .. } => Redirect::to(redirect).into_response(),
        SubmitOutcome::Invalid(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Html(views::new_dish_page(&form, upload_field.as_deref())),
        )
            .into_response(),
        // Already logged; the user just stays on the form.
        SubmitOutcome::Failed => {
            Html(views::new_dish_page(&form, upload_field.as_deref())).into_response()
        }
    }
}

#[instrument(skip(state))]
pub async fn toggle_from_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Redirect> {
    toggle(&state, &id).await?;
    Ok(Redirect::to(MENU_ROUTE))
}

// --- json api ---

#[instrument(skip(state))]
pub async fn list_dishes(State(state): State<AppState>) -> ApiResult<Json<Vec<Dish>>> {
    let dishes = repo::list_all(state.backend.documents().as_ref()).await?;
    Ok(Json(dishes))
}

#[instrument(skip(state, input))]
pub async fn create_dish(
    State(state): State<AppState>,
    Json(input): Json<NewDishInput>,
) -> ApiResult<(StatusCode, Json<CreatedDish>)> {
    let (values, upload_id) = input.into_parts();
    match submit(&state, values, upload_id).await.1 {
        SubmitOutcome::Created { id, .. } => Ok((StatusCode::CREATED, Json(CreatedDish { id }))),
        SubmitOutcome::Invalid(errors) => Err(AppError::Validation(errors)),
        SubmitOutcome::Failed => Err(anyhow::anyhow!("dish could not be stored").into()),
    }
}

pub async fn validate_dish(Json(req): Json<ValidateRequest>) -> Json<ValidateResponse> {
    let (values, _) = req.values.into_parts();
    let mut form = DishForm::new(values);
    for field in req.touched {
        form.blur(field);
    }
    Json(ValidateResponse {
        errors: form.visible_errors(),
    })
}

#[instrument(skip(state))]
pub async fn toggle_availability(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AvailabilityResponse>> {
    let card = toggle(&state, &id).await?;
    Ok(Json(AvailabilityResponse {
        availability: card.availability(),
        sync: card.sync_state(),
        revision: state.feed.current(),
    }))
}

/// Current menu revision. With `after`, waits until the revision moves past
/// it, the wait times out, or the server shuts down.
pub async fn menu_revision(
    State(state): State<AppState>,
    Query(q): Query<RevisionQuery>,
) -> Json<RevisionResponse> {
    let mut rx = state.feed.subscribe();
    if let Some(after) = q.after {
        if *rx.borrow_and_update() == after {
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep(REVISION_WAIT) => {}
                _ = state.shutdown.cancelled() => {}
            }
        }
    }
    let revision = *rx.borrow();
    Json(RevisionResponse { revision })
}

// --- helpers ---

async fn submit(
    state: &AppState,
    values: DishFormValues,
    upload_id: Option<Uuid>,
) -> (DishForm, SubmitOutcome) {
    let mut form = DishForm::new(values);
    if let Some(id) = upload_id {
        if let Some(progress) = state.uploads.subscribe(id).await {
            form.attach_upload(progress);
        }
    }
    let outcome = form
        .submit(
            &state.backend,
            &state.config.placeholder_image,
            &state.feed,
        )
        .await;
    if let (SubmitOutcome::Created { .. }, Some(id)) = (&outcome, upload_id) {
        // The form is gone; an unfinished upload has nothing left to fill in.
        state.uploads.cancel(id).await;
    }
    (form, outcome)
}

/// Load the dish, toggle it on a fresh card and wait for the write to settle.
async fn toggle(state: &AppState, id: &str) -> ApiResult<DishCard> {
    let dish = repo::find(state.backend.documents().as_ref(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dish {id}")))?;
    let card = DishCard::new(
        dish,
        state.backend.documents().clone(),
        state.config.availability_policy,
        state.feed.clone(),
        state.shutdown.child_token(),
    );
    card.toggle().await.context("availability write task")?;
    Ok(card)
}
