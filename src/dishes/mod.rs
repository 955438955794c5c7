pub mod card;
mod dto;
pub mod form;
mod handlers;
pub mod list;
pub mod model;
pub mod repo;
mod views;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::page_routes())
        .merge(handlers::api_routes())
}
