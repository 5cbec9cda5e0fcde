mod auth;
mod posts;
mod system;
mod timeline;
mod users;

use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::error::{ApiError, ErrorBody};
use crate::SharedState;

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    axum::Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

pub fn route_handler(state: SharedState) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/token", post(auth::token))
        .route("/posts", post(posts::create_post))
        .route(
            "/posts/{post_id}",
            get(posts::get_post).delete(posts::delete_post),
        )
        .route("/timeline", get(timeline::get_timeline))
        .route(
            "/users/follow/{user_id}",
            post(users::follow).delete(users::unfollow),
        )
        .route("/users/{username}", get(users::profile))
        .route("/users/{user_id}/followers", get(users::followers))
        .route("/users/{user_id}/following", get(users::following))
        .route("/system/health", get(system::health))
        .route("/system/metrics", get(system::metrics))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(_state: State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        AppJson(ErrorBody {
            detail: "Not Found".to_owned(),
            kind: "not_found",
        }),
    )
}
