use axum::extract::State;
use axum::http::StatusCode;
use pulse_core::Timestamp;
use serde::{Deserialize, Serialize};

use super::users::UserProfile;
use super::AppJson;
use crate::error::{ApiResult, InvalidArgumentSnafu, UnauthorizedSnafu};
use crate::SharedState;

const MAX_USERNAME_CHARS: usize = 50;
const MAX_EMAIL_CHARS: usize = 255;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub user: UserProfile,
    pub token: String,
}

/// Create an account and mint its first bearer credential.
///
/// Passwords and credential verification live outside this service; the
/// token mint is the contract boundary.
pub async fn register(
    State(state): State<SharedState>,
    AppJson(request): AppJson<RegisterRequest>,
) -> ApiResult<(StatusCode, AppJson<RegisterResponse>)> {
    let username = request.username.trim();
    if username.is_empty() || MAX_USERNAME_CHARS < username.chars().count() {
        return InvalidArgumentSnafu {
            msg: format!("Username must be 1..={MAX_USERNAME_CHARS} characters"),
        }
        .fail();
    }

    let email = request.email.trim();
    if !email.contains('@') || MAX_EMAIL_CHARS < email.chars().count() {
        return InvalidArgumentSnafu {
            msg: "Invalid email address",
        }
        .fail();
    }

    let user = state.db.create_user(username, email).await?;
    let token = state.auth.mint(user.id, Timestamp::now());

    Ok((
        StatusCode::CREATED,
        AppJson(RegisterResponse {
            user: UserProfile::from_user(&user),
            token,
        }),
    ))
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub username: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn token(
    State(state): State<SharedState>,
    AppJson(request): AppJson<TokenRequest>,
) -> ApiResult<AppJson<TokenResponse>> {
    let user = state
        .db
        .get_user_by_username(request.username.trim())
        .await?
        .ok_or_else(|| {
            UnauthorizedSnafu {
                msg: "Unknown user",
            }
            .build()
        })?;

    Ok(AppJson(TokenResponse {
        token: state.auth.mint(user.id, Timestamp::now()),
    }))
}
