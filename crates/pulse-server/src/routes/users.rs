use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use pulse_core::{Timestamp, UserId};
use pulse_db::User;
use pulse_util_error::FmtCompact as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppJson;
use crate::auth::AuthUser;
use crate::error::{ApiResult, NotFoundSnafu};
use crate::{SharedState, LOG_TARGET};

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 100;

#[derive(Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub follower_count: u64,
    pub following_count: u64,
    pub is_celebrity: bool,
    pub created_at: Timestamp,
}

impl UserProfile {
    pub(crate) fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            follower_count: user.follower_count,
            following_count: user.following_count,
            is_celebrity: user.is_celebrity,
            created_at: user.created_at,
        }
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// Follow a user, then drop the follower's cached timeline so the next read
/// rebuilds it with the new followee included.
pub async fn follow(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(target): Path<UserId>,
) -> ApiResult<StatusCode> {
    state.db.add_follow(user.id, target).await?;
    invalidate_timeline(&state, user.id);

    Ok(StatusCode::NO_CONTENT)
}

pub async fn unfollow(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(target): Path<UserId>,
) -> ApiResult<StatusCode> {
    state.db.remove_follow(user.id, target).await?;
    invalidate_timeline(&state, user.id);

    Ok(StatusCode::NO_CONTENT)
}

/// Invalidation is best-effort: on failure the stale timeline is still
/// bounded by the cap and gets replaced on the next fallback read.
fn invalidate_timeline(state: &SharedState, user_id: UserId) {
    if let Err(err) = state.cache.invalidate(user_id) {
        info!(
            target: LOG_TARGET,
            %user_id,
            err = %err.fmt_compact(),
            "Timeline invalidation failed"
        );
    }
}

pub async fn profile(
    State(state): State<SharedState>,
    Path(username): Path<String>,
) -> ApiResult<AppJson<UserProfile>> {
    let user = state
        .db
        .get_user_by_username(&username)
        .await?
        .ok_or_else(|| {
            NotFoundSnafu {
                msg: format!("User {username} not found"),
            }
            .build()
        })?;

    Ok(AppJson(UserProfile::from_user(&user)))
}

pub async fn followers(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<AppJson<Vec<UserProfile>>> {
    ensure_user_exists(&state, user_id).await?;
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);

    let (ids, _) = state
        .db
        .followers_page(user_id, None, query.offset + limit)
        .await?;
    let page: Vec<UserId> = ids.into_iter().skip(query.offset).collect();

    Ok(AppJson(hydrate_profiles(&state, page).await?))
}

pub async fn following(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<AppJson<Vec<UserProfile>>> {
    ensure_user_exists(&state, user_id).await?;
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);

    let ids = state.db.followed_ids_of(user_id).await?;
    let page: Vec<UserId> = ids.into_iter().skip(query.offset).take(limit).collect();

    Ok(AppJson(hydrate_profiles(&state, page).await?))
}

async fn ensure_user_exists(state: &SharedState, user_id: UserId) -> ApiResult<()> {
    state.db.get_user(user_id).await?.ok_or_else(|| {
        NotFoundSnafu {
            msg: format!("User {user_id} not found"),
        }
        .build()
    })?;
    Ok(())
}

async fn hydrate_profiles(state: &SharedState, ids: Vec<UserId>) -> ApiResult<Vec<UserProfile>> {
    let users = state.db.get_users_by_ids(ids.iter().copied()).await?;
    Ok(ids
        .into_iter()
        .filter_map(|id| users.get(&id).map(UserProfile::from_user))
        .collect())
}
