use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use pulse_core::{FeedEvent, PostId, Timestamp, UserId, MAX_POST_CONTENT_CHARS};
use pulse_db::{Database, Post};
use pulse_util_error::FmtCompact as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::AppJson;
use crate::auth::AuthUser;
use crate::error::{ApiResult, InvalidArgumentSnafu, NotFoundSnafu};
use crate::{SharedState, LOG_TARGET};

#[derive(Serialize)]
pub struct PostView {
    pub id: PostId,
    pub author_id: UserId,
    pub author: String,
    pub content: String,
    pub created_at: Timestamp,
}

/// Batched hydration of posts into API views; one user read for the whole
/// page.
pub(crate) async fn hydrate_views(db: &Database, posts: Vec<Post>) -> ApiResult<Vec<PostView>> {
    let author_ids: BTreeSet<UserId> = posts.iter().map(|post| post.author).collect();
    let authors = db.get_users_by_ids(author_ids).await?;

    Ok(posts
        .into_iter()
        .map(|post| PostView {
            id: post.id,
            author_id: post.author,
            author: authors
                .get(&post.author)
                .map(|user| user.username.clone())
                .unwrap_or_default(),
            content: post.content,
            created_at: post.created_at,
        })
        .collect())
}

#[derive(Deserialize)]
pub struct CreatePostRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct CreatePostResponse {
    #[serde(flatten)]
    pub post: PostView,
    /// Set when the post was committed but the fan-out event could not be
    /// published; the post still reaches readers via the pull/fallback
    /// paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<&'static str>,
}

/// Persist a post and hand fan-out to the worker.
///
/// The publish happens after the commit and its failure never rolls the
/// post back, so request latency does not scale with the author's follower
/// count.
pub async fn create_post(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    AppJson(request): AppJson<CreatePostRequest>,
) -> ApiResult<(StatusCode, AppJson<CreatePostResponse>)> {
    let content = request.content.trim();
    let chars = content.chars().count();
    if chars == 0 {
        return InvalidArgumentSnafu {
            msg: "Post content must not be empty",
        }
        .fail();
    }
    if MAX_POST_CONTENT_CHARS < chars {
        return InvalidArgumentSnafu {
            msg: format!("Post content exceeds {MAX_POST_CONTENT_CHARS} codepoints"),
        }
        .fail();
    }

    let post = state.db.create_post(user.id, content).await?;

    let mut warning = None;
    if user.is_celebrity {
        info!(target: LOG_TARGET, post_id = %post.id, author = %user.id, "Celebrity post, skipping fan-out");
    } else {
        let event = FeedEvent::PostCreated {
            post_id: post.id,
            author_id: user.id,
            is_celebrity: false,
            timestamp: post.created_at,
        };
        if let Err(err) = state.bus.publish(&event).await {
            error!(
                target: LOG_TARGET,
                post_id = %post.id,
                err = %err.fmt_compact(),
                "Failed to publish post_created event"
            );
            warning = Some("fanout_deferred");
            // At least the author sees their own post right away; everyone
            // else gets it via the fallback scan.
            if let Err(err) = state.cache.add(user.id, post.id, post.created_at) {
                debug!(target: LOG_TARGET, err = %err.fmt_compact(), "Direct timeline write failed");
            }
        }
    }

    let view = PostView {
        id: post.id,
        author_id: post.author,
        author: user.username,
        content: post.content,
        created_at: post.created_at,
    };
    Ok((
        StatusCode::CREATED,
        AppJson(CreatePostResponse {
            post: view,
            warning,
        }),
    ))
}

pub async fn get_post(
    State(state): State<SharedState>,
    Path(post_id): Path<PostId>,
) -> ApiResult<AppJson<PostView>> {
    let post = state.db.get_post(post_id).await?.ok_or_else(|| {
        NotFoundSnafu {
            msg: format!("Post {post_id} not found"),
        }
        .build()
    })?;

    let mut views = hydrate_views(&state.db, vec![post]).await?;
    Ok(AppJson(views.remove(0)))
}

/// Remove a post; the store is the source of truth, cached timeline entries
/// are swept asynchronously off the request path.
pub async fn delete_post(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(post_id): Path<PostId>,
) -> ApiResult<StatusCode> {
    state.db.delete_post(post_id, user.id).await?;

    let cache = state.cache.clone();
    tokio::spawn(async move {
        match cache.remove_post_everywhere(post_id) {
            Ok(removed) => {
                debug!(target: LOG_TARGET, %post_id, removed, "Swept deleted post from timelines");
            }
            Err(err) => {
                info!(
                    target: LOG_TARGET,
                    %post_id,
                    err = %err.fmt_compact(),
                    "Timeline sweep failed; stale entries drop on hydration"
                );
            }
        }
    });

    Ok(StatusCode::NO_CONTENT)
}
