use std::collections::HashSet;

use axum::extract::{Query, State};
use pulse_cache::TimelineEntry;
use pulse_core::{PostId, Timestamp};
use pulse_util_error::FmtCompact as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::posts::{hydrate_views, PostView};
use super::AppJson;
use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::{SharedState, LOG_TARGET};

/// How many fresh posts per read are pulled from followed celebrities.
const CELEBRITY_PULL_LIMIT: usize = 20;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 100;

#[derive(Deserialize)]
pub struct TimelineQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

#[derive(Serialize)]
pub struct TimelineResponse {
    pub posts: Vec<PostView>,
    pub source: &'static str,
    pub has_more: bool,
}

/// Assemble the viewer's timeline.
///
/// The cached push-timeline is merged with a fresh pull from followed
/// celebrities; when the cache is unavailable or holds no timeline for the
/// viewer, the read falls back to a direct store scan (and opportunistically
/// rebuilds the cached timeline from it).
pub async fn get_timeline(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<AppJson<TimelineResponse>> {
    let viewer = user.id;
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset;
    let wanted = offset + limit;
    let since = Timestamp::now().saturating_sub(state.config.lookback);

    let push = if state.cache.available() {
        match state.cache.range(viewer, 0, wanted) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(target: LOG_TARGET, %viewer, err = %err.fmt_compact(), "Cache read failed");
                None
            }
        }
    } else {
        None
    };

    let (mut merged, source): (Vec<(Timestamp, PostId)>, &'static str) = match push {
        Some(push_entries) => {
            let mut merged: Vec<(Timestamp, PostId)> = push_entries
                .iter()
                .map(|entry| (entry.score, entry.post_id))
                .collect();

            let celebrities = state.db.followed_celebrities_of(viewer).await?;
            if celebrities.is_empty() {
                (merged, "cache")
            } else {
                let pulled = state
                    .db
                    .recent_posts_by_authors(&celebrities, since, CELEBRITY_PULL_LIMIT)
                    .await?;
                merged.extend(pulled.iter().map(|post| (post.created_at, post.id)));
                (merged, "cache+pull")
            }
        }
        None => {
            // No cached timeline (or no cache): scan the store over the
            // viewer's whole followed set, own posts included.
            let mut authors = state.db.followed_ids_of(viewer).await?;
            authors.push(viewer);
            let posts = state
                .db
                .recent_posts_by_authors(&authors, since, wanted)
                .await?;

            if state.cache.available() {
                let entries: Vec<TimelineEntry> = posts
                    .iter()
                    .map(|post| TimelineEntry {
                        post_id: post.id,
                        score: post.created_at,
                    })
                    .collect();
                if let Err(err) = state.cache.add_many(viewer, &entries) {
                    debug!(target: LOG_TARGET, %viewer, err = %err.fmt_compact(), "Timeline rebuild failed");
                }
            }

            (
                posts.iter().map(|post| (post.created_at, post.id)).collect(),
                "database",
            )
        }
    };

    // Score descending, equal scores put the lower post id last; pagination
    // applies only after the merge.
    merged.sort_unstable_by(|a, b| b.cmp(a));
    let mut seen = HashSet::new();
    merged.retain(|&(_, post_id)| seen.insert(post_id));

    let page: Vec<PostId> = merged
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|(_, post_id)| post_id)
        .collect();

    let mut posts_by_id = state.db.get_posts_by_ids(page.iter().copied()).await?;
    let page_posts: Vec<_> = page
        .into_iter()
        .filter_map(|post_id| posts_by_id.remove(&post_id))
        .collect();

    let posts = hydrate_views(&state.db, page_posts).await?;
    let has_more = posts.len() == limit;

    Ok(AppJson(TimelineResponse {
        posts,
        source,
        has_more,
    }))
}
