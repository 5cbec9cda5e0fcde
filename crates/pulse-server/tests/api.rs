mod common;

use common::{post_contents, TestApp};
use pulse_core::{FeedEvent, PostId, Timestamp};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn regular_post_reaches_follower_via_cache() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;

    app.follow(&b, a.id).await;
    app.create_post(&a, "hello").await;

    let timeline = app
        .wait_timeline(&b, |t| t["source"] == "cache" && !post_contents(t).is_empty())
        .await;
    assert_eq!(timeline["source"], "cache");
    assert_eq!(post_contents(&timeline), vec!["hello"]);
    assert_eq!(timeline["posts"][0]["author"], "a");
    assert_eq!(timeline["has_more"], false);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn celebrity_posts_are_pulled_not_fanned_out() {
    // Threshold is 2 in the test config.
    let app = TestApp::start().await;
    let celeb = app.register("celeb").await;
    let f1 = app.register("f1").await;
    let f2 = app.register("f2").await;
    app.follow(&f1, celeb.id).await;
    app.follow(&f2, celeb.id).await;

    let viewer = app.register("viewer").await;
    app.follow(&viewer, celeb.id).await;

    app.create_post(&celeb, "star").await;

    // No event was emitted for the celebrity post.
    let status = app.state.bus.status();
    assert_eq!(status.queued + status.in_flight, 0);

    // First read has no cached timeline and falls back to the store...
    let first = app.timeline(&viewer, "").await;
    assert_eq!(first["source"], "database");
    assert_eq!(post_contents(&first), vec!["star"]);

    // ...which rebuilds the cache, so the next read merges cache and pull,
    // deduplicated by post id.
    let second = app.timeline(&viewer, "").await;
    assert_eq!(second["source"], "cache+pull");
    assert_eq!(post_contents(&second), vec!["star"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cached_timeline_is_trimmed_to_cap() {
    let app = TestApp::start_with(|config| config.timeline_cap = 3).await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    app.follow(&b, a.id).await;

    for i in 1..=4 {
        app.create_post(&a, &format!("post {i}")).await;
        app.wait_timeline(&b, |t| {
            t["source"] == "cache" && post_contents(t).first() == Some(&format!("post {i}"))
        })
        .await;
    }

    let timeline = app.timeline(&b, "?limit=10").await;
    assert_eq!(timeline["source"], "cache");
    // The lowest-scored entry was evicted; the newest three remain.
    assert_eq!(post_contents(&timeline), vec!["post 4", "post 3", "post 2"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cache_outage_degrades_to_database_reads() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    app.follow(&b, a.id).await;
    app.create_post(&a, "hello").await;
    app.wait_timeline(&b, |t| t["source"] == "cache").await;

    app.state.cache.set_available(false);

    let timeline = app.timeline(&b, "").await;
    assert_eq!(timeline["source"], "database");
    assert_eq!(post_contents(&timeline), vec!["hello"]);

    let health: serde_json::Value = app
        .get("/system/health", None)
        .await
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["database"], "healthy");
    assert_eq!(health["cache"], "unavailable");

    app.state.cache.set_available(true);
    let timeline = app
        .wait_timeline(&b, |t| t["source"] == "cache" || t["source"] == "database")
        .await;
    assert_eq!(post_contents(&timeline), vec!["hello"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn redelivered_event_adds_no_duplicate_entries() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    app.follow(&b, a.id).await;

    let created = app.create_post(&a, "hello").await;
    app.wait_timeline(&b, |t| t["source"] == "cache" && !post_contents(t).is_empty())
        .await;

    // Simulate the bus redelivering the already-processed event.
    app.state
        .bus
        .publish(&FeedEvent::PostCreated {
            post_id: PostId(created["id"].as_u64().expect("post id")),
            author_id: a.id,
            is_celebrity: false,
            timestamp: Timestamp(created["created_at"].as_u64().expect("created_at")),
        })
        .await
        .expect("publish");
    app.wait_bus_idle().await;

    let timeline = app.timeline(&b, "?limit=10").await;
    assert_eq!(post_contents(&timeline), vec!["hello"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unfollow_invalidates_the_cached_timeline() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;

    app.follow(&b, a.id).await;
    app.create_post(&a, "hello").await;
    app.wait_timeline(&b, |t| !post_contents(t).is_empty()).await;

    let resp = app
        .delete(&format!("/users/follow/{}", a.id), Some(&b.token))
        .await;
    assert_eq!(resp.status(), 204);

    // The stale cached timeline is gone; the fallback read no longer sees
    // the unfollowed author's posts.
    let timeline = app.timeline(&b, "").await;
    assert_eq!(timeline["source"], "database");
    assert!(post_contents(&timeline).is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn timeline_pages_with_offset_and_limit() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    app.follow(&b, a.id).await;

    for i in 1..=5 {
        app.create_post(&a, &format!("post {i}")).await;
    }
    app.wait_timeline(&b, |t| post_contents(t).len() == 5).await;

    let page = app.timeline(&b, "?limit=2&offset=0").await;
    assert_eq!(post_contents(&page), vec!["post 5", "post 4"]);
    assert_eq!(page["has_more"], true);

    let page = app.timeline(&b, "?limit=2&offset=2").await;
    assert_eq!(post_contents(&page), vec!["post 3", "post 2"]);

    let page = app.timeline(&b, "?limit=2&offset=4").await;
    assert_eq!(post_contents(&page), vec!["post 1"]);
    assert_eq!(page["has_more"], false);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn post_content_boundaries() {
    let app = TestApp::start().await;
    let a = app.register("a").await;

    let at_cap = "x".repeat(5000);
    let over_cap = "x".repeat(5001);
    let cases: [(&str, u16); 5] = [
        ("", 400),
        ("   ", 400),
        ("x", 201),
        (&at_cap, 201),
        (&over_cap, 400),
    ];
    for (content, expected) in cases {
        let resp = app
            .post_json(
                "/posts",
                Some(&a.token),
                &serde_json::json!({ "content": content }),
            )
            .await;
        assert_eq!(
            resp.status().as_u16(),
            expected,
            "content of {} chars",
            content.chars().count()
        );
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn follow_edge_errors_map_to_statuses() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;

    app.follow(&a, b.id).await;

    let resp = app
        .post_empty(&format!("/users/follow/{}", b.id), Some(&a.token))
        .await;
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "conflict");

    let resp = app
        .post_empty(&format!("/users/follow/{}", a.id), Some(&a.token))
        .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "invalid_argument");

    let resp = app
        .post_empty("/users/follow/9999", Some(&a.token))
        .await;
    assert_eq!(resp.status(), 404);

    let resp = app
        .delete(&format!("/users/follow/{}", a.id), Some(&b.token))
        .await;
    assert_eq!(resp.status(), 404);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_is_required_and_verified() {
    let app = TestApp::start().await;
    let _ = app.register("a").await;

    let resp = app.get("/timeline", None).await;
    assert_eq!(resp.status(), 401);

    let resp = app.get("/timeline", Some("garbage-token")).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "unauthorized");

    let resp = app
        .post_json(
            "/auth/token",
            None,
            &serde_json::json!({ "username": "nobody" }),
        )
        .await;
    assert_eq!(resp.status(), 401);

    let resp = app
        .post_json(
            "/auth/token",
            None,
            &serde_json::json!({ "username": "a" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json");
    let token = body["token"].as_str().expect("token");
    let resp = app.get("/timeline", Some(token)).await;
    assert_eq!(resp.status(), 200);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registration_conflicts_and_validation() {
    let app = TestApp::start().await;
    let _ = app.register("a").await;

    let resp = app
        .post_json(
            "/auth/register",
            None,
            &serde_json::json!({ "username": "a", "email": "a2@example.com" }),
        )
        .await;
    assert_eq!(resp.status(), 409);

    let resp = app
        .post_json(
            "/auth/register",
            None,
            &serde_json::json!({ "username": "b", "email": "not-an-email" }),
        )
        .await;
    assert_eq!(resp.status(), 400);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn follower_listings_paginate() {
    let app = TestApp::start_with(|config| config.celebrity_threshold = 100).await;
    let star = app.register("star").await;

    let mut fans = vec![];
    for i in 0..5 {
        let fan = app.register(&format!("fan{i}")).await;
        app.follow(&fan, star.id).await;
        fans.push(fan);
    }

    let resp = app
        .get(
            &format!("/users/{}/followers?limit=2&offset=2", star.id),
            None,
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json");
    let names: Vec<&str> = body
        .as_array()
        .expect("array")
        .iter()
        .map(|u| u["username"].as_str().expect("username"))
        .collect();
    assert_eq!(names, vec!["fan2", "fan3"]);

    let resp = app
        .get(&format!("/users/{}/following", fans[0].id), None)
        .await;
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body.as_array().expect("array").len(), 1);

    let resp = app.get("/users/9999/followers", None).await;
    assert_eq!(resp.status(), 404);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn deleted_post_disappears_from_timelines() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    app.follow(&b, a.id).await;

    let created = app.create_post(&a, "fleeting").await;
    let post_id = created["id"].as_u64().expect("post id");
    app.wait_timeline(&b, |t| !post_contents(t).is_empty()).await;

    // Only the author may delete.
    let resp = app.delete(&format!("/posts/{post_id}"), Some(&b.token)).await;
    assert_eq!(resp.status(), 404);

    let resp = app.delete(&format!("/posts/{post_id}"), Some(&a.token)).await;
    assert_eq!(resp.status(), 204);

    let timeline = app.wait_timeline(&b, |t| post_contents(t).is_empty()).await;
    assert!(post_contents(&timeline).is_empty());

    let resp = app.get(&format!("/posts/{post_id}"), None).await;
    assert_eq!(resp.status(), 404);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn metrics_report_totals() {
    let app = TestApp::start().await;
    let a = app.register("a").await;
    let b = app.register("b").await;
    let c = app.register("c").await;
    app.follow(&b, a.id).await;
    app.follow(&c, a.id).await;
    app.create_post(&a, "hello").await;

    let resp = app.get("/system/metrics", None).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["total_users"], 3);
    assert_eq!(body["total_posts"], 1);
    assert_eq!(body["total_follows"], 2);
    // Threshold is 2: two followers made `a` a celebrity.
    assert_eq!(body["celebrity_count"], 1);
    assert_eq!(body["cache_available"], true);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unknown_routes_return_json_404() {
    let app = TestApp::start().await;

    let resp = app.get("/definitely/not/here", None).await;
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "not_found");
}
