#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pulse_bus::EventBus;
use pulse_cache::TimelineCache;
use pulse_core::UserId;
use pulse_db::Database;
use pulse_server::config::Config;
use pulse_server::task::fanout::FanoutWorker;
use pulse_server::{AppState, Server, SharedState};
use tempfile::TempDir;
use tokio::sync::watch;

/// A full service instance on an ephemeral port with ephemeral storage:
/// HTTP server plus one fan-out worker, both wired to the same components.
///
/// `state` is exposed so tests can reach behind the HTTP surface (flip cache
/// availability, inject bus messages, inspect queue depths).
pub struct TestApp {
    pub base_url: String,
    pub state: SharedState,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    _temp_dir: TempDir,
}

pub struct TestUser {
    pub id: UserId,
    pub username: String,
    pub token: String,
}

impl TestApp {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");

        let mut config = Config {
            db_path: temp_dir.path().join("pulse.redb"),
            token_secret: "integration-test-secret".to_owned(),
            token_ttl: Duration::from_secs(3600),
            celebrity_threshold: 2,
            timeline_cap: 1000,
            fanout_batch_size: 100,
            worker_concurrency: 2,
            // Fast redelivery keeps failure tests quick.
            visibility_timeout: Duration::from_millis(200),
            max_receives: 3,
            bus_capacity: 1000,
            lookback: Duration::from_secs(86_400),
            cors_origins: None,
        };
        tweak(&mut config);

        let db = Arc::new(
            Database::open(config.db_path.clone(), config.celebrity_threshold)
                .await
                .expect("db opens"),
        );
        let cache = Arc::new(TimelineCache::new(config.timeline_cap));
        let bus = Arc::new(EventBus::new(
            config.visibility_timeout,
            config.max_receives,
            config.bus_capacity,
        ));
        let state = AppState::new(config, db, cache, bus);

        let server = Server::init("127.0.0.1:0", state.clone())
            .await
            .expect("server binds");
        let base_url = format!("http://{}", server.local_addr().expect("addr"));

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx.clone()));
        tokio::spawn(FanoutWorker::new(&state, shutdown_rx).run());

        Self {
            base_url,
            state,
            client: reqwest::Client::new(),
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, username: &str) -> TestUser {
        let resp = self
            .client
            .post(self.url("/auth/register"))
            .json(&serde_json::json!({
                "username": username,
                "email": format!("{username}@example.com"),
            }))
            .send()
            .await
            .expect("register request");
        assert_eq!(resp.status(), 201, "register should succeed");

        let body: serde_json::Value = resp.json().await.expect("json body");
        TestUser {
            id: UserId(body["user"]["id"].as_u64().expect("user id")),
            username: username.to_owned(),
            token: body["token"].as_str().expect("token").to_owned(),
        }
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("get request")
    }

    pub async fn post_json(
        &self,
        path: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> reqwest::Response {
        let mut req = self.client.post(self.url(path)).json(body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("post request")
    }

    pub async fn post_empty(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.post(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("post request")
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.client.delete(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("delete request")
    }

    /// Create a post, asserting success; returns the response body.
    pub async fn create_post(&self, user: &TestUser, content: &str) -> serde_json::Value {
        let resp = self
            .post_json(
                "/posts",
                Some(&user.token),
                &serde_json::json!({ "content": content }),
            )
            .await;
        assert_eq!(resp.status(), 201, "post creation should succeed");
        resp.json().await.expect("json body")
    }

    pub async fn follow(&self, follower: &TestUser, target: UserId) {
        let resp = self
            .post_empty(&format!("/users/follow/{target}"), Some(&follower.token))
            .await;
        assert_eq!(resp.status(), 204, "follow should succeed");
    }

    pub async fn timeline(&self, user: &TestUser, query: &str) -> serde_json::Value {
        let resp = self.get(&format!("/timeline{query}"), Some(&user.token)).await;
        assert_eq!(resp.status(), 200, "timeline read should succeed");
        resp.json().await.expect("json body")
    }

    /// Poll the viewer's timeline until `predicate` holds or two seconds
    /// pass; returns the last body either way.
    pub async fn wait_timeline(
        &self,
        user: &TestUser,
        predicate: impl Fn(&serde_json::Value) -> bool,
    ) -> serde_json::Value {
        let mut body = self.timeline(user, "").await;
        for _ in 0..200 {
            if predicate(&body) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            body = self.timeline(user, "").await;
        }
        body
    }

    /// Wait for the bus to drain (nothing queued or in flight).
    pub async fn wait_bus_idle(&self) {
        for _ in 0..200 {
            let status = self.state.bus.status();
            if status.queued == 0 && status.in_flight == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bus did not drain: {:?}", self.state.bus.status());
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn post_contents(timeline: &serde_json::Value) -> Vec<String> {
    timeline["posts"]
        .as_array()
        .expect("posts array")
        .iter()
        .map(|post| post["content"].as_str().expect("content").to_owned())
        .collect()
}
