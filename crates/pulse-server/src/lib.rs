pub mod auth;
pub mod config;
mod error;
mod routes;
pub mod task;

use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr as _;
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use pulse_bus::EventBus;
use pulse_cache::TimelineCache;
use pulse_db::Database;
use snafu::{ResultExt as _, Snafu};
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use crate::auth::AuthTokens;
pub use crate::config::{Config, ConfigError};
pub use crate::error::{ApiError, ApiResult};

const LOG_TARGET: &str = "pulse::server";

/// Shared per-request context: immutable configuration plus cheaply-cloned
/// component handles.
pub struct AppState {
    pub db: Arc<Database>,
    pub cache: Arc<TimelineCache>,
    pub bus: Arc<EventBus>,
    pub config: Config,
    pub auth: AuthTokens,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        cache: Arc<TimelineCache>,
        bus: Arc<EventBus>,
    ) -> SharedState {
        let auth = AuthTokens::new(&config.token_secret, config.token_ttl);
        Arc::new(Self {
            db,
            cache,
            bus,
            config,
            auth,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(transparent)]
    Io { source: io::Error },
    ListenAddr { source: AddrParseError },
    #[snafu(display("Invalid CORS origin: {origin}"))]
    CorsOrigin { origin: String },
}
pub type ServerResult<T> = std::result::Result<T, ServerError>;

pub struct Server {
    listener: TcpListener,
    state: SharedState,
}

impl Server {
    pub async fn init(listen: &str, state: SharedState) -> ServerResult<Server> {
        let listener = Self::get_listener(listen).await?;

        info!(target: LOG_TARGET, addr = %listener.local_addr()?, "Listening");
        Ok(Self { listener, state })
    }

    async fn get_listener(listen: &str) -> ServerResult<TcpListener> {
        let addr = SocketAddr::from_str(listen).context(ListenAddrSnafu)?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;
        socket.bind(addr)?;

        Ok(socket.listen(1024)?)
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown flag flips; in-flight requests complete
    /// before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ServerResult<()> {
        let mut router = routes::route_handler(self.state.clone());

        if let Some(origins) = &self.state.config.cors_origins {
            router = router.layer(cors_layer(origins)?);
        }

        axum::serve(self.listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|&stop| stop).await;
            })
            .await?;

        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> ServerResult<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| ServerError::CorsOrigin {
                origin: origin.clone(),
            })
        })
        .collect::<ServerResult<Vec<HeaderValue>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST, Method::DELETE]))
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
