//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - A [`DataServer`] stops serving when dropped. Hold on to it until all fetches are done.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the metricator crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("metricator=trace,metricator_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

#[derive(Debug, Default)]
struct ServerState {
    payload: String,
    token: Option<String>,
    hits: usize,
    fail_next: usize,
    delay: Option<Duration>,
}

/// A fake remote data server serving `GET /api/data` on a random local port.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`.
#[derive(Debug)]
pub struct DataServer {
    state: Arc<Mutex<ServerState>>,
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl DataServer {
    /// Starts serving `payload` as the dataset.
    pub fn new(payload: &str) -> Self {
        let state = Arc::new(Mutex::new(ServerState {
            payload: payload.to_owned(),
            ..Default::default()
        }));

        let router = Router::new()
            .route("/api/data", get(serve_data))
            .with_state(state.clone());

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            state,
            handle,
            socket,
        }
    }

    /// Requires `Authorization: Bearer <token>` on every request, answering `401` otherwise.
    pub fn with_token(self, token: &str) -> Self {
        self.state.lock().unwrap().token = Some(token.to_owned());
        self
    }

    /// The base URL of this server.
    pub fn url(&self) -> Url {
        format!("http://localhost:{}/", self.socket.port())
            .parse()
            .unwrap()
    }

    /// Number of requests received so far.
    pub fn hits(&self) -> usize {
        self.state.lock().unwrap().hits
    }

    /// Answers the next `count` requests with `500 Internal Server Error`.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    /// Waits for `delay` before answering each request.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Replaces the served dataset.
    pub fn set_payload(&self, payload: &str) {
        self.state.lock().unwrap().payload = payload.to_owned();
    }
}

impl Drop for DataServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_data(
    State(state): State<Arc<Mutex<ServerState>>>,
    headers: HeaderMap,
) -> Response {
    let (delay, response) = {
        let mut state = state.lock().unwrap();
        state.hits += 1;

        let authorized = match state.token {
            Some(ref token) => headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value == format!("Bearer {token}")),
            None => true,
        };

        let response = if !authorized {
            StatusCode::UNAUTHORIZED.into_response()
        } else if state.fail_next > 0 {
            state.fail_next -= 1;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        } else {
            (
                [(header::CONTENT_TYPE, "application/json")],
                state.payload.clone(),
            )
                .into_response()
        };
        (state.delay, response)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    response
}
