//! Helpers for testing the resource cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`JsonServer`], make sure that the server is held until all requests to it
//!    have been made. Dropping the server stops it, and pollers pointing at it start failing.
//!    Assign it to a variable: `let server = JsonServer::new(json!({}));`.
//!
//!  - [`JsonServer::with_tls`] serves HTTPS with a certificate issued by the `ca.pem` fixture.
//!    `other-ca.pem` is a valid CA bundle that did not issue it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{self, State};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resourcecache` crates and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "resourcecache_service=trace,resourcecache=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the absolute path to the given fixture.
///
/// Fixtures are located in the `tests/fixtures` directory, located from the workspace root.
/// Fixtures can be either files, or directories.
///
/// # Panics
///
/// Panics if the fixture path does not exist on the file system.
pub fn fixture(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("./tests/fixtures/");
    full_path.push(path);

    assert!(full_path.exists(), "'{}' does not exist", path.display());

    full_path
}

/// Returns the contents of a fixture.
///
/// # Panics
///
/// Panics if the fixture does not exist or cannot be read.
pub fn read_fixture(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(fixture(path)).unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    scheme: &'static str,
}

fn bind_local() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    listener.set_nonblocking(true).unwrap();
    let socket = listener.local_addr().unwrap();
    (listener, socket)
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let (listener, socket) = bind_local();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            scheme: "http",
        }
    }

    /// Serves `router` over HTTPS.
    ///
    /// The server presents the `localhost.pem` fixture, a certificate for `localhost` issued
    /// by the CA in the `ca.pem` fixture.
    pub fn with_router_tls(router: Router) -> Self {
        let (listener, socket) = bind_local();
        let certificate = read_fixture("localhost.pem");
        let key = read_fixture("localhost.key");

        let handle = tokio::spawn(async move {
            let config = RustlsConfig::from_pem(certificate, key).await.unwrap();
            axum_server::from_tcp_rustls(listener, config)
                .serve(router.into_make_service())
                .await
                .unwrap();
        });

        Self {
            handle,
            socket,
            scheme: "https",
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("{}://localhost:{}/{}", self.scheme, self.socket.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct Payload {
    body: Mutex<Value>,
    failing: AtomicBool,
    hits: AtomicUsize,
}

/// A server answering with a JSON document that can be changed at any time.
///
/// Routes:
///
///  - `/data`: the current document, or a `500` while [failing](Self::set_failing).
///  - `/garbage`: a `200` with a body that is not JSON.
///  - `/status/:code`: an empty response with the given status.
#[derive(Debug)]
pub struct JsonServer {
    server: Server,
    payload: Arc<Payload>,
}

impl JsonServer {
    pub fn new(body: Value) -> Self {
        Self::start(body, Server::with_router)
    }

    /// Like [`new`](Self::new), but served over HTTPS, see [`Server::with_router_tls`].
    pub fn with_tls(body: Value) -> Self {
        Self::start(body, Server::with_router_tls)
    }

    fn start(body: Value, serve: impl FnOnce(Router) -> Server) -> Self {
        let payload = Arc::new(Payload {
            body: Mutex::new(body),
            failing: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route(
                "/data",
                get(|State(payload): State<Arc<Payload>>| async move {
                    payload.hits.fetch_add(1, Ordering::SeqCst);
                    if payload.failing.load(Ordering::SeqCst) {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    let body = payload.body.lock().unwrap().clone();
                    Ok(Json(body))
                }),
            )
            .route("/garbage", get(|| async { "this is not json" }))
            .route(
                "/status/:code",
                get(|extract::Path(code): extract::Path<u16>| async move {
                    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .with_state(Arc::clone(&payload));

        Self {
            server: serve(router),
            payload,
        }
    }

    /// Replaces the document served on `/data`.
    pub fn set_body(&self, body: Value) {
        *self.payload.body.lock().unwrap() = body;
    }

    /// Makes `/data` answer with a `500` while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.payload.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of requests to `/data` so far.
    pub fn hits(&self) -> usize {
        self.payload.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}
