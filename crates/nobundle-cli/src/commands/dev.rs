//! `nobundle dev` command implementation.
//!
//! ## Architecture
//!
//! ```text
//! Browser requests GET /src/App.vue
//!   → DevServer::handle (resolve → load → compile → rewrite)
//!   → application/javascript
//!
//! File watcher (notify, own thread)
//!   → coalesce events for `watch.debounceMs`
//!   → HmrCoordinator::handle_changes
//!   → broadcast → every /__hmr WebSocket
//! ```
//!
//! Anything `DevServer` does not handle is served from the root by
//! tower-http's `ServeDir`.

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use miette::{IntoDiagnostic, Result};
use nobundle_core::config::{load_config, DevConfig};
use nobundle_core::dev::client::HMR_SOCKET_PATH;
use nobundle_core::dev::{DevServer, Request as DevRequest, Response as DevResponse, UpdateMessage};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Directories never watched.
const ALWAYS_IGNORED: &[&str] = &["node_modules", ".git"];

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Project root.
    pub root: PathBuf,
    /// Port to listen on (CLI override).
    pub port: Option<u16>,
    /// Host to bind to (CLI override).
    pub host: Option<String>,
    /// Open browser automatically.
    pub open: bool,
    /// Explicit config file path (overrides auto-discovery).
    pub config: Option<PathBuf>,
}

/// Shared server state.
struct DevState {
    server: DevServer,
    static_files: ServeDir,
}

type AppState = Arc<DevState>;

/// Run the dev server.
pub async fn run(action: DevAction) -> Result<()> {
    let root = action.root.canonicalize().into_diagnostic()?;

    let mut config = match load_config(&root, action.config.as_deref()) {
        Ok(Some((config_path, config))) => {
            let rel_path = config_path.strip_prefix(&root).unwrap_or(&config_path);
            println!("  Loaded config from {}", rel_path.display());
            config
        }
        Ok(None) => DevConfig::new(root.clone()),
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults");
            DevConfig::new(root.clone())
        }
    };

    // CLI flags override the config file
    if let Some(port) = action.port {
        config.server.port = port;
    }
    if let Some(host) = action.host {
        config.server.host = host;
    }
    config.server.open |= action.open;

    let server = DevServer::new(config.clone()).into_diagnostic()?;
    let state = Arc::new(DevState {
        server,
        static_files: ServeDir::new(&root),
    });

    // Set up file watcher
    let (change_tx, mut change_rx) = mpsc::channel::<Vec<PathBuf>>(16);
    let watch_root = root.clone();
    let ignore: Vec<String> = ALWAYS_IGNORED
        .iter()
        .map(|s| (*s).to_string())
        .chain(config.watch.ignore.iter().cloned())
        .collect();
    let debounce = Duration::from_millis(config.watch.debounce_ms);
    std::thread::spawn(move || {
        if let Err(e) = watch_files(&watch_root, &ignore, debounce, &change_tx) {
            warn!(error = %e, "file watcher stopped");
        }
    });

    // Spawn file change handler
    let change_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(batch) = change_rx.recv().await {
            for file in &batch {
                info!(
                    file = %file.strip_prefix(change_state.server.root()).unwrap_or(file).display(),
                    "file changed"
                );
            }
            change_state.server.hmr().handle_changes(&batch).await;
        }
    });

    let app = Router::new()
        .route(HMR_SOCKET_PATH, get(hmr_websocket))
        .fallback(serve)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let host_ip = if config.server.host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        config.server.host.clone()
    };
    let addr: SocketAddr = format!("{}:{}", host_ip, config.server.port)
        .parse()
        .into_diagnostic()?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;

    println!();
    println!(
        "  Dev server running at http://{}:{}",
        config.server.host, config.server.port
    );
    println!("  Hot Module Replacement enabled");
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    if config.server.open {
        let url = format!("http://{}:{}", config.server.host, config.server.port);
        if let Err(e) = open_browser(&url) {
            warn!(error = %e, "failed to open browser");
        }
    }

    axum::serve(listener, app).await.into_diagnostic()?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Serve every non-WebSocket request.
async fn serve(State(state): State<AppState>, request: Request) -> Response {
    let url = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());

    let mut dev_request = DevRequest::new(url);
    dev_request.is_import = is_module_fetch(request.headers());
    dev_request.referer = referer_path(request.headers());

    match state.server.handle(&dev_request).await {
        DevResponse::Content { content_type, body } => (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response(),
        DevResponse::Redirect { location } => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        DevResponse::NotFound { message } => (StatusCode::NOT_FOUND, message).into_response(),
        DevResponse::Static => serve_static(&state, request).await,
    }
}

async fn serve_static(state: &DevState, request: Request) -> Response {
    let mut files = state.static_files.clone();
    match files.try_call(request).await {
        Ok(response) => response.map(Body::new),
        Err(err) => {
            warn!(error = %err, "failed to serve static file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Whether the browser is fetching the resource as a module script.
///
/// `Sec-Fetch-Dest` decides when present; otherwise an `Accept` header
/// asking for CSS or HTML means this is not an import.
fn is_module_fetch(headers: &HeaderMap) -> bool {
    if let Some(dest) = headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
    {
        return matches!(dest, "script" | "worker" | "sharedworker" | "empty");
    }
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    !(accept.contains("text/css") || accept.contains("text/html"))
}

/// Path part of the `Referer` header.
fn referer_path(headers: &HeaderMap) -> Option<String> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    let after_scheme = referer.split_once("://").map_or(referer, |(_, rest)| rest);
    let path = after_scheme.find('/').map_or("/", |idx| &after_scheme[idx..]);
    Some(path.to_string())
}

// ============================================================================
// WebSocket HMR
// ============================================================================

/// Handle WebSocket connections for HMR.
async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.server.hmr().subscribe();
    ws.on_upgrade(move |socket| handle_hmr_socket(socket, rx))
}

/// Forward broadcast updates to one client until either side closes.
async fn handle_hmr_socket(socket: WebSocket, mut rx: broadcast::Receiver<UpdateMessage>) {
    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(UpdateMessage::Connected.to_json()))
        .await
        .is_err()
    {
        return;
    }

    let mut forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if sender.send(Message::Text(msg.to_json())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hmr client lagging, dropped updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // The client never sends anything we act on; drain until it closes.
    let mut drain = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut forward => drain.abort(),
        _ = &mut drain => forward.abort(),
    }
    debug!("hmr client disconnected");
}

// ============================================================================
// File Watching
// ============================================================================

/// Check if a path should be ignored by the file watcher.
fn should_ignore(root: &Path, path: &Path, ignore: &[String]) -> bool {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        ignore.iter().any(|ignored| *ignored == name)
    })
}

/// Watch `root` and send coalesced, deduplicated batches of changed files.
///
/// A batch is flushed once no new event arrived for `debounce`.
fn watch_files(
    root: &Path,
    ignore: &[String],
    debounce: Duration,
    change_tx: &mpsc::Sender<Vec<PathBuf>>,
) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut watcher = RecommendedWatcher::new(tx, Config::default()).into_diagnostic()?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .into_diagnostic()?;

    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

    loop {
        let next = if pending.is_empty() {
            rx.recv().map_err(|_| ())
        } else {
            match rx.recv_timeout(debounce) {
                Ok(event) => Ok(event),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    let batch: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                    if change_tx.blocking_send(batch).is_err() {
                        break;
                    }
                    continue;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(()),
            }
        };

        match next {
            Ok(Ok(event)) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                pending.extend(
                    event
                        .paths
                        .into_iter()
                        .filter(|p| !should_ignore(root, p, ignore)),
                );
            }
            Ok(Err(e)) => warn!(error = %e, "watch error"),
            Err(()) => break,
        }
    }

    Ok(())
}

// ============================================================================
// Utilities
// ============================================================================

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}
