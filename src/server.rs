// Server context and listeners. The context is explicit state threaded
// through every connection handler: options, the cancel registry, and the
// factory producing one backend session per client connection.

// Standard library imports
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

// External crate imports
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio::sync::Notify;

// Internal crate imports
use crate::backend::BackendSession;
use crate::client;
use crate::errors::Error;

/// How the server answers SSLRequest probes. The TLS transport itself is
/// provided by a fronting proxy; the server only negotiates the probe byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SslMode {
    Disable,
    Allow,
    Require,
    Enable,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub project: Option<String>,
    pub instance: Option<String>,
    pub default_database: Option<String>,
    pub port: u16,
    pub unix_socket_dir: Option<PathBuf>,
    /// Disable client authentication for local development.
    pub dev_mode: bool,
    pub ssl_mode: SslMode,
    /// Report unknown non-vendor settings as notices instead of errors.
    pub lenient_settings: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            project: None,
            instance: None,
            default_database: None,
            port: 5432,
            unix_socket_dir: None,
            dev_mode: false,
            ssl_mode: SslMode::Disable,
            lenient_settings: false,
        }
    }
}

/// Entry a connection registers so a CancelRequest can reach it. The notify
/// wakes the connection's single in-flight backend call, if any.
pub struct CancelHandle {
    pub secret: i32,
    pub cancel: Arc<Notify>,
}

/// connection_id → handle; used only by cancellation.
pub type ConnectionRegistry = Arc<Mutex<HashMap<i32, CancelHandle>>>;

/// Creates one backend session per accepted connection.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn BackendSession> + Send + Sync>;

pub struct ServerContext {
    pub options: ServerOptions,
    pub registry: ConnectionRegistry,
    pub backend_factory: BackendFactory,
}

impl ServerContext {
    pub fn new(options: ServerOptions, backend_factory: BackendFactory) -> ServerContext {
        ServerContext {
            options,
            registry: Arc::new(Mutex::new(HashMap::new())),
            backend_factory,
        }
    }
}

/// Serve one listener socket until shutdown. Each accepted connection runs
/// in its own task with its own backend session.
pub async fn serve_tcp(
    context: Arc<ServerContext>,
    listener: TcpListener,
    shutdown: broadcast::Sender<()>,
) -> Result<(), Error> {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TCP listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept error: {err:?}");
                        continue;
                    }
                };
                if let Err(err) = socket.set_nodelay(true) {
                    warn!("Could not set nodelay on client socket: {err:?}");
                }
                let context = context.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::task::spawn(async move {
                    let backend = (context.backend_factory)();
                    match client::handle_connection(socket, addr.to_string(), context, backend, shutdown_rx).await {
                        Ok(()) => info!("Client {addr} disconnected"),
                        Err(err) => warn!("Client {addr} disconnected with error: {err}"),
                    }
                });
            }
        }
    }
}

/// Serve the Unix-domain socket listener, same shape as TCP.
pub async fn serve_unix(
    context: Arc<ServerContext>,
    listener: UnixListener,
    shutdown: broadcast::Sender<()>,
) -> Result<(), Error> {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Unix listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept error on unix socket: {err:?}");
                        continue;
                    }
                };
                let context = context.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::task::spawn(async move {
                    let backend = (context.backend_factory)();
                    match client::handle_connection(socket, "unix".to_string(), context, backend, shutdown_rx).await {
                        Ok(()) => info!("Unix client disconnected"),
                        Err(err) => warn!("Unix client disconnected with error: {err}"),
                    }
                });
            }
        }
    }
}

/// The Unix-domain socket path PostgreSQL clients expect: `.s.PGSQL.<port>`
/// inside the configured directory.
pub fn unix_socket_path(dir: &std::path::Path, port: u16) -> PathBuf {
    dir.join(format!(".s.PGSQL.{port}"))
}
