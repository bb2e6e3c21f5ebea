#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, UnixListener};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::broadcast;

use pg_bridge::backend::memory::MemoryBackend;
use pg_bridge::server::{
    serve_tcp, serve_unix, unix_socket_path, ServerContext, ServerOptions, SslMode,
};
use pg_bridge::{cmd_args, logger, VERSION};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cmd_args::parse();
    logger::init(&args);

    info!("Welcome to pg_bridge! (Version {VERSION})");

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let options = ServerOptions {
        project: args.project.clone(),
        instance: args.instance.clone(),
        default_database: args.database.clone(),
        port: args.port,
        unix_socket_dir: args.unix_socket_dir.clone(),
        dev_mode: args.disable_auth,
        ssl_mode: args.ssl,
        lenient_settings: args.lenient_settings,
    };

    if let (Some(project), Some(instance)) = (&options.project, &options.instance) {
        info!("Configured for project {project}, instance {instance}");
    }
    if options.ssl_mode == SslMode::Enable || options.ssl_mode == SslMode::Require {
        warn!("TLS transport is expected to be terminated by a fronting proxy");
    }
    if !options.dev_mode {
        info!("Client authentication is enabled; clients must send a password");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-pg-bridge")
        .build()?;

    runtime.block_on(async move {
        let context = Arc::new(ServerContext::new(
            options,
            Arc::new(|| Box::new(MemoryBackend::new()) as Box<dyn pg_bridge::backend::BackendSession>),
        ));

        let addr = format!("0.0.0.0:{}", context.options.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("Listener socket error on {addr}: {err:?}");
                process::exit(1);
            }
        };
        info!("Running on {addr}");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let tcp_task = tokio::task::spawn(serve_tcp(
            context.clone(),
            listener,
            shutdown_tx.clone(),
        ));

        let mut unix_path = None;
        let mut unix_task = None;
        if let Some(dir) = context.options.unix_socket_dir.clone() {
            let path = unix_socket_path(&dir, context.options.port);
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&path);
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    info!("Listening on unix socket {}", path.display());
                    unix_task = Some(tokio::task::spawn(serve_unix(
                        context.clone(),
                        listener,
                        shutdown_tx.clone(),
                    )));
                    unix_path = Some(path);
                }
                Err(err) => {
                    error!("Unix socket error on {}: {err:?}", path.display());
                    process::exit(1);
                }
            }
        }

        info!("Waiting for dear clients");

        let mut term_signal = unix_signal(SignalKind::terminate()).unwrap();
        let mut interrupt_signal = unix_signal(SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = term_signal.recv() => info!("Got SIGTERM, shutting down"),
            _ = interrupt_signal.recv() => info!("Got SIGINT, shutting down"),
        }

        let _ = shutdown_tx.send(());
        // Give connection tasks a moment to write their goodbyes.
        let _ = tokio::time::timeout(Duration::from_secs(1), tcp_task).await;
        if let Some(task) = unix_task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if let Some(path) = unix_path {
            let _ = std::fs::remove_file(path);
        }
        info!("Shutting down...");
    });

    Ok(())
}
