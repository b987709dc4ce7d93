mod app;
mod config;
mod identity;
mod logging;
mod metrics;
mod router;
mod server;
mod shutdown;
mod store;
mod wire;
mod worker;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use app::Application;
use config::AppConfig;
use logging::{LogLevel, Logger, LoggerConfig};
use metrics::Metrics;
use router::LocalRouter;
use server::{LimitListener, LimitedConn};
use worker::{Connection, Worker};

// Sleep applied after a temporary accept refusal before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() {
    let app_config = load_config_or_exit();
    let log_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let store = store::open_store(&app_config.storage, &logger).unwrap_or_else(|error| {
        eprintln!("storage startup error: {error}");
        process::exit(2);
    });
    // No external collector is wired in; counters and timers are dropped.
    let metrics = Arc::new(Metrics::default());
    let push_router: Arc<dyn router::Router> = Arc::new(LocalRouter::new(&app_config.router));
    let application = Arc::new(Application::new(
        Arc::clone(&logger),
        metrics,
        store,
        push_router,
        &app_config.client,
    ));

    let keep_alive = Duration::from_secs(app_config.server.keep_alive_secs);
    let address = bind_address(&app_config);
    let (listener, tls_acceptor) = if app_config.server.tls_enabled {
        match server::listen_tls(
            &address,
            &app_config.server.cert_file,
            &app_config.server.key_file,
            app_config.server.max_conns,
            keep_alive,
        )
        .await
        {
            Ok((listener, acceptor)) => (listener, Some(acceptor)),
            Err(error) => {
                eprintln!("server startup error: {error}");
                process::exit(2);
            }
        }
    } else {
        match server::listen(&address, app_config.server.max_conns, keep_alive).await {
            Ok(listener) => (listener, None),
            Err(error) => {
                eprintln!("server startup error: {error}");
                process::exit(2);
            }
        }
    };

    let bound = listener.local_addr();
    let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
    let hostname = if app_config.server.host == "0.0.0.0" {
        ""
    } else {
        app_config.server.host.as_str()
    };
    let (advertised_host, advertised_port) = server::host_port(&bound, hostname);
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} (build {}) accepting WebSocket clients",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("SIMPLEPUSH_BUILD_DATE_UTC")
        ),
        Some(json!({
            "bind_address": bound.to_string(),
            "endpoint": server::canonical_url(scheme, &advertised_host, &advertised_port),
            "max_conns": app_config.server.max_conns,
            "keep_alive_secs": app_config.server.keep_alive_secs,
            "storage_engine": app_config.storage.engine,
        })),
    );

    serve(listener, tls_acceptor, Arc::clone(&application)).await;
    logger.info(Some("main"), "Shutdown complete");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn bind_address(app_config: &AppConfig) -> String {
    format!("{}:{}", app_config.server.host, app_config.server.port)
}

// Accept loop: admitted sockets are handed to their own worker task;
// temporary refusals back off, permanent failures end the loop.
async fn serve(listener: LimitListener, tls_acceptor: Option<TlsAcceptor>, app: Arc<Application>) {
    let shutdown = shutdown::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                app.logger().info(
                    Some("main::server"),
                    "Shutdown signal received, closing listener",
                );
                listener.close().await;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let app = Arc::clone(&app);
                    let tls_acceptor = tls_acceptor.clone();
                    tokio::spawn(handle_connection(app, tls_acceptor, conn));
                }
                Err(error) if error.is_temporary() => {
                    app.logger().warn(
                        Some("main::server"),
                        &format!("accept refused: {error}; backing off"),
                    );
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(error) => {
                    app.logger().error(
                        Some("main::server"),
                        &format!("accept failed: {error}; stopping accept loop"),
                    );
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    app: Arc<Application>,
    tls_acceptor: Option<TlsAcceptor>,
    conn: LimitedConn,
) {
    let peer = conn.peer_addr().to_string();
    let rid = identity::generate().unwrap_or_else(|_| "unassigned".to_owned());

    match tls_acceptor {
        Some(acceptor) => match acceptor.accept(conn).await {
            Ok(stream) => drive_worker(app, stream, peer, rid).await,
            Err(error) => app.logger().warn(
                Some("main::server"),
                &format!("TLS handshake failed for {peer}: {error}"),
            ),
        },
        None => drive_worker(app, conn, peer, rid).await,
    }
}

async fn drive_worker<S>(app: Arc<Application>, stream: S, peer: String, rid: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => {
            if app.logger().should_log(LogLevel::Debug) {
                app.logger().log(
                    LogLevel::Debug,
                    Some("main::server"),
                    "WebSocket connection established",
                    Some(json!({"rid": rid, "peer": peer})),
                );
            }
            let connection = Connection::new(ws, peer);
            Worker::new(app, rid).run(connection).await;
        }
        Err(error) => {
            app.logger().warn(
                Some("main::server"),
                &format!("WebSocket handshake failed for {peer}: {error}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;

    use super::bind_address;

    #[test]
    fn bind_address_joins_configured_host_and_port() {
        let mut app_config = AppConfig::default();
        app_config.server.host = "127.0.0.1".to_owned();
        app_config.server.port = 9443;

        assert_eq!(bind_address(&app_config), "127.0.0.1:9443");
    }
}
