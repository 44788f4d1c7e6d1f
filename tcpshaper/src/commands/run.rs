use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tcpshaper_core::relay::relay;
use tcpshaper_core::{Acceptor, ListenerRates, ThrottledAcceptor, ThrottledStream, WaitContext};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::*;

use crate::config::{load_config, watch_config};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(%version, "tcpshaper");

    let config = load_config(&cli.config)?;
    let rates = ListenerRates::from_config(&config.server, &config.connection);

    let listener = TcpListener::bind(*config.listen)
        .await
        .with_context(|| format!("Could not bind {}", config.listen))?;
    let context = WaitContext::new();
    let acceptor = ThrottledAcceptor::new(listener, rates.clone(), context.clone());

    if console::user_attended() {
        info!("--------------------------------------------");
        info!("tcpshaper is now running.");
        info!("Accepting connections on {}", config.listen);
        info!("Relaying to {}", config.upstream);
        info!("Server rates:     read {}, write {}", config.server.read, config.server.write);
        info!(
            "Connection rates: read {}, write {}",
            config.connection.read, config.connection.write
        );
        info!("--------------------------------------------");
    }

    let upstream: Arc<str> = config.upstream.as_str().into();

    tokio::spawn({
        let path = cli.config.clone();
        async move {
            if let Err(error) = watch_config(path, config, rates).await {
                error!(?error, "Config watcher stopped");
            }
        }
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                context.cancel();
            }
            Err(error) => error!(?error, "Failed to listen for ctrl-c"),
        }
    });

    serve(acceptor, upstream).await
}

/// Accepts until the acceptor's context is cancelled, relaying each
/// connection to `upstream` on its own task.
pub(crate) async fn serve<A>(mut acceptor: ThrottledAcceptor<A>, upstream: Arc<str>) -> Result<()>
where
    A: Acceptor,
    A::Io: 'static,
{
    let context = acceptor.context().clone();
    loop {
        tokio::select! {
            _ = context.cancellation_token().cancelled() => break,
            result = acceptor.accept() => match result {
                Ok((stream, remote_address)) => {
                    tokio::spawn(handle_connection(stream, remote_address, upstream.clone()));
                }
                Err(error) => {
                    error!(?error, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    acceptor.close();
    info!("Exiting");
    Ok(())
}

async fn handle_connection<T>(
    stream: ThrottledStream<T>,
    remote_address: SocketAddr,
    upstream: Arc<str>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!(%remote_address, "Connection accepted");

    let result = async {
        let upstream_stream = TcpStream::connect(&*upstream)
            .await
            .with_context(|| format!("Could not connect to {upstream}"))?;
        upstream_stream.set_nodelay(true)?;
        Ok::<_, anyhow::Error>(relay(stream, upstream_stream).await?)
    }
    .await;

    match result {
        Ok(stats) => info!(
            %remote_address,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "Connection closed"
        ),
        Err(error) => warn!(%remote_address, ?error, "Connection failed"),
    }
}
