//! Copies a shaped client connection to and from an upstream peer.

use std::io;
use std::sync::Arc;

use tcpshaper_common::ShaperError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::rate_limiting::{LimiterNode, ThrottledStream};

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by [relay] in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Forwards bytes both ways until both sides have closed.
///
/// Reads and writes on the client side are cut to the current burst of
/// its limiters, so a limit change mid-transfer doesn't break the
/// connection.
pub async fn relay<T, U>(client: ThrottledStream<T>, upstream: U) -> io::Result<RelayStats>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let read_limiter = client.read_limiter().clone();
    let write_limiter = client.write_limiter().clone();

    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let (client_to_upstream, upstream_to_client) = futures::future::try_join(
        pump(&mut client_rx, &mut upstream_tx, &read_limiter),
        pump(&mut upstream_rx, &mut client_tx, &write_limiter),
    )
    .await?;

    let stats = RelayStats {
        client_to_upstream,
        upstream_to_client,
    };
    debug!(?stats, "Relay finished");
    Ok(stats)
}

fn chunk_size(limiter: &LimiterNode) -> usize {
    usize::try_from(limiter.max_admissible())
        .unwrap_or(usize::MAX)
        .clamp(1, BUFFER_SIZE)
}

fn is_unsatisfiable(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::InvalidInput
        && matches!(
            error.get_ref().and_then(|e| e.downcast_ref::<ShaperError>()),
            Some(ShaperError::UnsatisfiableRequest { .. })
        )
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, limiter: &Arc<LimiterNode>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf[..chunk_size(limiter)]).await {
            Ok(0) => break,
            Ok(n) => n,
            // the burst shrank after the chunk was sized
            Err(e) if is_unsatisfiable(&e) => continue,
            Err(e) => return Err(e),
        };

        let mut written = 0;
        while written < n {
            let end = n.min(written + chunk_size(limiter));
            match writer.write(&buf[written..end]).await {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(k) => written += k,
                Err(e) if is_unsatisfiable(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        total += n as u64;
    }

    writer.shutdown().await?;
    Ok(total)
}
