use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tcpshaper_common::DirectionalRates;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::context::WaitContext;
use super::limiter::LimiterNode;
use super::setting::RateSetting;
use super::stream::ThrottledStream;

/// Source of incoming connections that can be wrapped by a [ThrottledAcceptor]
#[async_trait]
pub trait Acceptor: Send {
    type Io: AsyncRead + AsyncWrite + Unpin + Send;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// The four knobs of a shaped listener. The server settings drive the
/// shared budgets, the connection settings are used for every connection's
/// own budget.
#[derive(Clone, Debug)]
pub struct ListenerRates {
    pub read_server: Arc<RateSetting>,
    pub write_server: Arc<RateSetting>,
    pub read_connection: Arc<RateSetting>,
    pub write_connection: Arc<RateSetting>,
}

impl ListenerRates {
    /// Uses the same setting for all four budgets
    pub fn uniform(setting: Arc<RateSetting>) -> Self {
        Self {
            read_server: setting.clone(),
            write_server: setting.clone(),
            read_connection: setting.clone(),
            write_connection: setting,
        }
    }

    pub fn from_config(server: &DirectionalRates, connection: &DirectionalRates) -> Self {
        Self {
            read_server: Arc::new(RateSetting::from(&server.read)),
            write_server: Arc::new(RateSetting::from(&server.write)),
            read_connection: Arc::new(RateSetting::from(&connection.read)),
            write_connection: Arc::new(RateSetting::from(&connection.write)),
        }
    }

    /// Pushes new values into the live settings. Open connections pick
    /// them up on their next read or write.
    pub fn apply(&self, server: &DirectionalRates, connection: &DirectionalRates) {
        self.read_server.apply(&server.read);
        self.write_server.apply(&server.write);
        self.read_connection.apply(&connection.read);
        self.write_connection.apply(&connection.write);
    }
}

/// Wraps an [Acceptor] so that every accepted connection is a
/// [ThrottledStream] limited by both the server-wide and its own budget.
pub struct ThrottledAcceptor<A> {
    inner: Option<A>,
    rates: ListenerRates,
    read_root: Arc<LimiterNode>,
    write_root: Arc<LimiterNode>,
    context: WaitContext,
}

impl<A: Acceptor> ThrottledAcceptor<A> {
    pub fn new(inner: A, rates: ListenerRates, context: WaitContext) -> Self {
        Self {
            inner: Some(inner),
            read_root: LimiterNode::root(rates.read_server.clone()),
            write_root: LimiterNode::root(rates.write_server.clone()),
            rates,
            context,
        }
    }

    pub async fn accept(&mut self) -> io::Result<(ThrottledStream<A::Io>, SocketAddr)> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(closed());
        };
        let (stream, remote_address) = inner.accept().await?;

        let read = self.read_root.child(self.rates.read_connection.clone());
        let write = self.write_root.child(self.rates.write_connection.clone());
        debug!(%remote_address, "Accepted shaped connection");

        Ok((
            ThrottledStream::new(stream, read, write, self.context.child()),
            remote_address,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.as_ref().ok_or_else(closed)?.local_addr()
    }

    /// Stops accepting. Connections handed out earlier stay open.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn rates(&self) -> &ListenerRates {
        &self.rates
    }

    pub fn read_root(&self) -> &Arc<LimiterNode> {
        &self.read_root
    }

    pub fn write_root(&self) -> &Arc<LimiterNode> {
        &self.write_root
    }

    pub fn context(&self) -> &WaitContext {
        &self.context
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "acceptor is closed")
}
