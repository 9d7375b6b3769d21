//! Connection management.
//!
//! [`Connection::open`] dials eagerly through a custom connector that wraps
//! every socket in a `TrackedStream`. The wrapper publishes
//! [`ConnectivityState`] changes on a `watch` channel as sockets open and
//! drop, which is what [`Connection::close`] waits on.

use crate::error::{Error, Result};
use core::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::{Context, Poll},
    time::Duration,
};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::watch,
};
use tonic::{
    codegen::http::Uri,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity},
};

/// How long [`Connection::close`] waits for `Shutdown`.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// PEM-encoded TLS material.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsBundle {
    /// CA used to verify the server. Native roots are used when absent.
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub identity: Option<(Vec<u8>, Vec<u8>)>,
    /// Name checked against the server certificate, when it differs from the
    /// dialed host.
    pub server_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Security {
    #[default]
    Plaintext,
    Tls(TlsBundle),
}

/// Per-call message size ceilings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    pub max_send_message_size: usize,
    pub max_recv_message_size: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_send_message_size: i32::MAX as usize,
            max_recv_message_size: i32::MAX as usize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    pub security: Security,
    /// Overrides the `:authority` sent with each request.
    pub authority: Option<String>,
    pub dial_timeout: Duration,
    /// HTTP/2 ping interval; also used as the ping ack timeout.
    pub keepalive: Option<Duration>,
    pub call_options: Option<CallOptions>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            security: Security::Plaintext,
            authority: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive: None,
            call_options: None,
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    #[must_use]
    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.call_options = Some(options);
        self
    }
}

/// Shared between the connector and every socket it produced.
#[derive(Debug)]
struct Tracker {
    state: watch::Sender<ConnectivityState>,
    live: AtomicUsize,
    closing: AtomicBool,
}

impl Tracker {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Self {
            state,
            live: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        }
    }

    fn publish(&self, next: ConnectivityState) {
        self.state.send_if_modified(|state| {
            // Shutdown is terminal.
            if *state == ConnectivityState::Shutdown || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn connecting(&self) {
        if self.live.load(Ordering::Acquire) == 0 && !self.closing.load(Ordering::Acquire) {
            self.publish(ConnectivityState::Connecting);
        }
    }

    fn opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
        if !self.closing.load(Ordering::Acquire) {
            self.publish(ConnectivityState::Ready);
        }
    }

    fn failed(&self) {
        if self.live.load(Ordering::Acquire) == 0 && !self.closing.load(Ordering::Acquire) {
            self.publish(ConnectivityState::TransientFailure);
        }
    }

    fn dropped(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settle();
        }
    }

    /// With no sockets left: `Shutdown` once closing, `Idle` otherwise.
    fn settle(&self) {
        if self.live.load(Ordering::Acquire) > 0 {
            return;
        }
        if self.closing.load(Ordering::Acquire) {
            self.publish(ConnectivityState::Shutdown);
        } else {
            self.publish(ConnectivityState::Idle);
        }
    }
}

pin_project! {
    /// A TCP stream that reports its own drop to the connection's tracker.
    #[derive(Debug)]
    struct TrackedStream {
        #[pin]
        inner: TcpStream,
        tracker: Arc<Tracker>,
    }

    impl PinnedDrop for TrackedStream {
        fn drop(this: Pin<&mut Self>) {
            this.project().tracker.dropped();
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

async fn dial(
    uri: Uri,
    timeout: Duration,
    tracker: Arc<Tracker>,
) -> io::Result<TokioIo<TrackedStream>> {
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing host"))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });

    tracker.connecting();
    let connect = TcpStream::connect((host.as_str(), port));
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracker.failed();
            return Err(e);
        }
        Err(_) => {
            tracker.failed();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out"));
        }
    };
    stream.set_nodelay(true)?;

    tracker.opened();
    Ok(TokioIo::new(TrackedStream {
        inner: stream,
        tracker,
    }))
}

/// An open channel plus the state needed to close it cleanly.
#[derive(Debug)]
pub struct Connection {
    host: String,
    channel: Channel,
    tracker: Arc<Tracker>,
    call_options: CallOptions,
}

impl Connection {
    /// Dials `host` (`host:port`, or a full `http(s)://` URI) and waits for
    /// the first connection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a malformed host, authority, or TLS
    /// material; [`Error::DialTimeout`] when `dial_timeout` elapses;
    /// [`Error::Unreachable`] when the connection is refused or the
    /// handshake fails.
    pub async fn open(host: &str, options: &TransportOptions) -> Result<Self> {
        let scheme = match options.security {
            Security::Plaintext => "http",
            Security::Tls(_) => "https",
        };
        let uri = if host.contains("://") {
            host.to_string()
        } else {
            format!("{scheme}://{host}")
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| Error::InvalidConfig(format!("host `{host}`: {e}")))?;

        if let Some(authority) = &options.authority {
            let origin: Uri = format!("{scheme}://{authority}")
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("authority `{authority}`: {e}")))?;
            endpoint = endpoint.origin(origin);
        }

        if let Some(interval) = options.keepalive {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_timeout(interval);
        }

        if let Security::Tls(bundle) = &options.security {
            endpoint = endpoint
                .tls_config(tls_config(bundle))
                .map_err(|e| Error::InvalidConfig(format!("tls: {e}")))?;
        }

        let tracker = Arc::new(Tracker::new());
        let dial_timeout = options.dial_timeout;
        let connector = {
            let tracker = Arc::clone(&tracker);
            tower::service_fn(move |uri: Uri| dial(uri, dial_timeout, Arc::clone(&tracker)))
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("Dialing {} (timeout {:?})", host, dial_timeout);

        let channel = match tokio::time::timeout(
            dial_timeout,
            endpoint.connect_with_connector(connector),
        )
        .await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(classify(host, dial_timeout, &e)),
            Err(_) => {
                return Err(Error::DialTimeout {
                    host: host.to_string(),
                    timeout: dial_timeout,
                });
            }
        };

        Ok(Self {
            host: host.to_string(),
            channel,
            tracker,
            call_options: options.call_options.unwrap_or_default(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A handle to the shared channel; clones multiplex over one connection.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tracker.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectivityState> {
        self.tracker.state.subscribe()
    }

    pub fn call_options(&self) -> CallOptions {
        self.call_options
    }

    /// Drops this handle's channel and waits until every socket is gone and
    /// the state is `Shutdown`, or [`CLOSE_TIMEOUT`] elapses. Returns the
    /// state the wait ended in.
    ///
    /// Channels cloned out of this connection keep their sockets alive; drop
    /// them first.
    pub async fn close(self) -> ConnectivityState {
        let Self {
            host: _host,
            channel,
            tracker,
            ..
        } = self;

        let mut states = tracker.state.subscribe();
        tracker.closing.store(true, Ordering::Release);
        drop(channel);
        tracker.settle();

        let reached = matches!(
            tokio::time::timeout(
                CLOSE_TIMEOUT,
                states.wait_for(|s| *s == ConnectivityState::Shutdown),
            )
            .await,
            Ok(Ok(_))
        );

        let state = *tracker.state.borrow();
        if !reached {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Connection to {} still {} after {:?}",
                _host,
                state,
                CLOSE_TIMEOUT
            );
        }
        state
    }
}

fn tls_config(bundle: &TlsBundle) -> ClientTlsConfig {
    let mut tls = ClientTlsConfig::new();
    tls = match &bundle.ca_pem {
        Some(ca) => tls.ca_certificate(Certificate::from_pem(ca)),
        None => tls.with_native_roots(),
    };
    if let Some((cert, key)) = &bundle.identity {
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    if let Some(name) = &bundle.server_name {
        tls = tls.domain_name(name.clone());
    }
    tls
}

/// Sorts a dial failure into timeout versus everything else by walking the
/// source chain for a timed-out I/O error.
fn classify(host: &str, timeout: Duration, err: &tonic::transport::Error) -> Error {
    let mut reason = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let timed_out = cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::TimedOut);
        if timed_out {
            return Error::DialTimeout {
                host: host.to_string(),
                timeout,
            };
        }
        reason = format!("{reason}: {cause}");
        source = cause.source();
    }
    Error::Unreachable {
        host: host.to_string(),
        reason,
    }
}
