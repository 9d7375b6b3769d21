#![doc = include_str!("../README.md")]

mod service;

pub use service::{
    ECHO_HEADER, FAIL_NAME, GreeterService, SERVER_HEADER, SERVER_NAME, Stats, StatsSnapshot,
};

use core::net::SocketAddr;
use proto::greeter_server::GreeterServer;
use std::sync::Arc;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;

pub mod proto {
    tonic::include_proto!("helloworld");

    /// Encoded `FileDescriptorSet` for `greeter.proto`.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("greeter_descriptor");
}

/// Directory holding `greeter.proto`, usable as an import path.
pub const PROTO_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/proto");

/// Path to `greeter.proto`.
pub const PROTO_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/proto/greeter.proto");

/// A running Greeter server with reflection and health.
///
/// Dropping the handle leaves the server running until the runtime shuts
/// down; call [`TestServer::shutdown`] to stop it deterministically.
pub struct TestServer {
    addr: SocketAddr,
    stats: Arc<Stats>,
    health: HealthReporter,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl TestServer {
    /// Starts a server on an ephemeral localhost port.
    pub async fn start() -> anyhow::Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let incoming = TcpListenerStream::new(listener);

        let stats = Arc::new(Stats::default());
        let service = GreeterService::new(Arc::clone(&stats));

        let (health, health_service) = tonic_health::server::health_reporter();
        health
            .set_serving::<GreeterServer<GreeterService>>()
            .await;

        let reflection = Builder::configure()
            .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(health_service)
                .add_service(reflection)
                .add_service(GreeterServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move { signal.cancelled().await })
                .await
        });

        #[cfg(feature = "tracing")]
        tracing::info!("Greeter listening on {}", addr);

        Ok(Self {
            addr,
            stats,
            health,
            shutdown,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form accepted by `rpcprobe`.
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Marks the service as not serving, then stops accepting connections and
    /// waits for in-flight calls to finish.
    pub async fn shutdown(self) {
        self.health
            .set_not_serving::<GreeterServer<GreeterService>>()
            .await;
        self.shutdown.cancel();

        if let Ok(Err(_e)) = self.handle.await {
            #[cfg(feature = "tracing")]
            tracing::error!("Greeter server exited with error: {:?}", _e);
        }
    }
}
