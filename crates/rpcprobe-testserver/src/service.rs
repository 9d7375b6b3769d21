//! `helloworld.Greeter` implementation.
//!
//! Every method counts what it receives and sends in a shared [`Stats`] so
//! tests can assert on what actually crossed the wire, not just on what the
//! client reports.

use crate::proto::{HelloReply, HelloRequest, greeter_server::Greeter};
use core::{pin::Pin, time::Duration};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{
    Request, Response, Status, Streaming,
    metadata::{MetadataMap, MetadataValue},
};

/// A request with this name makes the streaming methods fail.
pub const FAIL_NAME: &str = "error";

/// Response header set on every reply.
pub const SERVER_HEADER: &str = "x-served-by";
pub const SERVER_NAME: &str = "rpcprobe-testserver";

/// Request header copied back into the response headers.
pub const ECHO_HEADER: &str = "x-echo";

/// Delay between replies of an endless `SayHellos` stream.
const ENDLESS_INTERVAL: Duration = Duration::from_millis(5);

const STREAM_BUFFER: usize = 4;

#[derive(Debug, Default)]
pub struct Stats {
    calls: AtomicU64,
    unary_received: AtomicU64,
    server_stream_sent: AtomicU64,
    client_stream_received: AtomicU64,
    bidi_received: AtomicU64,
    bidi_sent: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub unary_received: u64,
    pub server_stream_sent: u64,
    pub client_stream_received: u64,
    pub bidi_received: u64,
    pub bidi_sent: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            unary_received: self.unary_received.load(Ordering::Relaxed),
            server_stream_sent: self.server_stream_sent.load(Ordering::Relaxed),
            client_stream_received: self.client_stream_received.load(Ordering::Relaxed),
            bidi_received: self.bidi_received.load(Ordering::Relaxed),
            bidi_sent: self.bidi_sent.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, Default)]
pub struct GreeterService {
    stats: Arc<Stats>,
}

impl GreeterService {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }
}

fn reply(message: String, count: u32) -> HelloReply {
    HelloReply { message, count }
}

/// Wraps `body` in a response carrying the server header and, when present,
/// the echoed request header.
fn respond<T>(request: &MetadataMap, body: T) -> Response<T> {
    let mut response = Response::new(body);
    let headers = response.metadata_mut();
    headers.insert(SERVER_HEADER, MetadataValue::from_static(SERVER_NAME));
    if let Some(echo) = request.get(ECHO_HEADER) {
        headers.insert(ECHO_HEADER, echo.clone());
    }
    response
}

#[tonic::async_trait]
impl Greeter for GreeterService {
    type SayHellosStream = Pin<Box<dyn Stream<Item = Result<HelloReply, Status>> + Send>>;
    type SayHelloBidiStream = Pin<Box<dyn Stream<Item = Result<HelloReply, Status>> + Send>>;

    async fn say_hello(&self, req: Request<HelloRequest>) -> Result<Response<HelloReply>, Status> {
        Stats::bump(&self.stats.calls);
        Stats::bump(&self.stats.unary_received);

        let HelloRequest { name, count } = req.get_ref().clone();
        if count > 0 {
            tokio::time::sleep(Duration::from_millis(count.into())).await;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("SayHello from {}", name);

        Ok(respond(req.metadata(), reply(format!("Hello {name}"), 1)))
    }

    async fn say_hellos(
        &self,
        req: Request<HelloRequest>,
    ) -> Result<Response<Self::SayHellosStream>, Status> {
        Stats::bump(&self.stats.calls);

        let metadata = req.metadata().clone();
        let HelloRequest { name, count } = req.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut sent = 0u32;
            while count == 0 || sent < count {
                sent += 1;
                if tx
                    .send(Ok(reply(format!("Hello {name} #{sent}"), sent)))
                    .await
                    .is_err()
                {
                    // Client went away
                    break;
                }
                Stats::bump(&stats.server_stream_sent);

                if name == FAIL_NAME {
                    let _ = tx.send(Err(Status::internal("forced failure"))).await;
                    break;
                }
                if count == 0 {
                    tokio::time::sleep(ENDLESS_INTERVAL).await;
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("SayHellos finished after {} replies", sent);
        });

        let stream: Self::SayHellosStream = Box::pin(ReceiverStream::new(rx));
        Ok(respond(&metadata, stream))
    }

    async fn say_hello_cs(
        &self,
        req: Request<Streaming<HelloRequest>>,
    ) -> Result<Response<HelloReply>, Status> {
        Stats::bump(&self.stats.calls);

        let metadata = req.metadata().clone();
        let mut inbound = req.into_inner();
        let mut names = Vec::new();
        while let Some(msg) = inbound.message().await? {
            Stats::bump(&self.stats.client_stream_received);
            if msg.name == FAIL_NAME {
                return Err(Status::invalid_argument("forced failure"));
            }
            names.push(msg.name);
        }

        let count = u32::try_from(names.len()).unwrap_or(u32::MAX);
        Ok(respond(
            &metadata,
            reply(format!("Hello {}", names.join(", ")), count),
        ))
    }

    async fn say_hello_bidi(
        &self,
        req: Request<Streaming<HelloRequest>>,
    ) -> Result<Response<Self::SayHelloBidiStream>, Status> {
        Stats::bump(&self.stats.calls);

        let metadata = req.metadata().clone();
        let mut inbound = req.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut seen = 0u32;
            while let Ok(Some(msg)) = inbound.message().await {
                Stats::bump(&stats.bidi_received);
                seen += 1;

                let failed = msg.name == FAIL_NAME;
                let item = if failed {
                    Err(Status::internal("forced failure"))
                } else {
                    Ok(reply(format!("Hello {}", msg.name), seen))
                };
                if tx.send(item).await.is_err() || failed {
                    break;
                }
                Stats::bump(&stats.bidi_sent);
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("SayHelloBidi finished after {} requests", seen);
        });

        let stream: Self::SayHelloBidiStream = Box::pin(ReceiverStream::new(rx));
        Ok(respond(&metadata, stream))
    }
}
