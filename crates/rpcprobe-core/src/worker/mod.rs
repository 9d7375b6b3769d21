//! Streaming workers.
//!
//! A [`Worker`] executes one call at a time against a resolved method. The
//! call shape decides the protocol:
//!
//! - unary: one send, one receive.
//! - client streaming: a send loop, then one close-and-receive.
//! - server streaming: one send, then a receive loop.
//! - bidi: send and receive loops joined; the send side half-closes when
//!   the stream ends.
//!
//! Streams end on provider signals, [`StreamOptions`] bounds, a receive
//! interceptor, or [`StopHandle::stop`]. Only the last one leaves the worker
//! in [`WorkerState::Cancelled`]; the others count as completion.

mod bidi;
mod client_stream;
mod provider;
mod server_stream;
mod timer;
mod unary;

pub use provider::{
    MessageList, MessageProvider, RecvAction, RecvInterceptor, StreamMessage, TemplateProvider,
};

use crate::{
    calldata::CallData,
    codec::DynamicCodec,
    config::StreamOptions,
    descriptor::{CallKind, MethodDescriptor},
    error::{Error, Result},
    transport::{CallOptions, Connection},
};
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use prost_reflect::DynamicMessage;
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{
    Request, Status,
    client::Grpc,
    codegen::http::uri::PathAndQuery,
    metadata::MetadataMap,
    transport::Channel,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug)]
struct StopSlot {
    active: AtomicBool,
    token: Mutex<CancellationToken>,
}

/// Stops the owning worker's current call from another task.
#[derive(Clone, Debug)]
pub struct StopHandle {
    slot: Arc<StopSlot>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self {
            slot: Arc::new(StopSlot {
                active: AtomicBool::new(false),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }
}

impl StopHandle {
    /// Cancels the running call. Returns `false`, doing nothing, when no call
    /// is running.
    pub fn stop(&self) -> bool {
        if !self.slot.active.load(Ordering::Acquire) {
            return false;
        }
        self.slot.token.lock().cancel();
        true
    }

    pub fn is_active(&self) -> bool {
        self.slot.active.load(Ordering::Acquire)
    }

    /// Installs a fresh token for the next call and marks it active.
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot.token.lock() = token.clone();
        self.slot.active.store(true, Ordering::Release);
        token
    }

    fn disarm(&self) {
        self.slot.active.store(false, Ordering::Release);
    }
}

/// Outbound messages for one run.
pub enum CallInput {
    Messages(Vec<DynamicMessage>),
    Provider(Box<dyn MessageProvider + Send>),
}

impl CallInput {
    pub fn messages(messages: impl IntoIterator<Item = DynamicMessage>) -> Self {
        CallInput::Messages(messages.into_iter().collect())
    }

    pub fn provider(provider: impl MessageProvider + Send + 'static) -> Self {
        CallInput::Provider(Box::new(provider))
    }

    fn into_provider(self) -> Result<Box<dyn MessageProvider + Send>> {
        match self {
            CallInput::Messages(messages) if messages.is_empty() => Err(Error::NoData),
            CallInput::Messages(messages) => Ok(Box::new(MessageList::new(messages))),
            CallInput::Provider(provider) => Ok(provider),
        }
    }
}

impl core::fmt::Debug for CallInput {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CallInput::Messages(messages) => f.debug_tuple("Messages").field(messages).finish(),
            CallInput::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// Result of one run.
#[derive(Clone, Debug)]
pub struct CallReport {
    pub state: WorkerState,
    pub sent: u64,
    pub received: u64,
    /// Last message received, if any.
    pub response: Option<DynamicMessage>,
    /// Response headers.
    pub metadata: MetadataMap,
    pub elapsed: Duration,
}

/// What a shape-specific driver produced.
#[derive(Debug, Default)]
struct Outcome {
    sent: u64,
    received: u64,
    response: Option<DynamicMessage>,
    metadata: MetadataMap,
}

/// Everything a shape-specific driver needs for one call.
struct Call<'a> {
    grpc: Grpc<Channel>,
    path: PathAndQuery,
    codec: DynamicCodec,
    data: CallData,
    provider: &'a mut (dyn MessageProvider + Send),
    interceptor: Option<&'a mut (dyn RecvInterceptor + Send + 'static)>,
    options: StreamOptions,
    metadata: MetadataMap,
    /// Explicit stop. Stream bounds use child tokens of this one.
    stop: CancellationToken,
}

fn request<T>(message: T, metadata: &MetadataMap) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = metadata.clone();
    request
}

fn first_message(
    provider: &mut (dyn MessageProvider + Send),
    data: &CallData,
) -> Result<DynamicMessage> {
    match provider.next_message(data)? {
        StreamMessage::Message(message) | StreamMessage::Last(message) => Ok(message),
        StreamMessage::End => Err(Error::NoData),
    }
}

fn intercept(
    interceptor: &mut Option<&mut (dyn RecvInterceptor + Send + 'static)>,
    item: core::result::Result<&DynamicMessage, &Status>,
) -> Result<RecvAction> {
    match interceptor {
        Some(interceptor) => interceptor.on_recv(item),
        None => Ok(RecvAction::Continue),
    }
}

/// Pulls from the provider and feeds `tx` until the provider ends, a bound
/// is reached, `cancel` fires, or `done` reports that the receive side
/// finished. Returns how many messages were handed to the transport.
///
/// Dropping `tx` on return is what half-closes the request stream.
async fn send_loop(
    provider: &mut (dyn MessageProvider + Send),
    data: &CallData,
    tx: mpsc::Sender<DynamicMessage>,
    options: StreamOptions,
    cancel: &CancellationToken,
    done: &CancellationToken,
) -> (u64, Result<()>) {
    let mut sent = 0;
    loop {
        if cancel.is_cancelled() || done.is_cancelled() {
            break;
        }

        let (message, last) = match provider.next_message(&data.regenerate()) {
            Ok(StreamMessage::Message(message)) => (message, false),
            Ok(StreamMessage::Last(message)) => (message, true),
            Ok(StreamMessage::End) => break,
            Err(e) => return (sent, Err(e)),
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = done.cancelled() => break,
            res = tx.send(message) => {
                if res.is_err() {
                    // Request stream dropped by the transport.
                    break;
                }
            }
        }
        sent += 1;

        if last || options.reached(sent) {
            break;
        }

        if let Some(interval) = options.interval {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.cancelled() => break,
                () = done.cancelled() => break,
            }
        }
    }
    (sent, Ok(()))
}

/// Executes calls for one method over a shared connection.
pub struct Worker {
    id: String,
    method: MethodDescriptor,
    channel: Channel,
    call_options: CallOptions,
    options: StreamOptions,
    timeout: Option<Duration>,
    interceptor: Option<Box<dyn RecvInterceptor + Send>>,
    stop: StopHandle,
    state: WorkerState,
    request_number: i64,
}

impl Worker {
    pub fn new(id: impl Into<String>, method: MethodDescriptor, connection: &Connection) -> Self {
        Self {
            id: id.into(),
            method,
            channel: connection.channel(),
            call_options: connection.call_options(),
            options: StreamOptions::default(),
            timeout: None,
            interceptor: None,
            stop: StopHandle::default(),
            state: WorkerState::Idle,
            request_number: 0,
        }
    }

    #[must_use]
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Deadline for each whole call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Hook run on every received message of a server-streaming or bidi call.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl RecvInterceptor + Send + 'static) -> Self {
        self.interceptor = Some(Box::new(interceptor));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of calls started so far, including a running one.
    pub fn request_number(&self) -> i64 {
        self.request_number
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// See [`StopHandle::stop`].
    pub fn stop(&self) -> bool {
        self.stop.stop()
    }

    /// Executes one call.
    ///
    /// Stream-control signals (provider end, last message, interceptor end,
    /// message and duration bounds) finish in [`WorkerState::Completed`]; an
    /// explicit stop finishes in [`WorkerState::Cancelled`]. Both return a
    /// report.
    ///
    /// # Errors
    ///
    /// [`Error::NoData`] without input; [`Error::Status`] or
    /// [`Error::Transport`] when the call fails; [`Error::DeadlineExceeded`]
    /// when the call timeout elapses; any provider or interceptor error.
    pub async fn run(&mut self, input: CallInput, metadata: MetadataMap) -> Result<CallReport> {
        self.request_number += 1;
        let mut provider = match input.into_provider() {
            Ok(provider) => provider,
            Err(e) => {
                self.state = WorkerState::Failed;
                return Err(e);
            }
        };

        let token = self.stop.arm();
        self.state = WorkerState::Running;
        let started = Instant::now();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Worker {} starting call #{} to {} ({:?})",
            self.id,
            self.request_number,
            self.method.full_name(),
            self.method.kind()
        );

        let result = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.dispatch(&mut *provider, metadata, &token))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded(limit)),
                }
            }
            None => self.dispatch(&mut *provider, metadata, &token).await,
        };

        self.stop.disarm();
        let elapsed = started.elapsed();

        match result {
            Ok(outcome) => {
                self.state = if token.is_cancelled() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {} call #{} stopped", self.id, self.request_number);
                    WorkerState::Cancelled
                } else {
                    WorkerState::Completed
                };

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Worker {} call #{} finished in {:?}: sent {}, received {}",
                    self.id,
                    self.request_number,
                    elapsed,
                    outcome.sent,
                    outcome.received
                );

                Ok(CallReport {
                    state: self.state,
                    sent: outcome.sent,
                    received: outcome.received,
                    response: outcome.response,
                    metadata: outcome.metadata,
                    elapsed,
                })
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Worker {} call #{} failed after {:?}: {}",
                    self.id,
                    self.request_number,
                    elapsed,
                    e
                );
                self.state = WorkerState::Failed;
                Err(e)
            }
        }
    }

    async fn dispatch(
        &mut self,
        provider: &mut (dyn MessageProvider + Send),
        metadata: MetadataMap,
        token: &CancellationToken,
    ) -> Result<Outcome> {
        let mut grpc = Grpc::new(self.channel.clone())
            .max_decoding_message_size(self.call_options.max_recv_message_size)
            .max_encoding_message_size(self.call_options.max_send_message_size);
        grpc.ready().await?;

        let call = Call {
            grpc,
            path: self.method.path()?,
            codec: DynamicCodec::new(self.method.output()),
            data: CallData::new(&self.method, self.id.as_str(), self.request_number),
            provider,
            interceptor: self.interceptor.as_deref_mut(),
            options: self.options,
            metadata,
            stop: token.clone(),
        };

        match self.method.kind() {
            CallKind::Unary => unary::run(call).await,
            CallKind::ClientStreaming => client_stream::run(call).await,
            CallKind::ServerStreaming => server_stream::run(call).await,
            CallKind::Bidi => bidi::run(call).await,
        }
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("method", &self.method.full_name())
            .field("state", &self.state)
            .field("request_number", &self.request_number)
            .finish_non_exhaustive()
    }
}
