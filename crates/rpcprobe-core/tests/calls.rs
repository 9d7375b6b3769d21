mod common;

use common::{BIDI, CLIENT_STREAM, SERVER_STREAM, UNARY, count, hello, session, start, text};
use core::time::Duration;
use rpcprobe_core::{
    CallData, CallInput, ConnectivityState, DynamicMessage, Error, MetadataMap, RecvAction,
    RecvInterceptor, StreamMessage, StreamOptions, TemplateProvider, WorkerState,
};
use rpcprobe_testserver::{ECHO_HEADER, SERVER_HEADER, SERVER_NAME};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tonic::{Code, Status};

fn end_on_first(_: Result<&DynamicMessage, &Status>) -> rpcprobe_core::Result<RecvAction> {
    Ok(RecvAction::EndStream)
}

fn end_on_error(item: Result<&DynamicMessage, &Status>) -> rpcprobe_core::Result<RecvAction> {
    Ok(if item.is_err() {
        RecvAction::EndStream
    } else {
        RecvAction::Continue
    })
}

#[tokio::test]
async fn unary_sends_and_receives_once() {
    let server = start().await;
    let session = session(&server, UNARY, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let report = worker
        .run(CallInput::messages([hello(&session, "probe", 0)]), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert_eq!((report.sent, report.received), (1, 1));
    assert_eq!(text(report.response.as_ref().unwrap(), "message"), "Hello probe");
    assert_eq!(worker.state(), WorkerState::Completed);
    assert_eq!(worker.request_number(), 1);

    let stats = server.stats();
    assert_eq!((stats.calls, stats.unary_received), (1, 1));
    server.shutdown().await;
}

#[tokio::test]
async fn unary_returns_response_headers() {
    let server = start().await;
    let session = session(&server, UNARY, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let mut metadata = MetadataMap::new();
    metadata.insert(ECHO_HEADER, "marco".parse().unwrap());
    let report = worker
        .run(CallInput::messages([hello(&session, "h", 0)]), metadata)
        .await
        .unwrap();

    assert_eq!(report.metadata.get(ECHO_HEADER).unwrap(), "marco");
    assert_eq!(report.metadata.get(SERVER_HEADER).unwrap(), SERVER_NAME);
    server.shutdown().await;
}

#[tokio::test]
async fn call_timeout_is_deadline_exceeded() {
    let server = start().await;
    let config = common::config(&server, UNARY).with_timeout(Duration::from_millis(100));
    let session = rpcprobe_core::Session::connect(config).await.unwrap();
    let mut worker = session.worker("w-0");

    // The server sleeps `count` milliseconds before replying.
    let err = worker
        .run(CallInput::messages([hello(&session, "slow", 2_000)]), MetadataMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded(d) if d == Duration::from_millis(100)));
    assert_eq!(worker.state(), WorkerState::Failed);
    server.shutdown().await;
}

#[tokio::test]
async fn run_without_data_fails() {
    let server = start().await;
    let session = session(&server, UNARY, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let err = worker
        .run(CallInput::messages([]), MetadataMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoData));
    assert_eq!(err.to_string(), "no data provided for request");
    server.shutdown().await;
}

#[tokio::test]
async fn client_stream_sends_exactly_the_message_limit() {
    let server = start().await;
    let session = session(
        &server,
        CLIENT_STREAM,
        StreamOptions::default().with_max_messages(4),
    )
    .await;
    let message = hello(&session, "n", 0);
    let mut worker = session.worker("w-0");

    // Never ends on its own.
    let provider = move |_: &CallData| -> rpcprobe_core::Result<StreamMessage> {
        Ok(StreamMessage::Message(message.clone()))
    };
    let report = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert_eq!((report.sent, report.received), (4, 1));
    let response = report.response.unwrap();
    assert_eq!(count(&response), 4);
    assert_eq!(text(&response, "message"), "Hello n, n, n, n");
    assert_eq!(server.stats().client_stream_received, 4);
    server.shutdown().await;
}

#[tokio::test]
async fn client_stream_stops_after_last_message() {
    let server = start().await;
    let session = session(&server, CLIENT_STREAM, StreamOptions::default()).await;
    let first = hello(&session, "a", 0);
    let last = hello(&session, "b", 0);
    let mut worker = session.worker("w-0");

    let mut calls = 0;
    let provider = move |_: &CallData| -> rpcprobe_core::Result<StreamMessage> {
        calls += 1;
        Ok(match calls {
            1 => StreamMessage::Message(first.clone()),
            _ => StreamMessage::Last(last.clone()),
        })
    };
    let report = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.sent, 2);
    assert_eq!(text(report.response.as_ref().unwrap(), "message"), "Hello a, b");
    server.shutdown().await;
}

#[tokio::test]
async fn client_stream_renders_templates_per_message() {
    let server = start().await;
    let session = session(&server, CLIENT_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-7");

    let provider = TemplateProvider::new(
        session.method().input(),
        [
            r#"{"name":"{{.WorkerID}}"}"#.to_string(),
            r#"{"name":"{{.MethodName}}#{{.RequestNumber}}"}"#.to_string(),
        ],
    );
    let report = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(
        text(report.response.as_ref().unwrap(), "message"),
        "Hello w-7, SayHelloCS#1"
    );
    server.shutdown().await;
}

#[tokio::test]
async fn provider_error_aborts_the_call() {
    let server = start().await;
    let session = session(&server, CLIENT_STREAM, StreamOptions::default()).await;
    let message = hello(&session, "a", 0);
    let mut worker = session.worker("w-0");

    let mut calls = 0;
    let provider = move |_: &CallData| -> rpcprobe_core::Result<StreamMessage> {
        calls += 1;
        if calls > 2 {
            return Err(Error::Provider("payload source ran dry".into()));
        }
        Ok(StreamMessage::Message(message.clone()))
    };
    let err = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provider(ref reason) if reason == "payload source ran dry"));
    assert_eq!(worker.state(), WorkerState::Failed);
    server.shutdown().await;
}

#[tokio::test]
async fn client_stream_surfaces_server_errors() {
    let server = start().await;
    let session = session(&server, CLIENT_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let err = worker
        .run(
            CallInput::messages([hello(&session, "ok", 0), hello(&session, "error", 0)]),
            MetadataMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Status(ref s) if s.code() == Code::InvalidArgument));
    server.shutdown().await;
}

#[tokio::test]
async fn server_stream_receives_every_reply() {
    let server = start().await;
    let session = session(&server, SERVER_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let report = worker
        .run(CallInput::messages([hello(&session, "s", 3)]), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!((report.sent, report.received), (1, 3));
    assert_eq!(text(report.response.as_ref().unwrap(), "message"), "Hello s #3");
    server.shutdown().await;
}

#[tokio::test]
async fn server_stream_honors_message_limit() {
    let server = start().await;
    let session = session(
        &server,
        SERVER_STREAM,
        StreamOptions::default().with_max_messages(5),
    )
    .await;
    let mut worker = session.worker("w-0");

    // count 0 streams forever.
    let report = worker
        .run(CallInput::messages([hello(&session, "s", 0)]), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert_eq!(report.received, 5);
    server.shutdown().await;
}

#[tokio::test]
async fn server_stream_duration_ends_endless_stream() {
    let server = start().await;
    let session = session(
        &server,
        SERVER_STREAM,
        StreamOptions::default().with_max_duration(Duration::from_millis(200)),
    )
    .await;
    let mut worker = session.worker("w-0");

    let report = worker
        .run(CallInput::messages([hello(&session, "s", 0)]), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert!(report.received > 0);
    assert!(report.elapsed >= Duration::from_millis(200));
    server.shutdown().await;
}

#[tokio::test]
async fn server_stream_error_is_reported_without_interceptor() {
    let server = start().await;
    let session = session(&server, SERVER_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let err = worker
        .run(CallInput::messages([hello(&session, "error", 5)]), MetadataMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Status(ref s) if s.code() == Code::Internal));
    server.shutdown().await;
}

#[tokio::test]
async fn server_stream_interceptor_end_is_success() {
    let server = start().await;
    let session = session(&server, SERVER_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-0").with_interceptor(end_on_error);

    let report = worker
        .run(CallInput::messages([hello(&session, "error", 5)]), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert_eq!(report.received, 1);
    server.shutdown().await;
}

#[tokio::test]
async fn stop_cancels_a_running_stream() {
    let server = start().await;
    let session = session(&server, SERVER_STREAM, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");
    let handle = worker.stop_handle();

    assert!(!worker.stop(), "idle stop is a no-op");

    let stopper = tokio::spawn(async move {
        while !handle.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop()
    });

    let report = worker
        .run(CallInput::messages([hello(&session, "s", 0)]), MetadataMap::new())
        .await
        .unwrap();

    assert!(stopper.await.unwrap());
    assert_eq!(report.state, WorkerState::Cancelled);
    assert_eq!(worker.state(), WorkerState::Cancelled);
    assert!(!worker.stop());
    server.shutdown().await;
}

#[tokio::test]
async fn bidi_echoes_each_message() {
    let server = start().await;
    let session = session(&server, BIDI, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let report = worker
        .run(
            CallInput::messages([
                hello(&session, "a", 0),
                hello(&session, "b", 0),
                hello(&session, "c", 0),
            ]),
            MetadataMap::new(),
        )
        .await
        .unwrap();

    assert_eq!((report.sent, report.received), (3, 3));
    let last = report.response.unwrap();
    assert_eq!(text(&last, "message"), "Hello c");
    assert_eq!(count(&last), 3);
    server.shutdown().await;
}

#[tokio::test]
async fn bidi_intercepted_end_half_closes_gracefully() {
    let server = start().await;
    let session = session(
        &server,
        BIDI,
        StreamOptions::default()
            .with_max_messages(1_000)
            .with_interval(Duration::from_millis(10)),
    )
    .await;
    let message = hello(&session, "b", 0);
    let mut worker = session.worker("w-0").with_interceptor(end_on_first);

    let provider = move |_: &CallData| -> rpcprobe_core::Result<StreamMessage> {
        Ok(StreamMessage::Message(message.clone()))
    };
    let report = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert!(report.sent >= 1 && report.sent < 1_000, "sent {}", report.sent);
    assert!(report.received >= 1);

    let stats = server.stats();
    assert_eq!(stats.bidi_received, report.sent);
    server.shutdown().await;
}

/// Ends the stream on every item and counts how often it was asked.
struct CountingEnd(Arc<AtomicU64>);

impl RecvInterceptor for CountingEnd {
    fn on_recv(
        &mut self,
        _: Result<&DynamicMessage, &Status>,
    ) -> rpcprobe_core::Result<RecvAction> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(RecvAction::EndStream)
    }
}

#[tokio::test]
async fn bidi_interceptor_sees_every_message_after_end() {
    let server = start().await;
    let session = session(&server, BIDI, StreamOptions::default()).await;
    let calls = Arc::new(AtomicU64::new(0));
    let mut worker = session
        .worker("w-0")
        .with_interceptor(CountingEnd(Arc::clone(&calls)));

    let report = worker
        .run(
            CallInput::messages([
                hello(&session, "a", 0),
                hello(&session, "b", 0),
                hello(&session, "c", 0),
                hello(&session, "d", 0),
                hello(&session, "e", 0),
            ]),
            MetadataMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert!(report.received >= 1);
    assert_eq!(calls.load(Ordering::Relaxed), report.received);
    server.shutdown().await;
}

#[tokio::test]
async fn bidi_duration_half_closes() {
    let server = start().await;
    let session = session(
        &server,
        BIDI,
        StreamOptions::default()
            .with_interval(Duration::from_millis(10))
            .with_max_duration(Duration::from_millis(150)),
    )
    .await;
    let message = hello(&session, "d", 0);
    let mut worker = session.worker("w-0");

    let provider = move |_: &CallData| -> rpcprobe_core::Result<StreamMessage> {
        Ok(StreamMessage::Message(message.clone()))
    };
    let report = worker
        .run(CallInput::provider(provider), MetadataMap::new())
        .await
        .unwrap();

    assert_eq!(report.state, WorkerState::Completed);
    assert!(report.sent > 0);
    assert_eq!(report.received, report.sent);
    server.shutdown().await;
}

#[tokio::test]
async fn bidi_server_error_is_reported() {
    let server = start().await;
    let session = session(&server, BIDI, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");

    let err = worker
        .run(CallInput::messages([hello(&session, "error", 0)]), MetadataMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Status(ref s) if s.code() == Code::Internal));
    server.shutdown().await;
}

#[tokio::test]
async fn close_reaches_shutdown() {
    let server = start().await;
    let session = session(&server, UNARY, StreamOptions::default()).await;
    let mut worker = session.worker("w-0");
    worker
        .run(CallInput::messages([hello(&session, "c", 0)]), MetadataMap::new())
        .await
        .unwrap();
    assert_eq!(session.connection().state(), ConnectivityState::Ready);

    drop(worker);
    assert_eq!(session.close().await, ConnectivityState::Shutdown);
    server.shutdown().await;
}
