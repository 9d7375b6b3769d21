use super::{Call, Outcome, request, send_loop, timer::DurationTimer};
use crate::error::Result;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Sends until the provider or a bound ends the stream, then half-closes and
/// waits for the single response. A provider error or an explicit stop
/// abandons the call instead.
pub(super) async fn run(call: Call<'_>) -> Result<Outcome> {
    let Call {
        mut grpc,
        path,
        codec,
        data,
        provider,
        options,
        metadata,
        stop,
        ..
    } = call;

    let (tx, rx) = mpsc::channel(1);
    let outbound = request(ReceiverStream::new(rx), &metadata);

    // Bounds end the send loop gracefully; the call itself only watches
    // `stop` and `abort`.
    let cancel = stop.child_token();
    let done = CancellationToken::new();
    let abort = CancellationToken::new();
    let _timer = DurationTimer::maybe(options.max_duration, &cancel);

    let send = async {
        let (sent, result) = send_loop(provider, &data, tx, options, &cancel, &done).await;
        if result.is_err() {
            abort.cancel();
        }
        (sent, result)
    };

    let recv = async {
        let response = tokio::select! {
            () = stop.cancelled() => None,
            () = abort.cancelled() => None,
            response = grpc.client_streaming(outbound, path, codec) => Some(response),
        };
        done.cancel();
        response
    };

    let ((sent, sent_result), response) = tokio::join!(send, recv);
    sent_result?;

    let Some(response) = response else {
        // Stopped before the server answered.
        return Ok(Outcome {
            sent,
            ..Outcome::default()
        });
    };
    let response = response?;
    let metadata = response.metadata().clone();
    Ok(Outcome {
        sent,
        received: 1,
        response: Some(response.into_inner()),
        metadata,
    })
}
