use super::{Call, Outcome, RecvAction, intercept, request, send_loop, timer::DurationTimer};
use crate::error::{Error, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Runs the send and receive loops concurrently.
///
/// Tokens:
/// - `cancel` (child of `stop`): raised by the duration timer or the
///   interceptor; the send side half-closes and the receive side drains.
/// - `recv_done`: the receive side finished; the send side half-closes.
/// - `abort`: the provider failed; the receive side drops the call.
/// - `stop`: explicit stop; both sides return at once.
pub(super) async fn run(call: Call<'_>) -> Result<Outcome> {
    let Call {
        mut grpc,
        path,
        codec,
        data,
        provider,
        mut interceptor,
        options,
        metadata,
        stop,
    } = call;

    let (tx, rx) = mpsc::channel(1);
    let outbound = request(ReceiverStream::new(rx), &metadata);

    let cancel = stop.child_token();
    let recv_done = CancellationToken::new();
    let abort = CancellationToken::new();
    let _timer = DurationTimer::maybe(options.max_duration, &cancel);

    let send = async {
        let (sent, result) = send_loop(provider, &data, tx, options, &cancel, &recv_done).await;
        if result.is_err() {
            abort.cancel();
        }
        (sent, result)
    };

    let recv = async {
        let mut outcome = Outcome::default();

        let response = tokio::select! {
            () = stop.cancelled() => return Ok(outcome),
            () = abort.cancelled() => return Ok(outcome),
            response = grpc.streaming(outbound, path, codec) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(status) => return Err(Error::from(status)),
        };
        outcome.metadata = response.metadata().clone();
        let mut inbound = response.into_inner();

        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = abort.cancelled() => break,
                next = inbound.message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    outcome.received += 1;
                    let action = intercept(&mut interceptor, Ok(&message))?;
                    if action == RecvAction::EndStream && !cancel.is_cancelled() {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Interceptor ended stream, half-closing");
                        cancel.cancel();
                    }
                    outcome.response = Some(message);
                }
                Ok(None) => break,
                Err(status) => {
                    if intercept(&mut interceptor, Err(&status))? == RecvAction::EndStream {
                        break;
                    }
                    return Err(status.into());
                }
            }
        }
        Ok(outcome)
    };

    let recv = async {
        let result = recv.await;
        recv_done.cancel();
        result
    };

    let ((sent, sent_result), received) = tokio::join!(send, recv);
    sent_result?;
    let mut outcome = received?;
    outcome.sent = sent;
    Ok(outcome)
}
