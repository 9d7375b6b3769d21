use super::{Call, Outcome, RecvAction, first_message, intercept, request, timer::DurationTimer};
use crate::error::Result;

/// Sends one message, then receives until the server ends the stream, the
/// interceptor asks to stop, or a bound or stop cancels the call. Returning
/// early drops the response stream, which cancels the call on the wire.
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

    let message = first_message(provider, &data)?;

    let cancel = stop.child_token();
    let _timer = DurationTimer::maybe(options.max_duration, &cancel);

    let response = tokio::select! {
        () = cancel.cancelled() => {
            return Ok(Outcome {
                sent: 1,
                ..Outcome::default()
            });
        }
        response = grpc.server_streaming(request(message, &metadata), path, codec) => response?,
    };

    let mut outcome = Outcome {
        sent: 1,
        metadata: response.metadata().clone(),
        ..Outcome::default()
    };
    let mut inbound = response.into_inner();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = inbound.message() => next,
        };

        match next {
            Ok(Some(message)) => {
                outcome.received += 1;
                let action = intercept(&mut interceptor, Ok(&message))?;
                outcome.response = Some(message);
                if action == RecvAction::EndStream || options.reached(outcome.received) {
                    break;
                }
            }
            Ok(None) => break,
            Err(status) => {
                if intercept(&mut interceptor, Err(&status))? == RecvAction::EndStream {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Interceptor ended stream on {}", status.code());
                    break;
                }
                return Err(status.into());
            }
        }
    }

    Ok(outcome)
}
