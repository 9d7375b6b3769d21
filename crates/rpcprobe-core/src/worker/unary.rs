use super::{Call, Outcome, first_message, request};
use crate::error::Result;

pub(super) async fn run(call: Call<'_>) -> Result<Outcome> {
    let Call {
        mut grpc,
        path,
        codec,
        data,
        provider,
        metadata,
        stop,
        ..
    } = call;

    let message = first_message(provider, &data)?;

    tokio::select! {
        () = stop.cancelled() => Ok(Outcome::default()),
        response = grpc.unary(request(message, &metadata), path, codec) => {
            let response = response?;
            let metadata = response.metadata().clone();
            Ok(Outcome {
                sent: 1,
                received: 1,
                response: Some(response.into_inner()),
                metadata,
            })
        }
    }
}
