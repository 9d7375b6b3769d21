use core::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels `token` once after `duration`. Dropping the timer disarms it.
#[derive(Debug)]
pub(super) struct DurationTimer {
    handle: JoinHandle<()>,
}

impl DurationTimer {
    pub(super) fn start(duration: Duration, token: CancellationToken) -> Self {
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Stream duration {:?} elapsed", duration);
                    token.cancel();
                }
                () = token.cancelled() => {}
            }
        });
        Self { handle }
    }

    /// Arms a timer only when a duration is configured.
    pub(super) fn maybe(duration: Option<Duration>, token: &CancellationToken) -> Option<Self> {
        duration.map(|d| Self::start(d, token.clone()))
    }
}

impl Drop for DurationTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
