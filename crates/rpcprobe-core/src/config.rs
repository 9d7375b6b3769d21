use crate::{descriptor::SchemaSource, transport::TransportOptions};
use core::time::Duration;

/// Shapes the streaming side of a call. Every bound is optional; a stream
/// with none runs until the server (or provider) ends it or the worker is
/// stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Delay between outbound messages.
    pub interval: Option<Duration>,
    /// Cancels the stream this long after the call starts.
    pub max_duration: Option<Duration>,
    /// Messages sent (client streaming, bidi) or received (server streaming)
    /// before the stream ends gracefully. Zero means no limit.
    pub max_messages: Option<u64>,
}

impl StreamOptions {
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_max_messages(mut self, count: u64) -> Self {
        self.max_messages = Some(count);
        self
    }

    /// `true` once `count` reaches a configured, non-zero limit.
    pub fn reached(&self, count: u64) -> bool {
        self.max_messages.is_some_and(|max| max > 0 && count >= max)
    }
}

/// Everything needed to resolve, connect, and call one method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub host: String,
    pub target: String,
    pub schema: SchemaSource,
    pub transport: TransportOptions,
    pub stream: StreamOptions,
    /// Deadline for the whole call, independent of `stream.max_duration`.
    pub timeout: Option<Duration>,
}

impl RunConfig {
    pub fn new(host: impl Into<String>, target: impl Into<String>, schema: SchemaSource) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            schema,
            transport: TransportOptions::default(),
            stream: StreamOptions::default(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_limit() {
        let unbounded = StreamOptions::default();
        assert!(!unbounded.reached(u64::MAX));

        let bounded = StreamOptions::default().with_max_messages(3);
        assert!(!bounded.reached(2));
        assert!(bounded.reached(3));

        let zero = StreamOptions::default().with_max_messages(0);
        assert!(!zero.reached(1_000));
    }

    #[test]
    fn builders_fill_fields() {
        let config = RunConfig::new("localhost:1", "a.B/C", SchemaSource::Reflection)
            .with_timeout(Duration::from_secs(2))
            .with_stream(StreamOptions::default().with_interval(Duration::from_millis(5)));
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.stream.interval, Some(Duration::from_millis(5)));
        assert_eq!(config.transport, TransportOptions::default());
    }
}
