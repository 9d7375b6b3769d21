use crate::{
    codec::message_from_json,
    config::RunConfig,
    descriptor::{DescriptorRegistry, MethodDescriptor, SchemaSource, parse_target},
    error::Result,
    transport::{Connection, ConnectivityState},
    worker::Worker,
};
use prost_reflect::DynamicMessage;

/// A resolved method plus an open connection, ready to hand out workers.
#[derive(Debug)]
pub struct Session {
    config: RunConfig,
    connection: Connection,
    registry: DescriptorRegistry,
    method: MethodDescriptor,
}

impl Session {
    /// Resolves the target and opens the connection. File-based schemas are
    /// resolved before dialing, so a bad schema never touches the network.
    ///
    /// # Errors
    ///
    /// Any resolution or dial error.
    pub async fn connect(config: RunConfig) -> Result<Self> {
        let target = parse_target(&config.target)?;

        let (connection, registry) = match &config.schema {
            SchemaSource::Reflection => {
                let connection = Connection::open(&config.host, &config.transport).await?;
                let registry =
                    DescriptorRegistry::load(&config.schema, &target, Some(connection.channel()))
                        .await?;
                (connection, registry)
            }
            schema => {
                let registry = DescriptorRegistry::load(schema, &target, None).await?;
                let connection = Connection::open(&config.host, &config.transport).await?;
                (connection, registry)
            }
        };
        let method = registry.lookup(&target)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Resolved {} on {} ({:?})",
            method.full_name(),
            config.host,
            method.kind()
        );

        Ok(Self {
            config,
            connection,
            registry,
            method,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// The linked schema, for resolving other methods of the same source.
    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Builds an input message for the session's method.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMessage`](crate::Error::InvalidMessage) when the JSON
    /// does not fit the input type.
    pub fn message_from_json(&self, json: &str) -> Result<DynamicMessage> {
        message_from_json(&self.method.input(), json)
    }

    /// A worker for the session's method with the configured stream bounds
    /// and call timeout.
    pub fn worker(&self, id: impl Into<String>) -> Worker {
        Worker::new(id, self.method.clone(), &self.connection)
            .with_stream_options(self.config.stream)
            .with_timeout(self.config.timeout)
    }

    /// Closes the connection and returns the state it settled in; anything
    /// but `Shutdown` means the wait timed out. Drop workers first; each
    /// holds a channel.
    pub async fn close(self) -> ConnectivityState {
        self.connection.close().await
    }
}
