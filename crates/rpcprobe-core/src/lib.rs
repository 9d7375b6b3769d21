#![doc = include_str!("../README.md")]

mod calldata;
mod codec;
mod config;
mod descriptor;
mod error;
mod reflection;
mod session;
mod transport;
mod worker;

pub use calldata::CallData;
pub use codec::{DynamicCodec, message_from_json, message_to_json};
pub use config::{RunConfig, StreamOptions};
pub use descriptor::{
    CallKind, DescriptorRegistry, MethodDescriptor, MethodTarget, SchemaSource, parse_target,
    resolve,
};
pub use error::{Error, Result};
pub use reflection::ReflectionClient;
pub use session::Session;
pub use transport::{
    CallOptions, Connection, ConnectivityState, Security, TlsBundle, TransportOptions,
};
pub use worker::{
    CallInput, CallReport, MessageList, MessageProvider, RecvAction, RecvInterceptor, StopHandle,
    StreamMessage, TemplateProvider, Worker, WorkerState,
};

pub use prost_reflect::{DynamicMessage, MessageDescriptor};
pub use tonic::metadata::MetadataMap;
