//! Codec and JSON conversion for runtime-described messages.

use crate::error::{Error, Result};
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage, SerializeOptions};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// [`Codec`] for [`DynamicMessage`] requests and responses. Outbound
/// messages already carry their descriptor; inbound ones are decoded against
/// the method's output type.
#[derive(Clone, Debug)]
pub struct DynamicCodec {
    output: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(output: MessageDescriptor) -> Self {
        Self { output }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            output: self.output.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> core::result::Result<(), Self::Error> {
        item.encode(dst).map_err(|e| {
            Status::internal(format!("encode {}: {e}", item.descriptor().full_name()))
        })
    }
}

#[derive(Debug)]
pub struct DynamicDecoder {
    output: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> core::result::Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.output.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(format!("decode {}: {e}", self.output.full_name())))
    }
}

/// Builds a message of type `descriptor` from its proto3 JSON form.
///
/// # Errors
///
/// [`Error::InvalidMessage`] when the text is not JSON, names an unknown
/// field, or has trailing data.
pub fn message_from_json(descriptor: &MessageDescriptor, json: &str) -> Result<DynamicMessage> {
    let invalid = |e: serde_json::Error| Error::InvalidMessage {
        message: descriptor.full_name().to_string(),
        reason: e.to_string(),
    };

    let mut de = serde_json::Deserializer::from_str(json);
    let message = DynamicMessage::deserialize(descriptor.clone(), &mut de).map_err(invalid)?;
    de.end().map_err(invalid)?;
    Ok(message)
}

/// Renders a message as proto3 JSON, default-valued fields included.
///
/// # Errors
///
/// [`Error::InvalidMessage`] when a value has no JSON form (non-finite
/// floats are written as strings, so this is rare).
pub fn message_to_json(message: &DynamicMessage) -> Result<serde_json::Value> {
    let options = SerializeOptions::new().skip_default_fields(false);
    message
        .serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| Error::InvalidMessage {
            message: message.descriptor().full_name().to_string(),
            reason: e.to_string(),
        })
}
