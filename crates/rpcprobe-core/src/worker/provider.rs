use crate::{
    calldata::CallData,
    codec::message_from_json,
    error::Result,
};
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::collections::VecDeque;
use tonic::Status;

/// What a [`MessageProvider`] hands the send loop.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    /// Send this and ask again.
    Message(DynamicMessage),
    /// Send this, then half-close.
    Last(DynamicMessage),
    /// Half-close without sending.
    End,
}

/// Source of outbound messages. Called sequentially, once per message, with
/// call data regenerated for that message.
///
/// Returning an error aborts the call and the error is reported from
/// [`Worker::run`](crate::Worker::run).
pub trait MessageProvider {
    fn next_message(&mut self, data: &CallData) -> Result<StreamMessage>;
}

impl<F> MessageProvider for F
where
    F: FnMut(&CallData) -> Result<StreamMessage>,
{
    fn next_message(&mut self, data: &CallData) -> Result<StreamMessage> {
        self(data)
    }
}

/// Yields a fixed list in order, then [`StreamMessage::End`].
#[derive(Clone, Debug, Default)]
pub struct MessageList {
    messages: VecDeque<DynamicMessage>,
}

impl MessageList {
    pub fn new(messages: impl IntoIterator<Item = DynamicMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl MessageProvider for MessageList {
    fn next_message(&mut self, _data: &CallData) -> Result<StreamMessage> {
        Ok(self
            .messages
            .pop_front()
            .map_or(StreamMessage::End, StreamMessage::Message))
    }
}

/// Renders JSON payload templates against each message's [`CallData`], so
/// `{{.RequestNumber}}` or `{{.UUID}}` differ per message.
#[derive(Clone, Debug)]
pub struct TemplateProvider {
    descriptor: MessageDescriptor,
    templates: VecDeque<String>,
}

impl TemplateProvider {
    pub fn new(descriptor: MessageDescriptor, templates: impl IntoIterator<Item = String>) -> Self {
        Self {
            descriptor,
            templates: templates.into_iter().collect(),
        }
    }
}

impl MessageProvider for TemplateProvider {
    fn next_message(&mut self, data: &CallData) -> Result<StreamMessage> {
        let Some(template) = self.templates.pop_front() else {
            return Ok(StreamMessage::End);
        };
        let message = message_from_json(&self.descriptor, &data.render(&template))?;
        Ok(StreamMessage::Message(message))
    }
}

/// Returned by a [`RecvInterceptor`] for each received item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvAction {
    Continue,
    /// Stop receiving and treat the call as successful.
    EndStream,
}

/// Inspects every received message, or the error that ended the stream.
pub trait RecvInterceptor {
    fn on_recv(
        &mut self,
        item: core::result::Result<&DynamicMessage, &Status>,
    ) -> Result<RecvAction>;
}

impl<F> RecvInterceptor for F
where
    F: FnMut(core::result::Result<&DynamicMessage, &Status>) -> Result<RecvAction>,
{
    fn on_recv(
        &mut self,
        item: core::result::Result<&DynamicMessage, &Status>,
    ) -> Result<RecvAction> {
        self(item)
    }
}
