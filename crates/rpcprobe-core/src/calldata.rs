use crate::descriptor::MethodDescriptor;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Per-call template data.
///
/// Identity fields are fixed for the call; the timestamp and UUID are
/// resampled by [`CallData::regenerate`] before each outbound message of a
/// stream. The four timestamp fields always describe the same instant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallData {
    #[serde(rename = "WorkerID")]
    pub worker_id: String,
    pub request_number: i64,
    pub fully_qualified_name: String,
    pub method_name: String,
    pub service_name: String,
    pub input_name: String,
    pub output_name: String,
    pub is_client_streaming: bool,
    pub is_server_streaming: bool,
    pub timestamp: String,
    pub timestamp_unix: i64,
    pub timestamp_unix_milli: i64,
    pub timestamp_unix_nano: i64,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

impl CallData {
    pub fn new(
        method: &MethodDescriptor,
        worker_id: impl Into<String>,
        request_number: i64,
    ) -> Self {
        let mut data = Self {
            worker_id: worker_id.into(),
            request_number,
            fully_qualified_name: method.full_name().to_string(),
            method_name: method.name().to_string(),
            service_name: method.service_name(),
            input_name: method.input().name().to_string(),
            output_name: method.output().name().to_string(),
            is_client_streaming: method.is_client_streaming(),
            is_server_streaming: method.is_server_streaming(),
            timestamp: String::new(),
            timestamp_unix: 0,
            timestamp_unix_milli: 0,
            timestamp_unix_nano: 0,
            uuid: String::new(),
        };
        data.sample(Utc::now());
        data
    }

    /// Same identity, fresh timestamp and UUID.
    #[must_use]
    pub fn regenerate(&self) -> Self {
        let mut data = self.clone();
        data.sample(Utc::now());
        data
    }

    fn sample(&mut self, now: DateTime<Utc>) {
        self.timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.timestamp_unix = now.timestamp();
        self.timestamp_unix_milli = now.timestamp_millis();
        // Out of range after 2262; saturate rather than lose the other fields.
        self.timestamp_unix_nano = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.uuid = Uuid::new_v4().to_string();
    }

    /// Value of a template key such as `WorkerID` or `TimestampUnixMilli`.
    pub fn field(&self, key: &str) -> Option<String> {
        let value = match key {
            "WorkerID" => self.worker_id.clone(),
            "RequestNumber" => self.request_number.to_string(),
            "FullyQualifiedName" => self.fully_qualified_name.clone(),
            "MethodName" => self.method_name.clone(),
            "ServiceName" => self.service_name.clone(),
            "InputName" => self.input_name.clone(),
            "OutputName" => self.output_name.clone(),
            "IsClientStreaming" => self.is_client_streaming.to_string(),
            "IsServerStreaming" => self.is_server_streaming.to_string(),
            "Timestamp" => self.timestamp.clone(),
            "TimestampUnix" => self.timestamp_unix.to_string(),
            "TimestampUnixMilli" => self.timestamp_unix_milli.to_string(),
            "TimestampUnixNano" => self.timestamp_unix_nano.to_string(),
            "UUID" => self.uuid.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Replaces every `{{.Key}}` (inner whitespace allowed) with the matching
    /// field. Unknown keys and unterminated braces are copied through.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };

            let key = after[..end].trim();
            match key.strip_prefix('.').and_then(|k| self.field(k.trim())) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        out
    }
}
