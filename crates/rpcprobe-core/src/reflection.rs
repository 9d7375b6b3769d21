//! `grpc.reflection.v1` client.
//!
//! Asks the server for the file that defines a service, then fetches every
//! missing import by file name until the set is closed, and links the files
//! into a [`DescriptorPool`] dependencies first.

use crate::{
    descriptor::MethodTarget,
    error::{Error, Result},
};
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorProto;
use std::collections::{HashMap, HashSet, VecDeque};
use tonic::{Code, transport::Channel};
use tonic_reflection::pb::v1::{
    ServerReflectionRequest, server_reflection_client::ServerReflectionClient,
    server_reflection_request::MessageRequest, server_reflection_response::MessageResponse,
};

pub struct ReflectionClient {
    client: ServerReflectionClient<Channel>,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ServerReflectionClient::new(channel),
        }
    }

    /// Lists the services the server exposes.
    ///
    /// # Errors
    ///
    /// [`Error::Status`] or [`Error::Reflection`] when the query fails.
    pub async fn list_services(&mut self) -> Result<Vec<String>> {
        match self
            .request(MessageRequest::ListServices(String::new()))
            .await?
        {
            MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Builds a pool holding `target`'s service and its transitive imports.
    ///
    /// The symbol is looked up as the service name first, then as the
    /// method's dotted and slashed names, since servers differ in which forms
    /// they index.
    ///
    /// # Errors
    ///
    /// [`Error::SymbolNotFound`] naming `service/method` when no form is
    /// known to the server;
    /// [`Error::Schema`] when the returned files cannot be linked.
    pub async fn resolve(&mut self, target: &MethodTarget) -> Result<DescriptorPool> {
        let candidates = [
            target.service.clone(),
            format!("{}.{}", target.service, target.method),
            format!("{}/{}", target.service, target.method),
        ];

        let mut files = None;
        for symbol in candidates {
            match self.file_containing_symbol(&symbol).await {
                Ok(found) => {
                    files = Some(found);
                    break;
                }
                Err(Error::SymbolNotFound(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Reflection has no symbol {}, trying next form", symbol);
                }
                Err(e) => return Err(e),
            }
        }
        let files = files.ok_or_else(|| {
            Error::SymbolNotFound(format!("{}/{}", target.service, target.method))
        })?;

        let files = self.complete(files).await?;
        link(files)
    }

    async fn file_containing_symbol(&mut self, symbol: &str) -> Result<Vec<FileDescriptorProto>> {
        let response = self
            .request(MessageRequest::FileContainingSymbol(symbol.to_string()))
            .await;
        match response {
            Ok(MessageResponse::FileDescriptorResponse(files)) => {
                decode_files(&files.file_descriptor_proto)
            }
            Ok(MessageResponse::ErrorResponse(e)) if e.error_code == Code::NotFound as i32 => {
                Err(Error::SymbolNotFound(symbol.to_string()))
            }
            Err(Error::Status(status)) if status.code() == Code::NotFound => {
                Err(Error::SymbolNotFound(symbol.to_string()))
            }
            Ok(other) => Err(unexpected(&other)),
            Err(e) => Err(e),
        }
    }

    async fn file_by_filename(&mut self, name: &str) -> Result<Vec<FileDescriptorProto>> {
        match self
            .request(MessageRequest::FileByFilename(name.to_string()))
            .await?
        {
            MessageResponse::FileDescriptorResponse(files) => {
                decode_files(&files.file_descriptor_proto)
            }
            MessageResponse::ErrorResponse(e) => Err(Error::Reflection(format!(
                "file `{name}` not available: {}",
                e.error_message
            ))),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches imports until every dependency of every file is present.
    async fn complete(
        &mut self,
        initial: Vec<FileDescriptorProto>,
    ) -> Result<Vec<FileDescriptorProto>> {
        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut pending: VecDeque<FileDescriptorProto> = initial.into();

        while let Some(file) = pending.pop_front() {
            if files.contains_key(file.name()) {
                continue;
            }
            for dep in &file.dependency {
                if files.contains_key(dep) || pending.iter().any(|f| f.name() == dep) {
                    continue;
                }
                let fetched = self.file_by_filename(dep).await?;
                if !fetched.iter().any(|f| f.name() == dep) {
                    return Err(Error::Reflection(format!(
                        "server did not return requested file `{dep}`"
                    )));
                }
                pending.extend(fetched);
            }
            files.insert(file.name().to_string(), file);
        }

        Ok(files.into_values().collect())
    }

    async fn request(&mut self, request: MessageRequest) -> Result<MessageResponse> {
        let request = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };
        let mut inbound = self
            .client
            .server_reflection_info(tokio_stream::once(request))
            .await?
            .into_inner();

        let response = inbound
            .message()
            .await?
            .ok_or_else(|| Error::Reflection("stream closed without a response".to_string()))?;

        match response.message_response {
            Some(MessageResponse::ErrorResponse(e)) if e.error_code != Code::NotFound as i32 => {
                Err(Error::Reflection(format!(
                    "{} (code {})",
                    e.error_message, e.error_code
                )))
            }
            Some(message) => Ok(message),
            None => Err(Error::Reflection("empty response".to_string())),
        }
    }
}

fn unexpected(response: &MessageResponse) -> Error {
    let kind = match response {
        MessageResponse::FileDescriptorResponse(_) => "file descriptors",
        MessageResponse::AllExtensionNumbersResponse(_) => "extension numbers",
        MessageResponse::ListServicesResponse(_) => "service list",
        MessageResponse::ErrorResponse(_) => "error",
    };
    Error::Reflection(format!("unexpected {kind} response"))
}

fn decode_files(encoded: &[Vec<u8>]) -> Result<Vec<FileDescriptorProto>> {
    encoded
        .iter()
        .map(|bytes| {
            FileDescriptorProto::decode(bytes.as_slice()).map_err(|e| Error::Schema {
                origin: "reflection".to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Orders files so every file follows its imports.
fn dependency_order(files: Vec<FileDescriptorProto>) -> Result<Vec<FileDescriptorProto>> {
    let mut by_name: HashMap<String, FileDescriptorProto> = files
        .into_iter()
        .map(|f| (f.name().to_string(), f))
        .collect();
    let mut names: Vec<String> = by_name.keys().cloned().collect();
    names.sort();

    let mut ordered = Vec::with_capacity(by_name.len());
    let mut done = HashSet::new();
    let mut visiting = HashSet::new();

    fn visit(
        name: &str,
        by_name: &HashMap<String, FileDescriptorProto>,
        done: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        ordered: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(Error::Schema {
                origin: "reflection".to_string(),
                reason: format!("import cycle through `{name}`"),
            });
        }
        if let Some(file) = by_name.get(name) {
            for dep in &file.dependency {
                visit(dep, by_name, done, visiting, ordered)?;
            }
        }
        visiting.remove(name);
        done.insert(name.to_string());
        ordered.push(name.to_string());
        Ok(())
    }

    for name in &names {
        visit(name, &by_name, &mut done, &mut visiting, &mut ordered)?;
    }

    Ok(ordered
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

fn link(files: Vec<FileDescriptorProto>) -> Result<DescriptorPool> {
    let mut pool = DescriptorPool::new();
    for file in dependency_order(files)? {
        let name = file.name().to_string();
        pool.add_file_descriptor_proto(file)
            .map_err(|e| Error::Schema {
                origin: format!("reflection file `{name}`"),
                reason: e.to_string(),
            })?;
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, deps: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn names(files: &[FileDescriptorProto]) -> Vec<&str> {
        files.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn imports_come_first() {
        let ordered = dependency_order(vec![
            file("c.proto", &["b.proto"]),
            file("a.proto", &[]),
            file("b.proto", &["a.proto"]),
        ])
        .unwrap();
        assert_eq!(names(&ordered), ["a.proto", "b.proto", "c.proto"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = dependency_order(vec![
            file("a.proto", &["b.proto"]),
            file("b.proto", &["a.proto"]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[test]
    fn links_dependent_files() {
        use prost_types::{DescriptorProto, FieldDescriptorProto, field_descriptor_proto};

        let mut base = file("base.proto", &[]);
        base.package = Some("base".to_string());
        base.message_type = vec![DescriptorProto {
            name: Some("Id".to_string()),
            ..Default::default()
        }];

        let mut user = file("user.proto", &["base.proto"]);
        user.package = Some("user".to_string());
        user.message_type = vec![DescriptorProto {
            name: Some("User".to_string()),
            field: vec![FieldDescriptorProto {
                name: Some("id".to_string()),
                number: Some(1),
                label: Some(field_descriptor_proto::Label::Optional as i32),
                r#type: Some(field_descriptor_proto::Type::Message as i32),
                type_name: Some(".base.Id".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }];

        let pool = link(vec![user, base]).unwrap();
        assert!(pool.get_message_by_name("user.User").is_some());
        assert!(pool.get_message_by_name("base.Id").is_some());
    }
}
