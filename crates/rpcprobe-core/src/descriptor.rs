//! Method resolution.
//!
//! A target such as `helloworld.Greeter.SayHello` or `helloworld.Greeter/SayHello`
//! is split into a service and a method, then looked up in a
//! [`DescriptorRegistry`] built from one of the [`SchemaSource`]s.

use crate::{
    error::{Error, Result},
    reflection::ReflectionClient,
};
use core::fmt;
use prost_reflect::{DescriptorPool, MessageDescriptor};
use std::path::{Path, PathBuf};
use tonic::{codegen::http::uri::PathAndQuery, transport::Channel};

/// A method target split into its service and method parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodTarget {
    pub service: String,
    pub method: String,
}

impl MethodTarget {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Splits a method target.
///
/// One leading `.` or `/` is ignored. With a single slash the split happens
/// there (`pkg.Service/Method`); without one it happens at the last dot
/// (`pkg.Service.Method`). Both halves must be non-empty.
///
/// # Errors
///
/// [`Error::InvalidTarget`] for empty input, more than one slash, or a
/// missing service or method part.
pub fn parse_target(target: &str) -> Result<MethodTarget> {
    let invalid = |reason| Error::InvalidTarget {
        target: target.to_string(),
        reason,
    };

    let trimmed = target
        .strip_prefix('.')
        .or_else(|| target.strip_prefix('/'))
        .unwrap_or(target);
    if trimmed.is_empty() {
        return Err(invalid("empty target"));
    }

    let (service, method) = match trimmed.matches('/').count() {
        0 => trimmed
            .rsplit_once('.')
            .ok_or_else(|| invalid("expected `service.method` or `service/method`"))?,
        1 => trimmed
            .split_once('/')
            .ok_or_else(|| invalid("expected `service/method`"))?,
        _ => return Err(invalid("more than one `/` separator")),
    };

    if service.is_empty() {
        return Err(invalid("missing service name"));
    }
    if method.is_empty() {
        return Err(invalid("missing method name"));
    }
    Ok(MethodTarget::new(service, method))
}

/// The four call shapes, derived from the method's streaming flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidi,
}

/// Resolved method. Cheap to clone; the underlying pool is shared.
///
/// Equality compares names, input and output types, and streaming flags, so
/// the same method resolved from different schema sources compares equal.
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    inner: prost_reflect::MethodDescriptor,
}

impl MethodDescriptor {
    pub fn new(inner: prost_reflect::MethodDescriptor) -> Self {
        Self { inner }
    }

    /// `helloworld.Greeter.SayHello`
    pub fn full_name(&self) -> &str {
        self.inner.full_name()
    }

    /// `SayHello`
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// `helloworld.Greeter`
    pub fn service_full_name(&self) -> String {
        self.inner.parent_service().full_name().to_string()
    }

    /// `Greeter`
    pub fn service_name(&self) -> String {
        self.inner.parent_service().name().to_string()
    }

    pub fn input(&self) -> MessageDescriptor {
        self.inner.input()
    }

    pub fn output(&self) -> MessageDescriptor {
        self.inner.output()
    }

    /// Fully-qualified input type name.
    pub fn input_name(&self) -> String {
        self.inner.input().full_name().to_string()
    }

    /// Fully-qualified output type name.
    pub fn output_name(&self) -> String {
        self.inner.output().full_name().to_string()
    }

    pub fn is_client_streaming(&self) -> bool {
        self.inner.is_client_streaming()
    }

    pub fn is_server_streaming(&self) -> bool {
        self.inner.is_server_streaming()
    }

    pub fn kind(&self) -> CallKind {
        match (self.is_client_streaming(), self.is_server_streaming()) {
            (false, false) => CallKind::Unary,
            (true, false) => CallKind::ClientStreaming,
            (false, true) => CallKind::ServerStreaming,
            (true, true) => CallKind::Bidi,
        }
    }

    /// HTTP/2 request path: `/helloworld.Greeter/SayHello`.
    pub fn path(&self) -> Result<PathAndQuery> {
        let path = format!("/{}/{}", self.service_full_name(), self.name());
        path.parse().map_err(|_| Error::InvalidTarget {
            target: self.full_name().to_string(),
            reason: "not a valid request path",
        })
    }

    pub fn as_prost_reflect(&self) -> &prost_reflect::MethodDescriptor {
        &self.inner
    }
}

impl PartialEq for MethodDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.full_name() == other.full_name()
            && self.service_full_name() == other.service_full_name()
            && self.input_name() == other.input_name()
            && self.output_name() == other.output_name()
            && self.is_client_streaming() == other.is_client_streaming()
            && self.is_server_streaming() == other.is_server_streaming()
    }
}

impl Eq for MethodDescriptor {}

/// Where the schema comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaSource {
    /// Proto source files, compiled in-process. When `import_paths` is empty
    /// the parent directory of each file is used.
    Proto {
        files: Vec<PathBuf>,
        import_paths: Vec<PathBuf>,
    },
    /// A binary `FileDescriptorSet`, e.g. from `protoc --descriptor_set_out`.
    DescriptorSet(PathBuf),
    /// Ask the server through `grpc.reflection.v1`.
    Reflection,
}

impl SchemaSource {
    pub fn proto(file: impl Into<PathBuf>) -> Self {
        SchemaSource::Proto {
            files: vec![file.into()],
            import_paths: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_import_path(mut self, path: impl Into<PathBuf>) -> Self {
        if let SchemaSource::Proto { import_paths, .. } = &mut self {
            import_paths.push(path.into());
        }
        self
    }

    pub fn descriptor_set(path: impl Into<PathBuf>) -> Self {
        SchemaSource::DescriptorSet(path.into())
    }
}

/// A linked descriptor pool that can answer repeated method lookups.
#[derive(Clone, Debug)]
pub struct DescriptorRegistry {
    pool: DescriptorPool,
}

impl DescriptorRegistry {
    pub fn new(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    /// Compiles proto sources.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] when a file or import is missing or does not parse.
    pub fn from_proto<F, I>(files: &[F], import_paths: &[I]) -> Result<Self>
    where
        F: AsRef<Path>,
        I: AsRef<Path>,
    {
        let files: Vec<&Path> = files.iter().map(|f| f.as_ref()).collect();
        let origin = files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let schema_err = |reason: String| Error::Schema {
            origin: origin.clone(),
            reason,
        };

        let mut includes: Vec<PathBuf> = import_paths
            .iter()
            .map(|p| -> &Path { p.as_ref() })
            .map(Path::to_path_buf)
            .collect();
        if includes.is_empty() {
            for file in &files {
                let parent = file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                if !includes.iter().any(|p| p == parent) {
                    includes.push(parent.to_path_buf());
                }
            }
        }

        let mut compiler =
            protox::Compiler::new(&includes).map_err(|e| schema_err(e.to_string()))?;
        compiler.include_imports(true);
        compiler
            .open_files(&files)
            .map_err(|e| schema_err(e.to_string()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Compiled proto schema from {}", origin);

        Ok(Self::new(compiler.descriptor_pool()))
    }

    /// Loads an encoded `FileDescriptorSet` from disk.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] when the file cannot be read or linked.
    pub fn from_descriptor_set(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::Schema {
            origin: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            Error::Schema { reason, .. } => Error::Schema {
                origin: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Decodes an encoded `FileDescriptorSet`.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] when the bytes are not a valid, self-contained set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        DescriptorPool::decode(bytes)
            .map(Self::new)
            .map_err(|e| Error::Schema {
                origin: "descriptor set".to_string(),
                reason: e.to_string(),
            })
    }

    /// Fetches the file defining `target`'s service, plus its dependencies,
    /// through server reflection.
    ///
    /// # Errors
    ///
    /// [`Error::SymbolNotFound`] when the server does not know the service,
    /// [`Error::Reflection`] or [`Error::Status`] when the session fails.
    pub async fn from_reflection(channel: Channel, target: &MethodTarget) -> Result<Self> {
        let mut client = ReflectionClient::new(channel);
        let pool = client.resolve(target).await?;
        Ok(Self::new(pool))
    }

    /// Builds a registry from any source. `channel` is only used by
    /// [`SchemaSource::Reflection`].
    ///
    /// # Errors
    ///
    /// See the individual constructors. Reflection without a channel is
    /// [`Error::InvalidConfig`].
    pub async fn load(
        source: &SchemaSource,
        target: &MethodTarget,
        channel: Option<Channel>,
    ) -> Result<Self> {
        match source {
            SchemaSource::Proto {
                files,
                import_paths,
            } => Self::from_proto(files, import_paths),
            SchemaSource::DescriptorSet(path) => Self::from_descriptor_set(path),
            SchemaSource::Reflection => {
                let channel = channel.ok_or_else(|| {
                    Error::InvalidConfig("reflection needs an open connection".to_string())
                })?;
                Self::from_reflection(channel, target).await
            }
        }
    }

    /// Looks up a method by target string.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTarget`], [`Error::SymbolNotFound`],
    /// [`Error::NotAService`], or [`Error::MethodNotFound`].
    pub fn method(&self, target: &str) -> Result<MethodDescriptor> {
        self.lookup(&parse_target(target)?)
    }

    /// Looks up an already split target.
    ///
    /// # Errors
    ///
    /// See [`DescriptorRegistry::method`].
    pub fn lookup(&self, target: &MethodTarget) -> Result<MethodDescriptor> {
        let Some(service) = self.pool.get_service_by_name(&target.service) else {
            let other_symbol = self.pool.get_message_by_name(&target.service).is_some()
                || self.pool.get_enum_by_name(&target.service).is_some()
                || self.pool.get_extension_by_name(&target.service).is_some();
            return Err(if other_symbol {
                Error::NotAService(target.service.clone())
            } else {
                Error::SymbolNotFound(target.service.clone())
            });
        };

        service
            .methods()
            .find(|m| m.name() == target.method)
            .map(MethodDescriptor::new)
            .ok_or_else(|| Error::MethodNotFound {
                service: target.service.clone(),
                method: target.method.clone(),
            })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

/// Resolves `target` against `source` in one step.
///
/// # Errors
///
/// Any resolution error; the target string is named in
/// [`Error::InvalidTarget`].
pub async fn resolve(
    target: &str,
    source: &SchemaSource,
    channel: Option<Channel>,
) -> Result<MethodDescriptor> {
    let parsed = parse_target(target)?;
    let registry = DescriptorRegistry::load(source, &parsed, channel).await?;
    registry.lookup(&parsed)
}
