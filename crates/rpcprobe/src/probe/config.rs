use super::collection::{self, Entry};
use anyhow::{Context as _, bail};
use clap::Parser;
use rpcprobe_core::{SchemaSource, Security, StreamOptions, TlsBundle, TransportOptions};
use std::{path::Path, path::PathBuf, time::Duration};

/// Command-line options for `rpcprobe`.
///
/// Either a single call (`--call`) or a collection file (`--collection`) is
/// run. Connection and stream settings apply to every call of the run; a
/// collection entry may still override the host and proto file.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "rpcprobe",
    version,
    about = "Call any gRPC method by name, assert on the reply, and chain calls"
)]
pub struct CliArgs {
    /// Server address, `host:port` or a full `http(s)://` URI.
    ///
    /// Environment variable: `RPCPROBE_HOST`
    #[arg(long, env = "RPCPROBE_HOST", default_value_t = String::from("127.0.0.1:50051"))]
    pub host: String,

    /// Method to call, as `pkg.Service/Method` or `pkg.Service.Method`.
    #[arg(short, long, conflicts_with = "collection")]
    pub call: Option<String>,

    /// JSON collection of calls to run in order.
    #[arg(long)]
    pub collection: Option<PathBuf>,

    /// Proto source file(s). Without `--proto` or `--protoset` the schema is
    /// fetched through server reflection.
    ///
    /// Environment variable: `RPCPROBE_PROTO` (comma separated)
    #[arg(long = "proto", env = "RPCPROBE_PROTO", value_delimiter = ',')]
    pub protos: Vec<PathBuf>,

    /// Import search path(s) for `--proto` and collection `proto` files.
    ///
    /// Environment variable: `RPCPROBE_IMPORT_PATH` (comma separated)
    #[arg(long = "import-path", env = "RPCPROBE_IMPORT_PATH", value_delimiter = ',')]
    pub import_paths: Vec<PathBuf>,

    /// Compiled `FileDescriptorSet`.
    ///
    /// Environment variable: `RPCPROBE_PROTOSET`
    #[arg(long, env = "RPCPROBE_PROTOSET", conflicts_with = "protos")]
    pub protoset: Option<PathBuf>,

    /// Request payload as JSON. An array sends one message per element.
    /// Values may use `{{.RequestNumber}}`-style call data placeholders.
    #[arg(short, long)]
    pub data: Option<String>,

    /// Request metadata as `key: value`. Repeatable.
    #[arg(short = 'm', long = "metadata")]
    pub metadata: Vec<String>,

    /// Expression that must evaluate to `true` after the call. Repeatable.
    #[arg(long = "expect")]
    pub expects: Vec<String>,

    /// Expression evaluated after the expectations. Repeatable.
    #[arg(long = "event")]
    pub events: Vec<String>,

    /// Use TLS with native roots unless `--ca-cert` is given.
    ///
    /// Environment variable: `RPCPROBE_TLS`
    #[arg(long, env = "RPCPROBE_TLS", default_value_t = false)]
    pub tls: bool,

    /// PEM CA certificate used to verify the server. Implies `--tls`.
    ///
    /// Environment variable: `RPCPROBE_CA_CERT`
    #[arg(long, env = "RPCPROBE_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS. Requires `--key`.
    ///
    /// Environment variable: `RPCPROBE_CERT`
    #[arg(long, env = "RPCPROBE_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM client key for mutual TLS. Requires `--cert`.
    ///
    /// Environment variable: `RPCPROBE_KEY`
    #[arg(long, env = "RPCPROBE_KEY")]
    pub key: Option<PathBuf>,

    /// Name checked against the server certificate.
    ///
    /// Environment variable: `RPCPROBE_SERVER_NAME`
    #[arg(long, env = "RPCPROBE_SERVER_NAME")]
    pub server_name: Option<String>,

    /// `:authority` override.
    ///
    /// Environment variable: `RPCPROBE_AUTHORITY`
    #[arg(long, env = "RPCPROBE_AUTHORITY")]
    pub authority: Option<String>,

    /// Deadline for each whole call, in milliseconds. Unbounded when unset.
    ///
    /// Environment variable: `RPCPROBE_TIMEOUT_MS`
    #[arg(long, env = "RPCPROBE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Dial timeout in milliseconds.
    ///
    /// Environment variable: `RPCPROBE_DIAL_TIMEOUT_MS`
    #[arg(long, env = "RPCPROBE_DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    /// HTTP/2 keepalive interval in milliseconds; also used as the ping
    /// timeout.
    ///
    /// Environment variable: `RPCPROBE_KEEPALIVE_MS`
    #[arg(long, env = "RPCPROBE_KEEPALIVE_MS")]
    pub keepalive_ms: Option<u64>,

    /// Delay between streamed messages, in milliseconds.
    ///
    /// Environment variable: `RPCPROBE_STREAM_INTERVAL_MS`
    #[arg(long, env = "RPCPROBE_STREAM_INTERVAL_MS")]
    pub stream_interval_ms: Option<u64>,

    /// Upper bound on a streaming call's duration, in milliseconds.
    ///
    /// Environment variable: `RPCPROBE_STREAM_DURATION_MS`
    #[arg(long, env = "RPCPROBE_STREAM_DURATION_MS")]
    pub stream_duration_ms: Option<u64>,

    /// Maximum messages per stream (sent for client streams, received for
    /// server streams). `0` means unlimited.
    ///
    /// Environment variable: `RPCPROBE_STREAM_COUNT`
    #[arg(long, env = "RPCPROBE_STREAM_COUNT")]
    pub stream_count: Option<u64>,
}

/// What a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// `--call`, turned into a one-entry collection.
    Single(Entry),
    Collection(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub host: String,
    /// Run-wide schema; `None` means reflection unless an entry names a
    /// proto file.
    pub schema: Option<SchemaSource>,
    pub import_paths: Vec<PathBuf>,
    pub transport: TransportOptions,
    pub stream: StreamOptions,
    pub timeout: Option<Duration>,
    pub metadata: Vec<(String, String)>,
    pub source: Source,
}

impl RunSettings {
    /// The entries to run, loading the collection file if there is one.
    pub fn entries(&self) -> anyhow::Result<Vec<Entry>> {
        match &self.source {
            Source::Single(entry) => Ok(vec![entry.clone()]),
            Source::Collection(path) => collection::load(path),
        }
    }

    /// Schema for one entry: its own proto file first, then the run's.
    pub fn schema_for(&self, entry: &Entry) -> SchemaSource {
        match &entry.proto {
            Some(file) => SchemaSource::Proto {
                files: vec![file.clone()],
                import_paths: self.import_paths.clone(),
            },
            None => self.schema.clone().unwrap_or(SchemaSource::Reflection),
        }
    }
}

impl TryFrom<CliArgs> for RunSettings {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let source = match (args.call, args.collection) {
            (Some(call), None) => {
                let data = args
                    .data
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("--data is not valid JSON")?;
                Source::Single(Entry {
                    name: call.clone(),
                    call,
                    data,
                    expect: args.expects,
                    event: args.events,
                    ..Entry::default()
                })
            }
            (None, Some(path)) => {
                if args.data.is_some() || !args.expects.is_empty() || !args.events.is_empty() {
                    bail!("--data, --expect and --event apply to --call only");
                }
                Source::Collection(path)
            }
            (Some(_), Some(_)) => bail!("--call and --collection are mutually exclusive"),
            (None, None) => bail!("one of --call or --collection is required"),
        };

        if args.host.trim().is_empty() {
            bail!("RPCPROBE_HOST must not be empty");
        }
        if args.dial_timeout_ms == 0 {
            bail!("RPCPROBE_DIAL_TIMEOUT_MS must be greater than 0");
        }

        let schema = match (args.protos.is_empty(), args.protoset) {
            (false, Some(_)) => bail!("--proto and --protoset are mutually exclusive"),
            (false, None) => Some(SchemaSource::Proto {
                files: args.protos,
                import_paths: args.import_paths.clone(),
            }),
            (true, Some(path)) => Some(SchemaSource::DescriptorSet(path)),
            (true, None) => None,
        };

        let identity = match (args.cert, args.key) {
            (Some(cert), Some(key)) => Some((read_pem(&cert)?, read_pem(&key)?)),
            (None, None) => None,
            _ => bail!("--cert and --key must be given together"),
        };
        let ca_pem = args.ca_cert.as_deref().map(read_pem).transpose()?;

        let security = if args.tls || ca_pem.is_some() || identity.is_some() {
            Security::Tls(TlsBundle {
                ca_pem,
                identity,
                server_name: args.server_name,
            })
        } else {
            if args.server_name.is_some() {
                bail!("--server-name requires TLS");
            }
            Security::Plaintext
        };

        let mut transport = TransportOptions::default()
            .with_security(security)
            .with_dial_timeout(Duration::from_millis(args.dial_timeout_ms));
        if let Some(authority) = args.authority {
            transport = transport.with_authority(authority);
        }
        if let Some(ms) = args.keepalive_ms.filter(|ms| *ms > 0) {
            transport = transport.with_keepalive(Duration::from_millis(ms));
        }

        let mut stream = StreamOptions::default();
        if let Some(ms) = args.stream_interval_ms {
            stream = stream.with_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = args.stream_duration_ms.filter(|ms| *ms > 0) {
            stream = stream.with_max_duration(Duration::from_millis(ms));
        }
        if let Some(count) = args.stream_count {
            stream = stream.with_max_messages(count);
        }

        let metadata = args
            .metadata
            .iter()
            .map(|pair| parse_metadata(pair))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            host: args.host,
            schema,
            import_paths: args.import_paths,
            transport,
            stream,
            timeout: args
                .timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            metadata,
            source,
        })
    }
}

/// Parses `key: value`. Keys are lowercased, as gRPC metadata keys are.
pub fn parse_metadata(pair: &str) -> anyhow::Result<(String, String)> {
    let Some((key, value)) = pair.split_once(':') else {
        bail!("metadata `{pair}` is not in `key: value` form");
    };
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        bail!("metadata `{pair}` has an empty key");
    }
    Ok((key, value.trim().to_string()))
}

fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> anyhow::Result<RunSettings> {
        let argv = std::iter::once("rpcprobe").chain(args.iter().copied());
        RunSettings::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn single_call_becomes_an_entry() {
        let settings = settings(&[
            "--call",
            "helloworld.Greeter/SayHello",
            "--data",
            r#"{"name":"probe"}"#,
            "--expect",
            "true",
            "--metadata",
            "X-Trace: t-1",
        ])
        .unwrap();

        let Source::Single(entry) = &settings.source else {
            panic!("expected a single call");
        };
        assert_eq!(entry.name, "helloworld.Greeter/SayHello");
        assert_eq!(entry.payloads(), vec![r#"{"name":"probe"}"#.to_string()]);
        assert_eq!(entry.expect, vec!["true".to_string()]);
        assert_eq!(
            settings.metadata,
            vec![("x-trace".to_string(), "t-1".to_string())]
        );
        assert_eq!(settings.schema, None);
        assert_eq!(settings.transport.security, Security::Plaintext);
        assert_eq!(settings.timeout, None);
    }

    #[test]
    fn call_or_collection_is_required() {
        assert!(settings(&[]).is_err());
        assert!(settings(&["--call", "s/m", "--collection", "c.json"]).is_err());
    }

    #[test]
    fn collection_rejects_call_only_flags() {
        let err = settings(&["--collection", "c.json", "--expect", "true"]).unwrap_err();
        assert!(err.to_string().contains("--call only"));

        let settings = settings(&["--collection", "c.json"]).unwrap();
        assert_eq!(settings.source, Source::Collection(PathBuf::from("c.json")));
    }

    #[test]
    fn invalid_data_is_rejected() {
        assert!(settings(&["--call", "s/m", "--data", "{nope"]).is_err());
    }

    #[test]
    fn schema_flags() {
        let settings_with_proto = settings(&[
            "--call",
            "s/m",
            "--proto",
            "a.proto,b.proto",
            "--import-path",
            "protos",
        ])
        .unwrap();
        assert_eq!(
            settings_with_proto.schema,
            Some(SchemaSource::Proto {
                files: vec!["a.proto".into(), "b.proto".into()],
                import_paths: vec!["protos".into()],
            })
        );

        let settings_with_set = settings(&["--call", "s/m", "--protoset", "a.pb"]).unwrap();
        assert_eq!(
            settings_with_set.schema,
            Some(SchemaSource::DescriptorSet("a.pb".into()))
        );

        assert!(settings(&["--call", "s/m", "--proto", "a.proto", "--protoset", "a.pb"]).is_err());
    }

    #[test]
    fn entry_proto_overrides_run_schema() {
        let settings = settings(&["--call", "s/m", "--import-path", "protos"]).unwrap();
        let mut entry = Entry::default();
        assert_eq!(settings.schema_for(&entry), SchemaSource::Reflection);

        entry.proto = Some("x.proto".into());
        assert_eq!(
            settings.schema_for(&entry),
            SchemaSource::Proto {
                files: vec!["x.proto".into()],
                import_paths: vec!["protos".into()],
            }
        );
    }

    #[test]
    fn tls_material_is_read_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, b"ca").unwrap();
        let ca = ca.to_str().unwrap();

        let settings = settings(&["--call", "s/m", "--ca-cert", ca, "--server-name", "x"]).unwrap();
        assert_eq!(
            settings.transport.security,
            Security::Tls(TlsBundle {
                ca_pem: Some(b"ca".to_vec()),
                identity: None,
                server_name: Some("x".into()),
            })
        );
    }

    #[test]
    fn tls_errors() {
        let err = settings(&["--call", "s/m", "--ca-cert", "/nonexistent/ca.pem"]).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/ca.pem"));

        assert!(settings(&["--call", "s/m", "--cert", "c.pem"]).is_err());
        assert!(settings(&["--call", "s/m", "--server-name", "x"]).is_err());
    }

    #[test]
    fn timing_flags() {
        let settings = settings(&[
            "--call",
            "s/m",
            "--timeout-ms",
            "250",
            "--stream-interval-ms",
            "5",
            "--stream-duration-ms",
            "1000",
            "--stream-count",
            "3",
        ])
        .unwrap();

        assert_eq!(settings.timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            settings.stream,
            StreamOptions::default()
                .with_interval(Duration::from_millis(5))
                .with_max_duration(Duration::from_secs(1))
                .with_max_messages(3)
        );
    }

    #[test]
    fn zero_dial_timeout_is_rejected() {
        assert!(settings(&["--call", "s/m", "--dial-timeout-ms", "0"]).is_err());
    }

    #[test]
    fn metadata_pairs() {
        assert_eq!(
            parse_metadata("Authorization: Bearer a:b").unwrap(),
            ("authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_metadata("novalue").is_err());
        assert!(parse_metadata(": v").is_err());
    }
}
