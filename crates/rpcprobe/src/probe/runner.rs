use super::{collection::Entry, config::RunSettings, harness::Harness};
use anyhow::Context as _;
use rpcprobe_core::{
    CallInput, MetadataMap, RunConfig, Session, TemplateProvider, WorkerState, message_to_json,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinSet};
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};

/// A call that ran and passed its expectations.
#[derive(Debug)]
pub struct EntryReport {
    pub state: WorkerState,
    pub sent: u64,
    pub received: u64,
    pub elapsed: Duration,
    /// Last received message as JSON.
    pub response: Option<serde_json::Value>,
}

impl EntryReport {
    /// Stopped before a call was made.
    fn interrupted() -> Self {
        Self {
            state: WorkerState::Cancelled,
            sent: 0,
            received: 0,
            elapsed: Duration::ZERO,
            response: None,
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub name: String,
    pub result: anyhow::Result<EntryReport>,
}

impl Outcome {
    /// Ran to completion and met its expectations. An interrupted entry
    /// has not passed.
    pub fn passed(&self) -> bool {
        matches!(&self.result, Ok(report) if report.state != WorkerState::Cancelled)
    }
}

/// Runs entries in order against one shared [`Harness`].
#[derive(Debug)]
pub struct Runner {
    settings: RunSettings,
    harness: Harness,
    /// Set once Ctrl+C arrives. Never reset.
    interrupt: Arc<watch::Sender<bool>>,
    /// Owns the Ctrl+C listener; dropping the runner stops it.
    _listener: JoinSet<()>,
}

impl Runner {
    /// Must be called inside a Tokio runtime.
    pub fn new(settings: RunSettings) -> Self {
        let interrupt = Arc::new(watch::Sender::new(false));
        let mut listener = JoinSet::new();
        let signal = Arc::clone(&interrupt);
        listener.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                #[cfg(feature = "tracing")]
                tracing::warn!("Received Ctrl+C, stopping");
                signal.send_replace(true);
            }
        });

        Self {
            settings,
            harness: Harness::new(),
            interrupt,
            _listener: listener,
        }
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Runs every entry. A failing entry does not stop the run; an entry
    /// cancelled by Ctrl+C does.
    pub async fn run_all(&mut self, entries: &[Entry]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.run_entry(entry).await;
            let cancelled = matches!(&result, Ok(report) if report.state == WorkerState::Cancelled);

            #[cfg(feature = "tracing")]
            {
                if let Err(e) = &result {
                    tracing::warn!("Entry {} failed: {:#}", entry.name, e);
                }
            }

            outcomes.push(Outcome {
                name: entry.name.clone(),
                result,
            });
            if cancelled {
                #[cfg(feature = "tracing")]
                tracing::info!("Interrupted, skipping remaining entries");
                break;
            }
        }
        outcomes
    }

    /// Resolves, calls, then evaluates the entry's expectations and events.
    /// Ctrl+C during resolution skips the call; during the call it stops the
    /// worker. Either way the report is [`WorkerState::Cancelled`].
    ///
    /// # Errors
    ///
    /// Resolution, dial and call errors, a failed expectation, or a failed
    /// event.
    pub async fn run_entry(&mut self, entry: &Entry) -> anyhow::Result<EntryReport> {
        let host = self
            .harness
            .substitute(entry.url.as_deref().unwrap_or(&self.settings.host));
        let target = format!("{} on {}", entry.call, host);

        #[cfg(feature = "tracing")]
        tracing::info!("Running {} ({})", entry.name, target);

        let mut config = RunConfig::new(host, entry.call.as_str(), self.settings.schema_for(entry))
            .with_transport(self.settings.transport.clone())
            .with_stream(self.settings.stream);
        if let Some(timeout) = self.settings.timeout {
            config = config.with_timeout(timeout);
        }

        let mut interrupted = self.interrupt.subscribe();
        let session = tokio::select! {
            biased;
            _ = interrupted.wait_for(|&set| set) => return Ok(EntryReport::interrupted()),
            session = Session::connect(config) => {
                session.with_context(|| format!("resolving {target}"))?
            }
        };

        let payloads: Vec<String> = entry
            .payloads()
            .iter()
            .map(|payload| self.harness.substitute(payload))
            .collect();
        let metadata: Vec<(String, String)> = self
            .settings
            .metadata
            .iter()
            .cloned()
            .chain(
                entry
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
            )
            .map(|(k, v)| {
                let v = self.harness.substitute(&v);
                (k, v)
            })
            .collect();
        let headers = metadata_map(&metadata)?;

        let provider = TemplateProvider::new(session.method().input(), payloads.clone());
        let mut worker = session.worker(entry.name.as_str());

        let stop = worker.stop_handle();
        let mut watcher = JoinSet::new();
        watcher.spawn(async move {
            if interrupted.wait_for(|&set| set).await.is_ok() {
                // `stop` is a no-op until `run` arms the handle.
                while !stop.stop() {
                    tokio::task::yield_now().await;
                }
            }
        });
        let result = worker.run(CallInput::provider(provider), headers).await;
        drop(watcher);

        drop(worker);
        let _state = session.close().await;
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection for {} closed in state {}", entry.name, _state);

        let report = result?;
        self.harness
            .record(&request_body(&payloads), &metadata, &report)?;
        self.harness.check(&entry.expect)?;
        self.harness.apply(&entry.event)?;

        let response = report
            .response
            .as_ref()
            .map(message_to_json)
            .transpose()?;

        Ok(EntryReport {
            state: report.state,
            sent: report.sent,
            received: report.received,
            elapsed: report.elapsed,
            response,
        })
    }
}

/// What `$req.$body` shows: the payload, or a JSON array of payloads for a
/// streamed request.
fn request_body(payloads: &[String]) -> String {
    match payloads {
        [single] => single.clone(),
        many => format!("[{}]", many.join(",")),
    }
}

fn metadata_map(pairs: &[(String, String)]) -> anyhow::Result<MetadataMap> {
    let mut map = MetadataMap::new();
    for (name, raw) in pairs {
        let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid metadata key `{name}`"))?;
        let value = MetadataValue::try_from(raw.as_str())
            .with_context(|| format!("invalid metadata value for `{name}`"))?;
        map.append(key, value);
    }
    Ok(map)
}
