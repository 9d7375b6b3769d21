use super::collection::substitute;
use anyhow::{Context as _, bail};
use rpcprobe_core::{CallReport, MetadataMap, message_to_json};
use rpcprobe_expr::{Context, Exchange, Message, Value, evaluate};
use std::collections::HashMap;

/// Expression host for a run: an environment shared by every entry plus the
/// request and response of the latest call.
#[derive(Debug, Default)]
pub struct Harness {
    env: HashMap<String, Value>,
    request: Option<Exchange>,
    response: Option<Exchange>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env_map(&self) -> &HashMap<String, Value> {
        &self.env
    }

    /// Fills `{{name}}` placeholders from the environment.
    pub fn substitute(&self, text: &str) -> String {
        substitute(text, |name| self.env.get(name).map(Value::to_text))
    }

    /// Makes a finished call visible to expressions as `$req` and `$res`.
    ///
    /// The response body is the last received message as JSON (empty when
    /// nothing was received) and its headers are the response metadata.
    pub fn record(
        &mut self,
        payload: &str,
        metadata: &[(String, String)],
        report: &CallReport,
    ) -> anyhow::Result<()> {
        let body = match &report.response {
            Some(message) => message_to_json(message)
                .context("failed to render response")?
                .to_string(),
            None => String::new(),
        };

        self.request = Some(
            metadata
                .iter()
                .fold(Exchange::new(payload), |ex, (k, v)| ex.with_header(k, v)),
        );
        self.response = Some(
            headers(&report.metadata)
                .into_iter()
                .fold(Exchange::new(body), |ex, (k, v)| ex.with_header(k, v)),
        );
        Ok(())
    }

    /// Every expectation must hold. Non-boolean results do not count against
    /// the entry.
    pub fn check(&mut self, expectations: &[String]) -> anyhow::Result<()> {
        for source in expectations {
            let value = evaluate(source, self)
                .with_context(|| format!("expectation `{source}` could not be evaluated"))?;
            if value.as_bool() == Some(false) {
                bail!("expectation `{source}` does not hold");
            }
        }
        Ok(())
    }

    /// Runs events in order, stopping at the first error.
    pub fn apply(&mut self, events: &[String]) -> anyhow::Result<()> {
        for source in events {
            evaluate(source, self).with_context(|| format!("event `{source}` failed"))?;
        }
        Ok(())
    }
}

impl Context for Harness {
    fn request(&self) -> Option<&dyn Message> {
        self.request.as_ref().map(|ex| ex as &dyn Message)
    }

    fn response(&self) -> Option<&dyn Message> {
        self.response.as_ref().map(|ex| ex as &dyn Message)
    }

    fn env(&self, key: &str) -> Option<Value> {
        self.env.get(key).cloned()
    }

    fn set_env(&mut self, key: &str, value: Value) {
        self.env.insert(key.to_string(), value);
    }
}

/// ASCII metadata as header pairs. Binary (`-bin`) entries are skipped.
fn headers(metadata: &MetadataMap) -> Vec<(String, String)> {
    let map = metadata.clone().into_headers();
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .filter(|_| !name.as_str().ends_with("-bin"))
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcprobe_core::{DescriptorRegistry, WorkerState, message_from_json};
    use rpcprobe_testserver::proto::FILE_DESCRIPTOR_SET;
    use std::time::Duration;

    fn report(reply: Option<&str>, headers: &[(&'static str, &'static str)]) -> CallReport {
        let response = reply.map(|json| {
            let registry = DescriptorRegistry::from_bytes(FILE_DESCRIPTOR_SET).unwrap();
            let method = registry.method("helloworld.Greeter/SayHello").unwrap();
            message_from_json(&method.output(), json).unwrap()
        });
        let mut metadata = MetadataMap::new();
        for (k, v) in headers {
            metadata.insert(*k, v.parse().unwrap());
        }
        CallReport {
            state: WorkerState::Completed,
            sent: 1,
            received: u64::from(response.is_some()),
            response,
            metadata,
            elapsed: Duration::from_millis(1),
        }
    }

    fn recorded(reply: Option<&str>) -> Harness {
        let mut harness = Harness::new();
        harness
            .record(
                r#"{"name":"probe"}"#,
                &[("trace".to_string(), "t-1".to_string())],
                &report(reply, &[("server", "greeter"), ("x-served-by", "greeter")]),
            )
            .unwrap();
        harness
    }

    #[test]
    fn response_body_is_the_reply_as_json() {
        let mut harness = recorded(Some(r#"{"message":"Hello probe","count":2}"#));

        harness
            .check(&[
                r#"@contain($res.$body.$str, "Hello probe")"#.to_string(),
                r#"@contain($req.$body.$str, "probe")"#.to_string(),
            ])
            .unwrap();

        harness
            .apply(&["$env.greeting = $res.$body.$json.message".to_string()])
            .unwrap();
        assert_eq!(
            harness.env_map().get("greeting"),
            Some(&Value::from("Hello probe"))
        );
    }

    #[test]
    fn headers_come_from_metadata() {
        let mut harness = recorded(None);
        let value = evaluate("$res.$header.server", &mut harness).unwrap();
        assert_eq!(value, Value::from("greeter"));
        let value = evaluate("$res.$header.missing", &mut harness).unwrap();
        assert_eq!(value, Value::Null);

        harness
            .apply(&["$env.trace = $req.$header.TRACE".to_string()])
            .unwrap();
        assert_eq!(harness.env_map().get("trace"), Some(&Value::from("t-1")));
    }

    #[test]
    fn false_expectation_fails_with_its_source() {
        let mut harness = recorded(Some(r#"{"message":"Hello probe"}"#));
        let err = harness
            .check(&[r#"@contain($res.$body.$str, "Goodbye")"#.to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("Goodbye"));
    }

    #[test]
    fn non_boolean_expectations_are_ignored() {
        let mut harness = recorded(Some(r#"{"message":"Hello probe"}"#));
        harness
            .check(&["$res.$body.$json.message".to_string()])
            .unwrap();
    }

    #[test]
    fn evaluation_errors_fail_the_check() {
        let mut harness = recorded(None);
        // Empty body is not JSON.
        assert!(
            harness
                .check(&["$res.$body.$json.message".to_string()])
                .is_err()
        );
        assert!(harness.apply(&["$env.".to_string()]).is_err());
    }

    #[test]
    fn substitution_reads_the_environment() {
        let mut harness = Harness::new();
        harness.set_env("token", Value::from("abc"));
        harness.set_env("n", Value::from(3_i64));

        assert_eq!(
            harness.substitute(r#"{"name":"{{token}}-{{n}}-{{.RequestNumber}}"}"#),
            r#"{"name":"abc-3-{{.RequestNumber}}"}"#
        );
    }
}
