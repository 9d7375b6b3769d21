//! Request collections: an ordered JSON array of named calls that share one
//! environment.
//!
//! ```json
//! [
//!   {
//!     "name": "login",
//!     "call": "auth.v1.Auth/Login",
//!     "data": { "user": "probe" },
//!     "expect": ["@contain($res.$body.$str, \"token\")"],
//!     "event": ["$env.token = $res.$body.$json.token"]
//!   },
//!   {
//!     "name": "whoami",
//!     "call": "auth.v1.Auth/WhoAmI",
//!     "metadata": { "authorization": "Bearer {{token}}" },
//!     "data": {}
//!   }
//! ]
//! ```

use anyhow::Context as _;
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path, path::PathBuf};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Entry {
    pub name: String,
    /// Overrides `--host` for this entry.
    #[serde(default)]
    pub url: Option<String>,
    /// Proto file for this entry; otherwise the run's schema (or reflection).
    #[serde(default)]
    pub proto: Option<PathBuf>,
    pub call: String,
    /// One JSON object per message. An array sends each element in order.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub expect: Vec<String>,
    #[serde(default)]
    pub event: Vec<String>,
}

impl Entry {
    /// Payload templates as JSON text, one per message to send.
    pub fn payloads(&self) -> Vec<String> {
        match &self.data {
            None => Vec::new(),
            Some(serde_json::Value::Array(items)) => items.iter().map(|v| v.to_string()).collect(),
            Some(value) => vec![value.to_string()],
        }
    }
}

pub fn parse(text: &str) -> anyhow::Result<Vec<Entry>> {
    let entries: Vec<Entry> = serde_json::from_str(text).context("invalid collection")?;
    if let Some(entry) = entries.iter().find(|e| e.call.trim().is_empty()) {
        anyhow::bail!("entry `{}` has no call target", entry.name);
    }
    Ok(entries)
}

pub fn load(path: &Path) -> anyhow::Result<Vec<Entry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read collection {}", path.display()))?;
    parse(&text).with_context(|| format!("in {}", path.display()))
}

/// Replaces `{{name}}` placeholders with `lookup(name)`.
///
/// Placeholders starting with `.` belong to per-message call data and are
/// left for the worker to render, as are names `lookup` does not know.
pub fn substitute(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after[..end].trim();
        let value = if name.starts_with('.') {
            None
        } else {
            lookup(name)
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_with_defaults() {
        let entries = parse(
            r#"[
                {"name": "a", "call": "helloworld.Greeter/SayHello", "data": {"name": "x"}},
                {"name": "b", "call": "helloworld.Greeter.SayHelloCS",
                 "url": "localhost:1", "data": [{"name": "1"}, {"name": "2"}],
                 "metadata": {"x-trace": "t"}, "expect": ["true"], "event": ["$env.a = 1"]}
            ]"#,
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, None);
        assert!(entries[0].expect.is_empty());
        assert_eq!(entries[0].payloads(), vec![r#"{"name":"x"}"#.to_string()]);

        assert_eq!(entries[1].url.as_deref(), Some("localhost:1"));
        assert_eq!(entries[1].payloads().len(), 2);
        assert_eq!(entries[1].metadata["x-trace"], "t");
        assert_eq!(entries[1].event, vec!["$env.a = 1".to_string()]);
    }

    #[test]
    fn rejects_unknown_fields_and_blank_calls() {
        assert!(parse(r#"[{"name": "a", "call": "s/m", "bogus": 1}]"#).is_err());
        let err = parse(r#"[{"name": "a", "call": " "}]"#).unwrap_err();
        assert!(err.to_string().contains("`a`"));
    }

    #[test]
    fn missing_data_has_no_payloads() {
        let entry = Entry {
            name: "a".into(),
            call: "s/m".into(),
            ..Entry::default()
        };
        assert!(entry.payloads().is_empty());
    }

    #[test]
    fn substitutes_known_names_only() {
        let lookup = |name: &str| (name == "token").then(|| "abc".to_string());

        assert_eq!(substitute("Bearer {{token}}", lookup), "Bearer abc");
        assert_eq!(substitute("{{ token }}-{{token}}", lookup), "abc-abc");
        assert_eq!(substitute("{{other}}", lookup), "{{other}}");
        assert_eq!(substitute("{{.RequestNumber}}", lookup), "{{.RequestNumber}}");
        assert_eq!(substitute("open {{token", lookup), "open {{token");
    }

    #[test]
    fn dotted_names_are_never_looked_up() {
        let lookup = |_: &str| Some("x".to_string());
        assert_eq!(substitute("{{.UUID}}", lookup), "{{.UUID}}");
    }

    #[test]
    fn load_names_the_file() {
        let err = load(Path::new("/nonexistent/collection.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/collection.json"));
    }
}
