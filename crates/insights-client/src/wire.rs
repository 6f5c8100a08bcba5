//! Line protocol spoken with the daemon's unix socket plugin.
//!
//! One command per `\n` terminated line:
//!
//! - `PUTVAL <host>/mcac-<name>/<type> interval=<n> <tags> N:<v1>[:<v2>...]`
//! - `PUTINSIGHT <json>`
//! - `RELOADINSIGHTS`

use std::fmt;

/// Marks values that must not reach the insights upload.
pub const FILTER_INSIGHTS_TAG: &str = "mcac_filtered=true";

/// Why a metric is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    /// Regular sample on an insight tick.
    Sample,
    /// Regular sample kept out of insights.
    InsightFiltered,
    /// Last value of a removed metric.
    Final { insight_filtered: bool },
}

impl EmitKind {
    pub fn is_insight_filtered(self) -> bool {
        matches!(
            self,
            EmitKind::InsightFiltered
                | EmitKind::Final {
                    insight_filtered: true
                }
        )
    }

    pub fn tags(self) -> &'static str {
        if self.is_insight_filtered() {
            FILTER_INSIGHTS_TAG
        } else {
            ""
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PutVal(String),
    PutInsight(String),
    ReloadInsights,
}

impl Command {
    /// Wire form, newline terminated. Newlines inside the payload are dropped.
    pub fn encode(&self) -> String {
        let (verb, payload) = match self {
            Command::PutVal(payload) => ("PUTVAL", Some(payload)),
            Command::PutInsight(payload) => ("PUTINSIGHT", Some(payload)),
            Command::ReloadInsights => ("RELOADINSIGHTS", None),
        };

        match payload {
            Some(payload) => {
                let mut line = String::with_capacity(verb.len() + payload.len() + 2);
                line.push_str(verb);
                line.push(' ');
                line.extend(payload.chars().filter(|c| *c != '\n' && *c != '\r'));
                line.push('\n');
                line
            }
            None => format!("{verb}\n"),
        }
    }
}

/// A value of a `PUTVAL` list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Builds the payload of a `PUTVAL` command.
pub fn put_val(host: &str, name: &str, kind: &str, interval: u64, tags: &str, values: &[Value]) -> Command {
    let mut payload = format!("{host}/mcac-{name}/{kind} interval={interval} {tags} N");
    for value in values {
        payload.push(':');
        payload.push_str(&value.to_string());
    }
    Command::PutVal(payload)
}

/// Destination of encoded commands.
pub trait CommandSink {
    /// Queues `command` without flushing. Returns false when it was dropped.
    fn send(&mut self, command: Command) -> bool;

    fn flush(&mut self);
}
