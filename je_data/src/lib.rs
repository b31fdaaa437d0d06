use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier allocated by the persistence layer, unique for the lifetime of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Unscheduled,
    Waiting,
    Running,
    Stopped,
    Killed,
    Errored,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Unscheduled => "UNSCHEDULED",
            State::Waiting => "WAITING",
            State::Running => "RUNNING",
            State::Stopped => "STOPPED",
            State::Killed => "KILLED",
            State::Errored => "ERRORED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Killed | State::Errored)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three byte streams kept for every job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Input,
    Output,
    Logs,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Input => "input",
            StreamKind::Output => "output",
            StreamKind::Logs => "logs",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
}

impl JobSpec {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            interactive: false,
        }
    }

    pub fn interactive(name: &str, args: &[&str]) -> Self {
        Self {
            interactive: true,
            ..Self::new(name, args)
        }
    }
}

/// Persisted view of a job.
///
/// Every lifecycle transition writes a full snapshot; the same record is what
/// the query API returns and what gets published on the message bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub state: State,
    /// Exit code, only meaningful once the job is `STOPPED`.
    #[serde(default)]
    pub status: i32,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "started", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "stopped", default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(rename = "killed", default)]
    pub killed_at: Option<DateTime<Utc>>,
    #[serde(rename = "errored", default)]
    pub errored_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            name: spec.name,
            args: spec.args,
            interactive: spec.interactive,
            worker: String::new(),
            state: State::Unscheduled,
            status: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            killed_at: None,
            errored_at: None,
        }
    }

    pub fn spec(&self) -> JobSpec {
        JobSpec {
            name: self.name.clone(),
            args: self.args.clone(),
            interactive: self.interactive,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{JobId, JobSnapshot, JobSpec, State};

    #[test]
    fn test_snapshot_field_names() {
        let snapshot = JobSnapshot::new(JobId(7), JobSpec::new("echo", &["hello"]));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(7, value["id"]);
        assert_eq!("echo", value["name"]);
        assert_eq!("UNSCHEDULED", value["state"]);
        assert_eq!(0, value["status"]);
        assert!(value["created"].is_string());
        assert!(value["started"].is_null());
        assert!(value.get("created_at").is_none());
    }

    #[test]
    fn test_snapshot_decodes_sparse_record() {
        let raw = r#"{"id":3,"name":"cat","state":"KILLED","created":"2021-06-01T10:00:00Z","killed":"2021-06-01T10:00:05Z","extra":true}"#;
        let snapshot: JobSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(JobId(3), snapshot.id);
        assert_eq!(State::Killed, snapshot.state);
        assert!(snapshot.args.is_empty());
        assert!(snapshot.killed_at.is_some());
        assert!(snapshot.stopped_at.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!State::Unscheduled.is_terminal());
        assert!(!State::Waiting.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(State::Stopped.is_terminal());
        assert!(State::Killed.is_terminal());
        assert!(State::Errored.is_terminal());
    }
}
