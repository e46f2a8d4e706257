//! Invocation listener protocol.
//!
//! The launcher reports results through an [`InvocationListener`]. Call
//! ordering is fixed: `test_run_started` before any test, then per test
//! case `test_started` → optional `test_failed` → `test_ended`, and a
//! final `test_run_ended`. Every method is required; partial listeners
//! wrap [`RecordingListener`] instead of relying on default bodies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identifies one test case. The `Display` form (`module#name`) is what
/// include/exclude filters match against and what run records store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestDescription {
    pub module: String,
    pub name: String,
}

impl TestDescription {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for TestDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.module, self.name)
    }
}

/// Kind of an attached log artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Text,
    Json,
}

/// Receives test results as a run executes.
pub trait InvocationListener: Send {
    fn test_run_started(&mut self, name: &str, count: usize);
    fn test_started(&mut self, desc: &TestDescription, start_ms: i64);
    fn test_failed(&mut self, desc: &TestDescription, message: &str);
    fn test_ended(&mut self, desc: &TestDescription, end_ms: i64, metrics: &HashMap<String, String>);
    fn test_run_ended(&mut self, elapsed_ms: i64, metrics: &HashMap<String, String>);
    /// Attach a raw artifact file produced during the run.
    fn test_log(&mut self, name: &str, kind: LogKind, path: &Path);
}

/// Final status of a recorded test. Only terminal states are persisted;
/// retries treat everything non-failed as satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// One test case inside a [`RunRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub status: TestStatus,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Failure message, empty for passed tests.
    #[serde(default)]
    pub trace: String,
}

/// One completed test run, as persisted in a results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub elapsed_ms: i64,
    pub tests: Vec<TestRecord>,
}

/// Listener that records every callback. Backs the file reporter and
/// doubles as the protocol assertion helper in tests.
#[derive(Debug, Default)]
pub struct RecordingListener {
    runs: Vec<RunRecord>,
    current: Option<OpenRun>,
    logs: Vec<(String, LogKind, PathBuf)>,
}

#[derive(Debug)]
struct OpenRun {
    name: String,
    expected: usize,
    tests: Vec<TestRecord>,
    open_test: Option<TestRecord>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed runs recorded so far.
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Attached artifacts recorded so far.
    pub fn logs(&self) -> &[(String, LogKind, PathBuf)] {
        &self.logs
    }

    pub fn into_runs(self) -> Vec<RunRecord> {
        self.runs
    }

    /// Count of failed tests across all recorded runs.
    pub fn failure_count(&self) -> usize {
        self.runs
            .iter()
            .flat_map(|run| run.tests.iter())
            .filter(|test| test.status == TestStatus::Failed)
            .count()
    }

    /// Count of all tests across recorded runs.
    pub fn test_count(&self) -> usize {
        self.runs.iter().map(|run| run.tests.len()).sum()
    }
}

impl InvocationListener for RecordingListener {
    fn test_run_started(&mut self, name: &str, count: usize) {
        debug_assert!(self.current.is_none(), "unbalanced test_run_started");
        self.current = Some(OpenRun {
            name: name.to_string(),
            expected: count,
            tests: Vec::with_capacity(count),
            open_test: None,
        });
    }

    fn test_started(&mut self, desc: &TestDescription, start_ms: i64) {
        if let Some(run) = self.current.as_mut() {
            run.open_test = Some(TestRecord {
                id: desc.to_string(),
                status: TestStatus::Passed,
                start_ms,
                end_ms: start_ms,
                trace: String::new(),
            });
        }
    }

    fn test_failed(&mut self, desc: &TestDescription, message: &str) {
        if let Some(test) = self
            .current
            .as_mut()
            .and_then(|run| run.open_test.as_mut())
        {
            debug_assert_eq!(test.id, desc.to_string());
            test.status = TestStatus::Failed;
            if test.trace.is_empty() {
                test.trace = message.to_string();
            } else {
                test.trace.push('\n');
                test.trace.push_str(message);
            }
        }
    }

    fn test_ended(&mut self, _desc: &TestDescription, end_ms: i64, _metrics: &HashMap<String, String>) {
        if let Some(run) = self.current.as_mut() {
            if let Some(mut test) = run.open_test.take() {
                test.end_ms = end_ms;
                run.tests.push(test);
            }
        }
    }

    fn test_run_ended(&mut self, elapsed_ms: i64, _metrics: &HashMap<String, String>) {
        if let Some(run) = self.current.take() {
            debug_assert!(
                run.expected == 0 || run.tests.len() <= run.expected,
                "more tests reported than announced"
            );
            self.runs.push(RunRecord {
                name: run.name,
                elapsed_ms,
                tests: run.tests,
            });
        }
    }

    fn test_log(&mut self, name: &str, kind: LogKind, path: &Path) {
        self.logs.push((name.to_string(), kind, path.to_path_buf()));
    }
}
