//! Player result parsing and retry handoff.
//!
//! The player CLI writes a JSON result tree per test case; any node with a
//! failing play status contributes a human-readable error line. Completed
//! runs are persisted as JSON run records so a later invocation can replay
//! them and skip already-passed cases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use rth_common::ConfigError;
use rth_common::config::TestFilters;
use rth_common::protocol::{
    InvocationListener, LogKind, RecordingListener, RunRecord, TestDescription, TestStatus,
};

/// Defensive bound on result tree nesting.
const MAX_RESULT_DEPTH: usize = 64;

/// Collect the failure messages of every failed node in a result tree.
///
/// Children are visited before their parent, matching the order the
/// player executes nested actions. An empty vec means the case passed.
pub fn parse_result_tree(root: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    walk_result(root, 0, &mut errors);
    errors
}

fn walk_result(node: &Value, depth: usize, errors: &mut Vec<String>) {
    if depth >= MAX_RESULT_DEPTH {
        warn!("result tree exceeds depth {MAX_RESULT_DEPTH}; truncating traversal");
        return;
    }
    if let Some(children) = node.get("childrenResult").and_then(Value::as_array) {
        for child in children {
            walk_result(child, depth + 1, errors);
        }
    }
    let failed = node
        .get("playStatus")
        .and_then(Value::as_str)
        .is_some_and(|status| status.eq_ignore_ascii_case("FAIL"));
    if failed {
        let field = |key: &str| node.get(key).and_then(Value::as_str).unwrap_or_default();
        errors.push(format!(
            "{} ({}): {}",
            field("actionId"),
            field("content"),
            field("validationDetails"),
        ));
    }
}

/// Load run records persisted by a previous invocation.
pub fn load_previous_records(path: &Path) -> Result<Vec<RunRecord>, ConfigError> {
    let bad = |reason: String| ConfigError::BadPreviousResults {
        path: path.to_path_buf(),
        reason,
    };
    if !path.is_file() {
        return Err(bad("not found".to_string()));
    }
    let raw = std::fs::read_to_string(path).map_err(|err| bad(err.to_string()))?;
    serde_json::from_str(&raw).map_err(|err| bad(err.to_string()))
}

/// Replay previous runs through the listener and exclude every test that
/// does not need to re-run. Failed tests are replayed as failures and stay
/// eligible; everything else is treated as satisfied.
pub fn replay_previous_records(
    records: &[RunRecord],
    module: &str,
    listener: &mut dyn InvocationListener,
    filters: &mut TestFilters,
) {
    let prefix = format!("{module}#");
    for record in records.iter().filter(|r| r.name.starts_with(&prefix)) {
        listener.test_run_started(&record.name, record.tests.len());
        for test in &record.tests {
            let desc = description_from_id(&test.id, module);
            listener.test_started(&desc, test.start_ms);
            if test.status == TestStatus::Failed {
                listener.test_failed(&desc, &test.trace);
            } else {
                filters.exclude_id(&test.id);
            }
            listener.test_ended(&desc, test.end_ms, &HashMap::new());
        }
        listener.test_run_ended(record.elapsed_ms, &HashMap::new());
    }
}

fn description_from_id(id: &str, default_module: &str) -> TestDescription {
    match id.split_once('#') {
        Some((module, name)) => TestDescription::new(module, name),
        None => TestDescription::new(default_module, id),
    }
}

/// Listener that records the run and persists it as JSON for file-based
/// retries. The write goes to `<path>.tmp` first and is renamed into
/// place, so a crashed invocation never leaves a truncated results file.
pub struct FileResultReporter {
    output_path: PathBuf,
    recorder: RecordingListener,
}

impl FileResultReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            recorder: RecordingListener::new(),
        }
    }

    pub fn recorder(&self) -> &RecordingListener {
        &self.recorder
    }

    fn persist(&self) {
        let tmp = self.output_path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let json = serde_json::to_string_pretty(self.recorder.runs())?;
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &self.output_path)
        };
        if let Err(err) = write() {
            warn!(
                "failed to persist results to {}: {err}",
                self.output_path.display()
            );
        }
    }
}

impl InvocationListener for FileResultReporter {
    fn test_run_started(&mut self, name: &str, count: usize) {
        self.recorder.test_run_started(name, count);
    }

    fn test_started(&mut self, desc: &TestDescription, start_ms: i64) {
        self.recorder.test_started(desc, start_ms);
    }

    fn test_failed(&mut self, desc: &TestDescription, message: &str) {
        self.recorder.test_failed(desc, message);
    }

    fn test_ended(&mut self, desc: &TestDescription, end_ms: i64, metrics: &HashMap<String, String>) {
        self.recorder.test_ended(desc, end_ms, metrics);
    }

    fn test_run_ended(&mut self, elapsed_ms: i64, metrics: &HashMap<String, String>) {
        self.recorder.test_run_ended(elapsed_ms, metrics);
        self.persist();
    }

    fn test_log(&mut self, name: &str, kind: LogKind, path: &Path) {
        self.recorder.test_log(name, kind, path);
    }
}
