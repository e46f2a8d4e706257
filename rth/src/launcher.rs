//! Playbook dispatch.
//!
//! The launcher walks the configured playbook inputs into test cases,
//! executes each one through the external player CLI with a wall-clock
//! timeout, classifies the subprocess outcome, and reports through the
//! listener protocol. Test cases run strictly sequentially so listener
//! ordering stays deterministic; cancellation is observed at the
//! subprocess wait and unwinds as [`LaunchError::Interrupted`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use rth_common::cancel::CancelToken;
use rth_common::config::{TestFilters, TestInput};
use rth_common::errors::{ConfigError, HarnessError, LaunchError};
use rth_common::fsutil::unique_temp_dir;
use rth_common::protocol::{InvocationListener, LogKind, TestDescription};
use rth_common::types::{DeviceDescriptor, PlayMode};

use crate::results::{load_previous_records, parse_result_tree, replay_previous_records};

/// Module component of every test description this launcher emits.
pub const MODULE_NAME: &str = "playbook";

/// Where the player writes a case's result tree, relative to the case's
/// output directory.
pub const RESULT_FILE_SUBPATH: &str = "result/playback_result.json";

const INPUT_OPTION: &str = "--input";
const OUTPUT_OPTION: &str = "--output";
const DEVICES_OPTION: &str = "--devices";
const MODE_OPTION: &str = "--mode";
const GLOBAL_VARIABLE_OPTION: &str = "--global_variable";

/// Launcher lifecycle, advanced by [`PlaybookLauncher::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchState {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    TimedOut,
    Interrupted,
}

impl LaunchState {
    fn severity(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 0,
            Self::Completed => 1,
            Self::Failed => 2,
            Self::TimedOut => 3,
            Self::Interrupted => 4,
        }
    }

    /// Keep the most severe terminal classification seen so far.
    fn escalate(&mut self, next: LaunchState) {
        if next.severity() >= self.severity() {
            *self = next;
        }
    }
}

/// Launcher settings, typically derived from the invocation config.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Player CLI: an executable, or a `.jar` run through `java -jar`.
    pub player_cli: PathBuf,
    pub play_mode: PlayMode,
    pub test_timeout: Duration,
    /// Work directory; a temp dir is created when unset.
    pub work_dir: Option<PathBuf>,
    /// Results of a previous invocation to replay before running.
    pub previous_results: Option<PathBuf>,
    /// Auxiliary executables copied into the work dir.
    pub binaries: Vec<PathBuf>,
    /// Global variables per test key, each entry `key=value`.
    pub global_variables: HashMap<String, Vec<String>>,
    pub tests: Vec<TestInput>,
}

/// One dispatchable unit of work.
#[derive(Debug, Clone)]
struct PlaybookCase {
    /// Relative path id, stable across retries and mount points.
    id: String,
    /// Groups cases that share global variables.
    key: String,
    file: PathBuf,
    desc: TestDescription,
}

impl PlaybookCase {
    fn new(id: String, key: &str, file: PathBuf) -> Self {
        let desc = TestDescription::new(MODULE_NAME, &id);
        Self {
            id,
            key: key.to_string(),
            file,
            desc,
        }
    }
}

enum CaseOutcome {
    Success(std::process::Output),
    Failed(std::process::Output),
    Exception(std::io::Error),
    TimedOut,
}

pub struct PlaybookLauncher {
    config: LauncherConfig,
    filters: TestFilters,
    state: LaunchState,
    output_dir: PathBuf,
}

impl PlaybookLauncher {
    pub fn new(config: LauncherConfig, filters: TestFilters) -> Self {
        Self {
            config,
            filters,
            state: LaunchState::NotStarted,
            output_dir: PathBuf::new(),
        }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Run every configured playbook case against `devices`, reporting
    /// through `listener`. Returns `Err` only for configuration problems
    /// or interruption; per-case subprocess failures are listener events.
    pub async fn run(
        &mut self,
        devices: &[DeviceDescriptor],
        listener: &mut dyn InvocationListener,
        cancel: &CancelToken,
    ) -> Result<(), HarnessError> {
        if !self.config.player_cli.is_file() {
            return Err(ConfigError::PlayerNotFound(self.config.player_cli.clone()).into());
        }

        if let Some(previous) = self.config.previous_results.clone() {
            info!("Loading previous results from {}", previous.display());
            let records = load_previous_records(&previous)?;
            replay_previous_records(&records, MODULE_NAME, listener, &mut self.filters);
        }

        let mut cases = Vec::new();
        for input in &self.config.tests {
            cases.extend(discover_cases(&input.key, &input.path)?);
        }

        let work_dir = self.prepare_work_dir()?;
        self.output_dir = work_dir.join("output");
        self.state = LaunchState::Running;

        for case in cases {
            if !self.filters.should_run(&case.desc.to_string()) {
                debug!("Skipping {}", case.desc);
                continue;
            }
            let run_started = Instant::now();
            listener.test_run_started(&case.desc.to_string(), 1);
            let result = self.run_case(listener, &case, devices, &work_dir, cancel).await;
            listener.test_run_ended(run_started.elapsed().as_millis() as i64, &HashMap::new());
            if let Err(err) = result {
                self.state = LaunchState::Interrupted;
                return Err(err);
            }
        }
        if self.state == LaunchState::Running {
            self.state = LaunchState::Completed;
        }
        Ok(())
    }

    /// Create the work dir and stage auxiliary binaries into it.
    fn prepare_work_dir(&self) -> Result<PathBuf, HarnessError> {
        let work_dir = match &self.config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| LaunchError::WorkDir {
                    path: dir.clone(),
                    source,
                })?;
                dir.clone()
            }
            None => unique_temp_dir(MODULE_NAME).map_err(|source| LaunchError::WorkDir {
                path: std::env::temp_dir(),
                source,
            })?,
        };
        for binary in &self.config.binaries {
            stage_binary(binary, &work_dir).map_err(|source| LaunchError::WorkDir {
                path: work_dir.clone(),
                source,
            })?;
        }
        Ok(work_dir)
    }

    async fn run_case(
        &mut self,
        listener: &mut dyn InvocationListener,
        case: &PlaybookCase,
        devices: &[DeviceDescriptor],
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), HarnessError> {
        listener.test_started(&case.desc, now_ms());

        let command = self.build_command(case, devices);
        info!("Running {} (command: {:?})", case.desc, command);
        let outcome = self.execute(&command, work_dir, cancel).await?;
        match outcome {
            CaseOutcome::Success(output) => {
                debug!(
                    "Command succeeded, stdout = [{}], stderr = [{}].",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let result_file = self
                    .output_dir
                    .join(&case.id)
                    .join(RESULT_FILE_SUBPATH);
                self.verify_result_file(listener, case, &result_file);
                self.state.escalate(LaunchState::Completed);
            }
            CaseOutcome::Failed(output) => {
                error!(
                    "Command failed, stdout = [{}], stderr = [{}].",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                listener.test_failed(&case.desc, "Command failed");
                self.state.escalate(LaunchState::Failed);
            }
            CaseOutcome::Exception(err) => {
                error!("Command could not run: {err}");
                listener.test_failed(&case.desc, "Command failed");
                self.state.escalate(LaunchState::Failed);
            }
            CaseOutcome::TimedOut => {
                error!("Command timed out after {:?}.", self.config.test_timeout);
                listener.test_failed(&case.desc, "Command timed out");
                self.state.escalate(LaunchState::TimedOut);
            }
        }

        listener.test_ended(&case.desc, now_ms(), &HashMap::new());
        Ok(())
    }

    /// Wait on the player subprocess, bounded by the per-case timeout and
    /// the cancellation token. The child is killed when either fires.
    async fn execute(
        &self,
        command: &[String],
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CaseOutcome, HarnessError> {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tokio::select! {
            _ = cancel.cancelled() => Err(LaunchError::Interrupted.into()),
            waited = tokio::time::timeout(self.config.test_timeout, cmd.output()) => {
                Ok(match waited {
                    Err(_) => CaseOutcome::TimedOut,
                    Ok(Ok(output)) if output.status.success() => CaseOutcome::Success(output),
                    Ok(Ok(output)) => CaseOutcome::Failed(output),
                    Ok(Err(err)) => CaseOutcome::Exception(err),
                })
            }
        }
    }

    fn build_command(&self, case: &PlaybookCase, devices: &[DeviceDescriptor]) -> Vec<String> {
        let mut command = Vec::new();
        if self
            .config
            .player_cli
            .extension()
            .is_some_and(|ext| ext == "jar")
        {
            command.push("java".to_string());
            command.push("-jar".to_string());
        }
        command.push(self.config.player_cli.display().to_string());
        command.push(INPUT_OPTION.to_string());
        command.push(case.file.display().to_string());
        command.push(OUTPUT_OPTION.to_string());
        command.push(self.output_dir.join(&case.id).display().to_string());
        command.push(MODE_OPTION.to_string());
        command.push(self.config.play_mode.to_string());
        command.push(DEVICES_OPTION.to_string());
        command.push(
            devices
                .iter()
                .map(|d| d.serial.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(variables) = self.config.global_variables.get(&case.key) {
            command.push(GLOBAL_VARIABLE_OPTION.to_string());
            command.push(variables.join(","));
        }
        command
    }

    /// Parse the case's result tree and report failures. The raw file is
    /// attached as an artifact whenever it exists, pass or fail.
    fn verify_result_file(
        &self,
        listener: &mut dyn InvocationListener,
        case: &PlaybookCase,
        result_file: &Path,
    ) {
        if !result_file.is_file() {
            listener.test_failed(
                &case.desc,
                &format!("Test result file {} not found", result_file.display()),
            );
            return;
        }

        let parsed = std::fs::read_to_string(result_file)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw).map_err(|err| err.to_string())
            });
        match parsed {
            Ok(tree) => {
                let errors = parse_result_tree(&tree);
                if !errors.is_empty() {
                    listener.test_failed(&case.desc, &errors.join("\n"));
                }
            }
            Err(reason) => {
                error!("Failed to parse test result file: {reason}");
                listener.test_failed(
                    &case.desc,
                    &format!("Failed to parse test result file: {reason}"),
                );
            }
        }
        listener.test_log(&format!("{}_result", case.id), LogKind::Json, result_file);
    }
}

/// Expand one input path into test cases. A directory is walked
/// recursively; each regular file's id is its path relative to the
/// directory's parent, so ids do not depend on where the tree is mounted.
fn discover_cases(key: &str, path: &Path) -> Result<Vec<PlaybookCase>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::TestInputNotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![PlaybookCase::new(id, key, path.to_path_buf())]);
    }

    let base = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => path,
    };
    let mut cases = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            ConfigError::TestInputNotFound(err.path().unwrap_or(path).to_path_buf())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let id = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        cases.push(PlaybookCase::new(id, key, entry.path().to_path_buf()));
    }
    Ok(cases)
}

fn stage_binary(binary: &Path, work_dir: &Path) -> std::io::Result<()> {
    let name = binary
        .file_name()
        .ok_or_else(|| std::io::Error::other("binary path has no file name"))?;
    let staged = work_dir.join(name);
    std::fs::copy(binary, &staged)?;
    set_executable(&staged)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
