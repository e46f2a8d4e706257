//! Invocation configuration.
//!
//! One TOML file describes everything a harness invocation needs: the
//! cluster identity, the player CLI and its timeouts, the build resources
//! to provision, the playbook inputs, test filters, device serials, and
//! key-scoped global variables. Filter regexes are compiled (and thereby
//! validated) at load time so a bad pattern fails before any work starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::errors::ConfigError;
use crate::types::{PlayMode, TestResource};

/// Default per-test-case wall clock timeout.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default path for the retry handoff results file.
pub const DEFAULT_OUTPUT_PATH: &str = "rth_results.json";

#[derive(Debug, Clone, Deserialize)]
pub struct InvocationConfig {
    pub invocation: InvocationSection,
    pub player: PlayerSection,
    pub resources: ResourceSection,
    #[serde(default)]
    pub tests: Vec<TestInput>,
    #[serde(default)]
    pub filters: FilterSection,
    #[serde(default)]
    pub devices: DeviceSection,
    /// Global variables scoped by test key, each entry `key=value`.
    #[serde(default)]
    pub global_variables: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvocationSection {
    pub cluster: String,
    #[serde(default)]
    pub lab_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSection {
    /// Player CLI: either an executable or a `.jar` (run via `java -jar`).
    pub cli: PathBuf,
    #[serde(default)]
    pub mode: PlayMode,
    #[serde(default = "default_test_timeout", with = "duration_str")]
    pub test_timeout: Duration,
    /// Work directory; a temp dir is created when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Results file from a previous invocation, replayed for retries.
    #[serde(default)]
    pub previous_results: Option<PathBuf>,
    /// Where to persist this invocation's results for future retries.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Auxiliary executables copied into the work dir for command actions.
    #[serde(default)]
    pub binaries: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSection {
    /// Root directory all resources must stay under.
    pub root_dir: PathBuf,
    #[serde(default = "default_true")]
    pub mount_zip: bool,
    #[serde(default = "default_build_id")]
    pub build_id: String,
    #[serde(default = "default_build_target")]
    pub build_target: String,
    #[serde(default, rename = "entry")]
    pub entries: Vec<TestResource>,
}

impl ResourceSection {
    /// Resources with the legacy zip rule applied: a `*.zip` resource with
    /// no explicit decompress directive decompresses into its own parent
    /// directory.
    pub fn normalized_entries(&self) -> Vec<TestResource> {
        self.entries
            .iter()
            .map(|entry| {
                if !entry.decompress && entry.name.ends_with(".zip") {
                    let parent = Path::new(&entry.name)
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    TestResource::new(&entry.name, &entry.url, true, parent)
                } else {
                    entry.clone()
                }
            })
            .collect()
    }
}

/// One playbook input: a file (one test case) or a directory (walked
/// recursively). `key` scopes global variables shared across cases.
#[derive(Debug, Clone, Deserialize)]
pub struct TestInput {
    #[serde(default = "default_test_key")]
    pub key: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub serials: Vec<String>,
}

impl InvocationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        // Surface bad filter patterns at load time.
        config.filters.compile()?;
        tracing::debug!(
            "Loaded invocation config from {} ({} resource(s), {} test input(s))",
            path.display(),
            config.resources.entries.len(),
            config.tests.len()
        );
        Ok(config)
    }
}

impl FilterSection {
    pub fn compile(&self) -> Result<TestFilters, ConfigError> {
        Ok(TestFilters {
            include: compile_patterns(&self.include)?,
            exclude: compile_patterns(&self.exclude)?,
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns.iter().map(|p| compile_full_match(p)).collect()
}

fn compile_full_match(pattern: &str) -> Result<Regex, ConfigError> {
    // Filters match the whole test id, not a substring.
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| ConfigError::BadFilter {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compiled include/exclude filters over test ids.
#[derive(Debug, Default)]
pub struct TestFilters {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TestFilters {
    /// Exclude wins; with includes present the id must match one of them.
    pub fn should_run(&self, test_id: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(test_id)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(test_id))
    }

    /// Exclude one literal test id (used when replaying passed results).
    pub fn exclude_id(&mut self, test_id: &str) {
        if let Ok(re) = compile_full_match(&regex::escape(test_id)) {
            self.exclude.push(re);
        }
    }
}

fn default_test_timeout() -> Duration {
    DEFAULT_TEST_TIMEOUT
}

fn default_output_path() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_PATH)
}

fn default_true() -> bool {
    true
}

fn default_build_id() -> String {
    "0".to_string()
}

fn default_build_target() -> String {
    "stub".to_string()
}

fn default_test_key() -> String {
    "default".to_string()
}

mod duration_str {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [invocation]
        cluster = "lab-1"
        lab_name = "sfo"

        [player]
        cli = "/opt/player/player.jar"
        mode = "MULTIDEVICE"
        test_timeout = "10m"

        [resources]
        root_dir = "/tmp/rth"

        [[resources.entry]]
        name = "suite.zip"
        url = "https://builds.example.com/suite.zip"

        [[tests]]
        key = "login"
        path = "playbooks/login"

        [filters]
        exclude = ["playbook#flaky/.*"]

        [devices]
        serials = ["SER1", "SER2"]

        [global_variables]
        login = ["user=tester"]
    "#;

    fn load_sample() -> InvocationConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invocation.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        InvocationConfig::load(&path).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let config = load_sample();
        assert_eq!(config.invocation.cluster, "lab-1");
        assert_eq!(config.player.mode, PlayMode::Multidevice);
        assert_eq!(config.player.test_timeout, Duration::from_secs(600));
        assert_eq!(config.player.output_path, PathBuf::from(DEFAULT_OUTPUT_PATH));
        assert_eq!(config.devices.serials.len(), 2);
        assert_eq!(config.global_variables["login"], vec!["user=tester"]);
    }

    #[test]
    fn zip_resources_default_to_decompress_in_parent() {
        let config = load_sample();
        let entries = config.resources.normalized_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].decompress);
        assert_eq!(entries[0].decompress_dir, "");
    }

    #[test]
    fn nested_zip_decompresses_into_its_directory() {
        let section = ResourceSection {
            root_dir: PathBuf::from("/tmp"),
            mount_zip: true,
            build_id: "0".into(),
            build_target: "stub".into(),
            entries: vec![TestResource::new("suite/bot.zip", "u", false, "")],
        };
        let entries = section.normalized_entries();
        assert_eq!(entries[0].decompress_dir, "suite");
    }

    #[test]
    fn bad_filter_fails_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invocation.toml");
        let bad = SAMPLE.replace("playbook#flaky/.*", "playbook#[unclosed");
        std::fs::write(&path, bad).unwrap();
        match InvocationConfig::load(&path) {
            Err(ConfigError::BadFilter { pattern, .. }) => {
                assert_eq!(pattern, "playbook#[unclosed")
            }
            other => panic!("expected BadFilter, got {other:?}"),
        }
    }

    #[test]
    fn filters_exclude_wins_over_include() {
        let section = FilterSection {
            include: vec!["playbook#smoke/.*".into()],
            exclude: vec!["playbook#smoke/broken\\.json".into()],
        };
        let filters = section.compile().unwrap();
        assert!(filters.should_run("playbook#smoke/login.json"));
        assert!(!filters.should_run("playbook#smoke/broken.json"));
        assert!(!filters.should_run("playbook#other/login.json"));
    }

    #[test]
    fn filters_match_whole_id_only() {
        let section = FilterSection {
            include: vec![],
            exclude: vec!["playbook#a\\.json".into()],
        };
        let filters = section.compile().unwrap();
        assert!(!filters.should_run("playbook#a.json"));
        // A substring match must not exclude.
        assert!(filters.should_run("playbook#a.json.bak"));
    }

    #[test]
    fn exclude_id_escapes_regex_metacharacters() {
        let mut filters = TestFilters::default();
        filters.exclude_id("playbook#a.json");
        assert!(!filters.should_run("playbook#a.json"));
        assert!(filters.should_run("playbook#axjson"));
    }
}
