//! Configuration for the companion process and the run coordinator.
//!
//! Both configs follow the builder style: `new()` with defaults, then
//! `with_*` overrides. [`CompanionConfig::from_env`] fills in values from
//! `BIFROST_*` environment variables.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_COMPANION: &str = "BIFROST_COMPANION";
pub const ENV_RUNTIME_ARGS: &str = "BIFROST_RUNTIME_ARGS";
pub const ENV_DEPENDENCY_DIR: &str = "BIFROST_DEPENDENCY_DIR";
pub const ENV_SEGMENT: &str = "BIFROST_SEGMENT";
pub const ENV_NOTEBOOK: &str = "BIFROST_NOTEBOOK";

const DEFAULT_PROGRAM: &str = "node";
const DEFAULT_MODULE_PATH_VAR: &str = "NODE_PATH";
const DEFAULT_DEPENDENCY_DIR: &str = "node_modules";

/// How to launch the companion runtime.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub program: PathBuf,
    /// Arguments placed before the positional bridge arguments (runtime flags,
    /// entry script).
    pub runtime_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Local dependency directory appended to the module search path.
    pub dependency_dir: PathBuf,
    /// Environment variable holding the companion's module search path.
    pub module_path_var: String,
    pub envs: Vec<(String, String)>,
    pub shared_memory: bool,
    pub mp_shared: bool,
    pub notebook: bool,
    pub windows: bool,
    pub segment_name: String,
    /// How long a stopped monitor waits for the old process before killing it.
    pub reap_grace: Duration,
}

impl CompanionConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            runtime_args: Vec::new(),
            cwd: None,
            dependency_dir: PathBuf::from(DEFAULT_DEPENDENCY_DIR),
            module_path_var: DEFAULT_MODULE_PATH_VAR.to_string(),
            envs: Vec::new(),
            shared_memory: cfg!(unix),
            mp_shared: false,
            notebook: false,
            windows: cfg!(windows),
            segment_name: format!("bifrost_{}", uuid::Uuid::new_v4().simple()),
            reap_grace: Duration::from_secs(2),
        }
    }

    /// Defaults overridden by `BIFROST_*` environment variables.
    pub fn from_env() -> Self {
        let program = std::env::var_os(ENV_COMPANION)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM));
        let mut config = Self::new(program);

        if let Ok(args) = std::env::var(ENV_RUNTIME_ARGS) {
            config.runtime_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = std::env::var_os(ENV_DEPENDENCY_DIR) {
            config.dependency_dir = PathBuf::from(dir);
        }
        if let Ok(segment) = std::env::var(ENV_SEGMENT)
            && !segment.is_empty()
        {
            config.segment_name = segment;
        }
        if let Ok(value) = std::env::var(ENV_NOTEBOOK) {
            config.notebook = parse_flag(&value);
        }
        config
    }

    pub fn with_runtime_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_dependency_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dependency_dir = dir.into();
        self
    }

    pub fn with_module_path_var(mut self, var: impl Into<String>) -> Self {
        self.module_path_var = var.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_shared_memory(mut self, shared: bool, mp_shared: bool) -> Self {
        self.shared_memory = shared;
        self.mp_shared = mp_shared;
        self
    }

    pub fn with_notebook(mut self, notebook: bool) -> Self {
        self.notebook = notebook;
        self
    }

    pub fn with_segment_name(mut self, name: impl Into<String>) -> Self {
        self.segment_name = name.into();
        self
    }

    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    /// Dependency directory resolved against the companion's working directory
    /// (or the host's, when none is configured).
    pub fn resolved_dependency_dir(&self) -> PathBuf {
        if self.dependency_dir.is_absolute() {
            return self.dependency_dir.clone();
        }
        let base = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        base.join(&self.dependency_dir)
    }

    /// Positional bridge arguments, in the order the companion expects them.
    pub fn bridge_args(&self) -> [String; 5] {
        [
            render_flag(self.shared_memory),
            render_flag(self.mp_shared),
            render_flag(self.notebook),
            render_flag(self.windows),
            self.segment_name.clone(),
        ]
    }

    /// Full argument vector: runtime args followed by the bridge arguments.
    pub fn spawn_args(&self) -> Vec<String> {
        self.runtime_args
            .iter()
            .cloned()
            .chain(self.bridge_args())
            .collect()
    }

    /// Module search path with the dependency directory prepended to
    /// `existing` (usually the inherited value of [`Self::module_path_var`]).
    pub fn module_search_path(
        &self,
        existing: Option<&std::ffi::OsStr>,
    ) -> Result<OsString, std::env::JoinPathsError> {
        let dependency_dir = self.resolved_dependency_dir();
        let mut paths = vec![dependency_dir.clone()];
        if let Some(existing) = existing {
            paths.extend(std::env::split_paths(existing).filter(|p| *p != dependency_dir));
        }
        std::env::join_paths(paths)
    }
}

/// Coordinator behaviour for each run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound between two samples of the run flag.
    pub poll_interval: Duration,
    /// Applied when a run does not pass its own timeout.
    pub default_timeout: Option<Duration>,
    /// Log and skip variables whose (de)serializer fails instead of failing the sync.
    pub warn_on_sync_failure: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            default_timeout: None,
            warn_on_sync_failure: false,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_warn_on_sync_failure(mut self, warn: bool) -> Self {
        self.warn_on_sync_failure = warn;
        self
    }
}

/// Companion entry scripts expect `True`/`False`.
fn render_flag(flag: bool) -> String {
    let text = if flag { "True" } else { "False" };
    text.to_string()
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_args_keep_fixed_order() {
        let config = CompanionConfig::new("node")
            .with_shared_memory(true, false)
            .with_notebook(true)
            .with_segment_name("seg_1");
        let args = config.bridge_args();
        assert_eq!(args[0], "True");
        assert_eq!(args[1], "False");
        assert_eq!(args[2], "True");
        assert_eq!(args[3], if cfg!(windows) { "True" } else { "False" });
        assert_eq!(args[4], "seg_1");
    }

    #[test]
    fn runtime_args_precede_bridge_args() {
        let config = CompanionConfig::new("node")
            .with_runtime_args(["--max-old-space-size=32000", "main.js"])
            .with_segment_name("seg");
        let args = config.spawn_args();
        assert_eq!(args.len(), 7);
        assert_eq!(args[0], "--max-old-space-size=32000");
        assert_eq!(args[1], "main.js");
        assert_eq!(args[6], "seg");
    }

    #[test]
    fn segment_names_are_unique_by_default() {
        let a = CompanionConfig::new("node");
        let b = CompanionConfig::new("node");
        assert_ne!(a.segment_name, b.segment_name);
        assert!(a.segment_name.starts_with("bifrost_"));
    }

    #[cfg(unix)]
    #[test]
    fn module_search_path_prepends_dependency_dir() {
        let config = CompanionConfig::new("node")
            .with_cwd("/srv/app")
            .with_dependency_dir("node_modules");

        let fresh = config.module_search_path(None).unwrap();
        assert_eq!(fresh, OsString::from("/srv/app/node_modules"));

        let existing = std::env::join_paths(["/opt/lib", "/srv/app/node_modules"]).unwrap();
        let extended = config.module_search_path(Some(&existing)).unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&extended).collect();
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/srv/app/node_modules"),
                PathBuf::from("/opt/lib")
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn absolute_dependency_dir_ignores_cwd() {
        let config = CompanionConfig::new("node")
            .with_cwd("/srv/app")
            .with_dependency_dir("/deps");
        assert_eq!(config.resolved_dependency_dir(), PathBuf::from("/deps"));
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        for value in ["1", "true", "True", " yes ", "ON"] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["0", "false", "", "nope"] {
            assert!(!parse_flag(value), "{value}");
        }
    }

    #[test]
    fn bridge_config_defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(config.default_timeout.is_none());
        assert!(!config.warn_on_sync_failure);
    }
}
