use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

/// Limits enforced around every execution.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Ceiling for nested `analyze_subsection` / `parallel_analyze` calls
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
    /// Wall-clock deadline per execution
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Results with more top-level items are truncated and flagged
    #[serde(default = "default_max_result_items")]
    pub max_result_items: usize,
    /// Per comprehension clause
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_collection_len")]
    pub max_collection_len: usize,
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
    /// How many evaluation steps between two deadline checks
    #[serde(default = "default_step_check_interval")]
    pub step_check_interval: u64,
    #[serde(default = "default_max_nesting")]
    pub max_nesting: usize,
    #[serde(default = "default_max_pattern_len")]
    pub max_pattern_len: usize,
    #[serde(default = "default_max_parallel_ranges")]
    pub max_parallel_ranges: usize,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    /// Capacity of the per-session execution log (oldest evicted first)
    #[serde(default = "default_execution_log_capacity")]
    pub execution_log_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Upper bound on `summarize_range` output
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    #[serde(default = "default_timeline_summary_chars")]
    pub timeline_summary_chars: usize,
}

fn default_max_recursion_depth() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_result_items() -> usize {
    1000
}

fn default_max_iterations() -> usize {
    10_000
}

fn default_max_collection_len() -> usize {
    100_000
}

fn default_max_string_len() -> usize {
    1_000_000
}

fn default_step_check_interval() -> u64 {
    256
}

fn default_max_nesting() -> usize {
    64
}

fn default_max_pattern_len() -> usize {
    512
}

fn default_max_parallel_ranges() -> usize {
    10
}

fn default_max_search_results() -> usize {
    100
}

fn default_execution_log_capacity() -> usize {
    100
}

fn default_summary_max_chars() -> usize {
    500
}

fn default_timeline_summary_chars() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            timeout_ms: default_timeout_ms(),
            max_result_items: default_max_result_items(),
            max_iterations: default_max_iterations(),
            max_collection_len: default_max_collection_len(),
            max_string_len: default_max_string_len(),
            step_check_interval: default_step_check_interval(),
            max_nesting: default_max_nesting(),
            max_pattern_len: default_max_pattern_len(),
            max_parallel_ranges: default_max_parallel_ranges(),
            max_search_results: default_max_search_results(),
            execution_log_capacity: default_execution_log_capacity(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: default_summary_max_chars(),
            timeline_summary_chars: default_timeline_summary_chars(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Human-readable one-line summary of the limits, for startup logs
    pub fn limits_description(&self) -> String {
        format!(
            "timeout {}ms, recursion depth {}, result items {}",
            self.timeout_ms, self.max_recursion_depth, self.max_result_items
        )
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SANDBOX_TIMEOUT_MS}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise returns the built-in defaults.
    /// Used for the implicit default path; an explicit path must exist.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, content: &str) -> String {
        let path = dir.join("sandbox.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    // ── defaults ────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.max_recursion_depth, 5);
        assert_eq!(config.engine.timeout_ms, 5000);
        assert_eq!(config.engine.max_result_items, 1000);
        assert_eq!(config.engine.execution_log_capacity, 100);
        assert_eq!(config.context.timeline_summary_chars, 100);
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.timeout_ms, 5000);
        assert_eq!(config.context.summary_max_chars, 500);
    }

    #[test]
    fn test_timeout_duration() {
        let config = EngineConfig {
            timeout_ms: 250,
            ..EngineConfig::default()
        };
        assert_eq!(config.timeout(), Duration::from_millis(250));
    }

    // ── loading ─────────────────────────────────────────

    #[test]
    fn test_load_partial_engine_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[engine]\nmax_recursion_depth = 3\ntimeout_ms = 1000\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.max_recursion_depth, 3);
        assert_eq!(config.engine.timeout_ms, 1000);
        // Untouched fields keep their defaults
        assert_eq!(config.engine.max_result_items, 1000);
    }

    #[test]
    fn test_load_expands_env_vars() {
        std::env::set_var("CONTEXT_SANDBOX_TEST_ITEMS", "42");
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[engine]\nmax_result_items = ${CONTEXT_SANDBOX_TEST_ITEMS}\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.max_result_items, 42);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(Config::load("/nonexistent/sandbox.toml").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/sandbox.toml").unwrap();
        assert_eq!(config.engine.max_recursion_depth, 5);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[engine\ntimeout_ms = ");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_limits_description() {
        let config = EngineConfig::default();
        assert_eq!(
            config.limits_description(),
            "timeout 5000ms, recursion depth 5, result items 1000"
        );
    }
}
