use std::path::{Path, PathBuf};
use std::time::Duration;

use harvest_storage::{BackoffPolicy, HttpClientConfig};

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub sources_file: PathBuf,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub web_port: u16,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var("HARVEST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            artifacts_dir: std::env::var("HARVEST_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            sources_file: std::env::var("HARVEST_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("HARVEST_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("HARVEST_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            user_agent: std::env::var("HARVEST_USER_AGENT")
                .unwrap_or_else(|_| "harvest-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("HARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_retries: std::env::var("HARVEST_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            web_port: std::env::var("HARVEST_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Everything under one directory, no database, scheduler off.
    pub fn for_state_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            state_dir: root.join("state"),
            artifacts_dir: root.join("artifacts"),
            sources_file: root.join("sources.yaml"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            user_agent: "harvest-bot/0.1".to_string(),
            http_timeout_secs: 20,
            max_retries: 3,
            web_port: 8000,
        }
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn fingerprints_dir(&self) -> PathBuf {
        self.state_dir.join("fingerprints")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.state_dir.join("runs.jsonl")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.join("fetch_metadata.jsonl")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_root_layout() {
        let config = HarvestConfig::for_state_root("/tmp/harvest");
        assert_eq!(config.checkpoints_dir(), PathBuf::from("/tmp/harvest/state/checkpoints"));
        assert_eq!(config.run_log_path(), PathBuf::from("/tmp/harvest/state/runs.jsonl"));

        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(20));
        assert_eq!(http.backoff.max_retries, 3);
        assert_eq!(http.user_agent.as_deref(), Some("harvest-bot/0.1"));
    }
}
