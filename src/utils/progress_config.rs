// src/utils/progress_config.rs

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::env;

/// Configuration for progress tracking throughout a clustering run
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Whether to show progress bars at all
    pub enabled: bool,
    /// Whether to show per-partition sub-progress bars
    pub detailed: bool,
    /// Whether to show memory usage in progress messages
    pub show_memory: bool,
    /// Whether to show database connection pool statistics
    pub show_db_connection_stats: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed: true,
            show_memory: true,
            show_db_connection_stats: true,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

impl ProgressConfig {
    /// Create progress configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("PROGRESS_ENABLED", true),
            detailed: env_flag("PROGRESS_DETAILED", true),
            show_memory: env_flag("PROGRESS_SHOW_MEMORY", true),
            show_db_connection_stats: env_flag("PROGRESS_SHOW_DB_CONNECTIONS", true),
        }
    }

    /// Create a MultiProgress instance if progress is enabled, None otherwise
    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        if self.enabled {
            Some(MultiProgress::new())
        } else {
            None
        }
    }

    pub fn should_show_detailed(&self) -> bool {
        self.enabled && self.detailed
    }

    pub fn should_show_memory(&self) -> bool {
        self.enabled && self.show_memory
    }

    pub fn should_show_db_connection_stats(&self) -> bool {
        self.enabled && self.show_db_connection_stats
    }
}

/// Adds a bar of `len` steps to `multi_progress`, if there is one.
pub fn phase_bar(multi_progress: &Option<MultiProgress>, len: u64, indent: &str, msg: &str) -> Option<ProgressBar> {
    multi_progress.as_ref().map(|mp| {
        let pb = mp.add(ProgressBar::new(len));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{}{{spinner:.green}} [{{elapsed_precise}}] {{bar:30.cyan/blue}} {{pos}}/{{len}} {{msg}}",
                    indent
                ))
                .unwrap()
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        pb.set_message(msg.to_string());
        pb
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = ProgressConfig::default();
        assert!(config.enabled);
        assert!(config.detailed);
        assert!(config.show_memory);
        assert!(config.show_db_connection_stats);
    }

    #[test]
    fn test_env_config() {
        env::set_var("PROGRESS_ENABLED", "false");
        env::set_var("PROGRESS_DETAILED", "false");
        env::set_var("PROGRESS_SHOW_MEMORY", "nonsense");

        let config = ProgressConfig::from_env();
        assert!(!config.enabled);
        assert!(!config.detailed);
        assert!(config.show_memory);

        env::remove_var("PROGRESS_ENABLED");
        env::remove_var("PROGRESS_DETAILED");
        env::remove_var("PROGRESS_SHOW_MEMORY");
    }

    #[test]
    fn test_should_show_methods() {
        let mut config = ProgressConfig::default();
        assert!(config.should_show_detailed());
        assert!(config.should_show_memory());
        assert!(config.should_show_db_connection_stats());

        config.enabled = false;
        assert!(!config.should_show_detailed());
        assert!(!config.should_show_memory());
        assert!(!config.should_show_db_connection_stats());
        assert!(config.create_multi_progress().is_none());
        assert!(phase_bar(&config.create_multi_progress(), 3, "", "x").is_none());
    }
}
