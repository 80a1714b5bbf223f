pub mod agents;
pub mod ask;
pub mod config_cmd;
pub mod tasks_cmd;

use anyhow::Context;
use relaycell_core::{Config, Paths};
use relaycell_storage::{HistoryPolicy, Store};
use std::path::PathBuf;

/// Resolved paths and configuration shared by every subcommand.
pub struct Env {
    pub paths: Paths,
    pub config_file: PathBuf,
    pub config: Config,
}

impl Env {
    pub fn load(config_file: Option<PathBuf>) -> anyhow::Result<Self> {
        let paths = Paths::new();
        let (config_file, config) = match config_file {
            Some(path) => {
                let config = Config::load(&path)
                    .with_context(|| format!("loading config from {}", path.display()))?;
                (path, config)
            }
            None => (paths.config_file(), Config::load_or_default(&paths)?),
        };
        Ok(Self {
            paths,
            config_file,
            config,
        })
    }

    pub fn open_store(&self) -> anyhow::Result<Store> {
        self.paths.ensure_dirs()?;
        let db_path = self.config.db_path(&self.paths);
        let store = Store::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        Ok(store.with_history_policy(HistoryPolicy::new(
            self.config.runner.recent_raw,
            self.config.runner.mask_threshold,
        )))
    }
}
