//! Starting worker processes

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use foreman_config::WorkersConfig;
use foreman_ipc::WorkerCategory;
use tracing::{debug, info};

use crate::error::{DispatchError, DispatchResult};
use crate::process::LaunchedWorker;

/// Something that can start a worker process for a category
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, category: &WorkerCategory) -> DispatchResult<LaunchedWorker>;
}

/// Launches `<executable> [script] [args...] <category>` with piped stdio
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    executable: PathBuf,
    script: Option<PathBuf>,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            script: None,
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            script: config.script.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            env: config.env.clone(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, category: &WorkerCategory) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.executable);
        if let Some(script) = &self.script {
            cmd.arg(script);
        }
        cmd.args(&self.args)
            .arg(category.as_str())
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, category: &WorkerCategory) -> DispatchResult<LaunchedWorker> {
        debug!(
            worker = %category,
            executable = %self.executable.display(),
            "Spawning worker process"
        );

        let child = self.command(category).spawn().map_err(|e| {
            DispatchError::unavailable(
                category,
                format!("failed to spawn {}: {}", self.executable.display(), e),
            )
        })?;

        let worker = LaunchedWorker::from_child(child)
            .map_err(|e| DispatchError::unavailable(category, e.to_string()))?;
        info!(worker = %category, pid = ?worker.pid(), "Spawned worker process");
        Ok(worker)
    }
}
