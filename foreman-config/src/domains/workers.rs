//! Worker process launch configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConfigResult;
use crate::validation::{validate_token, validate_required_string, Validatable};

/// How worker processes are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Executable (or interpreter) started for every category
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Script handed to the executable as its first argument
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,

    /// Extra arguments placed before the category argument
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for worker processes; inherited when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Additional environment variables for worker processes
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Categories started eagerly at initialisation
    #[serde(default)]
    pub prewarm: Vec<String>,

    /// Whether the health monitor restarts workers found dead
    #[serde(default = "crate::domains::utils::default_true")]
    pub restart_on_crash: bool,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            script: None,
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
            prewarm: Vec::new(),
            restart_on_crash: true,
        }
    }
}

impl Validatable for WorkersConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.executable.to_string_lossy(),
            "executable",
            self.domain_name(),
        )?;

        if let Some(script) = &self.script {
            validate_required_string(&script.to_string_lossy(), "script", self.domain_name())?;
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(self.validation_error(format!(
                    "environment variable name '{}' is invalid",
                    key
                )));
            }
        }

        for category in &self.prewarm {
            validate_token(category, "prewarm", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workers"
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("foreman-worker")
}
