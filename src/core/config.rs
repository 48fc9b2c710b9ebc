//! Instance configuration lookup and launch command construction

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::instance::InstanceConfig;
use crate::error::ConfigError;

/// Resolves immutable instance configuration by name
pub trait ConfigStore: Send + Sync {
    /// Look up one instance; `ConfigError::NotFound` if absent
    fn get_instance_config(&self, name: &str) -> Result<InstanceConfig, ConfigError>;

    /// Names of every configured instance
    fn list_instances(&self) -> Result<Vec<String>, ConfigError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstancesFile {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

/// Reads `instances.json` on every lookup so edits apply without a restart
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, InstanceConfig>, ConfigError> {
        if !self.path.exists() {
            debug!("No instance configuration at {:?}", self.path);
            return Ok(HashMap::new());
        }
        let json = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: InstancesFile =
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        validate_configs(file.instances)
    }
}

impl ConfigStore for JsonConfigStore {
    fn get_instance_config(&self, name: &str) -> Result<InstanceConfig, ConfigError> {
        self.load()?
            .remove(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))
    }

    fn list_instances(&self) -> Result<Vec<String>, ConfigError> {
        let mut names: Vec<String> = self.load()?.into_keys().collect();
        names.sort();
        Ok(names)
    }
}

/// Fixed in-memory configuration
#[derive(Default)]
pub struct StaticConfigStore {
    configs: HashMap<String, InstanceConfig>,
}

impl StaticConfigStore {
    pub fn new(configs: Vec<InstanceConfig>) -> Result<Self, ConfigError> {
        Ok(Self {
            configs: validate_configs(configs)?,
        })
    }
}

impl ConfigStore for StaticConfigStore {
    fn get_instance_config(&self, name: &str) -> Result<InstanceConfig, ConfigError> {
        self.configs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))
    }

    fn list_instances(&self) -> Result<Vec<String>, ConfigError> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

fn validate_configs(
    configs: Vec<InstanceConfig>,
) -> Result<HashMap<String, InstanceConfig>, ConfigError> {
    let mut ports = HashSet::new();
    let mut by_name = HashMap::new();
    for config in configs {
        if config.name.is_empty()
            || !config
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ConfigError::Invalid {
                name: config.name,
                reason: "names may only contain letters, digits, '-', '_' and '.'".to_string(),
            });
        }
        if config.port == 0 {
            return Err(ConfigError::Invalid {
                name: config.name,
                reason: "port must be non-zero".to_string(),
            });
        }
        if !ports.insert((config.host.clone(), config.port)) {
            return Err(ConfigError::Invalid {
                reason: format!("{}:{} is used by another instance", config.host, config.port),
                name: config.name,
            });
        }
        if by_name.contains_key(&config.name) {
            return Err(ConfigError::Invalid {
                name: config.name,
                reason: "duplicate instance name".to_string(),
            });
        }
        by_name.insert(config.name.clone(), config);
    }
    Ok(by_name)
}

/// Fully resolved spawn arguments
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
}

/// Supplies the executable and arguments used to spawn an instance
pub trait LaunchResolver: Send + Sync {
    /// Absolute path of the managed server executable
    fn resolve_executable_path(&self) -> Result<PathBuf, ConfigError>;

    /// Build the full command for one instance
    fn build_command(&self, config: &InstanceConfig) -> Result<LaunchCommand, ConfigError>;
}

/// Default argument template for llama.cpp-style servers
pub fn default_args_template() -> Vec<String> {
    ["--model", "{model}", "--host", "{host}", "--port", "{port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Launches one server executable, expanding `{model}`, `{host}`, `{port}`
/// and `{name}` placeholders in an argument template
pub struct ServerLaunchResolver {
    executable: PathBuf,
    args_template: Vec<String>,
}

impl ServerLaunchResolver {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args_template: default_args_template(),
        }
    }

    pub fn with_args_template(mut self, template: Vec<String>) -> Self {
        self.args_template = template;
        self
    }

    /// File name of the managed executable, used for orphan detection
    pub fn executable_name(&self) -> Option<String> {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }
}

/// Substitute the instance placeholders in one argument
pub fn expand_placeholders(arg: &str, config: &InstanceConfig) -> String {
    arg.replace("{model}", &config.model.to_string_lossy())
        .replace("{host}", &config.host)
        .replace("{port}", &config.port.to_string())
        .replace("{name}", &config.name)
}

impl LaunchResolver for ServerLaunchResolver {
    fn resolve_executable_path(&self) -> Result<PathBuf, ConfigError> {
        let not_found = || ConfigError::Invalid {
            name: self.executable.to_string_lossy().to_string(),
            reason: "executable not found".to_string(),
        };

        if self.executable.components().count() > 1 || self.executable.is_absolute() {
            return if self.executable.is_file() {
                Ok(self.executable.clone())
            } else {
                Err(not_found())
            };
        }

        let path_var = std::env::var_os("PATH").ok_or_else(not_found)?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(&self.executable))
            .find(|candidate| candidate.is_file())
            .ok_or_else(not_found)
    }

    fn build_command(&self, config: &InstanceConfig) -> Result<LaunchCommand, ConfigError> {
        let program = self.resolve_executable_path()?;
        let mut args: Vec<String> = self
            .args_template
            .iter()
            .map(|arg| expand_placeholders(arg, config))
            .collect();
        args.extend(config.arguments.iter().cloned());

        let working_directory = config
            .working_directory
            .clone()
            .or_else(|| program.parent().map(Path::to_path_buf));

        Ok(LaunchCommand {
            program,
            args,
            environment: config.environment.clone(),
            working_directory,
        })
    }
}
