use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_CONFIG_FILENAME: &str = "redmigrate.toml";
pub const CONFIG_ENV_KEY: &str = "REDMIGRATE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "config_path={} ({})\nconfig_exists={}",
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            self.config_path.exists()
        )
    }
}

/// Resolve the config file location: flag > `REDMIGRATE_CONFIG` > `./redmigrate.toml`.
pub fn resolve_paths(context: &ResolutionContext, config_flag: Option<&Path>) -> ResolvedPaths {
    resolve_paths_with_lookup(context, config_flag, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    config_flag: Option<&Path>,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let (config_path, config_source) = if let Some(path) = config_flag {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env(CONFIG_ENV_KEY).filter(|value| !value.trim().is_empty()) {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.join(DEFAULT_CONFIG_FILENAME), ValueSource::Default)
    };

    ResolvedPaths {
        config_path,
        config_source,
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use super::{ResolutionContext, ValueSource, resolve_paths_with_lookup};

    fn context() -> ResolutionContext {
        ResolutionContext {
            cwd: PathBuf::from("/work"),
        }
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let env = HashMap::from([("REDMIGRATE_CONFIG".to_string(), "/env/config.toml".to_string())]);
        let resolved = resolve_paths_with_lookup(
            &context(),
            Some(Path::new("custom.toml")),
            |key| env.get(key).cloned(),
        );
        assert_eq!(resolved.config_path, PathBuf::from("/work/custom.toml"));
        assert_eq!(resolved.config_source, ValueSource::Flag);
    }

    #[test]
    fn resolve_paths_uses_env_when_no_flag() {
        let env = HashMap::from([("REDMIGRATE_CONFIG".to_string(), "/env/vars.yaml".to_string())]);
        let resolved = resolve_paths_with_lookup(&context(), None, |key| env.get(key).cloned());
        assert_eq!(resolved.config_path, PathBuf::from("/env/vars.yaml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn resolve_paths_falls_back_to_cwd_default() {
        let resolved = resolve_paths_with_lookup(&context(), None, |_| None);
        assert_eq!(resolved.config_path, PathBuf::from("/work/redmigrate.toml"));
        assert_eq!(resolved.config_source, ValueSource::Default);
        assert!(resolved.diagnostics().contains("(default)"));
    }
}
