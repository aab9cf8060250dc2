use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "redmigrate/0.2";
pub const DEFAULT_MAX_PUBLISH_ATTEMPTS: usize = 25;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigratorConfig {
    #[serde(default)]
    pub redmine: RedmineSection,
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub migration: MigrationSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RedmineSection {
    pub server: Option<String>,
    pub api_key: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub server: Option<String>,
    pub user: Option<String>,
    /// Base64 encoded, like the legacy `vars.yaml` files.
    pub password: Option<String>,
    pub space: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MigrationSection {
    #[serde(default)]
    pub leave_link: bool,
    #[serde(default)]
    pub replace_source: bool,
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_true")]
    pub transfer_attachments: bool,
    pub user_agent: Option<String>,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            leave_link: false,
            replace_source: false,
            max_publish_attempts: DEFAULT_MAX_PUBLISH_ATTEMPTS,
            fail_fast: false,
            transfer_attachments: true,
            user_agent: None,
        }
    }
}

fn default_max_publish_attempts() -> usize {
    DEFAULT_MAX_PUBLISH_ATTEMPTS
}

fn default_true() -> bool {
    true
}

/// Flat layout of legacy importer `vars.yaml` files.
#[derive(Debug, Clone, Deserialize, Default)]
struct LegacyVars {
    redmine_server: Option<String>,
    redmine_apikey: Option<String>,
    redmine_wiki_project: Option<String>,
    confluence_server: Option<String>,
    confluence_user: Option<String>,
    confluence_password: Option<String>,
    confluence_space: Option<String>,
}

impl From<LegacyVars> for MigratorConfig {
    fn from(vars: LegacyVars) -> Self {
        Self {
            redmine: RedmineSection {
                server: vars.redmine_server,
                api_key: vars.redmine_apikey,
                project: vars.redmine_wiki_project,
            },
            confluence: ConfluenceSection {
                server: vars.confluence_server,
                user: vars.confluence_user,
                password: vars.confluence_password,
                space: vars.confluence_space,
            },
            migration: MigrationSection::default(),
        }
    }
}

/// Command-line overrides; these win over env and file values.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub redmine_api_key: Option<String>,
    pub redmine_project: Option<String>,
    pub confluence_space: Option<String>,
}

/// Fully resolved connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub redmine_server: String,
    pub redmine_api_key: String,
    pub redmine_project: String,
    pub confluence_server: String,
    pub confluence_user: String,
    pub confluence_password: String,
    pub confluence_space: String,
    pub user_agent: String,
    pub migration: MigrationSection,
}

impl ResolvedConfig {
    /// Human readable summary with secrets masked.
    pub fn describe(&self) -> String {
        format!(
            "redmine_server={}\nredmine_project={}\nredmine_api_key={}\nconfluence_server={}\nconfluence_user={}\nconfluence_password={}\nconfluence_space={}\nleave_link={}\nreplace_source={}\nmax_publish_attempts={}\nfail_fast={}\ntransfer_attachments={}",
            self.redmine_server,
            self.redmine_project,
            mask(&self.redmine_api_key),
            self.confluence_server,
            self.confluence_user,
            mask(&self.confluence_password),
            self.confluence_space,
            self.migration.leave_link,
            self.migration.replace_source,
            self.migration.max_publish_attempts,
            self.migration.fail_fast,
            self.migration.transfer_attachments,
        )
    }
}

impl MigratorConfig {
    /// Resolve every setting: overrides > env > config file.
    pub fn resolve(&self, overrides: &ConfigOverrides) -> Result<ResolvedConfig> {
        self.resolve_with_lookup(overrides, |key| env::var(key).ok())
    }

    fn resolve_with_lookup<F>(&self, overrides: &ConfigOverrides, lookup_env: F) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |flag: Option<&String>, key: &str, file: Option<&String>| -> Option<String> {
            flag.map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| non_empty(lookup_env(key)))
                .or_else(|| non_empty(file.cloned()))
        };

        let redmine_server = pick(None, "REDMINE_SERVER", self.redmine.server.as_ref())
            .context("redmine server is not configured (REDMINE_SERVER or [redmine].server)")?;
        let redmine_api_key = pick(
            overrides.redmine_api_key.as_ref(),
            "REDMINE_API_KEY",
            self.redmine.api_key.as_ref(),
        )
        .context("redmine API key is not configured (REDMINE_API_KEY or [redmine].api_key)")?;
        let redmine_project = pick(
            overrides.redmine_project.as_ref(),
            "REDMINE_PROJECT",
            self.redmine.project.as_ref(),
        )
        .context("redmine project is not configured (REDMINE_PROJECT or [redmine].project)")?;
        let confluence_server = pick(None, "CONFLUENCE_SERVER", self.confluence.server.as_ref())
            .context("confluence server is not configured (CONFLUENCE_SERVER or [confluence].server)")?;
        let confluence_user = pick(None, "CONFLUENCE_USER", self.confluence.user.as_ref())
            .context("confluence user is not configured (CONFLUENCE_USER or [confluence].user)")?;
        let confluence_password = match non_empty(lookup_env("CONFLUENCE_PASSWORD")) {
            Some(plain) => plain,
            None => {
                let encoded = non_empty(self.confluence.password.clone()).context(
                    "confluence password is not configured (CONFLUENCE_PASSWORD or [confluence].password)",
                )?;
                decode_password(&encoded)?
            }
        };
        let confluence_space = pick(
            overrides.confluence_space.as_ref(),
            "CONFLUENCE_SPACE",
            self.confluence.space.as_ref(),
        )
        .context("confluence space is not configured (CONFLUENCE_SPACE or [confluence].space)")?;

        Ok(ResolvedConfig {
            redmine_server: redmine_server.trim_end_matches('/').to_string(),
            redmine_api_key,
            redmine_project,
            confluence_server: confluence_server.trim_end_matches('/').to_string(),
            confluence_user,
            confluence_password,
            confluence_space,
            user_agent: self
                .migration
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            migration: self.migration.clone(),
        })
    }
}

/// Load a config file. TOML is the native format; `.yaml`/`.yml` files are
/// read as legacy importer vars. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigratorConfig> {
    if !config_path.exists() {
        return Ok(MigratorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let is_yaml = config_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    if is_yaml {
        let vars: LegacyVars = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        return Ok(vars.into());
    }
    let parsed: MigratorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    if parsed.migration.max_publish_attempts == 0 {
        bail!(
            "[migration].max_publish_attempts must be at least 1 in {}",
            config_path.display()
        );
    }
    Ok(parsed)
}

fn decode_password(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("confluence password is not valid base64")?;
    String::from_utf8(bytes).context("confluence password is not valid UTF-8")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "********" }
}
