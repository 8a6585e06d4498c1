use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_CONF_DIR_NAME: &str = ".gcardvault";
const DEFAULT_OUTPUT_DIR_NAME: &str = "gcardvault";

pub const DEFAULT_PEOPLE_API_URL: &str = "https://people.googleapis.com";
pub const DEFAULT_CARDDAV_URL: &str = "https://www.googleapis.com";
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Everything a run needs, resolved once up front.
#[derive(Debug, Clone)]
pub struct Config {
    /// Principal (email address) whose contacts are exported, lowercased.
    pub user: String,
    pub conf_dir: PathBuf,
    pub output_dir: PathBuf,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Skip the git repository entirely.
    pub export_only: bool,
    /// Remove local files for contacts that no longer exist remotely.
    pub clean: bool,
    pub endpoints: Endpoints,
}

/// Base URLs of the Google services the vault talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub people_api: String,
    pub carddav: String,
    pub auth: String,
    pub token: String,
    pub userinfo: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            people_api: DEFAULT_PEOPLE_API_URL.to_string(),
            carddav: DEFAULT_CARDDAV_URL.to_string(),
            auth: DEFAULT_AUTH_URL.to_string(),
            token: DEFAULT_TOKEN_URL.to_string(),
            userinfo: DEFAULT_USERINFO_URL.to_string(),
        }
    }
}

/// Values supplied on the command line (or through their environment variables).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub user: String,
    pub conf_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub export_only: bool,
    pub clean: bool,
}

impl Config {
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.conf_dir, &self.output_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn token_file_path(&self) -> PathBuf {
        self.conf_dir.join(format!("{}.token.json", self.user))
    }
}

pub fn load(overrides: ConfigOverrides) -> Result<Config> {
    let conf_dir = match overrides.conf_dir {
        Some(dir) => expand_tilde(&dir),
        None => home::home_dir()
            .ok_or_else(|| anyhow!("unable to determine home directory"))?
            .join(DEFAULT_CONF_DIR_NAME),
    };

    let file = read_config_file(&conf_dir.join(CONFIG_FILE_NAME))?;

    let output_dir = match overrides.output_dir.or(file.output_dir) {
        Some(dir) => expand_tilde(&dir),
        None => std::env::current_dir()
            .context("unable to determine working directory")?
            .join(DEFAULT_OUTPUT_DIR_NAME),
    };

    Ok(Config {
        user: overrides.user.trim().to_lowercase(),
        conf_dir,
        output_dir,
        client_id: non_empty(overrides.client_id.or(file.client_id)),
        client_secret: non_empty(overrides.client_secret.or(file.client_secret)),
        export_only: overrides.export_only,
        clean: overrides.clean,
        endpoints: file.endpoints.into(),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// =============================================================================
// config.toml
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    output_dir: Option<PathBuf>,
    client_id: Option<String>,
    client_secret: Option<String>,
    endpoints: EndpointsFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EndpointsFile {
    people_api: Option<String>,
    carddav: Option<String>,
    auth: Option<String>,
    token: Option<String>,
    userinfo: Option<String>,
}

impl From<EndpointsFile> for Endpoints {
    fn from(file: EndpointsFile) -> Self {
        let defaults = Endpoints::default();
        let trim = |url: String| url.trim_end_matches('/').to_string();
        Self {
            people_api: file.people_api.map(trim).unwrap_or(defaults.people_api),
            carddav: file.carddav.map(trim).unwrap_or(defaults.carddav),
            auth: file.auth.unwrap_or(defaults.auth),
            token: file.token.unwrap_or(defaults.token),
            userinfo: file.userinfo.unwrap_or(defaults.userinfo),
        }
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;

    let value: toml::Value = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    warn_unknown_keys(&value);

    value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))
}

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    const KNOWN: &[&str] = &["output_dir", "client_id", "client_secret", "endpoints"];
    warn_unknown_in_context(value, "config", KNOWN);

    if let Some(endpoints) = table.get("endpoints") {
        warn_unknown_in_context(
            endpoints,
            "endpoints",
            &["people_api", "carddav", "auth", "token", "userinfo"],
        );
    }
}

fn warn_unknown_in_context(value: &toml::Value, context: &str, known: &[&str]) {
    let Some(table) = value.as_table() else {
        return;
    };
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            log::warn!("unknown key '{}' in [{}] section of {}", key, context, CONFIG_FILE_NAME);
        }
    }
}
