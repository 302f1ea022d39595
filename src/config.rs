use ini::{Ini, ParseOption, Properties};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Section whose `api_token` doubles as the default token for every user.
const LEGACY_TOKEN_SECTION: &str = "main";

/// Section whose values every other section inherits.
const DEFAULTS_SECTION: &str = "DEFAULT";

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.pushoverrc";

/// One `[section]` of the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserSection {
    pub api_token: Option<String>,
    pub user_key: Option<String>,
    pub device: Option<String>,
}

impl UserSection {
    /// Take the known keys from `props`. Key names are case-insensitive and
    /// unknown keys are ignored.
    fn apply(&mut self, props: &Properties) {
        for (key, value) in props.iter() {
            let slot = match key.to_ascii_lowercase().as_str() {
                "api_token" => &mut self.api_token,
                "user_key" => &mut self.user_key,
                "device" => &mut self.device,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
    }

    fn inherit(&mut self, defaults: &UserSection) {
        if self.api_token.is_none() {
            self.api_token = defaults.api_token.clone();
        }
        if self.user_key.is_none() {
            self.user_key = defaults.user_key.clone();
        }
        if self.device.is_none() {
            self.device = defaults.device.clone();
        }
    }
}

/// Credentials file in INI format, one section per user.
///
/// ```ini
/// [Default]
/// api_token = a1b2...
/// user_key = u1v2...
/// device = phone
/// ```
///
/// Section names are case-sensitive, key names are not. Values are taken
/// verbatim (no quote handling) and `[DEFAULT]` values are inherited by every
/// other section. Keys above the first section header are ignored.
#[derive(Debug, Default, Clone)]
pub struct PushoverConfig {
    pub users: BTreeMap<String, UserSection>,
    /// Token taken from the legacy `[main]` section, if any.
    pub default_token: Option<String>,
}

impl PushoverConfig {
    /// Parse config file contents.
    pub fn parse(contents: &str) -> Result<Self, ini::ParseError> {
        let ini = Ini::load_from_str_opt(
            contents,
            ParseOption {
                enabled_quote: false,
                enabled_escape: false,
                ..ParseOption::default()
            },
        )?;

        let mut defaults = UserSection::default();
        let mut users: BTreeMap<String, UserSection> = BTreeMap::new();
        for (name, props) in ini.iter() {
            match name {
                None => continue,
                Some(DEFAULTS_SECTION) => defaults.apply(props),
                Some(name) => users.entry(name.to_string()).or_default().apply(props),
            }
        }
        for section in users.values_mut() {
            section.inherit(&defaults);
        }

        let default_token = users
            .get(LEGACY_TOKEN_SECTION)
            .and_then(|section| section.api_token.clone());
        Ok(Self {
            users,
            default_token,
        })
    }

    /// Load the config file at `path` (tilde-expanded). A missing file is an
    /// empty config.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = expand_path(path);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using empty config");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Read { path, source: e }),
        };
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            sections = config.users.len(),
            "loaded config file"
        );
        Ok(config)
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub token: Option<String>,
    /// User key, or the name of a config section holding one.
    pub user: String,
    pub device: Option<String>,
}

/// Everything needed to address a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user_key: String,
    pub device: Option<String>,
}

/// Resolve credentials: command line beats the user's section, which beats
/// the legacy `[main]` token.
pub fn resolve_credentials(
    overrides: &CredentialOverrides,
    config: &PushoverConfig,
) -> Result<Credentials, ConfigError> {
    let section = config.users.get(&overrides.user);

    let token = overrides
        .token
        .clone()
        .or_else(|| section.and_then(|s| s.api_token.clone()))
        .or_else(|| config.default_token.clone())
        .filter(|t| !t.is_empty());
    let user_key = section
        .and_then(|s| s.user_key.clone())
        .unwrap_or_else(|| overrides.user.clone());
    let device = overrides
        .device
        .clone()
        .or_else(|| section.and_then(|s| s.device.clone()));

    if user_key.is_empty() {
        return Err(ConfigError::MissingUserKey);
    }
    let token = token.ok_or(ConfigError::MissingToken)?;

    Ok(Credentials {
        token,
        user_key,
        device,
    })
}

/// Emergency priority makes Pushover repeat the alert, which needs both
/// `retry` and `expire`.
pub fn validate_priority(
    priority: Option<i8>,
    retry: Option<u32>,
    expire: Option<u32>,
) -> Result<(), ConfigError> {
    if priority == Some(2) && (retry.is_none() || expire.is_none()) {
        return Err(ConfigError::EmergencyNeedsRetryAndExpire);
    }
    Ok(())
}

/// Fatal configuration problems, raised before any command is launched.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid INI.
    Parse {
        path: PathBuf,
        source: ini::ParseError,
    },
    MissingUserKey,
    MissingToken,
    EmergencyNeedsRetryAndExpire,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
            ConfigError::MissingUserKey => write!(f, "User key missing!"),
            ConfigError::MissingToken => write!(f, "API token missing!"),
            ConfigError::EmergencyNeedsRetryAndExpire => {
                write!(f, "priority of 2 requires expire and retry")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}
