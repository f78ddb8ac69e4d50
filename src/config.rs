use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::debug;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8420;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// A bearer token. The secret is stored in the clear so it can be listed
/// back to the operator; the trust model is a single user on localhost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub id: String,
    pub name: String,
    pub value: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub nickname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutBehavior {
    Passthrough,
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub approval_timeout_seconds: u64,
    pub approval_timeout_behavior: TimeoutBehavior,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            approval_timeout_seconds: 300,
            approval_timeout_behavior: TimeoutBehavior::Passthrough,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub approval_timeout_seconds: Option<u64>,
    pub approval_timeout_behavior: Option<TimeoutBehavior>,
}

/// The on-disk document. Unknown top-level fields survive a load/save
/// round-trip through the flattened map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tokens: Vec<Token>,
    pub sessions: BTreeMap<String, SessionMeta>,
    pub settings: Settings,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// File-backed store for the config document. Owns all persistence;
/// saves go through a `.tmp` sibling and an atomic rename.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Config>,
}

impl ConfigStore {
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Ok(home.join(".claudehaus").join("config.json"))
    }

    /// Load the document at `path`, writing the default document first if
    /// none exists.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let existed = path.exists();
        let config = if existed {
            let data = std::fs::read(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            if data.is_empty() {
                Config::default()
            } else {
                serde_json::from_slice(&data)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
        } else {
            Config::default()
        };

        let store = Self {
            path,
            inner: Mutex::new(config),
        };
        if !existed {
            let config = store.inner.lock().expect("config store poisoned");
            store.persist(&config)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, config: &Config) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        create_private_dir(dir)?;

        let mut data = serde_json::to_vec_pretty(config).context("marshaling config")?;
        data.push(b'\n');

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)
            .with_context(|| format!("writing temp config {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting config {}", tmp.display()))?;
        }
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("renaming config to {}", self.path.display()));
        }
        Ok(())
    }

    pub fn server(&self) -> ServerConfig {
        self.inner.lock().expect("config store poisoned").server.clone()
    }

    // Token authenticator ----------------------------------------------

    /// Mint a token and persist it; returns the secret value.
    pub fn create_token(&self, name: &str) -> anyhow::Result<String> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let value = hex::encode(secret);

        let token = Token {
            id: generate_token_id(),
            name: name.to_string(),
            value: value.clone(),
            created_at: Utc::now().to_rfc3339(),
            last_used_at: None,
        };

        let mut config = self.inner.lock().expect("config store poisoned");
        config.tokens.push(token);
        self.persist(&config)?;
        Ok(value)
    }

    /// Walk the token list with a per-token constant-time comparison.
    /// A hit stamps `last_used_at`; that save is best-effort.
    pub fn validate_token(&self, value: &str) -> bool {
        let mut config = self.inner.lock().expect("config store poisoned");
        let matched = config
            .tokens
            .iter()
            .position(|token| secrets_match(&token.value, value));
        match matched {
            Some(idx) => {
                config.tokens[idx].last_used_at = Some(Utc::now().to_rfc3339());
                if let Err(err) = self.persist(&config) {
                    debug!(%err, "config save after token use failed");
                }
                true
            }
            None => false,
        }
    }

    /// Remove the token with the given id. Unknown ids return false
    /// without mutating anything.
    pub fn revoke_token(&self, id: &str) -> anyhow::Result<bool> {
        let mut config = self.inner.lock().expect("config store poisoned");
        let before = config.tokens.len();
        config.tokens.retain(|token| token.id != id);
        if config.tokens.len() == before {
            return Ok(false);
        }
        self.persist(&config)?;
        Ok(true)
    }

    pub fn list_tokens(&self) -> Vec<Token> {
        self.inner.lock().expect("config store poisoned").tokens.clone()
    }

    /// Create the `default` token on first boot. Returns the secret only
    /// when a token was actually created.
    pub fn ensure_default_token(&self) -> anyhow::Result<Option<String>> {
        if !self.list_tokens().is_empty() {
            return Ok(None);
        }
        self.create_token("default").map(Some)
    }

    // Settings & session metadata --------------------------------------

    pub fn settings(&self) -> Settings {
        self.inner.lock().expect("config store poisoned").settings
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> anyhow::Result<Settings> {
        let mut config = self.inner.lock().expect("config store poisoned");
        if let Some(seconds) = patch.approval_timeout_seconds {
            config.settings.approval_timeout_seconds = seconds;
        }
        if let Some(behavior) = patch.approval_timeout_behavior {
            config.settings.approval_timeout_behavior = behavior;
        }
        self.persist(&config)?;
        Ok(config.settings)
    }

    pub fn nickname(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("config store poisoned")
            .sessions
            .get(session_id)
            .map(|meta| meta.nickname.clone())
    }

    pub fn set_session_nickname(&self, session_id: &str, nickname: &str) -> anyhow::Result<()> {
        let mut config = self.inner.lock().expect("config store poisoned");
        config.sessions.insert(
            session_id.to_string(),
            SessionMeta {
                nickname: nickname.to_string(),
            },
        );
        self.persist(&config)
    }
}

fn generate_token_id() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("tok_{}", hex::encode(bytes))
}

fn secrets_match(stored: &str, candidate: &str) -> bool {
    !stored.is_empty()
        && stored.len() == candidate.len()
        && bool::from(stored.as_bytes().ct_eq(candidate.as_bytes()))
}

fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .or_else(|err| {
                if dir.is_dir() {
                    Ok(())
                } else {
                    Err(err)
                }
            })
            .with_context(|| format!("creating config dir {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating config dir {}", dir.display()))?;
    Ok(())
}
