//! Operator configuration.
//!
//! Values are looked up by key through a [`ConfigStore`]. The on-disk store
//! resolves `TRACEDROP_<KEY>` from the environment first, then the file
//! `<config_dir>/tracedrop/<key>`.

use crate::crypto::{KeyError, OperatorKey};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const KEY_USER: &str = "user";
pub const KEY_GROUP: &str = "group";
pub const KEY_USER_SECRET_KEY: &str = "user_secret_key";
pub const KEY_UPLOAD_BASE: &str = "upload_base";
pub const KEY_CREDENTIAL_CHECKER: &str = "credential_checker";

const ENV_PREFIX: &str = "TRACEDROP_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't find {env_var} or {path}")]
    Missing {
        key: String,
        env_var: String,
        path: String,
    },

    #[error("invalid {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("no per-user configuration directory on this system")]
    NoConfigDir,

    #[error("config I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config store lock poisoned")]
    Poisoned,
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        6
    }
}

/// Name of the environment variable overriding `key`.
pub fn env_var_for(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
}

/// Key/value capability behind operator identity and the consent cache.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;

    /// Human-readable location of `key`, used in diagnostics.
    fn location(&self, key: &str) -> String {
        key.to_string()
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)?.ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
            env_var: env_var_for(key),
            path: self.location(key),
        })
    }
}

/// Environment variables over one file per key.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
    read_env: bool,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_env: true,
        }
    }

    /// `<config_dir>/tracedrop`, e.g. `~/.config/tracedrop` on Linux.
    pub fn user_default() -> Result<Self, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(base.join("tracedrop")))
    }

    /// Ignore `TRACEDROP_*` variables; only the files are consulted.
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        if self.read_env {
            if let Ok(value) = std::env::var(env_var_for(key)) {
                return Ok(Some(value));
            }
        }

        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.replace('\n', ""))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        let io_err = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(io_err)?;
        file.write_all(value.as_bytes()).map_err(io_err)?;
        tracing::debug!(key, path = %path.display(), "config value written");
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        self.path_for(key).display().to_string()
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let values = self.values.lock().map_err(|_| ConfigError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut values = self.values.lock().map_err(|_| ConfigError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Cloud access credentials carried in the first two fields of the secret key.
#[derive(Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// The parsed `<access-key-id>,<secret>,<signing key>` triple.
#[derive(Debug)]
pub struct UserSecretKey {
    pub cloud: CloudCredentials,
    pub signing_key: OperatorKey,
}

impl UserSecretKey {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::Malformed {
            key: KEY_USER_SECRET_KEY.to_string(),
            reason,
        };

        let parts: Vec<&str> = value.trim().split(',').collect();
        let [id, secret, key] = parts.as_slice() else {
            return Err(malformed(format!(
                "expected 3 comma-separated fields, found {}",
                parts.len()
            )));
        };

        let signing_key =
            OperatorKey::from_sec1_base64(key).map_err(|e: KeyError| malformed(e.to_string()))?;
        Ok(Self {
            cloud: CloudCredentials {
                access_key_id: id.to_string(),
                secret_access_key: secret.to_string(),
            },
            signing_key,
        })
    }

    /// Inverse of [`UserSecretKey::parse`].
    pub fn encode(&self) -> Result<String, KeyError> {
        Ok(format!(
            "{},{},{}",
            self.cloud.access_key_id,
            self.cloud.secret_access_key,
            self.signing_key.to_sec1_base64()?
        ))
    }
}

/// Everything known about the operator for one run.
#[derive(Debug)]
pub struct OperatorConfig {
    pub user: String,
    pub group: String,
    pub cloud: Option<CloudCredentials>,
    /// Held only until signing; see [`OperatorConfig::take_signing_key`].
    pub signing_key: Option<OperatorKey>,
    pub upload_base: Option<String>,
    pub credential_checker: Option<String>,
}

impl OperatorConfig {
    /// Load identity and optional settings from `store`.
    ///
    /// `user` and `group` are always required; `user_secret_key` only when
    /// `require_secret_key` is set.
    pub fn load(store: &dyn ConfigStore, require_secret_key: bool) -> Result<Self, ConfigError> {
        let user = store.require(KEY_USER)?;
        let group = store.require(KEY_GROUP)?;
        let secret = if require_secret_key {
            Some(store.require(KEY_USER_SECRET_KEY)?)
        } else {
            store.get(KEY_USER_SECRET_KEY)?
        };

        let parsed = secret.as_deref().map(UserSecretKey::parse).transpose()?;
        let (cloud, signing_key) = match parsed {
            Some(UserSecretKey { cloud, signing_key }) => (Some(cloud), Some(signing_key)),
            None => (None, None),
        };

        Ok(Self {
            user,
            group,
            cloud,
            signing_key,
            upload_base: store.get(KEY_UPLOAD_BASE)?,
            credential_checker: store.get(KEY_CREDENTIAL_CHECKER)?,
        })
    }

    /// Move the signing key out so the signer owns the only copy.
    pub fn take_signing_key(&mut self) -> Option<OperatorKey> {
        self.signing_key.take()
    }

    pub fn cloud_credentials(&self) -> Option<&CloudCredentials> {
        self.cloud.as_ref()
    }
}
