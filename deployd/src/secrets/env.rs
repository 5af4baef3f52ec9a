//! Decrypted deployment environment

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Environment variables injected into the build process only.
///
/// Values are zeroized on drop and never appear in `Debug` output. The
/// `Serialize` impl exposes them and exists solely for the execution
/// request sent to the agent.
#[derive(Default)]
pub struct DeployEnv {
    vars: BTreeMap<String, SecretString>,
}

impl DeployEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable after checking the key shape
    pub fn insert(&mut self, key: impl Into<String>, value: String) -> Result<(), DeployError> {
        let key = key.into();
        validate_env_key(&key)?;
        self.vars.insert(key, SecretString::from(value));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Exposed `(key, value)` pairs for `Command::envs`
    pub fn exposed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret()))
    }

    /// Parse a JSON object of string values
    pub fn from_json(bytes: &[u8]) -> Result<Self, DeployError> {
        let raw: BTreeMap<String, String> = serde_json::from_slice(bytes).map_err(|_| {
            DeployError::ValidationError("Credentials are not a JSON object of strings".to_string())
        })?;
        Self::from_plain(raw)
    }

    /// Serialize to JSON, keeping the buffer inside a secret
    pub fn to_json(&self) -> Result<SecretSlice<u8>, DeployError> {
        Ok(SecretSlice::from(serde_json::to_vec(self)?))
    }

    fn from_plain(raw: BTreeMap<String, String>) -> Result<Self, DeployError> {
        let mut env = Self::new();
        for (key, value) in raw {
            env.insert(key, value)?;
        }
        Ok(env)
    }
}

impl fmt::Debug for DeployEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl Serialize for DeployEnv {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (key, value) in self.exposed() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeployEnv {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        Self::from_plain(raw).map_err(serde::de::Error::custom)
    }
}

/// Variables the build environment is assembled from; credentials never override them
const RESERVED_KEYS: &[&str] = &[
    "PATH", "HOME", "PORT", "USER", "LOGNAME", "SHELL", "PWD", "OLDPWD", "IFS", "ENV",
    "BASH_ENV", "CDPATH", "PS4", "SHELLOPTS", "BASHOPTS", "GLOBIGNORE", "TMPDIR",
];

/// Prefixes that steer the dynamic loader or git itself
const RESERVED_PREFIXES: &[&str] = &["LD_", "DYLD_", "GIT_", "BASH_FUNC_"];

/// Keys must look like shell identifiers: `[A-Za-z_][A-Za-z0-9_]*`, and
/// must not be one of the reserved names
fn validate_env_key(key: &str) -> Result<(), DeployError> {
    let mut chars = key.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DeployError::ValidationError(format!(
            "Invalid environment variable name '{}'",
            key
        )));
    }

    let upper = key.to_ascii_uppercase();
    if RESERVED_KEYS.contains(&upper.as_str())
        || RESERVED_PREFIXES.iter().any(|p| upper.starts_with(p))
    {
        return Err(DeployError::ValidationError(format!(
            "Environment variable '{}' is reserved",
            key
        )));
    }
    Ok(())
}
