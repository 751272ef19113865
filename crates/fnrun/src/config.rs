//! # Runtime Configuration
//!
//! Settings a [`Runtime`](crate::runtime::Runtime) is built from. Values can
//! come from JSON, from `FNRUN_*` environment variables, or from the fluent
//! `with_*` setters; anything not supplied keeps its default.

use serde::Deserialize;
use serde::Serialize;

use crate::exception::MAX_MESSAGE_LEN;
use crate::exception::MAX_STACK_FRAMES;

pub const ENV_PREFIX: &str = "FNRUN_";

#[derive(Debug)]
pub enum Error {
    Json(serde_json::Error),
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "Invalid configuration document: {}", e),
            Self::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for {}", value, key)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::InvalidValue { .. } => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this runtime; appears in user-error messages.
    pub runtime_id: String,
    pub tenant_id: String,
    pub namespace: String,
    pub max_message_len: usize,
    pub max_stack_frames: usize,
    /// Frames whose class name starts with one of these are dispatch
    /// machinery and never shown in user traces.
    pub dispatch_frame_prefixes: Vec<String>,
    pub shutdown_hook: String,
    pub recover_hook: String,
    pub shutdown_grace_period_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_id: fresh_runtime_id(),
            tenant_id: String::new(),
            namespace: String::new(),
            max_message_len: MAX_MESSAGE_LEN,
            max_stack_frames: MAX_STACK_FRAMES,
            dispatch_frame_prefixes: vec![format!("{}::", env!("CARGO_PKG_NAME"))],
            shutdown_hook: "yrShutdown".to_string(),
            recover_hook: "yrRecover".to_string(),
            shutdown_grace_period_secs: 30,
        }
    }
}

fn fresh_runtime_id() -> String {
    format!("runtime-{:016x}", rand::random::<u64>())
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(text)?;
        if config.runtime_id.is_empty() {
            config.runtime_id = fresh_runtime_id();
        }
        Ok(config)
    }

    /// Reads `FNRUN_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads `FNRUN_*` keys through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(value) = get("RUNTIME_ID") {
            config.runtime_id = value;
        }
        if let Some(value) = get("TENANT_ID") {
            config.tenant_id = value;
        }
        if let Some(value) = get("NAMESPACE") {
            config.namespace = value;
        }
        if let Some(value) = get("MAX_MESSAGE_LEN") {
            config.max_message_len = parse_number("FNRUN_MAX_MESSAGE_LEN", &value)?;
        }
        if let Some(value) = get("MAX_STACK_FRAMES") {
            config.max_stack_frames = parse_number("FNRUN_MAX_STACK_FRAMES", &value)?;
        }
        if let Some(value) = get("DISPATCH_FRAME_PREFIXES") {
            config.dispatch_frame_prefixes = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = get("SHUTDOWN_HOOK") {
            config.shutdown_hook = value;
        }
        if let Some(value) = get("RECOVER_HOOK") {
            config.recover_hook = value;
        }
        if let Some(value) = get("SHUTDOWN_GRACE_PERIOD_SECS") {
            config.shutdown_grace_period_secs = parse_number("FNRUN_SHUTDOWN_GRACE_PERIOD_SECS", &value)?;
        }
        Ok(config)
    }

    pub fn with_runtime_id(mut self, runtime_id: impl Into<String>) -> Self {
        self.runtime_id = runtime_id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn with_max_stack_frames(mut self, max_stack_frames: usize) -> Self {
        self.max_stack_frames = max_stack_frames;
        self
    }

    pub fn with_dispatch_frame_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dispatch_frame_prefixes.push(prefix.into());
        self
    }

    pub fn with_shutdown_grace_period(mut self, secs: u32) -> Self {
        self.shutdown_grace_period_secs = secs;
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.runtime_id.starts_with("runtime-"));
        assert_eq!(config.max_message_len, 10000);
        assert_eq!(config.shutdown_hook, "yrShutdown");
        assert_eq!(config.recover_hook, "yrRecover");
        assert_eq!(config.dispatch_frame_prefixes, vec!["fnrun::".to_string()]);
        assert_ne!(config.runtime_id, Config::default().runtime_id);
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(r#"{"tenant_id":"t-1","max_stack_frames":8}"#).expect("parse");
        assert_eq!(config.tenant_id, "t-1");
        assert_eq!(config.max_stack_frames, 8);
        assert_eq!(config.shutdown_grace_period_secs, 30);
        assert!(!config.runtime_id.is_empty());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FNRUN_RUNTIME_ID", "rt-env"),
            ("FNRUN_MAX_MESSAGE_LEN", "128"),
            ("FNRUN_DISPATCH_FRAME_PREFIXES", "fnrun::, sdk."),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).expect("config");
        assert_eq!(config.runtime_id, "rt-env");
        assert_eq!(config.max_message_len, 128);
        assert_eq!(config.dispatch_frame_prefixes, vec!["fnrun::".to_string(), "sdk.".to_string()]);
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let result = Config::from_lookup(|k| (k == "FNRUN_MAX_STACK_FRAMES").then(|| "lots".to_string()));
        assert!(matches!(result, Err(Error::InvalidValue { .. })));
    }
}
