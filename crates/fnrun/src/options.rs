//! # Invocation Options
//!
//! Scheduling and execution hints attached to a create or invoke call.
//! Callers bind a copy of their options at bind time, so later mutation of the
//! caller's value never leaks into an already-bound call.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ModuleCode;

/// Custom extension key carrying the instance concurrency.
pub const CONCURRENCY_KEY: &str = "Concurrency";

/// Custom extension that is really a create option.
pub const POST_START_EXEC_KEY: &str = "PostStartExec";

pub const DEFAULT_CPU: i32 = 500;
pub const DEFAULT_MEMORY: i32 = 500;
pub const DEFAULT_SCHEDULE_TIMEOUT_MS: i64 = 30000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Negative { field: &'static str, value: i64 },
    InvalidConcurrency(String),
    InvalidGroupTimeout(i64),
    InvalidAffinity(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negative { field, value } => {
                write!(f, "{} must be non-negative, got {}", field, value)
            }
            Self::InvalidConcurrency(value) => {
                write!(f, "Concurrency must be a positive integer, got '{}'", value)
            }
            Self::InvalidGroupTimeout(value) => {
                write!(f, "Group timeout must be -1 or non-negative, got {}", value)
            }
            Self::InvalidAffinity(reason) => write!(f, "Invalid schedule affinities: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for crate::error::Error {
    fn from(e: Error) -> Self {
        crate::error::Error::param_invalid(ModuleCode::Runtime, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityKind {
    Resource,
    Instance,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityType {
    PreferredAffinity,
    PreferredAntiAffinity,
    RequiredAffinity,
    RequiredAntiAffinity,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperatorKind {
    In,
    NotIn,
    Exists,
    NotExists,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOperator {
    pub kind: LabelOperatorKind,
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// One scheduling affinity rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub kind: AffinityKind,
    #[serde(rename = "type")]
    pub affinity_type: AffinityType,
    pub operators: Vec<LabelOperator>,
}

impl Affinity {
    pub fn new(kind: AffinityKind, affinity_type: AffinityType) -> Self {
        Self {
            kind,
            affinity_type,
            operators: Vec::new(),
        }
    }

    pub fn operator(mut self, kind: LabelOperatorKind, key: impl Into<String>, values: &[&str]) -> Self {
        self.operators.push(LabelOperator {
            kind,
            key: key.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokeOptions {
    pub cpu: i32,
    pub memory: i32,
    pub custom_resources: BTreeMap<String, f32>,
    pub custom_extensions: BTreeMap<String, String>,
    pub create_options: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
    pub labels: Vec<String>,
    pub affinity: BTreeMap<String, String>,
    pub schedule_affinities: Vec<Affinity>,
    pub retry_times: i32,
    pub priority: i32,
    pub instance_priority: i32,
    pub schedule_timeout_ms: i64,
    pub recover_retry_times: i32,
    pub preferred_priority: bool,
    pub required_priority: bool,
    pub preferred_anti_other_labels: bool,
    /// Explicit ordering request; ordering is also on whenever concurrency is 1.
    pub need_order: bool,
    pub preempted_allowed: bool,
    pub group_name: String,
    pub env_vars: HashMap<String, String>,
    pub trace_id: String,
    /// Namespace aliases applied when routing by function name.
    pub alias_params: BTreeMap<String, String>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU,
            memory: DEFAULT_MEMORY,
            custom_resources: BTreeMap::new(),
            custom_extensions: BTreeMap::new(),
            create_options: BTreeMap::new(),
            pod_labels: BTreeMap::new(),
            labels: Vec::new(),
            affinity: BTreeMap::new(),
            schedule_affinities: Vec::new(),
            retry_times: 0,
            priority: 0,
            instance_priority: 0,
            schedule_timeout_ms: DEFAULT_SCHEDULE_TIMEOUT_MS,
            recover_retry_times: 0,
            preferred_priority: true,
            required_priority: false,
            preferred_anti_other_labels: true,
            need_order: false,
            preempted_allowed: false,
            group_name: String::new(),
            env_vars: HashMap::new(),
            trace_id: String::new(),
            alias_params: BTreeMap::new(),
        }
    }
}

impl InvokeOptions {
    pub fn builder() -> InvokeOptionsBuilder {
        InvokeOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Adds a custom extension, diverting create-time keys to create options.
    pub fn add_custom_extension(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key == POST_START_EXEC_KEY {
            self.create_options.insert(key, value.into());
        } else {
            self.custom_extensions.insert(key, value.into());
        }
    }

    pub fn set_custom_extensions(&mut self, extensions: impl IntoIterator<Item = (String, String)>) {
        self.custom_extensions.clear();
        for (key, value) in extensions {
            self.add_custom_extension(key, value);
        }
    }

    /// Instance concurrency, 1 when unset.
    pub fn concurrency(&self) -> Result<u32> {
        match self.custom_extensions.get(CONCURRENCY_KEY) {
            None => Ok(1),
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(0) | Err(_) => Err(Error::InvalidConcurrency(raw.clone())),
                Ok(n) => Ok(n),
            },
        }
    }

    /// Whether calls on an instance created with these options run in issue order.
    pub fn resolve_need_order(&self) -> Result<bool> {
        Ok(self.need_order || self.concurrency()? == 1)
    }

    pub fn schedule_affinities_json(&self) -> Result<String> {
        serde_json::to_string(&self.schedule_affinities).map_err(|e| Error::InvalidAffinity(e.to_string()))
    }

    pub fn set_schedule_affinities_json(&mut self, json: &str) -> Result<()> {
        self.schedule_affinities =
            serde_json::from_str(json).map_err(|e| Error::InvalidAffinity(e.to_string()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let counters = [
            ("retryTimes", self.retry_times),
            ("priority", self.priority),
            ("instancePriority", self.instance_priority),
            ("recoverRetryTimes", self.recover_retry_times),
        ];
        for (field, value) in counters {
            if value < 0 {
                return Err(Error::Negative {
                    field,
                    value: value as i64,
                });
            }
        }
        if self.schedule_timeout_ms < 0 {
            return Err(Error::Negative {
                field: "scheduleTimeoutMs",
                value: self.schedule_timeout_ms,
            });
        }
        self.concurrency()?;
        Ok(())
    }
}

pub struct InvokeOptionsBuilder {
    options: InvokeOptions,
}

impl InvokeOptionsBuilder {
    pub fn cpu(mut self, cpu: i32) -> Self {
        self.options.cpu = cpu;
        self
    }

    pub fn memory(mut self, memory: i32) -> Self {
        self.options.memory = memory;
        self
    }

    pub fn custom_resource(mut self, name: impl Into<String>, amount: f32) -> Self {
        self.options.custom_resources.insert(name.into(), amount);
        self
    }

    pub fn custom_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.add_custom_extension(key, value);
        self
    }

    pub fn concurrency(self, concurrency: u32) -> Self {
        self.custom_extension(CONCURRENCY_KEY, concurrency.to_string())
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.options.labels.push(label.into());
        self
    }

    pub fn pod_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.pod_labels.insert(key.into(), value.into());
        self
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.options.schedule_affinities.push(affinity);
        self
    }

    pub fn retry_times(mut self, retry_times: i32) -> Self {
        self.options.retry_times = retry_times;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn instance_priority(mut self, instance_priority: i32) -> Self {
        self.options.instance_priority = instance_priority;
        self
    }

    pub fn schedule_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.options.schedule_timeout_ms = timeout_ms;
        self
    }

    pub fn recover_retry_times(mut self, recover_retry_times: i32) -> Self {
        self.options.recover_retry_times = recover_retry_times;
        self
    }

    pub fn need_order(mut self, need_order: bool) -> Self {
        self.options.need_order = need_order;
        self
    }

    pub fn preempted_allowed(mut self, preempted_allowed: bool) -> Self {
        self.options.preempted_allowed = preempted_allowed;
        self
    }

    pub fn group_name(mut self, group_name: impl Into<String>) -> Self {
        self.options.group_name = group_name.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.options.trace_id = trace_id.into();
        self
    }

    pub fn alias_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.alias_params.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<InvokeOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Options of a fate-sharing group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupOptions {
    /// Seconds to wait for the whole group to be scheduled; -1 waits forever.
    pub timeout_secs: i64,
    /// Members are terminated together.
    pub same_lifecycle: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            timeout_secs: -1,
            same_lifecycle: true,
        }
    }
}

impl GroupOptions {
    pub fn with_timeout(mut self, timeout_secs: i64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs < -1 {
            return Err(Error::InvalidGroupTimeout(self.timeout_secs));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = InvokeOptions::default();
        assert_eq!(options.cpu, 500);
        assert_eq!(options.memory, 500);
        assert_eq!(options.schedule_timeout_ms, 30000);
        assert_eq!(options.concurrency(), Ok(1));
        assert_eq!(options.resolve_need_order(), Ok(true));
    }

    #[test]
    fn test_concurrency_drives_ordering() {
        let parallel = InvokeOptions::builder().concurrency(10).build().expect("options");
        assert_eq!(parallel.resolve_need_order(), Ok(false));

        let forced = InvokeOptions::builder()
            .concurrency(10)
            .need_order(true)
            .build()
            .expect("options");
        assert_eq!(forced.resolve_need_order(), Ok(true));
    }

    #[test]
    fn test_negative_counters_rejected() {
        let err = InvokeOptions::builder().retry_times(-1).build().expect_err("negative");
        assert_eq!(err, Error::Negative { field: "retryTimes", value: -1 });
        let err = InvokeOptions::builder().priority(-3).build().expect_err("negative");
        let envelope: crate::error::Error = err.into();
        assert_eq!(envelope.code(), crate::error::ErrorCode::ParamInvalid);
    }

    #[test]
    fn test_bad_concurrency_rejected() {
        let err = InvokeOptions::builder()
            .custom_extension(CONCURRENCY_KEY, "0")
            .build()
            .expect_err("zero");
        assert!(matches!(err, Error::InvalidConcurrency(_)));
    }

    #[test]
    fn test_post_start_exec_moves_to_create_options() {
        let mut options = InvokeOptions::default();
        options.set_custom_extensions([
            (POST_START_EXEC_KEY.to_string(), "init.sh".to_string()),
            ("Other".to_string(), "x".to_string()),
        ]);
        assert_eq!(options.create_options.get(POST_START_EXEC_KEY).map(String::as_str), Some("init.sh"));
        assert!(!options.custom_extensions.contains_key(POST_START_EXEC_KEY));
        assert!(options.custom_extensions.contains_key("Other"));
    }

    #[test]
    fn test_affinity_json() {
        let mut options = InvokeOptions::builder()
            .affinity(
                Affinity::new(AffinityKind::Resource, AffinityType::RequiredAffinity)
                    .operator(LabelOperatorKind::In, "zone", &["a", "b"]),
            )
            .build()
            .expect("options");
        let json = options.schedule_affinities_json().expect("json");
        options.schedule_affinities.clear();
        options.set_schedule_affinities_json(&json).expect("parse");
        assert_eq!(options.schedule_affinities.len(), 1);
        assert_eq!(options.schedule_affinities[0].operators[0].values, vec!["a", "b"]);

        assert!(options.set_schedule_affinities_json("{").is_err());
    }

    #[test]
    fn test_group_timeout() {
        assert!(GroupOptions::default().validate().is_ok());
        assert!(GroupOptions::default().with_timeout(0).validate().is_ok());
        assert_eq!(
            GroupOptions::default().with_timeout(-2).validate(),
            Err(Error::InvalidGroupTimeout(-2))
        );
    }
}
