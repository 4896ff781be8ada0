use serde::Deserialize;

use crate::error::{CoalesceError, CoalesceResult};

/// Root configuration of the bench binary. Loaded from environment variables
/// with the prefix `COALESCE__` layered over an optional TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub writes: FlusherConfig,
    #[serde(default)]
    pub counters: FlusherConfig,
    #[serde(default = "default_lookup_group")]
    pub lookups: GroupConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// Per-engine flush settings shared by every batcher.
#[derive(Debug, Clone, Deserialize)]
pub struct FlusherConfig {
    #[serde(default = "default_flush_quota")]
    pub flush_quota: usize,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Upper bound on idle containers kept by the engine's object pools.
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,
}

/// Settings of a group coalescer: how batch results are joined back to requests.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub join_field: String,
    #[serde(default)]
    pub response_field: Option<String>,
    #[serde(default = "default_one_to_one")]
    pub one_to_one: bool,
    #[serde(default)]
    pub flusher: FlusherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_producers")]
    pub producers: usize,
    #[serde(default = "default_requests_per_producer")]
    pub requests_per_producer: usize,
    #[serde(default = "default_key_cardinality")]
    pub key_cardinality: u64,
    #[serde(default = "default_downstream_latency_ms")]
    pub downstream_latency_ms: u64,
}

fn default_flush_quota() -> usize {
    100
}
fn default_flush_timeout_ms() -> u64 {
    100
}
fn default_pool_max_idle() -> usize {
    64
}
fn default_one_to_one() -> bool {
    true
}
fn default_producers() -> usize {
    16
}
fn default_requests_per_producer() -> usize {
    1000
}
fn default_key_cardinality() -> u64 {
    256
}
fn default_downstream_latency_ms() -> u64 {
    5
}
fn default_lookup_group() -> GroupConfig {
    GroupConfig::new("id")
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            flush_quota: default_flush_quota(),
            flush_timeout_ms: default_flush_timeout_ms(),
            pool_max_idle: default_pool_max_idle(),
        }
    }
}

impl FlusherConfig {
    pub fn new(flush_quota: usize, flush_timeout_ms: u64) -> Self {
        Self {
            flush_quota,
            flush_timeout_ms,
            ..Self::default()
        }
    }

    /// Rejects non-positive quota or timeout. Engines call this before
    /// allocating anything.
    pub fn validate(&self) -> CoalesceResult<()> {
        if self.flush_quota == 0 {
            return Err(CoalesceError::Config(
                "flush_quota must be a positive integer".into(),
            ));
        }
        if self.flush_timeout_ms == 0 {
            return Err(CoalesceError::Config(
                "flush_timeout_ms must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_timeout_ms)
    }
}

impl GroupConfig {
    pub fn new(join_field: impl Into<String>) -> Self {
        Self {
            join_field: join_field.into(),
            response_field: None,
            one_to_one: default_one_to_one(),
            flusher: FlusherConfig::default(),
        }
    }

    pub fn with_response_field(mut self, field: impl Into<String>) -> Self {
        self.response_field = Some(field.into());
        self
    }

    pub fn one_to_many(mut self) -> Self {
        self.one_to_one = false;
        self
    }

    pub fn with_flusher(mut self, flusher: FlusherConfig) -> Self {
        self.flusher = flusher;
        self
    }

    pub fn validate(&self) -> CoalesceResult<()> {
        if self.join_field.trim().is_empty() {
            return Err(CoalesceError::Config("join_field must not be empty".into()));
        }
        if matches!(&self.response_field, Some(f) if f.trim().is_empty()) {
            return Err(CoalesceError::Config(
                "response_field must not be blank when set".into(),
            ));
        }
        self.flusher.validate()
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            requests_per_producer: default_requests_per_producer(),
            key_cardinality: default_key_cardinality(),
            downstream_latency_ms: default_downstream_latency_ms(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            writes: FlusherConfig::default(),
            counters: FlusherConfig::default(),
            lookups: default_lookup_group(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load configuration from an optional TOML file and environment variables.
    /// Environment values win over file values.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("COALESCE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> CoalesceResult<()> {
        self.writes.validate()?;
        self.counters.validate()?;
        self.lookups.validate()?;
        if self.workload.key_cardinality == 0 {
            return Err(CoalesceError::Config(
                "workload.key_cardinality must be positive".into(),
            ));
        }
        Ok(())
    }
}
