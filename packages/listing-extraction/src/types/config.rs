//! Configuration types for the extraction engine.
//!
//! Everything tunable lives here and is loaded, not hardcoded: per-backend
//! resilience parameters, cost ceilings, the field catalog with its default
//! confidence bands, merge importance weights and validation rules.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::traits::backend::BackendKind;
use crate::types::schema::{ConfidenceDefaults, FieldCatalog};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backends: BackendsConfig,
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub fields: FieldCatalog,
    pub confidence_defaults: ConfidenceDefaults,
    pub merge: MergeConfig,
    pub validation: ValidationConfig,
    pub images: ImageConfig,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> ConfigResult<()> {
        for kind in BackendKind::ALL {
            self.backends.get(kind).validate(kind)?;
        }

        self.quota.validate()?;

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "must be > 0 when the cache is enabled"));
        }

        let m = &self.merge;
        if !(m.disagreement_penalty > 0.0 && m.disagreement_penalty < 1.0) {
            return Err(ConfigError::invalid(
                "merge.disagreement_penalty",
                "must be strictly between 0 and 1",
            ));
        }
        if !(m.relative_tolerance >= 0.0 && m.relative_tolerance < 1.0) {
            return Err(ConfigError::invalid("merge.relative_tolerance", "must be in [0, 1)"));
        }
        if m.default_importance < 0.0 || m.importance.values().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ConfigError::invalid("merge.importance", "weights must be non-negative"));
        }

        let floor = self.validation.confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::invalid("validation.confidence_floor", "must be in [0, 1]"));
        }

        let d = &self.confidence_defaults;
        for (name, value) in [
            ("categorical", d.categorical),
            ("flag", d.flag),
            ("free_text", d.free_text),
            ("set", d.set),
            ("numeric", d.numeric),
            ("price", d.price),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(
                    format!("confidence_defaults.{name}"),
                    "must be in [0, 1]",
                ));
            }
        }

        if self.images.max_per_call == 0 {
            return Err(ConfigError::invalid("images.max_per_call", "must be > 0"));
        }

        if self.fields.is_empty() {
            return Err(ConfigError::invalid("fields", "catalog must not be empty"));
        }

        Ok(())
    }

    /// Set the cost ceilings.
    pub fn with_quota(mut self, daily_ceiling: f64, monthly_ceiling: f64) -> Self {
        self.quota = QuotaConfig {
            daily_ceiling,
            monthly_ceiling,
        };
        self
    }

    /// Replace one backend's configuration.
    pub fn with_backend(mut self, kind: BackendKind, backend: BackendConfig) -> Self {
        *self.backends.get_mut(kind) = backend;
        self
    }

    /// Disable the response cache.
    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }
}

/// One resilience configuration per backend kind.
///
/// A `[backends.<kind>]` table overrides only the keys it names, at any
/// depth. Everything else keeps that kind's own defaults, so
/// `[backends.vision] timeout_ms = 12000` still runs `gpt-4o` at vision cost.
#[derive(Debug, Clone, Serialize)]
pub struct BackendsConfig {
    pub text: BackendConfig,
    pub vision: BackendConfig,
    pub voice: BackendConfig,
}

impl<'de> Deserialize<'de> for BackendsConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Overrides {
            text: Option<Value>,
            vision: Option<Value>,
            voice: Option<Value>,
        }

        let overrides = Overrides::deserialize(deserializer)?;
        let resolve = |base: BackendConfig, table: Option<Value>, kind: &str| {
            overlay(base, table).map_err(|e| de::Error::custom(format!("backends.{kind}: {e}")))
        };

        Ok(Self {
            text: resolve(BackendConfig::text_default(), overrides.text, "text")?,
            vision: resolve(BackendConfig::vision_default(), overrides.vision, "vision")?,
            voice: resolve(BackendConfig::voice_default(), overrides.voice, "voice")?,
        })
    }
}

fn overlay(base: BackendConfig, table: Option<Value>) -> Result<BackendConfig, serde_json::Error> {
    let Some(table) = table else {
        return Ok(base);
    };
    let mut merged = serde_json::to_value(&base)?;
    merge_value(&mut merged, table);
    serde_json::from_value(merged)
}

fn merge_value(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_value(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            text: BackendConfig::text_default(),
            vision: BackendConfig::vision_default(),
            voice: BackendConfig::voice_default(),
        }
    }
}

impl BackendsConfig {
    pub fn get(&self, kind: BackendKind) -> &BackendConfig {
        match kind {
            BackendKind::Text => &self.text,
            BackendKind::Vision => &self.vision,
            BackendKind::Voice => &self.voice,
        }
    }

    pub fn get_mut(&mut self, kind: BackendKind) -> &mut BackendConfig {
        match kind {
            BackendKind::Text => &mut self.text,
            BackendKind::Vision => &mut self.vision,
            BackendKind::Voice => &mut self.voice,
        }
    }
}

/// Resilience and cost parameters for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Provider model identifier (opaque to the engine)
    pub model: String,

    /// Per-attempt timeout
    pub timeout_ms: u64,

    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cost: CostConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::text_default()
    }
}

impl BackendConfig {
    pub fn text_default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cost: CostConfig {
                per_call: 0.002,
                per_unit: 0.0,
            },
        }
    }

    pub fn vision_default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            timeout_ms: 60_000,
            cost: CostConfig {
                per_call: 0.005,
                per_unit: 0.01,
            },
            ..Self::text_default()
        }
    }

    pub fn voice_default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            timeout_ms: 45_000,
            cost: CostConfig {
                per_call: 0.006,
                per_unit: 0.0,
            },
            ..Self::text_default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cost(mut self, per_call: f64, per_unit: f64) -> Self {
        self.cost = CostConfig { per_call, per_unit };
        self
    }

    fn validate(&self, kind: BackendKind) -> ConfigResult<()> {
        let field = |name: &str| format!("backends.{kind}.{name}");

        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(field("timeout_ms"), "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(field("retry.max_attempts"), "must be >= 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                field("retry.base_delay_ms"),
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(field("breaker.failure_threshold"), "must be >= 1"));
        }
        if self.breaker.cooldown_secs == 0 || self.breaker.window_secs == 0 {
            return Err(ConfigError::invalid(field("breaker"), "window and cooldown must be > 0"));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(ConfigError::invalid(field("rate_limit"), "limits must be > 0"));
        }
        if !(self.cost.per_call >= 0.0 && self.cost.per_unit >= 0.0) {
            return Err(ConfigError::invalid(field("cost"), "costs must be non-negative"));
        }
        Ok(())
    }
}

/// Retry-with-backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Failures must fall within this window to count as consecutive
    pub window_secs: u64,

    /// How long the circuit stays open before a trial call
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

/// Token-bucket rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,

    /// Longest a call may block waiting for a token
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1_000,
            max_wait_ms: 5_000,
        }
    }
}

/// Estimated cost of one call: `per_call + per_unit * units`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub per_call: f64,

    /// Per billable unit (images for vision)
    pub per_unit: f64,
}

impl CostConfig {
    pub fn estimate(&self, units: u32) -> f64 {
        self.per_call + self.per_unit * units as f64
    }
}

/// Response cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 600,
            max_entries: 1_024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Cost ceilings per UTC calendar day and month.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_ceiling: f64,
    pub monthly_ceiling: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_ceiling: 50.0,
            monthly_ceiling: 1_000.0,
        }
    }
}

impl QuotaConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !(self.daily_ceiling.is_finite() && self.daily_ceiling >= 0.0) {
            return Err(ConfigError::invalid("quota.daily_ceiling", "must be a non-negative number"));
        }
        if !(self.monthly_ceiling.is_finite() && self.monthly_ceiling >= 0.0) {
            return Err(ConfigError::invalid("quota.monthly_ceiling", "must be a non-negative number"));
        }
        Ok(())
    }
}

/// Merge arbitration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Confidence multiplier applied to a contested winner
    pub disagreement_penalty: f32,

    /// Decimal values within this relative difference agree
    pub relative_tolerance: f64,

    /// Field importance for the overall confidence
    pub importance: HashMap<String, f32>,

    /// Importance of fields missing from `importance`
    pub default_importance: f32,

    /// Set-valued fields resolved against the amenity catalog
    pub catalog_fields: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let importance = ValidationConfig::default_required_fields()
            .into_iter()
            .chain(["bedrooms", "bathrooms", "total_area_sqm"].map(String::from))
            .map(|f| (f, 2.0))
            .collect();

        Self {
            disagreement_penalty: 0.8,
            relative_tolerance: 0.02,
            importance,
            default_importance: 1.0,
            catalog_fields: vec!["amenities".to_string()],
        }
    }
}

impl MergeConfig {
    pub fn importance_of(&self, field: &str) -> f32 {
        self.importance
            .get(field)
            .copied()
            .unwrap_or(self.default_importance)
    }
}

/// Inclusive numeric range for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,

    /// Hard failures make the record invalid; soft ones only warn
    #[serde(default)]
    pub hard: bool,
}

impl RangeRule {
    pub fn hard(field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
            hard: true,
        }
    }

    pub fn soft(field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            hard: false,
            ..Self::hard(field, min, max)
        }
    }
}

/// Cross-field consistency rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConsistencyRule {
    /// `lesser` must not exceed `greater` (e.g. built area vs total area)
    NotGreater { lesser: String, greater: String },

    /// `later` must not precede `earlier` (e.g. renovation vs construction year)
    NotBefore { later: String, earlier: String },
}

/// Validation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Populated fields below this confidence are flagged low-confidence
    pub confidence_floor: f32,

    /// Field whose value selects the category-specific required list
    pub category_field: String,

    /// Required for every listing
    pub default_required: Vec<String>,

    /// Extra required fields per category value
    pub required_by_category: HashMap<String, Vec<String>>,

    pub ranges: Vec<RangeRule>,
    pub consistency: Vec<ConsistencyRule>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let residential: Vec<String> = ["bedrooms", "bathrooms", "total_area_sqm"]
            .map(String::from)
            .to_vec();

        let required_by_category = HashMap::from([
            ("apartment".to_string(), residential.clone()),
            ("house".to_string(), residential.clone()),
            ("villa".to_string(), residential),
            ("land".to_string(), vec!["total_area_sqm".to_string()]),
            ("commercial".to_string(), vec!["total_area_sqm".to_string()]),
        ]);

        Self {
            confidence_floor: 0.5,
            category_field: "property_type".to_string(),
            default_required: Self::default_required_fields(),
            required_by_category,
            ranges: vec![
                RangeRule::hard("price", Some(1.0), None),
                RangeRule::hard("bedrooms", Some(0.0), Some(50.0)),
                RangeRule::hard("bathrooms", Some(0.0), Some(50.0)),
                RangeRule::hard("parking_spaces", Some(0.0), Some(100.0)),
                RangeRule::hard("total_area_sqm", Some(1.0), None),
                RangeRule::hard("built_area_sqm", Some(1.0), None),
                RangeRule::soft("total_area_sqm", None, Some(1_000_000.0)),
                RangeRule::soft("floor", Some(-5.0), Some(200.0)),
                RangeRule::soft("total_floors", Some(1.0), Some(200.0)),
                RangeRule::soft("year_built", Some(1800.0), Some(2100.0)),
                RangeRule::soft("year_renovated", Some(1800.0), Some(2100.0)),
            ],
            consistency: vec![
                ConsistencyRule::NotGreater {
                    lesser: "built_area_sqm".to_string(),
                    greater: "total_area_sqm".to_string(),
                },
                ConsistencyRule::NotGreater {
                    lesser: "floor".to_string(),
                    greater: "total_floors".to_string(),
                },
                ConsistencyRule::NotBefore {
                    later: "year_renovated".to_string(),
                    earlier: "year_built".to_string(),
                },
            ],
        }
    }
}

impl ValidationConfig {
    fn default_required_fields() -> Vec<String> {
        ["listing_type", "property_type", "price", "city"]
            .map(String::from)
            .to_vec()
    }
}

/// Image batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Images sent to the vision backend per call
    pub max_per_call: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { max_per_call: 8 }
    }
}

/// Orchestrator defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline used when the caller does not supply one
    pub default_deadline_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 45_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }
}
