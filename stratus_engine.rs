//! # Stratus Engine - CloudWatch Scrape Orchestration
//!
//! A concurrent scrape-orchestration and request-batching engine for a
//! CloudWatch-shaped monitoring API. One scrape cycle fans out across every
//! (job, role, region) triple, discovers the metrics that actually carry data,
//! batches them into `GetMetricData` calls under two independent rate gates and
//! merges the batched answers back onto the queries that asked for them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           STRATUS SCRAPE ENGINE                             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CONFIG → TRIPLES → QUERY GENERATORS → RATE GATES → BATCH / MERGE → SINK    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Credentials, the concrete AWS clients and the exposition of the collected
//! records live outside this crate. They plug in through the collaborator
//! traits of section 8.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Lazy Statics
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "stratus-engine";
pub const ENGINE_FULL_NAME: &str = "Stratus CloudWatch Scrape Engine";

// ----------------------------------------------------------------------------
// Request Windows
// ----------------------------------------------------------------------------

/// Default statistic period (seconds)
pub const DEFAULT_PERIOD_SECONDS: i64 = 300;

/// Default length of the requested time window (seconds)
pub const DEFAULT_LENGTH_SECONDS: i64 = 300;

/// Default delay between "now" and the end of the window (seconds)
pub const DEFAULT_DELAY_SECONDS: i64 = 0;

/// Longest period, length or delay accepted: CloudWatch retention (455 days)
pub const MAX_WINDOW_SECONDS: i64 = 455 * 24 * 60 * 60;

// ----------------------------------------------------------------------------
// Batching & Concurrency
// ----------------------------------------------------------------------------

/// Queries per `GetMetricData` call unless configured otherwise
pub const DEFAULT_METRICS_PER_QUERY: usize = 500;

/// Hard API limit on queries per `GetMetricData` call
pub const MAX_METRICS_PER_QUERY: usize = 500;

/// Concurrent data-fetch calls allowed by default
pub const DEFAULT_CLOUDWATCH_CONCURRENCY: usize = 5;

/// Concurrent discovery (tagging + catalog) calls allowed by default
pub const DEFAULT_TAG_CONCURRENCY: usize = 5;

/// Upper bound on one scrape cycle before in-flight calls are cancelled
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 120;

// ----------------------------------------------------------------------------
// Identifiers & Statistics
// ----------------------------------------------------------------------------

/// Pseudo-resource owning catalog entries that map to no discovered resource
pub const GLOBAL_RESOURCE_ID: &str = "global";

/// Statistics served by the plain statistics API
pub const STANDARD_STATISTICS: [&str; 5] = ["Sum", "Average", "Maximum", "Minimum", "SampleCount"];

/// Prefix of minted correlation ids (the API wants a leading lowercase letter)
pub const CORRELATION_ID_PREFIX: &str = "id_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Everything that crosses the boundary between the engine and its
// collaborators, plus the query record that is batched and merged.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Identity & Labels
// ----------------------------------------------------------------------------

/// An IAM role assumed to reach one account.
///
/// An empty ARN stands for the ambient credentials of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    #[serde(default)]
    pub role_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Role {
    pub fn new(role_arn: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            external_id: None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.role_arn.is_empty() {
            write!(f, "default")
        } else {
            write!(f, "{}", self.role_arn)
        }
    }
}

/// A key/value tag, used for resource tags, custom tags and search filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A metric dimension (name/value pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Order-insensitive comparison of two dimension sets.
pub fn same_dimensions(a: &[Dimension], b: &[Dimension]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&Dimension> = a.iter().collect();
    let mut b: Vec<&Dimension> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

// ----------------------------------------------------------------------------
// 3.2 Tagged Resources
// ----------------------------------------------------------------------------

/// A search-tag filter with its value pattern compiled.
#[derive(Debug, Clone)]
pub struct TagMatcher {
    pub key: String,
    pub pattern: Regex,
}

impl TagMatcher {
    /// Compile a set of search tags; tag values are regular expressions.
    pub fn compile(tags: &[Tag]) -> Result<Vec<Self>, regex::Error> {
        tags.iter()
            .map(|tag| {
                Ok(Self {
                    key: tag.key.clone(),
                    pattern: Regex::new(&tag.value)?,
                })
            })
            .collect()
    }
}

/// A resource found through the tagging API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedResource {
    pub arn: String,
    pub namespace: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl TaggedResource {
    /// The pseudo-resource owning metrics that match no discovered resource.
    pub fn global(namespace: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            arn: GLOBAL_RESOURCE_ID.to_string(),
            namespace: namespace.into(),
            region: region.into(),
            tags: Vec::new(),
        }
    }

    /// Value of a tag, if the resource carries it.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    /// True when every matcher finds a tag with its key and a matching value.
    pub fn filter_through_tags(&self, matchers: &[TagMatcher]) -> bool {
        matchers.iter().all(|matcher| {
            self.tags
                .iter()
                .any(|tag| tag.key == matcher.key && matcher.pattern.is_match(&tag.value))
        })
    }

    /// Tags exported onto this resource's metrics. Every configured key is
    /// present; a key the resource does not carry gets an empty value.
    pub fn metric_tags(&self, exported: &HashMap<String, Vec<String>>) -> Vec<Tag> {
        exported
            .get(&self.namespace)
            .map(|keys| {
                keys.iter()
                    .map(|key| Tag::new(key.clone(), self.tag(key).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 3.3 Monitoring API Shapes
// ----------------------------------------------------------------------------

/// One catalog entry: a metric together with a dimension combination that
/// has reported data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudwatchMetric {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

impl CloudwatchMetric {
    /// True when the entry's dimension names are exactly `required` (values
    /// are not compared).
    pub fn dimension_names_match(&self, required: &[String]) -> bool {
        if required.len() != self.dimensions.len() {
            return false;
        }
        self.dimensions
            .iter()
            .all(|dimension| required.iter().any(|name| *name == dimension.name))
    }
}

/// Answer of the identity service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account: Option<String>,
    pub arn: Option<String>,
}

/// Per-id result of a batched data fetch. `values[i]` was observed at
/// `timestamps[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataResult {
    pub id: String,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
}

/// Output of a batched data fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetMetricDataOutput {
    pub results: Vec<MetricDataResult>,
}

/// One data point from the single-metric statistics API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_statistics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Datapoint {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            average: None,
            sum: None,
            maximum: None,
            minimum: None,
            sample_count: None,
            extended_statistics: BTreeMap::new(),
            unit: None,
        }
    }

    /// Store `value` under the field matching `statistic`; percentiles go to
    /// the extended map.
    pub fn set_statistic(&mut self, statistic: &str, value: f64) {
        match statistic {
            "Average" => self.average = Some(value),
            "Sum" => self.sum = Some(value),
            "Maximum" => self.maximum = Some(value),
            "Minimum" => self.minimum = Some(value),
            "SampleCount" => self.sample_count = Some(value),
            other => {
                self.extended_statistics.insert(other.to_string(), value);
            }
        }
    }

    pub fn statistic(&self, statistic: &str) -> Option<f64> {
        match statistic {
            "Average" => self.average,
            "Sum" => self.sum,
            "Maximum" => self.maximum,
            "Minimum" => self.minimum,
            "SampleCount" => self.sample_count,
            other => self.extended_statistics.get(other).copied(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Correlated Queries
// ----------------------------------------------------------------------------

/// The value a batched fetch reported for one query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDataPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// The unit of work that is batched, fetched and merged.
///
/// A query is created before any data call is made and belongs to exactly
/// one triple. Batched fetches fill `result`; static fetches fill `points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedQuery {
    /// Resource ARN, `global`, or the static job name
    pub resource_id: String,
    /// Echoed back by the batched API; unique within the query's batch
    pub correlation_id: String,
    pub metric_name: String,
    pub namespace: String,
    pub statistics: Vec<String>,
    pub dimensions: Vec<Dimension>,
    /// Resource tags exported onto the metric
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub custom_tags: Vec<Tag>,
    pub period: i64,
    pub nil_to_zero: bool,
    pub add_cloudwatch_timestamp: bool,
    pub region: String,
    pub account_id: String,
    #[serde(default)]
    pub result: Option<MetricDataPoint>,
    #[serde(default)]
    pub points: Option<Vec<Datapoint>>,
}

impl CorrelatedQuery {
    /// Base query for `metric`; callers fill ids, dimensions and tags.
    pub fn for_metric(metric: &MetricConfig, namespace: &str, region: &str, account_id: &str) -> Self {
        Self {
            resource_id: String::new(),
            correlation_id: String::new(),
            metric_name: metric.name.clone(),
            namespace: namespace.to_string(),
            statistics: metric.statistics.clone(),
            dimensions: Vec::new(),
            tags: Vec::new(),
            custom_tags: Vec::new(),
            period: metric.period,
            nil_to_zero: metric.nil_to_zero.unwrap_or(false),
            add_cloudwatch_timestamp: metric.add_cloudwatch_timestamp.unwrap_or(false),
            region: region.to_string(),
            account_id: account_id.to_string(),
            result: None,
            points: None,
        }
    }

    /// Take the newest reported value. An empty value sequence (or one
    /// without a matching timestamp) leaves the slot empty.
    pub fn apply_result(&mut self, result: &MetricDataResult) {
        if let (Some(value), Some(timestamp)) = (result.values.first(), result.timestamps.first()) {
            self.result = Some(MetricDataPoint {
                value: *value,
                timestamp: *timestamp,
            });
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.result.map(|point| point.value)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Contributions
// ----------------------------------------------------------------------------

/// What one triple adds to the aggregate output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub resources: Vec<TaggedResource>,
    pub queries: Vec<CorrelatedQuery>,
}

impl Contribution {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.queries.is_empty()
    }
}

/// The three kinds of scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Discovery,
    Static,
    CustomNamespace,
}

impl Display for JobKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Discovery => write!(f, "discovery"),
            JobKind::Static => write!(f, "static"),
            JobKind::CustomNamespace => write!(f, "custom_namespace"),
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Errors are layered the same way the engine is: collaborator calls fail with
// `ClientError`, configuration with `ConfigError`, and everything converges on
// `ScrapeError` at the surface.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Self-monitoring error: {0}")]
    Monitoring(#[from] prometheus::Error),

    #[error("Replay fixture error: {0}")]
    Replay(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Scrape cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ScrapeError::Config(_) => false,
            ScrapeError::Client(e) => e.is_recoverable(),
            ScrapeError::Io(_) => true,
            ScrapeError::Serialization(_) => false,
            ScrapeError::Monitoring(_) => false,
            ScrapeError::Replay(_) => false,
            ScrapeError::Internal(_) => false,
            ScrapeError::Cancelled => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ScrapeError::Config(_) => "config",
            ScrapeError::Client(_) => "client",
            ScrapeError::Io(_) => "io",
            ScrapeError::Serialization(_) => "serialization",
            ScrapeError::Monitoring(_) => "monitoring",
            ScrapeError::Replay(_) => "replay",
            ScrapeError::Internal(_) => "internal",
            ScrapeError::Cancelled => "cancelled",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Client Errors
// ----------------------------------------------------------------------------

/// The external API calls the engine makes, used for error context and
/// self-monitoring labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiCall {
    GetCallerIdentity,
    GetResources,
    ListMetrics,
    GetMetricData,
    GetMetricStatistics,
}

impl ApiCall {
    pub const ALL: [ApiCall; 5] = [
        ApiCall::GetCallerIdentity,
        ApiCall::GetResources,
        ApiCall::ListMetrics,
        ApiCall::GetMetricData,
        ApiCall::GetMetricStatistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiCall::GetCallerIdentity => "GetCallerIdentity",
            ApiCall::GetResources => "GetResources",
            ApiCall::ListMetrics => "ListMetrics",
            ApiCall::GetMetricData => "GetMetricData",
            ApiCall::GetMetricStatistics => "GetMetricStatistics",
        }
    }
}

impl Display for ApiCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the collaborator clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{api} request failed: {message}")]
    Api { api: ApiCall, message: String },

    #[error("{api} request throttled")]
    Throttled { api: ApiCall },

    #[error("{api} response is missing '{field}'")]
    MissingField { api: ApiCall, field: &'static str },

    #[error("request window reaching {seconds}s back is out of range")]
    WindowOutOfRange { seconds: i64 },

    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn api(api: ApiCall, message: impl Into<String>) -> Self {
        ClientError::Api {
            api,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ClientError::Cancelled
                | ClientError::MissingField { .. }
                | ClientError::WindowOutOfRange { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// Result type for collaborator calls
pub type ClientResult<T> = Result<T, ClientError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + `STRATUS_` environment overrides through figment. Validation
// also normalizes: metric defaults are filled from their job, discovery job
// types and exported-tag keys are resolved to full namespaces, and role-less
// jobs get the ambient role.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Batching and rate-gate limits
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scrape jobs
    #[serde(default)]
    pub scrape: ScrapeConf,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("STRATUS_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides)
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and fill derived defaults in place
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.scrape.validate()
    }

    /// A small configuration covering all three job kinds
    pub fn example() -> Self {
        let metric = |name: &str, statistics: &[&str]| MetricConfig {
            name: name.to_string(),
            statistics: statistics.iter().map(|s| s.to_string()).collect(),
            ..MetricConfig::default()
        };

        let mut exported_tags_on_metrics = HashMap::new();
        exported_tags_on_metrics.insert("AWS/EC2".to_string(), vec!["Name".to_string()]);

        Self {
            engine: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            scrape: ScrapeConf {
                discovery: DiscoveryConf {
                    exported_tags_on_metrics,
                    jobs: vec![DiscoveryJob {
                        job_type: "AWS/EC2".to_string(),
                        roles: vec![Role::default()],
                        regions: vec!["us-east-1".to_string()],
                        search_tags: vec![Tag::new("Environment", "^prod$")],
                        custom_tags: vec![Tag::new("team", "platform")],
                        dimension_name_requirements: Vec::new(),
                        metrics: vec![
                            metric("CPUUtilization", &["Average", "Maximum"]),
                            metric("NetworkIn", &["Sum"]),
                        ],
                        period: 300,
                        length: 600,
                        delay: 0,
                        rounding_period: None,
                        nil_to_zero: Some(true),
                        add_cloudwatch_timestamp: None,
                    }],
                },
                static_jobs: vec![StaticJob {
                    name: "edge-lb".to_string(),
                    namespace: "AWS/ApplicationELB".to_string(),
                    roles: vec![Role::default()],
                    regions: vec!["eu-west-1".to_string()],
                    custom_tags: Vec::new(),
                    dimensions: vec![Dimension::new("LoadBalancer", "app/edge/0123456789abcdef")],
                    metrics: vec![metric("RequestCount", &["Sum"])],
                }],
                custom_namespace: vec![CustomNamespaceJob {
                    name: "billing-app".to_string(),
                    namespace: "Billing/App".to_string(),
                    roles: vec![Role::default()],
                    regions: vec!["us-east-1".to_string()],
                    custom_tags: Vec::new(),
                    dimension_name_requirements: vec!["Service".to_string()],
                    metrics: vec![metric("Invoices", &["Sum", "p99"])],
                    period: 60,
                    length: 300,
                    delay: 0,
                    rounding_period: None,
                    nil_to_zero: None,
                    add_cloudwatch_timestamp: None,
                }],
            },
        }
    }

    /// Render the example configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// Limits passed to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Maximum queries per batched data-fetch call
    #[serde(default = "default_metrics_per_query")]
    pub metrics_per_query: usize,

    /// Capacity of the data-fetch gate
    #[serde(default = "default_cloudwatch_concurrency")]
    pub cloudwatch_concurrency: usize,

    /// Capacity of the discovery gate
    #[serde(default = "default_tag_concurrency")]
    pub tag_concurrency: usize,

    /// Cancel a scrape cycle that runs longer than this
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            metrics_per_query: default_metrics_per_query(),
            cloudwatch_concurrency: default_cloudwatch_concurrency(),
            tag_concurrency: default_tag_concurrency(),
            scrape_timeout_secs: default_scrape_timeout(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_per_query == 0 || self.metrics_per_query > MAX_METRICS_PER_QUERY {
            return Err(ConfigError::invalid_value(
                "engine.metrics_per_query",
                format!("must be between 1 and {}", MAX_METRICS_PER_QUERY),
            ));
        }
        if self.cloudwatch_concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "engine.cloudwatch_concurrency",
                "must be at least 1",
            ));
        }
        if self.tag_concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "engine.tag_concurrency",
                "must be at least 1",
            ));
        }
        if self.scrape_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "engine.scrape_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_metrics_per_query() -> usize {
    DEFAULT_METRICS_PER_QUERY
}

fn default_cloudwatch_concurrency() -> usize {
    DEFAULT_CLOUDWATCH_CONCURRENCY
}

fn default_tag_concurrency() -> usize {
    DEFAULT_TAG_CONCURRENCY
}

fn default_scrape_timeout() -> u64 {
    DEFAULT_SCRAPE_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Scrape Configuration
// ----------------------------------------------------------------------------

/// All jobs of one scrape cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeConf {
    #[serde(default)]
    pub discovery: DiscoveryConf,

    #[serde(default, rename = "static")]
    pub static_jobs: Vec<StaticJob>,

    #[serde(default)]
    pub custom_namespace: Vec<CustomNamespaceJob>,
}

impl ScrapeConf {
    /// Number of (job, role, region) triples one cycle fans out to
    pub fn triple_count(&self) -> usize {
        let discovery: usize = self
            .discovery
            .jobs
            .iter()
            .map(|job| job.roles.len() * job.regions.len())
            .sum();
        let statics: usize = self
            .static_jobs
            .iter()
            .map(|job| job.roles.len() * job.regions.len())
            .sum();
        let custom: usize = self
            .custom_namespace
            .iter()
            .map(|job| job.roles.len() * job.regions.len())
            .sum();
        discovery + statics + custom
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let exported = std::mem::take(&mut self.discovery.exported_tags_on_metrics);
        for (key, tags) in exported {
            let service = find_service(&key).ok_or_else(|| {
                ConfigError::invalid_value(
                    format!("discovery.exported_tags_on_metrics.{}", key),
                    "unknown service",
                )
            })?;
            self.discovery
                .exported_tags_on_metrics
                .entry(service.namespace.to_string())
                .or_default()
                .extend(tags);
        }

        for (idx, job) in self.discovery.jobs.iter_mut().enumerate() {
            job.validate(&format!("discovery.jobs[{}]", idx))?;
        }
        for (idx, job) in self.static_jobs.iter_mut().enumerate() {
            job.validate(&format!("static[{}]", idx))?;
        }
        for (idx, job) in self.custom_namespace.iter_mut().enumerate() {
            job.validate(&format!("custom_namespace[{}]", idx))?;
        }
        Ok(())
    }
}

/// Discovery jobs and the tags they export onto metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConf {
    /// Namespace (or service alias) → tag keys copied onto each query
    #[serde(default)]
    pub exported_tags_on_metrics: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub jobs: Vec<DiscoveryJob>,
}

// ----------------------------------------------------------------------------
// 5.4 Job Definitions
// ----------------------------------------------------------------------------

/// Auto-discovered resources of one supported service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryJob {
    /// Service namespace or alias (`AWS/EC2`, `ec2`); a namespace after validation
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub search_tags: Vec<Tag>,
    #[serde(default)]
    pub custom_tags: Vec<Tag>,
    #[serde(default)]
    pub dimension_name_requirements: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding_period: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nil_to_zero: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_cloudwatch_timestamp: Option<bool>,
}

impl DiscoveryJob {
    fn defaults(&self) -> MetricDefaults {
        MetricDefaults {
            period: self.period,
            length: self.length,
            delay: self.delay,
            nil_to_zero: self.nil_to_zero,
            add_cloudwatch_timestamp: self.add_cloudwatch_timestamp,
        }
    }

    fn validate(&mut self, field: &str) -> Result<(), ConfigError> {
        let service = find_service(&self.job_type).ok_or_else(|| {
            ConfigError::invalid_value(
                format!("{}.type", field),
                format!("unknown discovery service '{}'", self.job_type),
            )
        })?;
        self.job_type = service.namespace.to_string();

        TagMatcher::compile(&self.search_tags).map_err(|e| {
            ConfigError::invalid_value(format!("{}.search_tags", field), e.to_string())
        })?;
        validate_rounding(field, self.rounding_period)?;

        let defaults = self.defaults();
        validate_common(field, &mut self.roles, &self.regions, &mut self.metrics, &defaults)
    }
}

/// A fixed resource declared by name, namespace and dimensions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticJob {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub custom_tags: Vec<Tag>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

impl StaticJob {
    fn validate(&mut self, field: &str) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::missing_field(format!("{}.name", field)));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::missing_field(format!("{}.namespace", field)));
        }
        validate_common(
            field,
            &mut self.roles,
            &self.regions,
            &mut self.metrics,
            &MetricDefaults::default(),
        )
    }
}

/// Every metric of a custom namespace, discovered from the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomNamespaceJob {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub custom_tags: Vec<Tag>,
    #[serde(default)]
    pub dimension_name_requirements: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounding_period: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nil_to_zero: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_cloudwatch_timestamp: Option<bool>,
}

impl CustomNamespaceJob {
    fn validate(&mut self, field: &str) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::missing_field(format!("{}.name", field)));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::missing_field(format!("{}.namespace", field)));
        }
        validate_rounding(field, self.rounding_period)?;

        if self.length <= 0 {
            self.length = DEFAULT_LENGTH_SECONDS;
        }
        let defaults = MetricDefaults {
            period: self.period,
            length: self.length,
            delay: self.delay,
            nil_to_zero: self.nil_to_zero,
            add_cloudwatch_timestamp: self.add_cloudwatch_timestamp,
        };
        validate_common(field, &mut self.roles, &self.regions, &mut self.metrics, &defaults)
    }
}

// ----------------------------------------------------------------------------
// 5.5 Metric Definitions
// ----------------------------------------------------------------------------

/// One metric with the statistics to request. Zero period/length/delay means
/// "inherit from the job".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub statistics: Vec<String>,
    #[serde(default)]
    pub period: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nil_to_zero: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_cloudwatch_timestamp: Option<bool>,
}

/// Job-level values a metric falls back to
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricDefaults {
    pub period: i64,
    pub length: i64,
    pub delay: i64,
    pub nil_to_zero: Option<bool>,
    pub add_cloudwatch_timestamp: Option<bool>,
}

impl MetricConfig {
    /// Fill unset values from the job, then from the global defaults.
    pub fn apply_defaults(&mut self, job: &MetricDefaults) {
        self.period = resolve(self.period, job.period, DEFAULT_PERIOD_SECONDS);
        self.length = resolve(self.length, job.length, DEFAULT_LENGTH_SECONDS);
        self.delay = resolve(self.delay, job.delay, DEFAULT_DELAY_SECONDS);
        if self.nil_to_zero.is_none() {
            self.nil_to_zero = job.nil_to_zero;
        }
        if self.add_cloudwatch_timestamp.is_none() {
            self.add_cloudwatch_timestamp = job.add_cloudwatch_timestamp;
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::missing_field(format!("{}.name", field)));
        }
        if self.statistics.is_empty() {
            return Err(ConfigError::invalid_value(
                format!("{}.statistics", field),
                format!("metric '{}' requests no statistics", self.name),
            ));
        }
        if let Some(bad) = self.statistics.iter().find(|s| !is_valid_statistic(s)) {
            return Err(ConfigError::invalid_value(
                format!("{}.statistics", field),
                format!("unknown statistic '{}'", bad),
            ));
        }
        if self.period <= 0 {
            return Err(ConfigError::invalid_value(
                format!("{}.period", field),
                "must be positive",
            ));
        }
        if self.length < 0 || self.delay < 0 {
            return Err(ConfigError::invalid_value(
                format!("{}.length", field),
                "length and delay cannot be negative",
            ));
        }
        validate_spans(
            field,
            &[("period", self.period), ("length", self.length), ("delay", self.delay)],
        )
    }
}

fn resolve(own: i64, job: i64, fallback: i64) -> i64 {
    if own > 0 {
        own
    } else if job > 0 {
        job
    } else {
        fallback
    }
}

fn validate_rounding(field: &str, rounding_period: Option<i64>) -> Result<(), ConfigError> {
    match rounding_period {
        Some(period) if period <= 0 => Err(ConfigError::invalid_value(
            format!("{}.rounding_period", field),
            "must be positive",
        )),
        Some(period) => validate_spans(field, &[("rounding_period", period)]),
        None => Ok(()),
    }
}

fn validate_spans(field: &str, spans: &[(&str, i64)]) -> Result<(), ConfigError> {
    match spans.iter().find(|(_, seconds)| *seconds > MAX_WINDOW_SECONDS) {
        Some((name, seconds)) => Err(ConfigError::invalid_value(
            format!("{}.{}", field, name),
            format!("{}s exceeds the {}s retention limit", seconds, MAX_WINDOW_SECONDS),
        )),
        None => Ok(()),
    }
}

fn validate_common(
    field: &str,
    roles: &mut Vec<Role>,
    regions: &[String],
    metrics: &mut [MetricConfig],
    defaults: &MetricDefaults,
) -> Result<(), ConfigError> {
    if roles.is_empty() {
        roles.push(Role::default());
    }
    if regions.is_empty() {
        return Err(ConfigError::missing_field(format!("{}.regions", field)));
    }
    if metrics.is_empty() {
        return Err(ConfigError::missing_field(format!("{}.metrics", field)));
    }
    validate_spans(
        field,
        &[
            ("period", defaults.period),
            ("length", defaults.length),
            ("delay", defaults.delay),
        ],
    )?;
    for (idx, metric) in metrics.iter_mut().enumerate() {
        metric.apply_defaults(defaults);
        metric.validate(&format!("{}.metrics[{}]", field, idx))?;
    }
    Ok(())
}

/// True for the standard statistics and percentiles `p0`..`p99.99`, `p100`.
pub fn is_valid_statistic(statistic: &str) -> bool {
    STANDARD_STATISTICS.contains(&statistic) || is_extended_statistic(statistic)
}

/// Percentile statistics are requested through the extended-statistics field.
pub fn is_extended_statistic(statistic: &str) -> bool {
    let Some(rest) = statistic.strip_prefix('p') else {
        return false;
    };
    if rest == "100" {
        return true;
    }
    let (whole, fraction) = match rest.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (rest, None),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let whole_ok = (1..=2).contains(&whole.len()) && digits(whole);
    let fraction_ok = fraction.map_or(true, |f| f.len() <= 2 && digits(f));
    whole_ok && fraction_ok
}

// ============================================================================
// SECTION 6: LOGGING INITIALIZATION
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Initialize the logging system. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig) -> ScrapeResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ScrapeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ScrapeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ScrapeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 7: SERVICE REGISTRY
// ============================================================================
// Supported discovery services. The dimension regexps run against resource
// ARNs; each named capture group yields one dimension value, with
// underscores in the group name standing for spaces in the dimension name.
// ============================================================================

/// A service discovery jobs can target
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub namespace: &'static str,
    pub alias: &'static str,
    pub resource_filters: &'static [&'static str],
    pub dimension_regexps: &'static [&'static str],
}

impl ServiceConfig {
    /// Compiled dimension regexps. Table services compile once per process;
    /// a service outside the table has none.
    pub fn dimension_regexps(&self) -> Result<&'static [Regex], regex::Error> {
        match COMPILED_DIMENSION_REGEXPS.get(self.namespace) {
            Some(Ok(regexps)) => Ok(regexps),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(&[]),
        }
    }
}

static COMPILED_DIMENSION_REGEXPS: Lazy<HashMap<&'static str, Result<Vec<Regex>, regex::Error>>> =
    Lazy::new(|| {
        SUPPORTED_SERVICES
            .iter()
            .map(|service| {
                let compiled = service
                    .dimension_regexps
                    .iter()
                    .map(|pattern| Regex::new(pattern))
                    .collect();
                (service.namespace, compiled)
            })
            .collect()
    });

pub static SUPPORTED_SERVICES: &[ServiceConfig] = &[
    ServiceConfig {
        namespace: "AWS/EC2",
        alias: "ec2",
        resource_filters: &["ec2:instance"],
        dimension_regexps: &["instance/(?P<InstanceId>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/EBS",
        alias: "ebs",
        resource_filters: &["ec2:volume"],
        dimension_regexps: &["volume/(?P<VolumeId>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/NATGateway",
        alias: "ngw",
        resource_filters: &["ec2:natgateway"],
        dimension_regexps: &["natgateway/(?P<NatGatewayId>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/RDS",
        alias: "rds",
        resource_filters: &["rds:db", "rds:cluster"],
        dimension_regexps: &[
            ":cluster:(?P<DBClusterIdentifier>[^/]+)",
            ":db:(?P<DBInstanceIdentifier>[^/]+)",
        ],
    },
    ServiceConfig {
        namespace: "AWS/ApplicationELB",
        alias: "alb",
        resource_filters: &[
            "elasticloadbalancing:loadbalancer/app",
            "elasticloadbalancing:targetgroup",
        ],
        dimension_regexps: &[
            ":(?P<TargetGroup>targetgroup/.+)",
            ":loadbalancer/(?P<LoadBalancer>.+)$",
        ],
    },
    ServiceConfig {
        namespace: "AWS/ELB",
        alias: "elb",
        resource_filters: &["elasticloadbalancing:loadbalancer"],
        dimension_regexps: &[":loadbalancer/(?P<LoadBalancerName>.+)$"],
    },
    ServiceConfig {
        namespace: "AWS/Lambda",
        alias: "lambda",
        resource_filters: &["lambda:function"],
        dimension_regexps: &[":function:(?P<FunctionName>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/SQS",
        alias: "sqs",
        resource_filters: &["sqs"],
        dimension_regexps: &["(?P<QueueName>[^:]+)$"],
    },
    ServiceConfig {
        namespace: "AWS/SNS",
        alias: "sns",
        resource_filters: &["sns"],
        dimension_regexps: &["(?P<TopicName>[^:]+)$"],
    },
    ServiceConfig {
        namespace: "AWS/S3",
        alias: "s3",
        resource_filters: &["s3"],
        dimension_regexps: &["(?P<BucketName>[^:]+)$"],
    },
    ServiceConfig {
        namespace: "AWS/DynamoDB",
        alias: "dynamodb",
        resource_filters: &["dynamodb:table"],
        dimension_regexps: &[":table/(?P<TableName>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/ElastiCache",
        alias: "ec",
        resource_filters: &["elasticache:cluster"],
        dimension_regexps: &["cluster:(?P<CacheClusterId>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/Kinesis",
        alias: "kinesis",
        resource_filters: &["kinesis:stream"],
        dimension_regexps: &[":stream/(?P<StreamName>[^/]+)"],
    },
    ServiceConfig {
        namespace: "AWS/ECS",
        alias: "ecs-svc",
        resource_filters: &["ecs:cluster", "ecs:service"],
        dimension_regexps: &[
            ":cluster/(?P<ClusterName>[^/]+)$",
            ":service/(?P<ClusterName>[^/]+)/(?P<ServiceName>[^/]+)$",
        ],
    },
];

/// Look a service up by namespace or alias.
pub fn find_service(name: &str) -> Option<&'static ServiceConfig> {
    SUPPORTED_SERVICES
        .iter()
        .find(|service| service.namespace == name || service.alias == name)
}

// ----------------------------------------------------------------------------
// 7.1 Resource Filters
// ----------------------------------------------------------------------------

/// What the tagging API is asked for on behalf of one discovery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub namespace: String,
    pub resource_type_filters: Vec<String>,
    pub search_tags: Vec<Tag>,
}

impl ResourceFilter {
    pub fn for_service(service: &ServiceConfig, search_tags: &[Tag]) -> Self {
        Self {
            namespace: service.namespace.to_string(),
            resource_type_filters: service
                .resource_filters
                .iter()
                .map(|filter| filter.to_string())
                .collect(),
            search_tags: search_tags.to_vec(),
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Catalog → Resource Association
// ----------------------------------------------------------------------------

/// Outcome of associating one catalog entry with the discovered resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Association<'a> {
    Resource(&'a TaggedResource),
    /// The entry carries none of the dimensions the service filters on
    Global,
    /// A filtered dimension names a resource that was not discovered
    Unmatched,
}

/// Index of discovered resources by the dimension values their ARNs encode.
pub struct ResourceAssociator<'a> {
    /// Dimension name → dimension value → resource
    by_dimension: HashMap<String, HashMap<String, &'a TaggedResource>>,
}

impl<'a> ResourceAssociator<'a> {
    pub fn new(regexps: &[Regex], resources: &'a [TaggedResource]) -> Self {
        let mut by_dimension: HashMap<String, HashMap<String, &'a TaggedResource>> = HashMap::new();

        for regexp in regexps {
            let names: Vec<&str> = regexp.capture_names().flatten().collect();
            for name in &names {
                by_dimension.entry(name.replace('_', " ")).or_default();
            }
            for resource in resources {
                let Some(captures) = regexp.captures(&resource.arn) else {
                    continue;
                };
                for name in &names {
                    if let Some(value) = captures.name(name) {
                        if let Some(values) = by_dimension.get_mut(&name.replace('_', " ")) {
                            values.insert(value.as_str().to_string(), resource);
                        }
                    }
                }
            }
        }

        Self { by_dimension }
    }

    /// Associate one catalog entry. Filtered dimensions are walked in order:
    /// a known value selects its resource, an unknown value stops the walk
    /// and rejects the entry unless an earlier dimension already matched.
    pub fn associate(&self, metric: &CloudwatchMetric) -> Association<'a> {
        let mut filtered = false;
        let mut found = None;
        for dimension in &metric.dimensions {
            let Some(values) = self.by_dimension.get(&dimension.name) else {
                continue;
            };
            filtered = true;
            match values.get(&dimension.value) {
                Some(resource) => found = Some(*resource),
                None => break,
            }
        }
        match (found, filtered) {
            (Some(resource), _) => Association::Resource(resource),
            (None, true) => Association::Unmatched,
            (None, false) => Association::Global,
        }
    }
}

// ============================================================================
// SECTION 8: COLLABORATOR INTERFACES
// ============================================================================
// Credentials and concrete API clients live outside the engine. Every call
// is raced against the scrape's cancellation token by the caller, so
// implementations need not observe it themselves.
// ============================================================================

/// Identity lookup scoped to one role.
#[async_trait]
pub trait StsClient: Send + Sync {
    async fn get_caller_identity(&self) -> ClientResult<CallerIdentity>;
}

/// Tag-based resource lookup scoped to one (region, role).
#[async_trait]
pub trait TaggingClient: Send + Sync {
    async fn get_resources(&self, filter: &ResourceFilter) -> ClientResult<Vec<TaggedResource>>;
}

/// Monitoring API scoped to one (region, role).
#[async_trait]
pub trait CloudwatchClient: Send + Sync {
    /// Every dimension combination with reported data for the metric.
    async fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
    ) -> ClientResult<Vec<CloudwatchMetric>>;

    async fn get_metric_statistics(
        &self,
        input: &GetMetricStatisticsInput,
    ) -> ClientResult<Vec<Datapoint>>;

    async fn get_metric_data(&self, input: &GetMetricDataInput) -> ClientResult<GetMetricDataOutput>;
}

/// Per-role and per-region client factories.
///
/// `refresh` runs once before fan-out and `clear` once after join; in
/// between the factories are read concurrently.
pub trait SessionCache: Send + Sync {
    fn refresh(&self);
    fn clear(&self);
    fn sts(&self, role: &Role) -> Arc<dyn StsClient>;
    fn cloudwatch(&self, region: &str, role: &Role) -> Arc<dyn CloudwatchClient>;
    fn tagging(&self, region: &str, role: &Role) -> Arc<dyn TaggingClient>;
}

// ============================================================================
// SECTION 9: RATE GATES
// ============================================================================

/// The two classes of external call, each with its own gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateClass {
    /// Resource and catalog discovery
    Tag,
    /// Data fetches
    Cloudwatch,
}

impl GateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateClass::Tag => "tag",
            GateClass::Cloudwatch => "cloudwatch",
        }
    }
}

/// A held slot; dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded-concurrency permit for one call class.
#[derive(Debug, Clone)]
pub struct RateGate {
    class: GateClass,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl RateGate {
    pub fn new(class: GateClass, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            class,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. Returns `None` when the scrape is cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<GatePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => {
                permit.ok().map(|permit| GatePermit { _permit: permit })
            }
        }
    }

    pub fn class(&self) -> GateClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// The gate pair shared by every triple of one scrape.
#[derive(Debug, Clone)]
pub struct RateGates {
    cloudwatch: RateGate,
    tag: RateGate,
}

impl RateGates {
    pub fn new(cloudwatch_concurrency: usize, tag_concurrency: usize) -> Self {
        Self {
            cloudwatch: RateGate::new(GateClass::Cloudwatch, cloudwatch_concurrency),
            tag: RateGate::new(GateClass::Tag, tag_concurrency),
        }
    }

    pub fn gate(&self, class: GateClass) -> &RateGate {
        match class {
            GateClass::Cloudwatch => &self.cloudwatch,
            GateClass::Tag => &self.tag,
        }
    }
}

// ============================================================================
// SECTION 10: REQUEST BUILDING
// ============================================================================

/// `[start, end)` of a batched fetch: `now` floored to the rounding period,
/// minus `delay`, spanning `length` seconds.
pub fn metric_data_window(
    now: DateTime<Utc>,
    rounding_period: i64,
    length: i64,
    delay: i64,
) -> ClientResult<(DateTime<Utc>, DateTime<Utc>)> {
    let rounding = rounding_period.max(1);
    let secs = now.timestamp();
    let floored = Utc
        .timestamp_opt(secs - secs.rem_euclid(rounding), 0)
        .single()
        .unwrap_or(now);
    let end = seconds_before(floored, delay)?;
    let start = seconds_before(end, length)?;
    Ok((start, end))
}

fn seconds_before(at: DateTime<Utc>, seconds: i64) -> ClientResult<DateTime<Utc>> {
    ChronoDuration::try_seconds(seconds)
        .and_then(|span| at.checked_sub_signed(span))
        .ok_or(ClientError::WindowOutOfRange { seconds })
}

/// Parameters shared by every batch of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub namespace: String,
    pub length: i64,
    pub delay: i64,
    /// Overrides the rounding derived from the query periods
    pub rounding_period: Option<i64>,
}

impl BatchWindow {
    /// The configured rounding period, else the smallest query period
    /// capped at the default period.
    pub fn rounding_for(&self, queries: &[CorrelatedQuery]) -> i64 {
        self.rounding_period.unwrap_or_else(|| {
            queries
                .iter()
                .map(|query| query.period)
                .filter(|period| *period > 0)
                .min()
                .unwrap_or(DEFAULT_PERIOD_SECONDS)
                .min(DEFAULT_PERIOD_SECONDS)
        })
    }
}

/// Window length of a discovery job: the job's length (or the default when
/// unset), raised to the longest metric length.
pub fn discovery_window_length(job: &DiscoveryJob) -> i64 {
    let base = if job.length > 0 {
        job.length
    } else {
        DEFAULT_LENGTH_SECONDS
    };
    job.metrics
        .iter()
        .map(|metric| metric.length)
        .fold(base, i64::max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanBy {
    TimestampDescending,
    TimestampAscending,
}

/// One query of a batched fetch; `id` is the correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataQuery {
    pub id: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    pub period: i64,
    pub stat: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMetricDataInput {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub queries: Vec<MetricDataQuery>,
    pub scan_by: ScanBy,
}

impl GetMetricDataInput {
    pub fn build(
        queries: &[CorrelatedQuery],
        window: &BatchWindow,
        now: DateTime<Utc>,
    ) -> ClientResult<Self> {
        let rounding = window.rounding_for(queries);
        let (start_time, end_time) = metric_data_window(now, rounding, window.length, window.delay)?;
        Ok(Self {
            start_time,
            end_time,
            queries: queries
                .iter()
                .map(|query| MetricDataQuery {
                    id: query.correlation_id.clone(),
                    namespace: window.namespace.clone(),
                    metric_name: query.metric_name.clone(),
                    dimensions: query.dimensions.clone(),
                    period: query.period,
                    stat: query.statistics.first().cloned().unwrap_or_default(),
                })
                .collect(),
            scan_by: ScanBy::TimestampDescending,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMetricStatisticsInput {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub period: i64,
    pub statistics: Vec<String>,
    pub extended_statistics: Vec<String>,
}

impl GetMetricStatisticsInput {
    pub fn build(
        query: &CorrelatedQuery,
        length: i64,
        delay: i64,
        now: DateTime<Utc>,
    ) -> ClientResult<Self> {
        let end_time = seconds_before(now, delay)?;
        let start_time = seconds_before(end_time, length)?;
        let (extended_statistics, statistics): (Vec<String>, Vec<String>) = query
            .statistics
            .iter()
            .cloned()
            .partition(|statistic| is_extended_statistic(statistic));
        Ok(Self {
            namespace: query.namespace.clone(),
            metric_name: query.metric_name.clone(),
            dimensions: query.dimensions.clone(),
            start_time,
            end_time,
            period: query.period,
            statistics,
            extended_statistics,
        })
    }
}

// ============================================================================
// SECTION 11: CORRELATION, BATCHING & MERGE
// ============================================================================

/// Deterministic correlation-id sequence, one per unit.
#[derive(Debug, Default)]
pub struct CorrelationIds {
    next: usize,
}

impl CorrelationIds {
    pub fn mint(&mut self) -> String {
        self.next += 1;
        format!("{}{}", CORRELATION_ID_PREFIX, self.next)
    }
}

/// Split into contiguous batches of at most `max` items, preserving order.
pub fn partition<T>(items: Vec<T>, max: usize) -> Vec<Vec<T>> {
    let max = max.max(1);
    let mut batches = Vec::with_capacity((items.len() + max - 1) / max);
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(max).collect());
    }
    batches
}

/// Reunite one batch with the results its call returned.
///
/// Each result updates at most the query of this batch carrying its id; ids
/// the batch does not contain are dropped. Only matched queries are returned,
/// in result order.
pub fn merge_batch(batch: Vec<CorrelatedQuery>, results: &[MetricDataResult]) -> Vec<CorrelatedQuery> {
    let mut pending: HashMap<String, CorrelatedQuery> = HashMap::with_capacity(batch.len());
    for query in batch {
        pending.entry(query.correlation_id.clone()).or_insert(query);
    }

    let mut merged = Vec::with_capacity(pending.len());
    for result in results {
        if let Some(mut query) = pending.remove(&result.id) {
            query.apply_result(result);
            merged.push(query);
        }
    }
    merged
}

/// Issue one external call against the scrape's cancellation token and
/// count it. Cancellation is not counted as an error.
pub async fn observe_call<T, F>(
    monitor: &ScrapeMonitor,
    cancel: &CancellationToken,
    api: ApiCall,
    call: F,
) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    monitor.record_request(api);
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = call => result,
    };
    if let Err(e) = &result {
        if !e.is_cancelled() {
            monitor.record_error(api);
        }
    }
    result
}

/// Everything a scrape unit needs once its triple's account is known.
#[derive(Clone)]
pub struct UnitContext {
    pub region: String,
    pub account_id: String,
    pub cloudwatch: Arc<dyn CloudwatchClient>,
    pub tagging: Arc<dyn TaggingClient>,
    pub gates: RateGates,
    pub cancel: CancellationToken,
    pub metrics_per_query: usize,
    pub monitor: Arc<ScrapeMonitor>,
}

impl UnitContext {
    /// Run `call` while holding a slot of `class`. The slot is released when
    /// this returns, whatever the outcome.
    pub async fn gated<T, F, Fut>(&self, class: GateClass, api: ApiCall, call: F) -> ClientResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let _permit = self
            .gates
            .gate(class)
            .acquire(&self.cancel)
            .await
            .ok_or(ClientError::Cancelled)?;
        observe_call(&self.monitor, &self.cancel, api, call()).await
    }
}

fn log_client_error(e: &ClientError, message: &str) {
    if e.is_cancelled() {
        debug!(target: "stratus::scrape", "{}: scrape cancelled", message);
    } else {
        error!(target: "stratus::scrape", error = %e, "{}", message);
    }
}

/// Fetch every query through batched calls, one concurrent worker per batch.
pub async fn fetch_batched(
    ctx: &UnitContext,
    queries: Vec<CorrelatedQuery>,
    window: BatchWindow,
) -> Vec<CorrelatedQuery> {
    let window = Arc::new(window);
    let mut workers = JoinSet::new();

    for batch in partition(queries, ctx.metrics_per_query) {
        let ctx = ctx.clone();
        let window = window.clone();
        workers.spawn(async move {
            let size = batch.len();
            let output = ctx
                .gated(GateClass::Cloudwatch, ApiCall::GetMetricData, || async {
                    let input = GetMetricDataInput::build(&batch, &window, Utc::now())?;
                    ctx.cloudwatch.get_metric_data(&input).await
                })
                .await;
            match output {
                Ok(output) => merge_batch(batch, &output.results),
                Err(e) => {
                    log_client_error(&e, "Batched metric data fetch failed");
                    debug!(target: "stratus::scrape", batch_size = size, "Dropping batch");
                    Vec::new()
                }
            }
        });
    }

    let mut merged = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(queries) => merged.extend(queries),
            Err(e) => error!(target: "stratus::scrape", error = %e, "Batch worker failed"),
        }
    }
    merged
}

/// A single-metric statistics fetch for one static query.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRequest {
    pub query: CorrelatedQuery,
    pub length: i64,
    pub delay: i64,
}

/// Fetch each request on its own worker; a request contributes its query
/// only when the call answered, even with no points.
pub async fn fetch_statistics(
    ctx: &UnitContext,
    requests: Vec<StatisticsRequest>,
) -> Vec<CorrelatedQuery> {
    let mut workers = JoinSet::new();

    for request in requests {
        let ctx = ctx.clone();
        workers.spawn(async move {
            let points = ctx
                .gated(GateClass::Cloudwatch, ApiCall::GetMetricStatistics, || async {
                    let input = GetMetricStatisticsInput::build(
                        &request.query,
                        request.length,
                        request.delay,
                        Utc::now(),
                    )?;
                    ctx.cloudwatch.get_metric_statistics(&input).await
                })
                .await;
            match points {
                Ok(points) => {
                    let mut query = request.query;
                    query.points = Some(points);
                    Some(query)
                }
                Err(e) => {
                    log_client_error(&e, "Metric statistics fetch failed");
                    None
                }
            }
        });
    }

    let mut fetched = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Some(query)) => fetched.push(query),
            Ok(None) => {}
            Err(e) => error!(target: "stratus::scrape", error = %e, "Statistics worker failed"),
        }
    }
    fetched
}

// ============================================================================
// SECTION 12: QUERY GENERATORS
// ============================================================================
// Each job kind only decides which queries to ask for and how to fetch
// them; fan-out, gating and merging are shared.
// ============================================================================

/// How the generated queries are fetched.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPlan {
    Batched {
        queries: Vec<CorrelatedQuery>,
        window: BatchWindow,
    },
    PerMetric {
        requests: Vec<StatisticsRequest>,
    },
}

/// Generated work of one triple.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapePlan {
    pub resources: Vec<TaggedResource>,
    pub fetch: FetchPlan,
}

#[async_trait]
pub trait QueryGenerator: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Build the queries; `None` abandons the triple.
    async fn generate(&self, ctx: &UnitContext) -> Option<ScrapePlan>;

    /// Whether the fetched contribution is emitted.
    fn accepts(&self, _contribution: &Contribution) -> bool {
        true
    }
}

/// Generate, fetch and filter one triple's contribution.
pub async fn run_unit(generator: &dyn QueryGenerator, ctx: &UnitContext) -> Contribution {
    let Some(plan) = generator.generate(ctx).await else {
        return Contribution::default();
    };

    let queries = match plan.fetch {
        FetchPlan::Batched { queries, window } => fetch_batched(ctx, queries, window).await,
        FetchPlan::PerMetric { requests } => fetch_statistics(ctx, requests).await,
    };

    let contribution = Contribution {
        resources: plan.resources,
        queries,
    };
    if generator.accepts(&contribution) {
        contribution
    } else {
        debug!(target: "stratus::scrape", kind = %generator.kind(), "Contribution discarded");
        Contribution::default()
    }
}

/// List the catalog for one metric through the tag gate.
async fn list_catalog(
    ctx: &UnitContext,
    namespace: &str,
    metric_name: &str,
) -> ClientResult<Vec<CloudwatchMetric>> {
    ctx.gated(GateClass::Tag, ApiCall::ListMetrics, || {
        ctx.cloudwatch.list_metrics(namespace, metric_name)
    })
    .await
}

fn passes_dimension_requirements(metric: &CloudwatchMetric, required: &[String]) -> bool {
    required.is_empty() || metric.dimension_names_match(required)
}

// ----------------------------------------------------------------------------
// 12.1 Discovery
// ----------------------------------------------------------------------------

pub struct DiscoveryGenerator {
    pub job: Arc<DiscoveryJob>,
    /// Namespace → tag keys exported onto metrics
    pub exported_tags: Arc<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl QueryGenerator for DiscoveryGenerator {
    fn kind(&self) -> JobKind {
        JobKind::Discovery
    }

    async fn generate(&self, ctx: &UnitContext) -> Option<ScrapePlan> {
        let job = &self.job;
        let Some(service) = find_service(&job.job_type) else {
            error!(target: "stratus::scrape", job_type = %job.job_type, "Unsupported discovery service");
            return None;
        };
        let matchers = match TagMatcher::compile(&job.search_tags) {
            Ok(matchers) => matchers,
            Err(e) => {
                error!(target: "stratus::scrape", error = %e, "Invalid search tag pattern");
                return None;
            }
        };
        let regexps = match service.dimension_regexps() {
            Ok(regexps) => regexps,
            Err(e) => {
                error!(target: "stratus::scrape", namespace = service.namespace, error = %e, "Invalid dimension regexp");
                return None;
            }
        };

        let filter = ResourceFilter::for_service(service, &job.search_tags);
        let resources = match ctx
            .gated(GateClass::Tag, ApiCall::GetResources, || ctx.tagging.get_resources(&filter))
            .await
        {
            Ok(resources) => resources,
            Err(e) => {
                log_client_error(&e, "Couldn't describe resources");
                return None;
            }
        };
        let resources: Vec<TaggedResource> = resources
            .into_iter()
            .filter(|resource| resource.filter_through_tags(&matchers))
            .collect();
        if resources.is_empty() {
            info!(target: "stratus::scrape", "No tagged resources made it through filtering");
            return None;
        }

        let associator = ResourceAssociator::new(regexps, &resources);
        let mut ids = CorrelationIds::default();
        let mut queries = Vec::new();

        for metric in &job.metrics {
            let catalog = match list_catalog(ctx, &job.job_type, &metric.name).await {
                Ok(catalog) => catalog,
                Err(e) if e.is_cancelled() => return None,
                Err(e) => {
                    error!(
                        target: "stratus::scrape",
                        error = %e,
                        metric_name = %metric.name,
                        namespace = %job.job_type,
                        "Failed to get full metric list"
                    );
                    continue;
                }
            };

            for entry in &catalog {
                if !passes_dimension_requirements(entry, &job.dimension_name_requirements) {
                    continue;
                }
                let resource = match associator.associate(entry) {
                    Association::Resource(resource) => resource.clone(),
                    Association::Global => TaggedResource::global(job.job_type.clone(), ctx.region.clone()),
                    Association::Unmatched => continue,
                };
                let tags = resource.metric_tags(&self.exported_tags);

                for statistic in &metric.statistics {
                    let mut query = CorrelatedQuery::for_metric(metric, &job.job_type, &ctx.region, &ctx.account_id);
                    query.resource_id = resource.arn.clone();
                    query.correlation_id = ids.mint();
                    query.statistics = vec![statistic.clone()];
                    query.dimensions = entry.dimensions.clone();
                    query.tags = tags.clone();
                    query.custom_tags = job.custom_tags.clone();
                    queries.push(query);
                }
            }
        }

        if queries.is_empty() {
            debug!(target: "stratus::scrape", "No metrics data found");
            return None;
        }
        debug!(target: "stratus::scrape", resources = resources.len(), queries = queries.len(), "Discovery queries generated");

        Some(ScrapePlan {
            resources,
            fetch: FetchPlan::Batched {
                queries,
                window: BatchWindow {
                    namespace: job.job_type.clone(),
                    length: discovery_window_length(job),
                    delay: job.delay,
                    rounding_period: job.rounding_period,
                },
            },
        })
    }

    /// Discovery output needs both resources and merged queries.
    fn accepts(&self, contribution: &Contribution) -> bool {
        !contribution.resources.is_empty() && !contribution.queries.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 12.2 Static
// ----------------------------------------------------------------------------

pub struct StaticGenerator {
    pub job: Arc<StaticJob>,
}

#[async_trait]
impl QueryGenerator for StaticGenerator {
    fn kind(&self) -> JobKind {
        JobKind::Static
    }

    async fn generate(&self, ctx: &UnitContext) -> Option<ScrapePlan> {
        let job = &self.job;
        let requests: Vec<StatisticsRequest> = job
            .metrics
            .iter()
            .map(|metric| {
                let mut query = CorrelatedQuery::for_metric(metric, &job.namespace, &ctx.region, &ctx.account_id);
                query.resource_id = job.name.clone();
                query.correlation_id = metric.name.clone();
                query.dimensions = job.dimensions.clone();
                query.custom_tags = job.custom_tags.clone();
                StatisticsRequest {
                    query,
                    length: metric.length,
                    delay: metric.delay,
                }
            })
            .collect();

        Some(ScrapePlan {
            resources: Vec::new(),
            fetch: FetchPlan::PerMetric { requests },
        })
    }
}

// ----------------------------------------------------------------------------
// 12.3 Custom Namespace
// ----------------------------------------------------------------------------

pub struct CustomNamespaceGenerator {
    pub job: Arc<CustomNamespaceJob>,
}

#[async_trait]
impl QueryGenerator for CustomNamespaceGenerator {
    fn kind(&self) -> JobKind {
        JobKind::CustomNamespace
    }

    async fn generate(&self, ctx: &UnitContext) -> Option<ScrapePlan> {
        let job = &self.job;
        let mut ids = CorrelationIds::default();
        let mut queries = Vec::new();

        for metric in &job.metrics {
            let catalog = match list_catalog(ctx, &job.namespace, &metric.name).await {
                Ok(catalog) => catalog,
                Err(e) if e.is_cancelled() => return None,
                Err(e) => {
                    error!(
                        target: "stratus::scrape",
                        error = %e,
                        metric_name = %metric.name,
                        namespace = %job.namespace,
                        "Failed to get full metric list"
                    );
                    continue;
                }
            };

            for entry in catalog
                .iter()
                .filter(|entry| passes_dimension_requirements(entry, &job.dimension_name_requirements))
            {
                for statistic in &metric.statistics {
                    let mut query = CorrelatedQuery::for_metric(metric, &job.namespace, &ctx.region, &ctx.account_id);
                    query.resource_id = job.name.clone();
                    query.correlation_id = ids.mint();
                    query.statistics = vec![statistic.clone()];
                    query.dimensions = entry.dimensions.clone();
                    query.custom_tags = job.custom_tags.clone();
                    queries.push(query);
                }
            }
        }

        if queries.is_empty() {
            debug!(target: "stratus::scrape", "No metrics data found");
            return None;
        }

        Some(ScrapePlan {
            resources: Vec::new(),
            fetch: FetchPlan::Batched {
                queries,
                window: BatchWindow {
                    namespace: job.namespace.clone(),
                    length: job.length,
                    delay: job.delay,
                    rounding_period: job.rounding_period,
                },
            },
        })
    }
}

// ============================================================================
// SECTION 13: SCRAPE ORCHESTRATOR
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Aggregate Sink
// ----------------------------------------------------------------------------

/// The single mutex-guarded aggregate all triples append to.
#[derive(Debug, Default)]
pub struct ContributionSink {
    inner: Mutex<Contribution>,
}

impl ContributionSink {
    pub fn append(&self, contribution: Contribution) {
        let mut inner = self.inner.lock();
        inner.resources.extend(contribution.resources);
        inner.queries.extend(contribution.queries);
    }

    pub fn drain(&self) -> Contribution {
        std::mem::take(&mut *self.inner.lock())
    }
}

// ----------------------------------------------------------------------------
// 13.2 Self-Monitoring
// ----------------------------------------------------------------------------

/// Counters of the external calls one engine has issued.
pub struct ScrapeMonitor {
    registry: PrometheusRegistry,
    requests: IntCounterVec,
    errors: IntCounterVec,
}

impl ScrapeMonitor {
    pub fn new() -> ScrapeResult<Self> {
        let registry = PrometheusRegistry::new();
        let requests = IntCounterVec::new(
            Opts::new("stratus_api_requests_total", "External API calls issued by the scrape engine"),
            &["api"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("stratus_api_request_errors_total", "External API calls that failed"),
            &["api"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        Ok(Self {
            registry,
            requests,
            errors,
        })
    }

    pub fn record_request(&self, api: ApiCall) {
        self.requests.with_label_values(&[api.as_str()]).inc();
    }

    pub fn record_error(&self, api: ApiCall) {
        self.errors.with_label_values(&[api.as_str()]).inc();
    }

    pub fn requests(&self, api: ApiCall) -> u64 {
        self.requests.with_label_values(&[api.as_str()]).get()
    }

    pub fn errors(&self, api: ApiCall) -> u64 {
        self.errors.with_label_values(&[api.as_str()]).get()
    }

    /// Prometheus text exposition of the counters
    pub fn render(&self) -> ScrapeResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ScrapeError::Internal(e.to_string()))
    }
}

impl Debug for ScrapeMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeMonitor").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 13.3 Fan-Out
// ----------------------------------------------------------------------------

/// Clears the session cache once, whichever way the scrape exits.
///
/// After cancellation through the token, every triple task has been joined
/// before this runs. If the scrape future itself is dropped, the `JoinSet`
/// only aborts its tasks, so one already running on another worker may
/// still be inside a client call when the cache is cleared.
struct ClearOnDrop(Arc<dyn SessionCache>);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Shared state every triple of one scrape gets a handle to.
#[derive(Clone)]
struct FanOut {
    cache: Arc<dyn SessionCache>,
    gates: RateGates,
    cancel: CancellationToken,
    metrics_per_query: usize,
    monitor: Arc<ScrapeMonitor>,
    sink: Arc<ContributionSink>,
}

impl FanOut {
    fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        generator: Arc<dyn QueryGenerator>,
        role: &Role,
        region: &str,
        span: Span,
    ) {
        let fan_out = self.clone();
        let role = role.clone();
        let region = region.to_string();
        tasks.spawn(
            async move { fan_out.scrape_triple(generator, role, region).await }.instrument(span),
        );
    }

    async fn scrape_triple(self, generator: Arc<dyn QueryGenerator>, role: Role, region: String) {
        let sts = self.cache.sts(&role);
        let identity = observe_call(
            &self.monitor,
            &self.cancel,
            ApiCall::GetCallerIdentity,
            sts.get_caller_identity(),
        )
        .await;

        let account_id = match identity {
            Ok(CallerIdentity {
                account: Some(account),
                ..
            }) => account,
            Ok(_) => {
                error!(target: "stratus::scrape", "Couldn't get account Id: identity carries no account");
                return;
            }
            Err(e) if e.is_cancelled() => {
                debug!(target: "stratus::scrape", "Cancelled before the account was resolved");
                return;
            }
            Err(e) => {
                error!(target: "stratus::scrape", error = %e, "Couldn't get account Id");
                return;
            }
        };
        Span::current().record("account", account_id.as_str());

        let ctx = UnitContext {
            cloudwatch: self.cache.cloudwatch(&region, &role),
            tagging: self.cache.tagging(&region, &role),
            region,
            account_id,
            gates: self.gates.clone(),
            cancel: self.cancel.clone(),
            metrics_per_query: self.metrics_per_query,
            monitor: self.monitor.clone(),
        };

        let contribution = run_unit(generator.as_ref(), &ctx).await;
        debug!(
            target: "stratus::scrape",
            resources = contribution.resources.len(),
            queries = contribution.queries.len(),
            "Triple finished"
        );
        if !contribution.is_empty() {
            self.sink.append(contribution);
        }
    }
}

/// Run one scrape cycle over every (job, role, region) triple.
///
/// The cache is refreshed before any triple starts and cleared exactly once
/// after all of them have finished. Triples fail independently; cancelling
/// `ctx` makes every triple return early with whatever it already has.
pub async fn scrape_aws_data(
    ctx: &CancellationToken,
    conf: &ScrapeConf,
    metrics_per_query: usize,
    cloudwatch_concurrency: usize,
    tag_concurrency: usize,
    cache: Arc<dyn SessionCache>,
    monitor: Arc<ScrapeMonitor>,
) -> (Vec<TaggedResource>, Vec<CorrelatedQuery>) {
    cache.refresh();
    let _clear = ClearOnDrop(cache.clone());

    let fan_out = FanOut {
        cache,
        gates: RateGates::new(cloudwatch_concurrency, tag_concurrency),
        cancel: ctx.clone(),
        metrics_per_query: metrics_per_query.max(1),
        monitor,
        sink: Arc::new(ContributionSink::default()),
    };
    let exported_tags = Arc::new(conf.discovery.exported_tags_on_metrics.clone());
    let mut tasks = JoinSet::new();

    for job in &conf.discovery.jobs {
        let generator: Arc<dyn QueryGenerator> = Arc::new(DiscoveryGenerator {
            job: Arc::new(job.clone()),
            exported_tags: exported_tags.clone(),
        });
        for role in &job.roles {
            for region in &job.regions {
                let span = info_span!(
                    "triple",
                    job_type = %job.job_type,
                    region = %region,
                    arn = %role.role_arn,
                    account = field::Empty
                );
                fan_out.spawn(&mut tasks, generator.clone(), role, region, span);
            }
        }
    }

    for job in &conf.static_jobs {
        let generator: Arc<dyn QueryGenerator> = Arc::new(StaticGenerator {
            job: Arc::new(job.clone()),
        });
        for role in &job.roles {
            for region in &job.regions {
                let span = info_span!(
                    "triple",
                    static_job_name = %job.name,
                    region = %region,
                    arn = %role.role_arn,
                    account = field::Empty
                );
                fan_out.spawn(&mut tasks, generator.clone(), role, region, span);
            }
        }
    }

    for job in &conf.custom_namespace {
        let generator: Arc<dyn QueryGenerator> = Arc::new(CustomNamespaceGenerator {
            job: Arc::new(job.clone()),
        });
        for role in &job.roles {
            for region in &job.regions {
                let span = info_span!(
                    "triple",
                    custom_metric_namespace = %job.namespace,
                    region = %region,
                    arn = %role.role_arn,
                    account = field::Empty
                );
                fan_out.spawn(&mut tasks, generator.clone(), role, region, span);
            }
        }
    }

    debug!(target: "stratus::scrape", triples = tasks.len(), "Scrape fanned out");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(target: "stratus::scrape", error = %e, "Triple task failed");
        }
    }

    let aggregate = fan_out.sink.drain();
    (aggregate.resources, aggregate.queries)
}

// ----------------------------------------------------------------------------
// 13.4 Engine
// ----------------------------------------------------------------------------

/// Result of one scrape cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutput {
    pub resources: Vec<TaggedResource>,
    pub queries: Vec<CorrelatedQuery>,
    pub elapsed_ms: u64,
    /// The cycle was cut short by cancellation or the scrape timeout
    pub cancelled: bool,
}

/// Configured limits, self-monitoring and cancellation around
/// [`scrape_aws_data`].
pub struct ScrapeEngine {
    config: EngineConfig,
    cache: Arc<dyn SessionCache>,
    monitor: Arc<ScrapeMonitor>,
    cancel: CancellationToken,
}

impl ScrapeEngine {
    pub fn new(config: EngineConfig, cache: Arc<dyn SessionCache>) -> ScrapeResult<Self> {
        Ok(Self {
            config,
            cache,
            monitor: Arc::new(ScrapeMonitor::new()?),
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the current and every later cycle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn monitor(&self) -> Arc<ScrapeMonitor> {
        self.monitor.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn scrape_once(&self) -> ScrapeOutput {
        let cycle = self.cancel.child_token();
        let timeout = Duration::from_secs(self.config.engine.scrape_timeout_secs);
        let watchdog = {
            let cycle = cycle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cycle.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!(target: "stratus::engine", timeout_secs = timeout.as_secs(), "Scrape timed out, cancelling");
                        cycle.cancel();
                    }
                }
            })
        };

        let started = Instant::now();
        info!(
            target: "stratus::engine",
            triples = self.config.scrape.triple_count(),
            "Starting scrape"
        );
        let (resources, queries) = scrape_aws_data(
            &cycle,
            &self.config.scrape,
            self.config.engine.metrics_per_query,
            self.config.engine.cloudwatch_concurrency,
            self.config.engine.tag_concurrency,
            self.cache.clone(),
            self.monitor.clone(),
        )
        .await;
        let cancelled = cycle.is_cancelled();
        watchdog.abort();

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            target: "stratus::engine",
            resources = resources.len(),
            queries = queries.len(),
            elapsed_ms,
            cancelled,
            "Scrape finished"
        );

        ScrapeOutput {
            resources,
            queries,
            elapsed_ms,
            cancelled,
        }
    }
}

// ============================================================================
// SECTION 14: REPLAY BACKEND
// ============================================================================
// A recorded API session loaded from JSON. Serves every collaborator trait so
// a full cycle can run offline; request windows are not applied.
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayFixture {
    /// Role ARN (empty for the ambient role) → account id
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<TaggedResource>,
    /// Catalog entries served by `list_metrics`
    #[serde(default)]
    pub metrics: Vec<CloudwatchMetric>,
    #[serde(default)]
    pub series: Vec<ReplaySeries>,
}

/// Recorded datapoints of one (metric, dimensions, statistic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySeries {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    pub statistic: String,
    #[serde(default)]
    pub points: Vec<ReplayPoint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplayPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl ReplayFixture {
    fn series(&self, namespace: &str, metric_name: &str, dimensions: &[Dimension], statistic: &str) -> Option<&ReplaySeries> {
        self.series.iter().find(|series| {
            series.namespace == namespace
                && series.metric_name == metric_name
                && series.statistic == statistic
                && same_dimensions(&series.dimensions, dimensions)
        })
    }
}

pub struct ReplayBackend {
    fixture: Arc<ReplayFixture>,
    refreshes: AtomicUsize,
    clears: AtomicUsize,
}

impl ReplayBackend {
    pub fn new(fixture: ReplayFixture) -> Self {
        Self {
            fixture: Arc::new(fixture),
            refreshes: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ScrapeResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let fixture = serde_json::from_str(&raw)
            .map_err(|e| ScrapeError::Replay(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(fixture))
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(AtomicOrdering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(AtomicOrdering::SeqCst)
    }

    fn client(&self, region: &str, role: &Role) -> Arc<ReplayClient> {
        Arc::new(ReplayClient {
            fixture: self.fixture.clone(),
            region: region.to_string(),
            role: role.clone(),
        })
    }
}

impl SessionCache for ReplayBackend {
    fn refresh(&self) {
        self.refreshes.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn sts(&self, role: &Role) -> Arc<dyn StsClient> {
        self.client("", role)
    }

    fn cloudwatch(&self, region: &str, role: &Role) -> Arc<dyn CloudwatchClient> {
        self.client(region, role)
    }

    fn tagging(&self, region: &str, role: &Role) -> Arc<dyn TaggingClient> {
        self.client(region, role)
    }
}

struct ReplayClient {
    fixture: Arc<ReplayFixture>,
    region: String,
    role: Role,
}

#[async_trait]
impl StsClient for ReplayClient {
    async fn get_caller_identity(&self) -> ClientResult<CallerIdentity> {
        match self.fixture.accounts.get(&self.role.role_arn) {
            Some(account) => Ok(CallerIdentity {
                account: Some(account.clone()),
                arn: Some(self.role.role_arn.clone()),
            }),
            None => Err(ClientError::api(
                ApiCall::GetCallerIdentity,
                format!("no account recorded for role {}", self.role),
            )),
        }
    }
}

#[async_trait]
impl TaggingClient for ReplayClient {
    async fn get_resources(&self, filter: &ResourceFilter) -> ClientResult<Vec<TaggedResource>> {
        Ok(self
            .fixture
            .resources
            .iter()
            .filter(|resource| resource.namespace == filter.namespace)
            .filter(|resource| resource.region.is_empty() || resource.region == self.region)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CloudwatchClient for ReplayClient {
    async fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
    ) -> ClientResult<Vec<CloudwatchMetric>> {
        Ok(self
            .fixture
            .metrics
            .iter()
            .filter(|metric| metric.namespace == namespace && metric.metric_name == metric_name)
            .cloned()
            .collect())
    }

    async fn get_metric_statistics(
        &self,
        input: &GetMetricStatisticsInput,
    ) -> ClientResult<Vec<Datapoint>> {
        let mut points: BTreeMap<DateTime<Utc>, Datapoint> = BTreeMap::new();
        for statistic in input.statistics.iter().chain(&input.extended_statistics) {
            let Some(series) = self.fixture.series(
                &input.namespace,
                &input.metric_name,
                &input.dimensions,
                statistic,
            ) else {
                continue;
            };
            for point in &series.points {
                points
                    .entry(point.timestamp)
                    .or_insert_with(|| Datapoint::at(point.timestamp))
                    .set_statistic(statistic, point.value);
            }
        }
        Ok(points.into_values().collect())
    }

    async fn get_metric_data(&self, input: &GetMetricDataInput) -> ClientResult<GetMetricDataOutput> {
        let results: Vec<MetricDataResult> = input
            .queries
            .iter()
            .map(|query| {
                let mut points: Vec<ReplayPoint> = self
                    .fixture
                    .series(&query.namespace, &query.metric_name, &query.dimensions, &query.stat)
                    .map(|series| series.points.clone())
                    .unwrap_or_default();
                match input.scan_by {
                    ScanBy::TimestampDescending => points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
                    ScanBy::TimestampAscending => points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
                }
                MetricDataResult {
                    id: query.id.clone(),
                    values: points.iter().map(|point| point.value).collect(),
                    timestamps: points.iter().map(|point| point.timestamp).collect(),
                }
            })
            .collect();
        Ok(GetMetricDataOutput { results })
    }
}

// ============================================================================
// SECTION 15: CLI & MAIN
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version = ENGINE_VERSION,
    author = "Stratus Team",
    about = "Concurrent CloudWatch scrape orchestration engine",
    long_about = "Stratus fans a scrape cycle out across every (job, role, region) \
                  triple, discovers which metrics carry data, and batches them into \
                  GetMetricData calls under two independent rate gates."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "stratus.toml", env = "STRATUS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "STRATUS_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration file and print the triple plan
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate an example configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,

    /// Run one scrape cycle against a recorded API session
    Scrape {
        /// Replay fixture (JSON)
        #[arg(short, long)]
        replay: PathBuf,

        /// Also print the self-monitoring counters
        #[arg(long)]
        self_metrics: bool,
    },
}

fn handle_validate(config_path: &Path, verbose: bool) -> ScrapeResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)?;
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Scrape plan:");
    println!("  • Metrics per query: {}", config.engine.metrics_per_query);
    println!(
        "  • Gates: cloudwatch={}, tag={}",
        config.engine.cloudwatch_concurrency, config.engine.tag_concurrency
    );
    for job in &config.scrape.discovery.jobs {
        println!(
            "  • discovery {}: {} roles × {} regions, {} metrics",
            job.job_type,
            job.roles.len(),
            job.regions.len(),
            job.metrics.len()
        );
    }
    for job in &config.scrape.static_jobs {
        println!(
            "  • static {} ({}): {} roles × {} regions, {} metrics",
            job.name,
            job.namespace,
            job.roles.len(),
            job.regions.len(),
            job.metrics.len()
        );
    }
    for job in &config.scrape.custom_namespace {
        println!(
            "  • custom namespace {}: {} roles × {} regions, {} metrics",
            job.namespace,
            job.roles.len(),
            job.regions.len(),
            job.metrics.len()
        );
    }
    println!("  • Triples per cycle: {}", config.scrape.triple_count());

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> ScrapeResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Example configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_version() {
    println!("☁️  {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Supported discovery services:");
    for service in SUPPORTED_SERVICES {
        println!("  • {} ({})", service.namespace, service.alias);
    }
}

async fn handle_scrape(config: EngineConfig, replay: &Path, self_metrics: bool) -> ScrapeResult<()> {
    let backend = Arc::new(ReplayBackend::from_file(replay)?);
    let engine = ScrapeEngine::new(config, backend)?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "stratus::engine", "Interrupt received, cancelling scrape");
            cancel.cancel();
        }
    });

    let output = engine.scrape_once().await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    if self_metrics {
        print!("{}", engine.monitor().render()?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let (replay, self_metrics) = match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Commands::Scrape {
            replay,
            self_metrics,
        } => (replay.clone(), *self_metrics),
    };

    let mut config = EngineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    info!(
        target: "stratus::engine",
        version = ENGINE_VERSION,
        config = %cli.config.display(),
        "{} starting",
        ENGINE_NAME
    );

    handle_scrape(config, &replay, self_metrics)
        .await
        .context("Scrape failed")?;

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn query(id: &str) -> CorrelatedQuery {
        let metric = MetricConfig {
            name: "CPUUtilization".to_string(),
            statistics: vec!["Average".to_string()],
            period: 60,
            ..MetricConfig::default()
        };
        let mut query = CorrelatedQuery::for_metric(&metric, "AWS/EC2", "us-east-1", "111");
        query.correlation_id = id.to_string();
        query.resource_id = format!("res-{}", id);
        query
    }

    fn result(id: &str, values: &[f64], timestamps: &[DateTime<Utc>]) -> MetricDataResult {
        MetricDataResult {
            id: id.to_string(),
            values: values.to_vec(),
            timestamps: timestamps.to_vec(),
        }
    }

    fn ids(queries: &[CorrelatedQuery]) -> Vec<&str> {
        queries.iter().map(|q| q.correlation_id.as_str()).collect()
    }

    // ------------------------------------------------------------------
    // Partition & merge
    // ------------------------------------------------------------------

    #[test]
    fn test_partition_example() {
        let queries: Vec<CorrelatedQuery> = ["A", "B", "C", "D", "E"].iter().map(|id| query(id)).collect();
        let batches = partition(queries, 2);

        let batch_ids: Vec<Vec<&str>> = batches.iter().map(|batch| ids(batch)).collect();
        assert_eq!(batch_ids, vec![vec!["A", "B"], vec!["C", "D"], vec!["E"]]);
    }

    #[test]
    fn test_partition_empty_and_zero_size() {
        assert!(partition(Vec::<u8>::new(), 3).is_empty());
        assert_eq!(partition(vec![1, 2, 3], 0), vec![vec![1], vec![2], vec![3]]);
    }

    proptest! {
        #[test]
        fn test_partition_preserves_every_item(
            items in proptest::collection::vec(any::<u16>(), 0..300),
            max in 1usize..40
        ) {
            let batches = partition(items.clone(), max);
            prop_assert_eq!(batches.len(), (items.len() + max - 1) / max);
            prop_assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= max));
            let flat: Vec<u16> = batches.into_iter().flatten().collect();
            prop_assert_eq!(flat, items);
        }
    }

    #[test]
    fn test_merge_updates_only_same_batch_ids() {
        let mut batches = partition(["A", "B", "C", "D", "E"].iter().map(|id| query(id)).collect(), 2);
        let first = batches.remove(0);

        let merged = merge_batch(first, &[result("A", &[1.0], &[at(0, 5, 0)]), result("C", &[], &[])]);

        assert_eq!(ids(&merged), vec!["A"]);
        assert_eq!(merged[0].value(), Some(1.0));
        assert_eq!(merged[0].result.map(|p| p.timestamp), Some(at(0, 5, 0)));
    }

    #[test]
    fn test_merge_keeps_matched_query_without_values() {
        let merged = merge_batch(vec![query("C"), query("D")], &[result("C", &[], &[])]);

        assert_eq!(ids(&merged), vec!["C"]);
        assert_eq!(merged[0].result, None);
    }

    #[test]
    fn test_merge_takes_first_value_and_timestamp() {
        let merged = merge_batch(
            vec![query("A")],
            &[result("A", &[3.0, 2.0, 1.0], &[at(0, 10, 0), at(0, 5, 0), at(0, 0, 0)])],
        );

        assert_eq!(
            merged[0].result,
            Some(MetricDataPoint {
                value: 3.0,
                timestamp: at(0, 10, 0)
            })
        );
    }

    #[test]
    fn test_merge_duplicate_result_ids_first_wins() {
        let merged = merge_batch(
            vec![query("A")],
            &[result("A", &[1.0], &[at(0, 0, 0)]), result("A", &[9.0], &[at(0, 0, 0)])],
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value(), Some(1.0));
    }

    #[test]
    fn test_apply_result_needs_matching_timestamp() {
        let mut q = query("A");
        q.apply_result(&result("A", &[5.0], &[]));
        assert_eq!(q.result, None);
    }

    #[test]
    fn test_correlation_ids_are_sequential() {
        let mut ids = CorrelationIds::default();
        let minted: Vec<String> = (0..3).map(|_| ids.mint()).collect();
        assert_eq!(minted, vec!["id_1", "id_2", "id_3"]);
    }

    // ------------------------------------------------------------------
    // Catalog filtering & association
    // ------------------------------------------------------------------

    fn catalog_entry(namespace: &str, metric: &str, dimensions: &[(&str, &str)]) -> CloudwatchMetric {
        CloudwatchMetric {
            namespace: namespace.to_string(),
            metric_name: metric.to_string(),
            dimensions: dimensions.iter().map(|(n, v)| Dimension::new(*n, *v)).collect(),
        }
    }

    fn resource(namespace: &str, arn: &str, tags: &[(&str, &str)]) -> TaggedResource {
        TaggedResource {
            arn: arn.to_string(),
            namespace: namespace.to_string(),
            region: "us-east-1".to_string(),
            tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
        }
    }

    #[rstest]
    #[case(&["InstanceId"], &["InstanceId"], true)]
    #[case(&["InstanceId", "AutoScalingGroupName"], &["AutoScalingGroupName", "InstanceId"], true)]
    #[case(&["InstanceId"], &["InstanceId", "AutoScalingGroupName"], false)]
    #[case(&["InstanceId", "ImageId"], &["InstanceId", "AutoScalingGroupName"], false)]
    #[case(&[], &["InstanceId"], false)]
    fn test_dimension_names_match(
        #[case] present: &[&str],
        #[case] required: &[&str],
        #[case] expected: bool,
    ) {
        let dims: Vec<(&str, &str)> = present.iter().map(|name| (*name, "x")).collect();
        let metric = catalog_entry("AWS/EC2", "CPUUtilization", &dims);
        let required: Vec<String> = required.iter().map(|s| s.to_string()).collect();

        assert_eq!(metric.dimension_names_match(&required), expected);
    }

    #[test]
    fn test_associate_ec2_instances() {
        let service = find_service("ec2").unwrap();
        let resources = vec![
            resource("AWS/EC2", "arn:aws:ec2:us-east-1:111:instance/i-1", &[]),
            resource("AWS/EC2", "arn:aws:ec2:us-east-1:111:instance/i-2", &[]),
        ];
        let associator = ResourceAssociator::new(service.dimension_regexps().unwrap(), &resources);

        let known = catalog_entry("AWS/EC2", "CPUUtilization", &[("InstanceId", "i-2")]);
        let unknown = catalog_entry("AWS/EC2", "CPUUtilization", &[("InstanceId", "i-9")]);
        let unfiltered = catalog_entry("AWS/EC2", "CPUUtilization", &[("AutoScalingGroupName", "asg")]);
        let bare = catalog_entry("AWS/EC2", "CPUUtilization", &[]);

        assert_eq!(associator.associate(&known), Association::Resource(&resources[1]));
        assert_eq!(associator.associate(&unknown), Association::Unmatched);
        assert_eq!(associator.associate(&unfiltered), Association::Global);
        assert_eq!(associator.associate(&bare), Association::Global);
    }

    #[test]
    fn test_associate_walks_filtered_dimensions_in_order() {
        let service = find_service("AWS/ApplicationELB").unwrap();
        let resources = vec![
            resource(
                "AWS/ApplicationELB",
                "arn:aws:elasticloadbalancing:us-east-1:111:loadbalancer/app/edge/abc",
                &[],
            ),
            resource(
                "AWS/ApplicationELB",
                "arn:aws:elasticloadbalancing:us-east-1:111:targetgroup/tg-a/123",
                &[],
            ),
        ];
        let associator = ResourceAssociator::new(service.dimension_regexps().unwrap(), &resources);

        let both_known = catalog_entry(
            "AWS/ApplicationELB",
            "RequestCount",
            &[("LoadBalancer", "app/edge/abc"), ("TargetGroup", "targetgroup/tg-a/123")],
        );
        let second_unknown = catalog_entry(
            "AWS/ApplicationELB",
            "RequestCount",
            &[("LoadBalancer", "app/edge/abc"), ("TargetGroup", "targetgroup/gone/1")],
        );
        let first_unknown = catalog_entry(
            "AWS/ApplicationELB",
            "RequestCount",
            &[("LoadBalancer", "app/gone/1"), ("TargetGroup", "targetgroup/tg-a/123")],
        );

        assert_eq!(associator.associate(&both_known), Association::Resource(&resources[1]));
        assert_eq!(associator.associate(&second_unknown), Association::Resource(&resources[0]));
        assert_eq!(associator.associate(&first_unknown), Association::Unmatched);
    }

    #[test]
    fn test_associate_maps_underscores_to_spaces() {
        let regexps = vec![Regex::new("(?P<Queue_Name>[^:]+)$").unwrap()];
        let resources = vec![resource("Custom/Queue", "arn:aws:sqs:us-east-1:111:orders", &[])];
        let associator = ResourceAssociator::new(&regexps, &resources);

        let entry = catalog_entry("Custom/Queue", "Depth", &[("Queue Name", "orders")]);
        assert_eq!(associator.associate(&entry), Association::Resource(&resources[0]));
    }

    #[test]
    fn test_filter_through_tags() {
        let res = resource("AWS/EC2", "arn:x", &[("Environment", "prod-eu"), ("Team", "core")]);

        let matching = TagMatcher::compile(&[Tag::new("Environment", "^prod"), Tag::new("Team", "core|edge")]).unwrap();
        let wrong_value = TagMatcher::compile(&[Tag::new("Environment", "^staging")]).unwrap();
        let missing_key = TagMatcher::compile(&[Tag::new("Owner", ".*")]).unwrap();

        assert!(res.filter_through_tags(&matching));
        assert!(res.filter_through_tags(&[]));
        assert!(!res.filter_through_tags(&wrong_value));
        assert!(!res.filter_through_tags(&missing_key));
    }

    #[test]
    fn test_metric_tags_fill_missing_keys_with_empty_values() {
        let res = resource("AWS/EC2", "arn:x", &[("Name", "web"), ("Team", "core")]);
        let mut exported = HashMap::new();
        exported.insert("AWS/EC2".to_string(), vec!["Name".to_string(), "Owner".to_string()]);

        assert_eq!(res.metric_tags(&exported), vec![Tag::new("Name", "web"), Tag::new("Owner", "")]);

        let other = resource("AWS/RDS", "arn:y", &[("Name", "db")]);
        assert!(other.metric_tags(&exported).is_empty());
    }

    // ------------------------------------------------------------------
    // Request building
    // ------------------------------------------------------------------

    #[test]
    fn test_metric_data_window() {
        let (start, end) = metric_data_window(at(0, 7, 30), 300, 300, 60).unwrap();

        assert_eq!(end, at(0, 4, 0));
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap());
    }

    #[test]
    fn test_window_out_of_range_is_an_error() {
        let huge = 10_000_000_000_000;

        let err = metric_data_window(at(0, 7, 30), 300, huge, 0).unwrap_err();
        assert!(matches!(err, ClientError::WindowOutOfRange { seconds } if seconds == huge));
        assert!(!err.is_recoverable());

        assert!(GetMetricStatisticsInput::build(&query("x"), 300, i64::MAX, at(1, 0, 0)).is_err());

        let window = BatchWindow {
            namespace: "AWS/EC2".to_string(),
            length: MAX_WINDOW_SECONDS,
            delay: MAX_WINDOW_SECONDS,
            rounding_period: None,
        };
        assert!(GetMetricDataInput::build(&[query("id_1")], &window, at(0, 7, 30)).is_ok());
    }

    #[test]
    fn test_rounding_follows_smallest_period() {
        let window = BatchWindow {
            namespace: "AWS/EC2".to_string(),
            length: 600,
            delay: 0,
            rounding_period: None,
        };
        let mut fast = query("a");
        fast.period = 60;
        let mut slow = query("b");
        slow.period = 120;
        let mut hourly = query("c");
        hourly.period = 3600;

        assert_eq!(window.rounding_for(&[slow.clone(), fast]), 60);
        assert_eq!(window.rounding_for(&[hourly.clone()]), DEFAULT_PERIOD_SECONDS);

        let pinned = BatchWindow {
            rounding_period: Some(30),
            ..window
        };
        assert_eq!(pinned.rounding_for(&[hourly]), 30);
    }

    #[test]
    fn test_get_metric_data_input() {
        let mut a = query("id_1");
        a.statistics = vec!["Maximum".to_string()];
        let mut b = query("id_2");
        b.period = 120;
        let window = BatchWindow {
            namespace: "AWS/EC2".to_string(),
            length: 600,
            delay: 0,
            rounding_period: None,
        };

        let input = GetMetricDataInput::build(&[a, b], &window, at(0, 7, 30)).unwrap();

        assert_eq!(input.end_time, at(0, 7, 0));
        assert_eq!(input.start_time, Utc.with_ymd_and_hms(2023, 12, 31, 23, 57, 0).unwrap());
        assert_eq!(input.scan_by, ScanBy::TimestampDescending);
        let summary: Vec<(&str, &str, i64)> = input
            .queries
            .iter()
            .map(|q| (q.id.as_str(), q.stat.as_str(), q.period))
            .collect();
        assert_eq!(summary, vec![("id_1", "Maximum", 60), ("id_2", "Average", 120)]);
    }

    #[test]
    fn test_statistics_input_splits_percentiles() {
        let mut q = query("x");
        q.statistics = vec!["Average".to_string(), "p99".to_string(), "Sum".to_string(), "p50.5".to_string()];

        let input = GetMetricStatisticsInput::build(&q, 300, 120, at(1, 0, 0)).unwrap();

        assert_eq!(input.statistics, vec!["Average", "Sum"]);
        assert_eq!(input.extended_statistics, vec!["p99", "p50.5"]);
        assert_eq!(input.end_time, at(0, 58, 0));
        assert_eq!(input.start_time, at(0, 53, 0));
    }

    #[test]
    fn test_discovery_window_length() {
        let mut config = EngineConfig::example();
        let job = &mut config.scrape.discovery.jobs[0];
        job.length = 0;
        job.metrics[0].length = 600;
        job.metrics[1].length = 120;
        assert_eq!(discovery_window_length(job), 600);

        job.length = 60;
        job.metrics[0].length = 60;
        job.metrics[1].length = 60;
        assert_eq!(discovery_window_length(job), 60);
    }

    #[rstest]
    #[case("Average", true, false)]
    #[case("SampleCount", true, false)]
    #[case("p99", true, true)]
    #[case("p0", true, true)]
    #[case("p99.9", true, true)]
    #[case("p99.99", true, true)]
    #[case("p100", true, true)]
    #[case("p101", false, false)]
    #[case("p99.999", false, false)]
    #[case("p", false, false)]
    #[case("P99", false, false)]
    #[case("Median", false, false)]
    fn test_statistic_names(#[case] name: &str, #[case] valid: bool, #[case] extended: bool) {
        assert_eq!(is_valid_statistic(name), valid);
        assert_eq!(is_extended_statistic(name), extended);
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    const FULL_CONFIG: &str = r#"
[engine]
metrics_per_query = 100

[scrape.discovery.exported_tags_on_metrics]
ec2 = ["Name"]

[[scrape.discovery.jobs]]
type = "ec2"
regions = ["us-east-1"]
period = 60
length = 600
nil_to_zero = true

[[scrape.discovery.jobs.metrics]]
name = "CPUUtilization"
statistics = ["Average"]

[[scrape.discovery.jobs.metrics]]
name = "NetworkIn"
statistics = ["Sum"]
period = 120
nil_to_zero = false

[[scrape.static]]
name = "edge"
namespace = "AWS/ELB"
regions = ["eu-west-1", "eu-central-1"]
roles = [{ role_arn = "arn:aws:iam::1:role/a" }, { role_arn = "arn:aws:iam::2:role/b", external_id = "ext" }]
dimensions = [{ name = "LoadBalancerName", value = "edge" }]

[[scrape.static.metrics]]
name = "RequestCount"
statistics = ["Sum"]

[[scrape.custom_namespace]]
name = "billing"
namespace = "Billing/App"
regions = ["us-east-1"]

[[scrape.custom_namespace.metrics]]
name = "Invoices"
statistics = ["Sum", "p99"]
"#;

    #[test]
    fn test_config_fills_defaults() {
        let config = EngineConfig::from_toml(FULL_CONFIG).unwrap();

        assert_eq!(config.engine.metrics_per_query, 100);
        assert_eq!(config.engine.cloudwatch_concurrency, DEFAULT_CLOUDWATCH_CONCURRENCY);
        assert_eq!(config.engine.tag_concurrency, DEFAULT_TAG_CONCURRENCY);

        let exported = &config.scrape.discovery.exported_tags_on_metrics;
        assert_eq!(exported.get("AWS/EC2"), Some(&vec!["Name".to_string()]));

        let job = &config.scrape.discovery.jobs[0];
        assert_eq!(job.job_type, "AWS/EC2");
        assert_eq!(job.roles, vec![Role::default()]);
        let cpu = &job.metrics[0];
        assert_eq!((cpu.period, cpu.length, cpu.delay), (60, 600, 0));
        assert_eq!(cpu.nil_to_zero, Some(true));
        let net = &job.metrics[1];
        assert_eq!((net.period, net.length), (120, 600));
        assert_eq!(net.nil_to_zero, Some(false));

        let static_metric = &config.scrape.static_jobs[0].metrics[0];
        assert_eq!((static_metric.period, static_metric.length), (DEFAULT_PERIOD_SECONDS, DEFAULT_LENGTH_SECONDS));
        assert_eq!(config.scrape.static_jobs[0].roles[1].external_id.as_deref(), Some("ext"));

        let custom = &config.scrape.custom_namespace[0];
        assert_eq!(custom.length, DEFAULT_LENGTH_SECONDS);

        assert_eq!(config.scrape.triple_count(), 1 + 2 * 2 + 1);
    }

    #[rstest]
    #[case::unknown_service(
        "[[scrape.discovery.jobs]]\ntype = \"nope\"\nregions = [\"us-east-1\"]\n[[scrape.discovery.jobs.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::missing_regions(
        "[[scrape.custom_namespace]]\nname = \"c\"\nnamespace = \"N\"\n[[scrape.custom_namespace.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::no_metrics("[[scrape.static]]\nname = \"s\"\nnamespace = \"N\"\nregions = [\"r\"]\n")]
    #[case::no_statistics(
        "[[scrape.static]]\nname = \"s\"\nnamespace = \"N\"\nregions = [\"r\"]\n[[scrape.static.metrics]]\nname = \"m\"\n"
    )]
    #[case::unknown_statistic(
        "[[scrape.static]]\nname = \"s\"\nnamespace = \"N\"\nregions = [\"r\"]\n[[scrape.static.metrics]]\nname = \"m\"\nstatistics = [\"Median\"]\n"
    )]
    #[case::unnamed_static(
        "[[scrape.static]]\nname = \"\"\nnamespace = \"N\"\nregions = [\"r\"]\n[[scrape.static.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::bad_search_tag(
        "[[scrape.discovery.jobs]]\ntype = \"ec2\"\nregions = [\"r\"]\nsearch_tags = [{ key = \"k\", value = \"(\" }]\n[[scrape.discovery.jobs.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::custom_length_beyond_retention(
        "[[scrape.custom_namespace]]\nname = \"c\"\nnamespace = \"N\"\nregions = [\"r\"]\nlength = 10000000000000\n[[scrape.custom_namespace.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::metric_delay_beyond_retention(
        "[[scrape.static]]\nname = \"s\"\nnamespace = \"N\"\nregions = [\"r\"]\n[[scrape.static.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\ndelay = 40000000\n"
    )]
    #[case::rounding_beyond_retention(
        "[[scrape.discovery.jobs]]\ntype = \"ec2\"\nregions = [\"r\"]\nrounding_period = 9223372036854775807\n[[scrape.discovery.jobs.metrics]]\nname = \"m\"\nstatistics = [\"Sum\"]\n"
    )]
    #[case::oversized_batches("[engine]\nmetrics_per_query = 501\n")]
    #[case::zero_gate("[engine]\ntag_concurrency = 0\n")]
    #[case::not_toml("[scrape\n")]
    fn test_config_rejects(#[case] toml_str: &str) {
        assert!(EngineConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let config = EngineConfig::from_toml(&EngineConfig::generate_default_config()).unwrap();
        assert_eq!(config.scrape.triple_count(), 3);
        assert_eq!(config.scrape.custom_namespace[0].metrics[0].statistics, vec!["Sum", "p99"]);
    }

    #[test]
    fn test_find_service() {
        assert_eq!(find_service("ec2").map(|s| s.namespace), Some("AWS/EC2"));
        assert_eq!(find_service("AWS/Lambda").map(|s| s.alias), Some("lambda"));
        assert!(find_service("AWS/Nope").is_none());
        assert_eq!(find_service("ngw").map(|s| s.namespace), Some("AWS/NATGateway"));
    }

    #[test]
    fn test_every_dimension_regexp_compiles() {
        for service in SUPPORTED_SERVICES {
            let compiled = service
                .dimension_regexps()
                .unwrap_or_else(|e| panic!("{}: {}", service.namespace, e));
            assert_eq!(compiled.len(), service.dimension_regexps.len(), "{}", service.namespace);
            assert!(
                compiled.iter().all(|regex| regex.capture_names().flatten().count() > 0),
                "{} has a pattern without named groups",
                service.namespace
            );
            assert!(std::ptr::eq(
                compiled.as_ptr(),
                service.dimension_regexps().unwrap().as_ptr()
            ));
        }
    }

    #[test]
    fn test_error_categories() {
        let err: ScrapeError = ConfigError::missing_field("scrape.static[0].name").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err: ScrapeError = ClientError::Throttled {
            api: ApiCall::GetMetricData,
        }
        .into();
        assert_eq!(err.category(), "client");
        assert!(err.is_recoverable());
        assert!(!ScrapeError::from(ClientError::Cancelled).is_recoverable());
    }

    // ------------------------------------------------------------------
    // Rate gates
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_rate_gate_releases_on_drop() {
        let gate = RateGate::new(GateClass::Cloudwatch, 2);
        let cancel = CancellationToken::new();

        let first = gate.acquire(&cancel).await.unwrap();
        let _second = gate.acquire(&cancel).await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(first);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_rate_gate_acquire_observes_cancellation() {
        let gate = RateGate::new(GateClass::Tag, 1);
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await.is_none() })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_rate_gates_are_independent() {
        let gates = RateGates::new(3, 0);
        assert_eq!(gates.gate(GateClass::Cloudwatch).capacity(), 3);
        assert_eq!(gates.gate(GateClass::Tag).capacity(), 1);
        assert_eq!(gates.gate(GateClass::Tag).class(), GateClass::Tag);
    }

    #[test]
    fn test_monitor_renders_counters() {
        let monitor = ScrapeMonitor::new().unwrap();
        monitor.record_request(ApiCall::ListMetrics);
        monitor.record_request(ApiCall::ListMetrics);
        monitor.record_error(ApiCall::ListMetrics);

        assert_eq!(monitor.requests(ApiCall::ListMetrics), 2);
        assert_eq!(monitor.errors(ApiCall::ListMetrics), 1);
        let text = monitor.render().unwrap();
        assert!(text.contains("stratus_api_requests_total{api=\"ListMetrics\"} 2"));
        assert!(text.contains("stratus_api_request_errors_total{api=\"ListMetrics\"} 1"));
    }
}
