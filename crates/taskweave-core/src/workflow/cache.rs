//! Cache port for memoized step results, plus deterministic key derivation.
//!
//! The engine only decides *what* to cache and under which key; storage,
//! expiry, and the handling of data classifications belong to the adapter
//! behind [`CachePort`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use taskweave_types::workflow::{CachePolicy, DataClassification};
use thiserror::Error;

/// Cache adapter failures. Never fatal to an execution.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identifies who is reading a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContext {
    pub workflow_id: String,
    pub step_id: String,
    pub classification: DataClassification,
}

/// How a value should be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub classification: DataClassification,
}

impl CacheOptions {
    pub fn from_policy(policy: &CachePolicy) -> Self {
        Self {
            ttl: Duration::from_secs(policy.ttl_secs),
            classification: policy.classification,
        }
    }
}

// ---------------------------------------------------------------------------
// CachePort trait
// ---------------------------------------------------------------------------

/// Storage for memoized step results.
pub trait CachePort: Send + Sync {
    fn get(
        &self,
        key: &str,
        ctx: &CacheContext,
    ) -> impl Future<Output = Result<Option<Value>, CacheError>> + Send;

    fn set(
        &self,
        key: &str,
        value: Value,
        options: CacheOptions,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

/// Object-safe version of [`CachePort`] with boxed futures.
pub trait CachePortDyn: Send + Sync {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
        ctx: &'a CacheContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, CacheError>> + Send + 'a>>;

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        options: CacheOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>>;
}

impl<T: CachePort> CachePortDyn for T {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
        ctx: &'a CacheContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, CacheError>> + Send + 'a>> {
        Box::pin(self.get(key, ctx))
    }

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        options: CacheOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + 'a>> {
        Box::pin(self.set(key, value, options))
    }
}

/// Type-erased cache port.
#[derive(Clone)]
pub struct BoxCachePort {
    inner: Arc<dyn CachePortDyn>,
}

impl BoxCachePort {
    pub fn new<T: CachePort + 'static>(cache: T) -> Self {
        Self {
            inner: Arc::new(cache),
        }
    }

    pub async fn get(&self, key: &str, ctx: &CacheContext) -> Result<Option<Value>, CacheError> {
        self.inner.get_boxed(key, ctx).await
    }

    pub async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError> {
        self.inner.set_boxed(key, value, options).await
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Deterministic cache key for a step.
///
/// Built from the workflow ID, the step ID, and only the context fields the
/// policy declares. Undeclared context keys never influence the key; declared
/// keys missing from the context contribute `null`.
pub fn cache_key(
    workflow_id: &str,
    step_id: &str,
    policy: &CachePolicy,
    context: &Map<String, Value>,
) -> String {
    // BTreeMap: field order in the policy must not change the key.
    let subset: BTreeMap<&str, &Value> = policy
        .key_fields
        .iter()
        .map(|field| (field.as_str(), context.get(field).unwrap_or(&Value::Null)))
        .collect();
    let fields = serde_json::to_string(&subset).unwrap_or_default();
    format!("{workflow_id}:{step_id}:{fields}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
