use super::OrchestrationHandler;
use crate::OrchestrationContext;
use crate::_typed_codec::Codec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable registry mapping orchestration names to handlers.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        use super::FnOrchestration;
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_clone = f.clone();
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(OrchestrationRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

/// Retry behavior applied by the activity dispatcher on handler failure.
/// `max_attempts` counts the initial attempt; the delay before attempt N+1 is
/// `backoff_ms * backoff_multiplier^(N-1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // Single attempt: failures surface immediately
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the given attempt (1-based; attempt 1 has no delay).
    pub fn delay_before_attempt_ms(&self, attempt: u32) -> u64 {
        if attempt <= 1 {
            return 0;
        }
        let factor = self.backoff_multiplier.powi(attempt as i32 - 2);
        (self.backoff_ms as f64 * factor) as u64
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

struct ActivityEntry {
    handler: Arc<dyn ActivityHandler>,
    retry: RetryPolicy,
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<ActivityEntry>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<ActivityEntry>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<(Arc<dyn ActivityHandler>, RetryPolicy)> {
        self.inner.get(name).map(|e| (e.handler.clone(), e.retry.clone()))
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_with_retry(name, RetryPolicy::default(), f)
    }

    pub fn register_with_retry<F, Fut>(mut self, name: impl Into<String>, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(
            name.into(),
            Arc::new(ActivityEntry {
                handler: Arc::new(FnActivity(f)),
                retry,
            }),
        );
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register_typed_with_retry(name, RetryPolicy::default(), f)
    }

    pub fn register_typed_with_retry<In, Out, F, Fut>(self, name: impl Into<String>, retry: RetryPolicy, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_clone = std::sync::Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register_with_retry(name, retry, wrapper)
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
