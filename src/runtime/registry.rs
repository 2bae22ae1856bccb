//! Name-keyed registries for orchestration and activity handlers.
//!
//! Both kinds share one `Registry<H>` and builder. Registries are immutable
//! once built and cheap to clone.

use crate::OrchestrationContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Orchestration code, invoked once per turn and replayed from history.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Activity code. Runs at least once per scheduled call.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Identity of the activity invocation being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    activity_name: String,
    activity_id: u64,
    worker_id: String,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: impl Into<String>,
        execution_id: u64,
        activity_name: impl Into<String>,
        activity_id: u64,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id,
            activity_name: activity_name.into(),
            activity_id,
            worker_id: worker_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Event id of the `TaskScheduled` event this invocation answers.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: crate::logging::ACTIVITY_TARGET,
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: crate::logging::ACTIVITY_TARGET,
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.activity_name,
            activity_id = %self.activity_id,
            worker_id = %self.worker_id,
            "{}",
            message.as_ref()
        );
    }
}

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    kind: &'static str,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "durasql::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "Registry lookup miss"
            );
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Register an already-boxed handler. A second registration under the
    /// same name replaces the first.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<H>) -> Self {
        let name = name.into();
        if self.map.insert(name.clone(), handler).is_some() {
            tracing::warn!(
                target: "durasql::runtime::registry",
                kind = self.kind,
                name = %name,
                "Duplicate registration replaced the earlier handler"
            );
        }
        self
    }

    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        RegistryBuilder {
            map: HashMap::new(),
            kind: "orchestration",
        }
    }
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        RegistryBuilder {
            map: HashMap::new(),
            kind: "activity",
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnOrchestration(f)))
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnActivity(f)))
    }
}
