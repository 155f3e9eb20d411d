//! Implementation of the workflow engine aggregate.

use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use serde_json::Value;

use crate::ActivityFn;
use crate::ActivityOptions;
use crate::ActivityRegistry;
use crate::CallHandler;
use crate::FunctionRegistry;
use crate::ProviderRegistry;
use crate::SubflowRegistry;
use crate::TaskHandler;
use crate::TaskRegistry;
use crate::WorkflowBackend;
use crate::WorkflowId;
use crate::backend::durable::LocalDurableBackend;
use crate::backend::durable::SignalRouter;
use crate::backend::in_process::InProcessBackend;
use crate::config::BackendConfig;
use crate::config::Config;
use crate::eval::call::http::HttpCallHandler;
use crate::provider::NarrativeValidator;
use crate::provider::Notifier;
use crate::provider::Provider;
use crate::scheduler::Scheduler;
use crate::tasks::DomainTaskHandler;

/// The reserved name of the cleanup activity.
pub const CLEANUP_ACTIVITY: &str = "Cleanup";

/// The reserved name of the HTTP request activity.
pub const HTTP_REQUEST_ACTIVITY: &str = "HttpRequest";

/// The reserved name of the gRPC request activity.
pub const GRPC_REQUEST_ACTIVITY: &str = "GrpcRequest";

/// The reserved name of the OpenAPI request activity.
pub const OPENAPI_REQUEST_ACTIVITY: &str = "OpenAPIRequest";

/// The reserved name of the AsyncAPI request activity.
pub const ASYNCAPI_REQUEST_ACTIVITY: &str = "AsyncIORequest";

/// Gets the activity name a `call` function is scheduled under.
pub fn activity_name(function: &str) -> &str {
    match function {
        "http" => HTTP_REQUEST_ACTIVITY,
        "grpc" => GRPC_REQUEST_ACTIVITY,
        "openapi" => OPENAPI_REQUEST_ACTIVITY,
        "asyncapi" => ASYNCAPI_REQUEST_ACTIVITY,
        other => other,
    }
}

/// Represents the engine: the registries, configuration, and services a
/// runner needs to execute a workflow instance.
#[derive(Clone)]
pub struct Engine {
    /// The engine configuration.
    config: Config,
    /// The registered `call` functions.
    functions: Arc<FunctionRegistry>,
    /// The registered custom task handlers.
    tasks: Arc<TaskRegistry>,
    /// The registered nested workflow documents.
    subflows: Arc<SubflowRegistry>,
    /// The registered external collaborators.
    providers: Arc<ProviderRegistry>,
    /// The named activities registered with backends.
    activities: Arc<ActivityRegistry>,
    /// The scheduler bridge, if one is configured.
    scheduler: Option<Arc<dyn Scheduler>>,
    /// The signal router shared across durable instances.
    router: Arc<SignalRouter>,
}

impl Engine {
    /// Creates a builder for an engine with the given configuration.
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Gets the engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gets the registered `call` functions.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Gets the registered custom task handlers.
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Gets the registered nested workflow documents.
    pub fn subflows(&self) -> &SubflowRegistry {
        &self.subflows
    }

    /// Gets the registered external collaborators.
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Gets the named activities registered with backends.
    pub fn activities(&self) -> &Arc<ActivityRegistry> {
        &self.activities
    }

    /// Gets the scheduler bridge, if one is configured.
    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Gets the signal router shared across durable instances.
    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    /// Returns `true` if ephemeral in-process limits apply.
    pub fn is_ephemeral(&self) -> bool {
        matches!(&self.config.backend, BackendConfig::InProcess(config) if config.ephemeral)
    }

    /// Gets the default activity options of the configured backend.
    pub fn activity_options(&self) -> ActivityOptions {
        match &self.config.backend {
            BackendConfig::InProcess(_) => ActivityOptions::default(),
            BackendConfig::Durable(config) => ActivityOptions {
                start_to_close: std::time::Duration::from_secs(config.activity_timeout_seconds),
                task_queue: config.task_queue.clone(),
            },
        }
    }

    /// Constructs a backend for a new instance of the configured kind.
    pub fn new_backend(&self, id: &WorkflowId) -> Arc<dyn WorkflowBackend> {
        match &self.config.backend {
            BackendConfig::InProcess(_) => {
                Arc::new(InProcessBackend::new(Arc::clone(&self.activities)))
            }
            BackendConfig::Durable(config) => Arc::new(LocalDurableBackend::new(
                id.clone(),
                Arc::clone(&self.activities),
                self.activity_options(),
                config.continue_as_new_after,
                Arc::clone(&self.router),
            )),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.functions)
            .field("tasks", &self.tasks)
            .field("providers", &self.providers)
            .field("scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    /// The engine configuration.
    config: Config,
    /// The registered `call` functions.
    functions: FunctionRegistry,
    /// The registered custom task handlers.
    tasks: TaskRegistry,
    /// The registered nested workflow documents.
    subflows: SubflowRegistry,
    /// The registered external collaborators.
    providers: ProviderRegistry,
    /// The scheduler bridge, if one is configured.
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl EngineBuilder {
    /// Creates a builder with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            functions: FunctionRegistry::new(),
            tasks: TaskRegistry::new(),
            subflows: SubflowRegistry::new(),
            providers: ProviderRegistry::new(),
            scheduler: None,
        }
    }

    /// Registers a `call` function handler.
    pub fn function(mut self, name: impl Into<String>, handler: Arc<dyn CallHandler>) -> Self {
        self.functions.register(name, handler);
        self
    }

    /// Registers a handler for a custom task kind.
    pub fn task_kind(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks.register_kind(kind, handler);
        self
    }

    /// Registers a handler for a specific task key.
    pub fn task_key(mut self, key: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks.register_key(key, handler);
        self
    }

    /// Registers a nested workflow document.
    pub fn subflow(mut self, document: Arc<thand_model::WorkflowDocument>) -> Self {
        self.subflows.register(document);
        self
    }

    /// Registers an identity provider.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.register_provider(provider);
        self
    }

    /// Registers a notification provider.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.providers.register_notifier(notifier);
        self
    }

    /// Sets the narrative validator.
    pub fn narrative_validator(mut self, validator: Arc<dyn NarrativeValidator>) -> Self {
        self.providers.set_narrative_validator(validator);
        self
    }

    /// Sets the scheduler bridge.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Builds the engine.
    ///
    /// The built-in HTTP caller and the domain task family are registered
    /// unless the builder overrode them; the activity map is derived from
    /// the function registry plus the reserved cleanup activity.
    pub fn build(mut self) -> Result<Engine> {
        self.config.validate()?;

        if !self.functions.contains("http") {
            self.functions
                .register("http", Arc::new(HttpCallHandler::new(self.config.http.clone())));
        }

        if self.tasks.lookup("", "thand").is_none() {
            self.tasks
                .register_kind("thand", Arc::new(DomainTaskHandler::new()));
        }

        let providers = Arc::new(self.providers);

        let mut activities = ActivityRegistry::new();
        for (name, handler) in self.functions.iter() {
            let handler = Arc::clone(handler);
            let activity: ActivityFn = Arc::new(move |invocation| {
                let handler = Arc::clone(&handler);
                async move { handler.execute(invocation).await }.boxed()
            });
            activities.register(activity_name(name), activity);
        }

        let cleanup_providers = Arc::clone(&providers);
        let cleanup: ActivityFn = Arc::new(move |invocation| {
            let providers = Arc::clone(&cleanup_providers);
            async move {
                crate::tasks::cleanup_snapshot(&providers, &invocation.workflow).await?;
                Ok(Value::Null)
            }
            .boxed()
        });
        activities.register(CLEANUP_ACTIVITY, cleanup);

        Ok(Engine {
            config: self.config,
            functions: Arc::new(self.functions),
            tasks: Arc::new(self.tasks),
            subflows: Arc::new(self.subflows),
            providers,
            activities: Arc::new(activities),
            scheduler: self.scheduler,
            router: Arc::new(SignalRouter::new()),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_registrations() {
        let engine = Engine::builder(Config::default()).build().expect("should build");
        assert!(engine.functions().contains("http"));
        assert!(engine.tasks().lookup("anything", "thand").is_some());
        assert!(engine.activities().get(HTTP_REQUEST_ACTIVITY).is_some());
        assert!(engine.activities().get(CLEANUP_ACTIVITY).is_some());
    }

    #[test]
    fn activity_names_map_the_reserved_families() {
        assert_eq!(activity_name("http"), HTTP_REQUEST_ACTIVITY);
        assert_eq!(activity_name("grpc"), GRPC_REQUEST_ACTIVITY);
        assert_eq!(activity_name("openapi"), OPENAPI_REQUEST_ACTIVITY);
        assert_eq!(activity_name("asyncapi"), ASYNCAPI_REQUEST_ACTIVITY);
        assert_eq!(activity_name("my-function"), "my-function");
    }
}
