//! Implementation of the task and function registries.
//!
//! Handlers are looked up through explicit maps built at engine
//! construction; nothing is registered reflectively.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thand_model::ExportBlock;
use thand_model::OutputBlock;
use thand_model::TaskDefinition;
use thand_model::WorkflowDocument;

use crate::ActivityInvocation;
use crate::CallRequest;
use crate::Engine;
use crate::TaskPath;
use crate::WorkflowContext;
use crate::WorkflowResult;
use crate::eval::TaskOutcome;

/// Represents a handler for a `call:<name>` function.
///
/// Handlers validate the interpolated request before execution and may
/// declare their own output and export transforms, which the engine adopts
/// when the document does not specify one.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Validates the interpolated call request.
    async fn validate(&self, call: &CallRequest) -> WorkflowResult<()> {
        let _ = call;
        Ok(())
    }

    /// Executes the call.
    async fn execute(&self, invocation: ActivityInvocation) -> anyhow::Result<Value>;

    /// Gets the handler's own output transform, if any.
    fn output(&self) -> Option<OutputBlock> {
        None
    }

    /// Gets the handler's own export transform, if any.
    fn export(&self) -> Option<ExportBlock> {
        None
    }
}

/// Represents the explicit map of `call` functions.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    /// The registered handlers, keyed by function name.
    handlers: HashMap<String, Arc<dyn CallHandler>>,
}

impl FunctionRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the given function name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CallHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Gets the handler registered under the given function name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CallHandler>> {
        self.handlers.get(name)
    }

    /// Returns `true` if a handler is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Iterates the registered handlers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn CallHandler>)> {
        self.handlers.iter().map(|(name, handler)| (name.as_str(), handler))
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Represents the execution context handed to a task handler.
pub struct TaskContext<'a> {
    /// The instance the task executes in.
    pub workflow: &'a mut WorkflowContext,
    /// The engine services.
    pub engine: &'a Engine,
    /// The key of the executing task.
    pub key: &'a str,
    /// The reference of the executing task.
    pub reference: &'a TaskPath,
}

/// Represents a handler for a custom task kind or a specific task key.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the task.
    async fn execute(
        &self,
        task: &mut TaskContext<'_>,
        definition: &TaskDefinition,
        input: Value,
    ) -> WorkflowResult<TaskOutcome>;
}

/// Represents the explicit map of custom task handlers.
///
/// The dispatcher consults key-specific handlers first, then kind handlers,
/// then the built-ins.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    /// The handlers registered for task kinds.
    kinds: HashMap<String, Arc<dyn TaskHandler>>,
    /// The handlers registered for specific task keys.
    keys: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a task kind.
    pub fn register_kind(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.kinds.insert(kind.into(), handler);
    }

    /// Registers a handler for a specific task key.
    pub fn register_key(&mut self, key: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.keys.insert(key.into(), handler);
    }

    /// Looks up the handler for the given task key and kind.
    pub fn lookup(&self, key: &str, kind: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.keys.get(key).or_else(|| self.kinds.get(kind))
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolves nested workflow documents for `run.workflow` tasks.
#[derive(Clone, Default)]
pub struct SubflowRegistry {
    /// The registered documents, keyed by workflow name.
    documents: HashMap<String, Arc<WorkflowDocument>>,
}

impl SubflowRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document under its workflow name.
    pub fn register(&mut self, document: Arc<WorkflowDocument>) {
        self.documents
            .insert(document.document.name.clone(), document);
    }

    /// Gets the document registered under the given workflow name.
    pub fn get(&self, name: &str) -> Option<&Arc<WorkflowDocument>> {
        self.documents.get(name)
    }
}

impl std::fmt::Debug for SubflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubflowRegistry")
            .field("documents", &self.documents.keys().collect::<Vec<_>>())
            .finish()
    }
}
