//! Function executor registry — the seam `Function`-kind tasks resolve
//! against (spec §4.7, "invoke an in-process function by symbolic name").
//!
//! The orchestration core ships the dispatch/cancellation/timeout machinery
//! around function tasks but no concrete functions of its own; the embedding
//! application registers implementations at startup, mirroring the way the
//! teacher's `connectors::registry::ConnectorRegistry` holds `dyn
//! DynamicConnector` trait objects behind a concurrent map rather than a
//! fixed enum of built-ins.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::concurrency::CancelToken;

/// One registered in-process function. Implementors get the task's raw
/// string args and a cancel token to check cooperatively; there is no way to
/// forcibly preempt synchronous work, so well-behaved implementations poll
/// `cancel.is_cancelled()` between steps for anything long-running.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn call(&self, args: &[String], cancel: CancelToken) -> Result<(), String>;
}

/// Concurrent name → executor map. Cheap to clone (wraps an `Arc`'d
/// `DashMap`); every `TaskManager` owns one and the embedding application
/// populates it before calling [`crate::composition::Orchestrator::run`].
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, Arc<dyn FunctionExecutor>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, executor: Arc<dyn FunctionExecutor>) {
        self.functions.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionExecutor>> {
        self.functions.get(name).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl FunctionExecutor for Echo {
        async fn call(&self, args: &[String], _cancel: CancelToken) -> Result<(), String> {
            if args.is_empty() {
                Err("no args given".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn registered_function_is_found_and_callable() {
        let registry = FunctionRegistry::new();
        registry.register("echo", Arc::new(Echo));
        let executor = registry.get("echo").expect("registered");
        assert!(executor.call(&["hi".to_string()], CancelToken::new()).await.is_ok());
    }

    #[test]
    fn unregistered_name_is_absent() {
        let registry = FunctionRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
