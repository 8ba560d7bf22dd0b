use crate::types::{CallbackPayload, CallbackStatus, WorkerRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// An in-process worker capability. `execute` starts the work and
/// returns; the executor is responsible for (eventually) delivering a
/// callback to `request.callback_url`, exactly like an external webhook
/// worker would.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, request: WorkerRequest) -> Result<()>;
}

/// workerType → executor table. Populated at engine startup and read-only
/// afterwards; dispatch falls back to the node's webhook URL for types
/// that are not registered.
#[derive(Default)]
pub struct WorkerRegistry {
    executors: HashMap<String, Arc<dyn WorkerExecutor>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_type: impl Into<String>, executor: Arc<dyn WorkerExecutor>) {
        self.executors.insert(worker_type.into(), executor);
    }

    pub fn get(&self, worker_type: &str) -> Option<Arc<dyn WorkerExecutor>> {
        self.executors.get(worker_type).cloned()
    }

    pub fn has(&self, worker_type: &str) -> bool {
        self.executors.contains_key(worker_type)
    }

    /// Snapshot of registered type names, for the compiler's worker
    /// resolution check.
    pub fn type_names(&self) -> BTreeSet<String> {
        self.executors.keys().cloned().collect()
    }
}

/// Loopback development worker: immediately calls back `completed` with
/// its input as output.
pub struct EchoWorker {
    client: reqwest::Client,
}

impl EchoWorker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for EchoWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerExecutor for EchoWorker {
    async fn execute(&self, request: WorkerRequest) -> Result<()> {
        let client = self.client.clone();
        let payload = CallbackPayload {
            status: CallbackStatus::Completed,
            output: Some(request.input.clone()),
            error: None,
        };
        tokio::spawn(async move {
            if let Err(err) = client
                .post(&request.callback_url)
                .json(&payload)
                .send()
                .await
            {
                tracing::warn!(node_id = %request.node_id, %err, "echo worker callback failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Records every request it receives; never calls back.
    pub(crate) struct RecordingWorker {
        pub(crate) requests: Mutex<Vec<WorkerRequest>>,
    }

    impl RecordingWorker {
        pub(crate) fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkerExecutor for RecordingWorker {
        async fn execute(&self, request: WorkerRequest) -> Result<()> {
            self.requests.lock().await.push(request);
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_lookup() {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", Arc::new(RecordingWorker::new()));

        assert!(registry.has("echo"));
        assert!(!registry.has("minimax"));
        assert!(registry.get("echo").is_some());
        assert_eq!(registry.type_names(), BTreeSet::from(["echo".to_string()]));
    }

    #[tokio::test]
    async fn executor_receives_dispatch_body() {
        let worker = Arc::new(RecordingWorker::new());
        let mut registry = WorkerRegistry::new();
        registry.register("rec", worker.clone());

        let request = WorkerRequest {
            run_id: Uuid::now_v7(),
            node_id: "W".to_string(),
            config: json!({"model": "small"}),
            input: json!({"prompt": "hi"}),
            callback_url: "http://localhost:4000/api/stitch/callback/x/W".to_string(),
        };
        registry.get("rec").unwrap().execute(request.clone()).await.unwrap();

        let seen = worker.requests.lock().await;
        assert_eq!(seen.as_slice(), &[request]);
    }
}
