//! End-to-end wiring: a poller and dispatcher over an in-process log, with
//! a backend and sink that record only what the pipeline tests assert on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kiln_compute::{
    Backend, BackendError, Dispatcher, DispatcherSettings, Executor, ModelCatalog, ResourceCache,
    RetryPolicy,
};
use kiln_core::config::ModelConfig;
use kiln_core::{Artifact, SynthesisRequest};
use kiln_notify::{ResultSink, SinkError};
use kiln_queue::{
    commit_channel, topic_queues, IngressPoller, MemoryBroker, MemoryLog, PollerSettings,
    PollerStats,
};

pub const GROUP: &str = "kiln-test";

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Load(String),
    Unload,
    Attach(String, f32),
    Detach(String),
    Reweight(String, f32),
    Synthesize(String),
    Release,
}

/// Called with each prompt; returning `true` fails that synthesis.
type Hook = Box<dyn Fn(&str) -> bool + Send>;

#[derive(Default)]
pub struct FakeBackend {
    ops: Mutex<Vec<Op>>,
    hook: Mutex<Option<Hook>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn synthesized(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Synthesize(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn on_synthesize(&self, hook: Hook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn push(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn load_base(&self, id: &str, _location: &Path) -> Result<(), BackendError> {
        self.push(Op::Load(id.to_string()));
        Ok(())
    }

    async fn unload_base(&self) -> Result<(), BackendError> {
        self.push(Op::Unload);
        Ok(())
    }

    async fn attach_overlay(&self, name: &str, _path: &Path, weight: f32) -> Result<(), BackendError> {
        self.push(Op::Attach(name.to_string(), weight));
        Ok(())
    }

    async fn detach_overlay(&self, name: &str) -> Result<(), BackendError> {
        self.push(Op::Detach(name.to_string()));
        Ok(())
    }

    async fn set_overlay_weight(&self, name: &str, weight: f32) -> Result<(), BackendError> {
        self.push(Op::Reweight(name.to_string(), weight));
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Artifact, BackendError> {
        let prompt = request.prompt().to_string();
        self.push(Op::Synthesize(prompt.clone()));
        let fail = self.hook.lock().unwrap().as_ref().is_some_and(|hook| hook(&prompt));
        if fail {
            return Err(BackendError::Synthesize("device lost".into()));
        }
        Ok(Artifact::png(format!("/tmp/kiln-it/{prompt}.png")))
    }

    async fn release_memory(&self) -> Result<(), BackendError> {
        self.push(Op::Release);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSink {
    successes: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> Vec<String> {
        self.successes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for FakeSink {
    async fn report_success(&self, task_id: &str, _artifact: &Artifact) -> Result<(), SinkError> {
        self.successes.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn report_failure(&self, task_id: &str, _error_message: &str) -> Result<(), SinkError> {
        self.failures.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "fake"
    }
}

/// Catalog holding the single base `m1`, located at `dir`.
fn catalog(dir: &Path) -> ModelCatalog {
    let model = ModelConfig {
        path: dir.to_path_buf(),
        overlay_dir: Some(dir.join("loras")),
    };
    ModelCatalog::new(HashMap::from([("m1".to_string(), model)]))
}

/// Message body the way producers write it. The prompt doubles as the id.
pub fn body(task_id: &str, model: &str, loras: &[(&str, f32)]) -> String {
    let loras: Vec<serde_json::Value> = loras
        .iter()
        .map(|(name, weight)| serde_json::json!({ "name": name, "weight": weight }))
        .collect();
    serde_json::json!({
        "task_id": task_id,
        "model_name": model,
        "loras": loras,
        "prompt": task_id,
        "image_params": { "width": 512, "height": 512 },
    })
    .to_string()
}

pub struct Worker {
    pub cancel: CancellationToken,
    pub poller: JoinHandle<PollerStats>,
    pub dispatcher: JoinHandle<()>,
}

impl Worker {
    /// Cancel and wait for both halves to finish.
    pub async fn stop(self) -> PollerStats {
        self.cancel.cancel();
        self.join().await
    }

    pub async fn join(self) -> PollerStats {
        tokio::time::timeout(Duration::from_secs(10), self.dispatcher)
            .await
            .expect("dispatcher stopped in time")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.poller)
            .await
            .expect("poller stopped in time")
            .unwrap()
    }
}

/// Start a poller and dispatcher session against `log`, with base `m1`
/// stored under `models`.
pub fn start_worker(
    log: Arc<MemoryLog>,
    priority: &[&str],
    normal: &[&str],
    models: &Path,
    backend: Arc<FakeBackend>,
    sink: Arc<FakeSink>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Worker {
    let settings = DispatcherSettings {
        priority_topics: priority.iter().map(|s| s.to_string()).collect(),
        normal_topics: normal.iter().map(|s| s.to_string()).collect(),
        batch_cap: 100,
        idle_sleep: Duration::from_millis(5),
    };
    let topics: Vec<String> = settings
        .priority_topics
        .iter()
        .chain(settings.normal_topics.iter())
        .cloned()
        .collect();

    let broker = Arc::new(MemoryBroker::connect(log, GROUP, topics.clone()));
    let (senders, queues) = topic_queues(&topics, 64);
    let (commit_tx, commit_rx) = commit_channel();

    let cache = ResourceCache::new(backend.clone(), catalog(models));
    let executor = Executor::new(cache, backend, sink, policy);
    let dispatcher = Dispatcher::new(queues, commit_tx, executor, settings);
    let poller = IngressPoller::new(
        broker,
        senders,
        commit_rx,
        PollerSettings {
            max_messages: 10,
            poll_timeout: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(5),
            error_sleep: Duration::from_millis(5),
        },
    );

    Worker {
        poller: tokio::spawn(poller.run(cancel.clone())),
        dispatcher: tokio::spawn(dispatcher.run(cancel.clone())),
        cancel,
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
