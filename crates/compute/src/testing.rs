//! Recording backend and sink shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kiln_core::config::ModelConfig;
use kiln_core::{Artifact, ImageParams, ImageRequest, Overlay, SynthesisRequest, Task};
use kiln_notify::{ResultSink, SinkError};

use crate::backend::{Backend, BackendError};
use crate::cache::ModelCatalog;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    LoadBase(String),
    UnloadBase,
    Attach(String, f32),
    Detach(String),
    Reweight(String, f32),
    Synthesize(String),
    Release,
}

pub type SynthHook = Box<dyn FnMut(&str) + Send>;

/// Backend that records every call. Synthesis "renders" the prompt.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<Call>>,
    fail_load: Mutex<HashSet<String>>,
    fail_attach: Mutex<HashSet<String>>,
    fail_unload: Mutex<bool>,
    /// Number of upcoming synthesize calls that fail.
    synth_failures: AtomicU32,
    hook: Mutex<Option<SynthHook>>,
    /// When set, synthesis writes a real file here.
    artifact_dir: Mutex<Option<PathBuf>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_load_of(&self, base_id: &str) {
        self.fail_load.lock().unwrap().insert(base_id.to_string());
    }

    pub fn fail_attach_of(&self, overlay: &str) {
        self.fail_attach.lock().unwrap().insert(overlay.to_string());
    }

    pub fn fail_unload(&self) {
        *self.fail_unload.lock().unwrap() = true;
    }

    pub fn fail_next_syntheses(&self, n: u32) {
        self.synth_failures.store(n, Ordering::SeqCst);
    }

    /// Run `hook` with the prompt at the start of every synthesize call.
    pub fn on_synthesize(&self, hook: SynthHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn write_artifacts_to(&self, dir: &Path) {
        *self.artifact_dir.lock().unwrap() = Some(dir.to_path_buf());
    }

    /// Prompts synthesized so far, in order.
    pub fn synthesized(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Synthesize(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn load_base(&self, id: &str, _location: &Path) -> Result<(), BackendError> {
        self.record(Call::LoadBase(id.to_string()));
        if self.fail_load.lock().unwrap().contains(id) {
            return Err(BackendError::Load {
                id: id.to_string(),
                reason: "weights corrupted".into(),
            });
        }
        Ok(())
    }

    async fn unload_base(&self) -> Result<(), BackendError> {
        self.record(Call::UnloadBase);
        if *self.fail_unload.lock().unwrap() {
            return Err(BackendError::Unload("device busy".into()));
        }
        Ok(())
    }

    async fn attach_overlay(
        &self,
        name: &str,
        _path: &Path,
        weight: f32,
    ) -> Result<(), BackendError> {
        self.record(Call::Attach(name.to_string(), weight));
        if self.fail_attach.lock().unwrap().contains(name) {
            return Err(BackendError::Attach {
                name: name.to_string(),
                reason: "file not found".into(),
            });
        }
        Ok(())
    }

    async fn detach_overlay(&self, name: &str) -> Result<(), BackendError> {
        self.record(Call::Detach(name.to_string()));
        Ok(())
    }

    async fn set_overlay_weight(&self, name: &str, weight: f32) -> Result<(), BackendError> {
        self.record(Call::Reweight(name.to_string(), weight));
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Artifact, BackendError> {
        let prompt = request.prompt().to_string();
        self.record(Call::Synthesize(prompt.clone()));
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(&prompt);
        }
        let remaining = self.synth_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.synth_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Synthesize("CUDA out of memory".into()));
        }
        let dir = self.artifact_dir.lock().unwrap().clone();
        match dir {
            Some(dir) => {
                let path = dir.join(format!("{prompt}.png"));
                tokio::fs::write(&path, b"\x89PNG").await?;
                Ok(Artifact::png(path))
            }
            None => Ok(Artifact::png(format!("/tmp/kiln-test/{prompt}.png"))),
        }
    }

    async fn release_memory(&self) -> Result<(), BackendError> {
        self.record(Call::Release);
        Ok(())
    }
}

/// Sink that records reports and can be told to reject uploads.
#[derive(Default)]
pub struct MockSink {
    pub successes: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<(String, String)>>,
    reject_uploads: Mutex<bool>,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_uploads(&self) {
        *self.reject_uploads.lock().unwrap() = true;
    }

    pub fn successes(&self) -> Vec<String> {
        self.successes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MockSink {
    async fn report_success(&self, task_id: &str, _artifact: &Artifact) -> Result<(), SinkError> {
        if *self.reject_uploads.lock().unwrap() {
            return Err(SinkError::Status {
                status: 413,
                body: "payload too large".into(),
            });
        }
        self.successes.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn report_failure(&self, task_id: &str, error_message: &str) -> Result<(), SinkError> {
        self.failures
            .lock()
            .unwrap()
            .push((task_id.to_string(), error_message.to_string()));
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "mock"
    }
}

/// Catalog where every listed base exists (points at the temp dir) and has
/// an overlay directory.
pub fn catalog(dir: &Path, bases: &[&str]) -> ModelCatalog {
    let models: HashMap<String, ModelConfig> = bases
        .iter()
        .map(|id| {
            (
                id.to_string(),
                ModelConfig {
                    path: dir.to_path_buf(),
                    overlay_dir: Some(dir.join("loras")),
                },
            )
        })
        .collect();
    ModelCatalog::new(models)
}

/// Task whose prompt equals its id, so synthesis order is visible.
pub fn task(topic: &str, id: &str, base: &str, overlays: &[(&str, f32)]) -> Task {
    Task {
        task_id: id.to_string(),
        topic: topic.to_string(),
        partition: 0,
        broker_offset: 0,
        base_resource_id: base.to_string(),
        overlays: overlays.iter().map(|(n, w)| Overlay::new(*n, *w)).collect(),
        payload: SynthesisRequest::TextToImage(ImageRequest {
            prompt: id.to_string(),
            negative_prompt: None,
            params: ImageParams::default(),
        }),
    }
}

pub fn unused_path() -> PathBuf {
    PathBuf::from("/nonexistent/kiln")
}
