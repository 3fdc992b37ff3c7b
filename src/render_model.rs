//! Render-model cache
//!
//! Device meshes are supplied by the runtime by name and can take a while to
//! become available. Loads poll the runtime until a terminal answer, are
//! uploaded once, and shared by every device that reports the same name.
//!
//! The polling itself can run on a [`RenderModelLoader`] thread so the frame
//! loop never sleeps on it. Only the frame thread touches the cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::AssetLoadError;
use crate::gpu::{GpuModel, GpuSurface};
use crate::runtime::{LoadStatus, RenderModelData, RenderModelSource, TextureMapData};

/// Bounds the retry-while-pending loop for a single runtime request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5000,
            retry_delay: Duration::from_millis(1),
        }
    }
}

/// A GPU-resident render model.
#[derive(Debug, PartialEq, Eq)]
pub struct RenderModel {
    name: String,
    gpu: GpuModel,
}

impl RenderModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gpu(&self) -> GpuModel {
        self.gpu
    }
}

/// Geometry and texture fetched from the runtime, not yet uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub name: String,
    pub data: RenderModelData,
    pub texture: TextureMapData,
    /// Number of "still loading" answers seen along the way.
    pub retries: u32,
}

enum Polled<T> {
    Ready(T),
    Failed(String),
    TimedOut(u32),
    Cancelled,
}

fn poll_to_completion<T>(
    policy: &LoadPolicy,
    running: &AtomicBool,
    retries: &mut u32,
    mut poll: impl FnMut() -> LoadStatus<T>,
) -> Polled<T> {
    let mut attempts = 0;
    loop {
        match poll() {
            LoadStatus::Ready(value) => return Polled::Ready(value),
            LoadStatus::Failed(reason) => return Polled::Failed(reason),
            LoadStatus::Pending => {}
        }
        if attempts >= policy.max_retries {
            return Polled::TimedOut(attempts);
        }
        if !running.load(Ordering::SeqCst) {
            return Polled::Cancelled;
        }
        attempts += 1;
        *retries += 1;
        thread::sleep(policy.retry_delay);
    }
}

/// Loads a model and its diffuse texture, blocking until both resolve.
pub fn fetch_render_model<S: RenderModelSource + ?Sized>(
    source: &mut S,
    name: &str,
    policy: &LoadPolicy,
) -> Result<LoadedModel, AssetLoadError> {
    fetch_while_running(source, name, policy, &AtomicBool::new(true))
}

fn fetch_while_running<S: RenderModelSource + ?Sized>(
    source: &mut S,
    name: &str,
    policy: &LoadPolicy,
    running: &AtomicBool,
) -> Result<LoadedModel, AssetLoadError> {
    let mut retries = 0;

    let data = match poll_to_completion(policy, running, &mut retries, || {
        source.load_render_model(name)
    }) {
        Polled::Ready(data) => data,
        Polled::Failed(reason) => {
            return Err(AssetLoadError::Model {
                name: name.to_string(),
                reason,
            })
        }
        Polled::TimedOut(retries) => {
            return Err(AssetLoadError::TimedOut {
                name: name.to_string(),
                retries,
            })
        }
        Polled::Cancelled => return Err(AssetLoadError::LoaderStopped),
    };

    let texture_id = data.diffuse_texture_id;
    let texture = match poll_to_completion(policy, running, &mut retries, || {
        source.load_texture(texture_id)
    }) {
        Polled::Ready(texture) => texture,
        other => {
            // the model itself was acquired; hand it back
            source.free_render_model(name);
            return Err(match other {
                Polled::Failed(reason) => AssetLoadError::Texture {
                    name: name.to_string(),
                    texture_id,
                    reason,
                },
                Polled::TimedOut(retries) => AssetLoadError::TimedOut {
                    name: name.to_string(),
                    retries,
                },
                _ => AssetLoadError::LoaderStopped,
            });
        }
    };

    // both are owned copies now; the runtime's buffers can go
    source.free_render_model(name);
    source.free_texture(texture_id);

    if retries > 0 {
        debug!("Render model {} ready after {} retries", name, retries);
    }

    Ok(LoadedModel {
        name: name.to_string(),
        data,
        texture,
        retries,
    })
}

/// Name-keyed store of uploaded render models.
#[derive(Default)]
pub struct RenderModelCache {
    models: HashMap<String, Arc<RenderModel>>,
    policy: LoadPolicy,
}

impl RenderModelCache {
    pub fn new(policy: LoadPolicy) -> Self {
        Self {
            models: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    pub fn get(&self, name: &str) -> Option<Arc<RenderModel>> {
        self.models.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Returns the cached model, or loads, uploads and caches it. Failures
    /// are not cached, so a later call tries again.
    pub fn get_or_load<S, G>(
        &mut self,
        name: &str,
        source: &mut S,
        gpu: &mut G,
    ) -> Result<Arc<RenderModel>, AssetLoadError>
    where
        S: RenderModelSource + ?Sized,
        G: GpuSurface + ?Sized,
    {
        if let Some(model) = self.get(name) {
            return Ok(model);
        }
        let loaded = fetch_render_model(source, name, &self.policy)?;
        self.insert_loaded(loaded, gpu)
    }

    /// Uploads a fetched model unless one with the same name is already cached.
    pub fn insert_loaded<G: GpuSurface + ?Sized>(
        &mut self,
        loaded: LoadedModel,
        gpu: &mut G,
    ) -> Result<Arc<RenderModel>, AssetLoadError> {
        if let Some(model) = self.get(&loaded.name) {
            return Ok(model);
        }
        let gpu_model = gpu.upload_render_model(&loaded.name, &loaded.data, &loaded.texture)?;
        let model = Arc::new(RenderModel {
            name: loaded.name.clone(),
            gpu: gpu_model,
        });
        self.models.insert(loaded.name, Arc::clone(&model));
        Ok(model)
    }

    /// Frees every model's GPU resources. Outstanding `Arc`s keep their
    /// handles but must not be drawn afterwards.
    pub fn release_all<G: GpuSurface + ?Sized>(&mut self, gpu: &mut G) {
        for (name, model) in self.models.drain() {
            debug!("Releasing render model {}", name);
            gpu.release_render_model(&model.gpu);
        }
    }
}

/// A load that finished on the loader thread, successfully or not.
#[derive(Debug)]
pub struct FinishedLoad {
    pub name: String,
    pub result: Result<LoadedModel, AssetLoadError>,
}

/// Runs the runtime polling loop on a worker thread.
pub struct RenderModelLoader {
    requests: Option<Sender<String>>,
    results: Receiver<FinishedLoad>,
    in_flight: HashSet<String>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RenderModelLoader {
    pub fn start(mut source: Box<dyn RenderModelSource + Send>, policy: LoadPolicy) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<String>();
        let (result_tx, result_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let worker_running = Arc::clone(&running);
        let worker = thread::spawn(move || {
            info!("Render model loader started");
            while let Ok(name) = request_rx.recv() {
                if !worker_running.load(Ordering::SeqCst) {
                    break;
                }
                let result = fetch_while_running(source.as_mut(), &name, &policy, &worker_running);
                if result_tx.send(FinishedLoad { name, result }).is_err() {
                    break;
                }
            }
            info!("Render model loader stopped");
        });

        Self {
            requests: Some(request_tx),
            results: result_rx,
            in_flight: HashSet::new(),
            running,
            worker: Some(worker),
        }
    }

    /// Queues a load. Returns `Ok(false)` if the name is already in flight.
    pub fn request(&mut self, name: &str) -> Result<bool, AssetLoadError> {
        if self.in_flight.contains(name) {
            return Ok(false);
        }
        let sender = self.requests.as_ref().ok_or(AssetLoadError::LoaderStopped)?;
        sender
            .send(name.to_string())
            .map_err(|_| AssetLoadError::LoaderStopped)?;
        self.in_flight.insert(name.to_string());
        Ok(true)
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.contains(name)
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Drains finished loads without blocking.
    pub fn poll(&mut self) -> Vec<FinishedLoad> {
        let mut finished = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(load) => {
                    self.in_flight.remove(&load.name);
                    finished.push(load);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.in_flight.is_empty() {
                        error!("Render model loader exited with {} loads outstanding", self.in_flight.len());
                        self.in_flight.clear();
                    }
                    break;
                }
            }
        }
        finished
    }

    /// Blocks until every queued load has finished or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Vec<FinishedLoad> {
        let deadline = Instant::now() + timeout;
        let mut finished = self.poll();
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results.recv_timeout(remaining) {
                Ok(load) => {
                    self.in_flight.remove(&load.name);
                    finished.push(load);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    self.in_flight.clear();
                    break;
                }
            }
        }
        finished
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // closing the channel wakes the worker out of recv()
        self.requests = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Render model loader thread panicked");
            }
        }
    }
}

impl Drop for RenderModelLoader {
    fn drop(&mut self) {
        self.stop();
    }
}
