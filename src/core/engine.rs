//! Public handle around the controller loop.
//!
//! [`Engine::start`] moves the collaborators into a [`Controller`] running on its
//! own worker thread. Every call on the handle is non-blocking: commands land in
//! the pending slot and are adopted at the next tick boundary.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::analysis::{self, DeltaStatistics, ModelAnalysis};
use crate::catalog::{Catalog, StimulusSet};
use crate::command::{Command, ExecuteFlags, MediaSources, SignalTarget};
use crate::config::EngineConfig;
use crate::controller::{Controller, EngineContext, EngineShared};
use crate::device::Device;
use crate::error::{EngineError, Result, WorkerError};
use crate::observer::EngineSnapshot;
use crate::presenter::Presenter;
use crate::program::ProgramStats;
use crate::store::Store;
use crate::worker::BackgroundJob;

pub struct Engine {
    shared: Arc<EngineShared>,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn Store>,
    device_id: String,
    signal_names: Vec<String>,
    join_timeout: Duration,
    worker: Mutex<Option<BackgroundJob<()>>>,
}

impl Engine {
    pub fn start(
        device: Box<dyn Device>,
        presenter: Box<dyn Presenter>,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Result<Self> {
        let join_timeout = config.join_timeout;
        let shared = Arc::new(EngineShared::new(config));
        let ctx = EngineContext::new(
            Arc::clone(&shared),
            device,
            presenter,
            Arc::clone(&catalog),
            Arc::clone(&store),
        );
        let device_id = ctx.device_id.clone();
        let signal_names = ctx.signal_names.clone();
        let controller = Controller::new(ctx);
        let worker = BackgroundJob::spawn("resonanz-engine", move |cancel| {
            controller.run(cancel);
            Some(())
        })?;
        info!(device = %device_id, signals = signal_names.len(), "engine started");
        Ok(Self {
            shared,
            catalog,
            store,
            device_id,
            signal_names,
            join_timeout,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn signal_names(&self) -> &[String] {
        &self.signal_names
    }

    // ═══ Commands ═══

    /// Validate and queue a command; a later submission before the next tick replaces it.
    pub fn submit(&self, cmd: Command) -> Result<()> {
        cmd.validate(&self.signal_names)?;
        if let Some(media) = cmd.media() {
            self.catalog.load(media)?;
        }
        let kind = cmd.kind();
        if let Some(replaced) = self.shared.submit(cmd) {
            info!(replaced = %replaced.kind(), by = %kind, "pending command replaced");
        }
        Ok(())
    }

    pub fn show_random(&self, media: MediaSources) -> Result<()> {
        self.submit(Command::ShowRandom { media })
    }

    pub fn measure(&self, media: MediaSources) -> Result<()> {
        self.submit(Command::Measure { media })
    }

    pub fn optimize(&self, media: MediaSources) -> Result<()> {
        self.submit(Command::Optimize { media })
    }

    pub fn execute(&self, media: MediaSources, targets: Vec<SignalTarget>, flags: ExecuteFlags) -> Result<()> {
        self.submit(Command::Execute { media, targets, flags })
    }

    pub fn measure_program(&self, media_file: &Path, signals: Vec<String>, length: usize) -> Result<()> {
        self.submit(Command::MeasureProgram {
            media_file: media_file.to_path_buf(),
            signals,
            length,
        })
    }

    /// Back to Idle, running the current command's exit actions.
    pub fn stop(&self) -> Result<()> {
        self.submit(Command::idle())
    }

    // ═══ Status ═══

    pub fn status(&self) -> String {
        self.shared.status()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.shared.snapshot()
    }

    /// Applies from the next command entry.
    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.shared.set_parameter(name, value)?;
        info!(name, value, "parameter set");
        Ok(())
    }

    pub fn config(&self) -> EngineConfig {
        self.shared.config()
    }

    pub fn measured_program(&self) -> Option<Vec<Vec<f32>>> {
        self.shared.measured_program()
    }

    pub fn invalidate_measured_program(&self) {
        self.shared.set_measured_program(None);
    }

    pub fn program_statistics(&self) -> ProgramStats {
        self.shared.program_stats()
    }

    // ═══ Model directory ═══

    fn stimuli(&self, media: &MediaSources) -> Result<StimulusSet> {
        Ok(StimulusSet::new(self.catalog.load(media)?, &self.device_id))
    }

    /// Reads persisted data only; samples still held by a running Measure are not counted.
    pub fn analyze_models(&self, media: &MediaSources) -> Result<ModelAnalysis> {
        let stimuli = self.stimuli(media)?;
        analysis::analyze_models(self.store.as_ref(), &media.model_dir, &stimuli)
    }

    pub fn delta_statistics(&self, media: &MediaSources) -> Result<DeltaStatistics> {
        let stimuli = self.stimuli(media)?;
        analysis::delta_statistics(self.store.as_ref(), &media.model_dir, &stimuli)
    }

    /// Remove every persisted dataset and model under `model_dir`.
    pub fn delete_model_data(&self, model_dir: &Path) -> Result<usize> {
        if self.is_busy() {
            return Err(EngineError::config("cannot delete model data while a command is running"));
        }
        let removed = self.store.clear(model_dir)?;
        self.shared.bump_generation();
        info!(dir = %model_dir.display(), removed, "model data deleted");
        Ok(removed)
    }

    // ═══ Shutdown ═══

    /// Stop the loop; the current command's exit actions run before the worker returns.
    pub fn shutdown(&self, timeout: Duration) -> std::result::Result<(), WorkerError> {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        match worker {
            Some(mut worker) => {
                let out = worker.stop(timeout);
                info!("engine shut down");
                out
            }
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let timeout = self.join_timeout;
        if let Err(e) = self.shutdown(timeout) {
            warn!(error = %e, "engine loop did not stop cleanly");
        }
    }
}
