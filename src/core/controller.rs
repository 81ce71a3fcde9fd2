//! Command state machine and tick loop.
//!
//! The loop thread owns a [`Controller`]: one [`ModeHandler`] per command
//! kind, each with `on_enter`, `on_tick` and `on_exit`. Callers never touch the
//! controller directly; they go through [`EngineShared`] (pending command slot,
//! status, busy flag, runtime config and published telemetry).

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::catalog::{shared, Catalog, EntityKey, StimulusSet};
use crate::command::{Command, CommandKind, CommandSlot, MediaSources};
use crate::config::EngineConfig;
use crate::dataset::{check_unit_range, Dataset, DatasetSlot, SharedData, SignalStream, StimulusData};
use crate::decision::{DecisionEngine, Selection};
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::estimator::BrainStateEstimator;
use crate::model::ModelBook;
use crate::modes::{handler_for, IdleMode};
use crate::observer::{ControllerAdapter, EngineSnapshot};
use crate::presenter::Presenter;
use crate::prng::Prng;
use crate::program::ProgramStats;
use crate::store::{self, Store};
use crate::training::TrainingScheduler;
use crate::worker::CancelToken;

/// Longest single sleep inside a tick wait, so cancellation is noticed quickly.
const MAX_SLEEP: Duration = Duration::from_millis(10);

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared between callers and the loop thread
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct EngineShared {
    pub commands: CommandSlot,
    busy: AtomicBool,
    /// Bumped when persisted data changed behind the loop's back.
    generation: AtomicU64,
    status: Mutex<String>,
    config: Mutex<EngineConfig>,
    measured_program: Mutex<Option<Vec<Vec<f32>>>>,
    stats: Mutex<ProgramStats>,
    snapshot: Mutex<EngineSnapshot>,
}

impl EngineShared {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Mutex::new(config),
            status: Mutex::new("idle".to_string()),
            ..Self::default()
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn status(&self) -> String {
        relock(&self.status).clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *relock(&self.status) = status.into();
    }

    pub fn config(&self) -> EngineConfig {
        relock(&self.config).clone()
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        relock(&self.config).set_parameter(name, value)
    }

    pub fn measured_program(&self) -> Option<Vec<Vec<f32>>> {
        relock(&self.measured_program).clone()
    }

    pub fn set_measured_program(&self, program: Option<Vec<Vec<f32>>>) {
        *relock(&self.measured_program) = program;
    }

    pub fn program_stats(&self) -> ProgramStats {
        *relock(&self.stats)
    }

    pub fn set_program_stats(&self, stats: ProgramStats) {
        *relock(&self.stats) = stats;
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        relock(&self.snapshot).clone()
    }

    fn publish_snapshot(&self, snapshot: EngineSnapshot) {
        *relock(&self.snapshot) = snapshot;
    }

    /// Queue `cmd`, raising the busy flag for anything but Idle while the
    /// slot is still locked.
    pub fn submit(&self, cmd: Command) -> Option<Command> {
        let raises = cmd.kind() != CommandKind::Idle;
        self.commands.submit_with(cmd, || {
            if raises {
                self.set_busy(true);
            }
        })
    }

    /// Publish `snapshot` and set busy to `active || pending`, serialized
    /// against [`EngineShared::submit`].
    fn settle(&self, active: bool, mut snapshot: EngineSnapshot) {
        self.commands.with_pending(|pending| {
            let busy = active || pending;
            snapshot.busy = busy;
            self.publish_snapshot(snapshot);
            self.set_busy(busy);
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Mode handlers
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The command completed on its own; the controller returns to Idle.
    Finished,
}

pub trait ModeHandler: Send {
    fn kind(&self) -> CommandKind;

    /// An error rejects the command; the controller stays Idle.
    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()>;

    /// An error aborts the command to Idle (after `on_exit`).
    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome>;

    fn on_exit(&mut self, ctx: &mut EngineContext);
}

// ═══════════════════════════════════════════════════════════════════════════
// Context owned by the loop thread
// ═══════════════════════════════════════════════════════════════════════════

pub struct EngineContext {
    pub shared: Arc<EngineShared>,
    /// Copy of the shared config taken at the last command entry.
    pub config: EngineConfig,
    pub device: Box<dyn Device>,
    pub presenter: Box<dyn Presenter>,
    pub catalog: Arc<dyn Catalog>,
    pub store: Arc<dyn Store>,
    pub device_id: String,
    pub signal_names: Vec<String>,

    pub estimator: BrainStateEstimator,
    pub data: SharedData,
    pub stimuli: StimulusSet,
    pub models: ModelBook,
    pub decision: DecisionEngine,
    pub training: TrainingScheduler,
    pub rng: Prng,

    /// Model directory, catalog fingerprint and data generation of the loaded datasets.
    loaded: Option<(PathBuf, u64, u64)>,
    models_loaded: bool,
    /// Append pumped readings to the raw stream.
    pub recording_stream: bool,
    next_sequence: u64,
    next_estimate: Instant,
}

impl EngineContext {
    pub fn new(
        shared: Arc<EngineShared>,
        device: Box<dyn Device>,
        presenter: Box<dyn Presenter>,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
    ) -> Self {
        let config = shared.config();
        let mut rng = Prng::from_seed(config.seed);
        let device_id = device.id();
        let signal_names = device.signal_names();
        let sound_dims = presenter.sound_parameter_count();
        Self {
            estimator: BrainStateEstimator::new(config.hidden_states, config.seed),
            data: SharedData::default(),
            stimuli: StimulusSet::default(),
            models: ModelBook::default(),
            decision: DecisionEngine::new(config.decision.clone(), sound_dims, rng.fork()),
            training: TrainingScheduler::new(
                config.training.clone(),
                config.hidden_states,
                config.observation_clusters,
                config.join_timeout,
                rng.fork(),
            ),
            rng,
            shared,
            config,
            device,
            presenter,
            catalog,
            store,
            device_id,
            signal_names,
            loaded: None,
            models_loaded: false,
            recording_stream: false,
            next_sequence: 0,
            next_estimate: Instant::now(),
        }
    }

    pub fn sound_dims(&self) -> usize {
        self.presenter.sound_parameter_count()
    }

    pub fn next_sequence(&mut self) -> u64 {
        let s = self.next_sequence;
        self.next_sequence += 1;
        s
    }

    // ═══ Catalog and datasets ═══

    /// Reload the catalog; datasets are reloaded from the store when the
    /// catalog, the model directory or the data generation changed since the last load.
    pub fn load_media(&mut self, media: &MediaSources) -> Result<()> {
        let listing = self.catalog.load(media)?;
        let stimuli = StimulusSet::new(listing, &self.device_id);
        let identity = (media.model_dir.clone(), stimuli.fingerprint(), self.shared.generation());
        if self.loaded.as_ref() == Some(&identity) {
            return Ok(());
        }

        let dir = &media.model_dir;
        let load = |key: &EntityKey, name: &str| -> Dataset {
            match store::load_dataset(self.store.as_ref(), dir, key) {
                Ok(Some(ds)) => ds,
                Ok(None) => Dataset::new(),
                Err(e) => {
                    warn!(entity = name, error = %e, "unreadable dataset; starting empty");
                    Dataset::new()
                }
            }
        };
        let mut data = StimulusData::with_catalog(0, 0);
        data.pictures = stimuli.pictures().iter().map(|e| load(&e.key, &e.name)).collect();
        data.keywords = stimuli.keywords().iter().map(|e| load(&e.key, &e.name)).collect();
        data.sound = load(&EntityKey::new(shared::SOUND, &self.device_id), shared::SOUND);
        data.stream = match store::load_stream(self.store.as_ref(), dir, &self.device_id) {
            Ok(stream) => stream.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "unreadable signal stream; starting empty");
                SignalStream::new()
            }
        };

        let samples: usize = data.slots().iter().filter_map(|s| data.dataset(*s)).map(Dataset::len).sum();
        let newest_sample = data
            .slots()
            .iter()
            .filter_map(|s| data.dataset(*s))
            .flat_map(|d| d.samples().last().map(|s| s.sequence + 1))
            .max()
            .unwrap_or(0);
        self.next_sequence = data.stream.next_sequence().max(newest_sample);
        info!(
            pictures = stimuli.pictures().len(),
            keywords = stimuli.keywords().len(),
            samples,
            stream = data.stream.len(),
            "stimulus catalog loaded"
        );

        self.data.replace(data);
        self.models = ModelBook::with_catalog(stimuli.pictures().len(), stimuli.keywords().len());
        self.models_loaded = false;
        self.stimuli = stimuli;
        self.loaded = Some(identity);
        self.training.invalidate();
        Ok(())
    }

    /// Load persisted models. Missing or corrupt entities are skipped; a
    /// category with entities but no loadable model fails the command.
    pub fn load_models(&mut self, media: &MediaSources) -> Result<()> {
        let dir = &media.model_dir;
        match store::load_state_model(self.store.as_ref(), dir, &self.device_id) {
            Ok(Some(model)) => {
                if self.estimator.model().is_none() {
                    self.estimator.swap_model(Some(Arc::new(model)), true);
                    self.estimator.initialize();
                }
            }
            Ok(None) => debug!("no persisted hidden-state model"),
            Err(e) => warn!(error = %e, "skipping hidden-state model"),
        }
        if self.models_loaded {
            return Ok(());
        }

        let mut book = ModelBook::with_catalog(self.stimuli.pictures().len(), self.stimuli.keywords().len());
        let mut load_category = |entities: &[crate::catalog::StimulusEntity], category: &str, slot: fn(usize) -> DatasetSlot| {
            let mut loaded = 0usize;
            for (i, e) in entities.iter().enumerate() {
                match store::load_model(self.store.as_ref(), dir, &e.key, &e.name) {
                    Ok(model) => {
                        book.publish(slot(i), Arc::new(model));
                        loaded += 1;
                    }
                    Err(err) => warn!(%err, "skipping entity"),
                }
            }
            if !entities.is_empty() && loaded == 0 {
                return Err(EngineError::ModelLoad {
                    entity: category.to_string(),
                    reason: format!("none of {} models could be loaded", entities.len()),
                });
            }
            Ok(loaded)
        };
        let pictures = load_category(self.stimuli.pictures(), "pictures", DatasetSlot::Picture)?;
        let keywords = load_category(self.stimuli.keywords(), "keywords", DatasetSlot::Keyword)?;
        let sound_key = EntityKey::new(shared::SOUND, &self.device_id);
        if self.sound_dims() > 0 {
            match store::load_model(self.store.as_ref(), dir, &sound_key, shared::SOUND) {
                Ok(model) => book.publish(DatasetSlot::Sound, Arc::new(model)),
                Err(err) => debug!(%err, "no sound model"),
            }
        }
        info!(pictures, keywords, "models loaded");
        self.models = book;
        self.models_loaded = true;
        Ok(())
    }

    /// Write every dataset and the raw stream. I/O happens outside the dataset lock.
    pub fn persist_datasets(&self) {
        let Some((dir, _, _)) = &self.loaded else {
            return;
        };
        let data = self.data.lock().clone();
        let store = self.store.as_ref();
        let mut failures = 0;
        for slot in data.slots() {
            let key = match slot {
                DatasetSlot::Picture(i) => self.stimuli.pictures().get(i).map(|e| e.key.clone()),
                DatasetSlot::Keyword(i) => self.stimuli.keywords().get(i).map(|e| e.key.clone()),
                DatasetSlot::Sound => Some(EntityKey::new(shared::SOUND, &self.device_id)),
            };
            let (Some(key), Some(ds)) = (key, data.dataset(slot)) else {
                continue;
            };
            if ds.is_empty() {
                continue;
            }
            if let Err(e) = store::save_dataset(store, dir, &key, ds) {
                error!(?slot, error = %e, "failed to persist dataset");
                failures += 1;
            }
        }
        if let Err(e) = store::save_stream(store, dir, &self.device_id, &data.stream) {
            error!(error = %e, "failed to persist signal stream");
            failures += 1;
        }
        if failures == 0 {
            debug!(dir = %dir.display(), "datasets persisted");
        }
    }

    // ═══ Device and display ═══

    /// Connection state with a grace window: `Ok(true)` connected,
    /// `Ok(false)` disconnected but still inside the window.
    pub fn check_device(&mut self, since: &mut Option<Instant>) -> Result<bool> {
        if self.device.connection_ok() {
            if since.take().is_some() {
                info!("device reconnected");
            }
            return Ok(true);
        }
        let first = *since.get_or_insert_with(Instant::now);
        let down = first.elapsed();
        if down > self.config.disconnect_grace {
            return Err(EngineError::DeviceDisconnected(down));
        }
        Ok(false)
    }

    /// A validated reading, or `None` (logged) when the device has nothing usable.
    pub fn read_signal(&mut self) -> Option<Vec<f32>> {
        let sample = self.device.data()?;
        if let Err(e) = check_unit_range("device reading", &sample) {
            warn!(error = %e, "dropping device reading");
            return None;
        }
        Some(sample)
    }

    pub fn show(&mut self, selection: &Selection) -> bool {
        let text = selection
            .keyword
            .and_then(|i| self.stimuli.keywords().get(i))
            .map(|e| e.name.clone())
            .unwrap_or_default();
        let sound = selection
            .sound
            .clone()
            .unwrap_or_else(|| self.decision.sound_parameters().to_vec());
        self.presenter.show(&text, selection.picture, &sound)
    }

    // ═══ Estimator cadence ═══

    /// Feed one reading to the estimator (and the raw stream while measuring).
    pub fn pump_estimator(&mut self) {
        let Some(sample) = self.read_signal() else {
            return;
        };
        self.estimator.update(&sample);
        if self.recording_stream {
            let seq = self.next_sequence();
            self.data.lock().stream.push(seq, sample);
        }
    }

    /// Sleep until `deadline`, pumping the estimator on its own cadence.
    pub fn wait_until(&mut self, deadline: Instant, cancel: Option<&CancelToken>) {
        loop {
            let now = Instant::now();
            if now >= self.next_estimate {
                self.pump_estimator();
                self.next_estimate = now + self.config.estimator_period;
            }
            if now >= deadline || cancel.is_some_and(CancelToken::is_cancelled) {
                return;
            }
            let wake = deadline.min(self.next_estimate);
            thread::sleep(wake.saturating_duration_since(now).min(MAX_SLEEP));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════

pub struct Controller {
    ctx: EngineContext,
    current: Box<dyn ModeHandler>,
}

impl Controller {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            current: Box::new(IdleMode::new(false)),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn current_kind(&self) -> CommandKind {
        self.current.kind()
    }

    /// One tick: adopt a pending command, run the current mode's body, publish telemetry.
    pub fn tick(&mut self) {
        if self.ctx.presenter.poll_interrupt() && self.current.kind() != CommandKind::Idle {
            info!("user interrupt");
            self.switch(Command::idle(), Some("interrupted".to_string()));
        }
        if let Some(cmd) = self.ctx.shared.commands.take() {
            self.switch(cmd, None);
        }

        match self.current.on_tick(&mut self.ctx) {
            Ok(TickOutcome::Continue) => {}
            Ok(TickOutcome::Finished) => {
                let kind = self.current.kind();
                info!(command = %kind, "command finished");
                self.switch(Command::idle(), Some(format!("{kind} finished")));
            }
            Err(e) => {
                let kind = self.current.kind();
                error!(command = %kind, error = %e, "command aborted");
                self.switch(Command::idle(), Some(format!("{kind} aborted: {e}")));
            }
        }
        self.publish_snapshot();
    }

    /// Run exit actions of the current mode, then enter `cmd`. `note` replaces
    /// the entered mode's status before the busy flag drops.
    fn switch(&mut self, cmd: Command, note: Option<String>) {
        let kind = cmd.kind();
        self.current.on_exit(&mut self.ctx);
        self.ctx.config = self.ctx.shared.config();

        let mut next = handler_for(cmd);
        match next.on_enter(&mut self.ctx) {
            Ok(()) => {
                info!(command = %kind, "command adopted");
                self.current = next;
                if let Some(note) = note {
                    self.ctx.shared.set_status(note);
                }
            }
            Err(e) => {
                error!(command = %kind, error = %e, "command rejected on entry");
                self.ctx.shared.set_status(format!("{kind} failed: {e}"));
                self.current = Box::new(IdleMode::new(false));
            }
        }
        // Observers polling the busy flag must never see a stale command kind.
        let active = self.current.kind() != CommandKind::Idle;
        let snapshot = ControllerAdapter::new(self).snapshot();
        self.ctx.shared.settle(active, snapshot);
    }

    /// After a panic the mode's state is unknown; drop it without exit actions
    /// beyond releasing workers.
    fn force_idle(&mut self) {
        if let Err(e) = self.ctx.training.stop() {
            warn!(error = %e, "training workers did not stop");
        }
        self.ctx.decision.release();
        self.ctx.recording_stream = false;
        self.current = Box::new(IdleMode::new(false));
        self.ctx.shared.set_status("idle (recovered from internal error)");
        let snapshot = ControllerAdapter::new(self).snapshot();
        self.ctx.shared.settle(false, snapshot);
    }

    fn publish_snapshot(&self) {
        let snapshot = ControllerAdapter::new(self).snapshot();
        self.ctx.shared.publish_snapshot(snapshot);
    }

    /// Tick until cancelled; exit actions of the last mode run before returning.
    pub fn run(mut self, cancel: &CancelToken) {
        info!(device = %self.ctx.device_id, "engine loop started");
        self.ctx.estimator.initialize();
        while !cancel.is_cancelled() {
            let started = Instant::now();
            if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                error!("tick panicked; forcing idle");
                self.force_idle();
            }
            let deadline = started + self.ctx.config.tick;
            self.ctx.wait_until(deadline, Some(cancel));
        }
        self.current.on_exit(&mut self.ctx);
        self.ctx.shared.set_busy(false);
        info!("engine loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::device::NoDevice;
    use crate::presenter::HeadlessPresenter;
    use crate::store::MemoryStore;

    fn media() -> MediaSources {
        MediaSources::new("pics".into(), "words.txt".into(), "models".into())
    }

    fn controller() -> (Controller, Arc<Mutex<HeadlessPresenter>>) {
        let shared = Arc::new(EngineShared::new(EngineConfig::default().with_seed(1)));
        let presenter = Arc::new(Mutex::new(HeadlessPresenter::new()));
        let ctx = EngineContext::new(
            shared,
            Box::new(NoDevice::new(3)),
            Box::new(Arc::clone(&presenter)),
            Arc::new(StaticCatalog::new(&["a.png", "b.png"], &["calm", "storm"])),
            Arc::new(MemoryStore::new()),
        );
        (Controller::new(ctx), presenter)
    }

    #[test]
    fn only_the_last_pending_command_is_adopted() {
        let (mut c, _) = controller();
        let shared = Arc::clone(&c.ctx.shared);
        shared.commands.submit(Command::Measure { media: media() });
        shared.commands.submit(Command::Optimize { media: media() });
        shared.commands.submit(Command::ShowRandom { media: media() });
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::ShowRandom);
        assert!(shared.is_busy());
        assert!(!shared.commands.has_pending());
    }

    #[test]
    fn failed_entry_leaves_controller_idle() {
        let (mut c, _) = controller();
        // Too little data to optimize.
        c.ctx.shared.commands.submit(Command::Optimize { media: media() });
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Idle);
        assert!(!c.ctx.shared.is_busy());
        assert!(c.ctx.shared.status().contains("insufficient data"), "{}", c.ctx.shared.status());
    }

    #[test]
    fn busy_raised_by_submission_drops_after_failed_entry() {
        let (mut c, _) = controller();
        let shared = Arc::clone(&c.ctx.shared);
        assert!(shared.submit(Command::Optimize { media: media() }).is_none());
        assert!(shared.is_busy());
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Idle);
        assert!(!shared.is_busy(), "{}", shared.status());
        for _ in 0..50 {
            c.tick();
        }
        assert!(!shared.is_busy());
        assert!(!shared.snapshot().busy);
    }

    #[test]
    fn submissions_racing_the_loop_never_strand_busy() {
        let (mut c, _) = controller();
        let shared = Arc::clone(&c.ctx.shared);
        let submitter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    shared.submit(Command::Optimize { media: media() });
                    std::thread::yield_now();
                }
            })
        };
        while !submitter.is_finished() {
            c.tick();
        }
        submitter.join().unwrap();
        // Drain whatever landed last.
        c.tick();
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Idle);
        assert!(!shared.is_busy(), "{}", shared.status());
    }

    #[test]
    fn stop_runs_exit_actions_and_returns_to_idle() {
        let (mut c, _) = controller();
        c.ctx.shared.commands.submit(Command::Measure { media: media() });
        c.tick();
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Measure);
        c.ctx.shared.commands.submit(Command::idle());
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Idle);
        assert!(!c.ctx.recording_stream);
        // Measure's exit persisted the samples it took.
        let dir = PathBuf::from("models");
        let key = c.ctx.stimuli.pictures()[0].key.clone();
        let stored = c.ctx.data.lock().pictures[0].len();
        let on_disk = store::load_dataset(c.ctx.store.as_ref(), &dir, &key).unwrap().map_or(0, |d| d.len());
        assert_eq!(stored, on_disk);
    }

    #[test]
    fn interrupt_forces_idle() {
        let (mut c, presenter) = controller();
        c.ctx.shared.commands.submit(Command::ShowRandom { media: media() });
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::ShowRandom);
        presenter.lock().unwrap().request_interrupt();
        c.tick();
        assert_eq!(c.current_kind(), CommandKind::Idle);
    }

    #[test]
    fn snapshot_follows_the_current_command() {
        let (mut c, _) = controller();
        c.ctx.shared.commands.submit(Command::ShowRandom { media: media() });
        c.tick();
        let snap = c.ctx.shared.snapshot();
        assert_eq!(snap.command, CommandKind::ShowRandom);
        assert_eq!(snap.pictures, 2);
        assert!(snap.busy);
    }
}
