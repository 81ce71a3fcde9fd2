//! Staged, resumable model training.
//!
//! One pipeline drives everything the decision engine needs:
//!
//! ```text
//! state model → relabel pass → sound model → pictures… → keywords… → done
//! ```
//!
//! [`TrainingScheduler::advance`] never blocks: the actual fitting runs in a
//! single [`BackgroundJob`] at a time and `advance` only polls it, publishes
//! finished results and starts the next unit of work. Progress per entity is
//! an explicit [`JobTag`], so stopping and resuming picks up at the first
//! entity that is not `Done`.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::catalog::{shared, EntityKey, StimulusSet};
use crate::config::TrainingConfig;
use crate::dataset::{DatasetSlot, SharedData, StimulusData};
use crate::error::{EngineError, Result, WorkerError};
use crate::estimator::BrainStateEstimator;
use crate::hidden_state::HiddenStateModel;
use crate::model::{fit_point_estimate, sample_posterior, ModelBook, PointFit, PredictiveModel};
use crate::prng::Prng;
use crate::relabel::HistoricalRelabeler;
use crate::store::{self, Store};
use crate::worker::{BackgroundJob, JobPoll, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JobTag {
    NotStarted,
    PointEstimating,
    UncertaintyFitting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stage {
    StateModel,
    Relabel,
    SoundModel,
    Pictures,
    Keywords,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingJob {
    pub slot: DatasetSlot,
    pub name: String,
    pub key: EntityKey,
    pub tag: JobTag,
}

impl TrainingJob {
    fn stage(&self) -> Stage {
        match self.slot {
            DatasetSlot::Sound => Stage::SoundModel,
            DatasetSlot::Picture(_) => Stage::Pictures,
            DatasetSlot::Keyword(_) => Stage::Keywords,
        }
    }
}

/// Entities in training order: sound first, then pictures, then keywords.
pub fn plan_jobs(stimuli: &StimulusSet, device_id: &str, sound: bool, sound_only: bool) -> Vec<TrainingJob> {
    let mut jobs = Vec::new();
    if sound {
        jobs.push(TrainingJob {
            slot: DatasetSlot::Sound,
            name: shared::SOUND.to_string(),
            key: EntityKey::new(shared::SOUND, device_id),
            tag: JobTag::NotStarted,
        });
    }
    if !sound_only {
        for (i, e) in stimuli.pictures().iter().enumerate() {
            jobs.push(TrainingJob {
                slot: DatasetSlot::Picture(i),
                name: e.name.clone(),
                key: e.key.clone(),
                tag: JobTag::NotStarted,
            });
        }
        for (i, e) in stimuli.keywords().iter().enumerate() {
            jobs.push(TrainingJob {
                slot: DatasetSlot::Keyword(i),
                name: e.name.clone(),
                key: e.key.clone(),
                tag: JobTag::NotStarted,
            });
        }
    }
    jobs
}

/// Fail fast before any training: the stream and every planned entity need enough data.
pub fn check_preconditions(cfg: &TrainingConfig, jobs: &[TrainingJob], data: &StimulusData) -> Result<()> {
    if jobs.is_empty() {
        return Err(EngineError::DataInsufficiency("no stimulus entities to train".into()));
    }
    if data.stream.len() < cfg.min_stream_len {
        return Err(EngineError::DataInsufficiency(format!(
            "raw signal stream has {} entries, need at least {}",
            data.stream.len(),
            cfg.min_stream_len
        )));
    }
    for job in jobs {
        let n = data.dataset(job.slot).map_or(0, |d| d.len());
        if n < cfg.min_samples_per_entity {
            return Err(EngineError::DataInsufficiency(format!(
                "`{}` has {n} samples, need at least {}",
                job.name, cfg.min_samples_per_entity
            )));
        }
    }
    Ok(())
}

/// What `advance` needs from the engine for one call.
pub struct TrainingContext<'a> {
    pub data: &'a SharedData,
    pub estimator: &'a BrainStateEstimator,
    pub models: &'a mut ModelBook,
    pub store: &'a dyn Store,
    pub model_dir: &'a Path,
    pub device_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Working,
    Done,
}

enum ActiveWork {
    StateModel(BackgroundJob<HiddenStateModel>),
    Point { index: usize, job: BackgroundJob<PointFit> },
    Posterior { index: usize, job: BackgroundJob<PredictiveModel> },
}

/// Identity of the data a pipeline was planned for. Progress is only kept
/// while this stays the same.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scope {
    fingerprint: u64,
    signature: (usize, usize, u64),
    sound: bool,
    sound_only: bool,
    uncertainty: bool,
}

pub struct TrainingScheduler {
    cfg: TrainingConfig,
    hidden_states: usize,
    clusters: usize,
    join_timeout: Duration,
    rng: Prng,

    scope: Option<Scope>,
    state_tag: JobTag,
    relabel_started: bool,
    relabel_done: bool,
    jobs: Vec<TrainingJob>,

    active: Option<ActiveWork>,
    relabeler: HistoricalRelabeler,
    progress: Arc<Progress>,

    session_start: Option<Instant>,
    session_units: usize,
}

impl TrainingScheduler {
    pub fn new(cfg: TrainingConfig, hidden_states: usize, clusters: usize, join_timeout: Duration, rng: Prng) -> Self {
        Self {
            cfg,
            hidden_states: hidden_states.max(1),
            clusters: clusters.max(1),
            join_timeout,
            rng,
            scope: None,
            state_tag: JobTag::NotStarted,
            relabel_started: false,
            relabel_done: false,
            jobs: Vec::new(),
            active: None,
            relabeler: HistoricalRelabeler::new(),
            progress: Progress::new(),
            session_start: None,
            session_units: 0,
        }
    }

    /// Takes effect at the next [`prepare`](Self::prepare).
    pub fn configure(&mut self, cfg: TrainingConfig) {
        self.cfg = cfg;
    }

    /// Check preconditions and (re)plan. Progress from an earlier run is kept
    /// when catalog and data are unchanged since that run.
    pub fn prepare(
        &mut self,
        stimuli: &StimulusSet,
        data: &StimulusData,
        device_id: &str,
        sound: bool,
    ) -> Result<()> {
        let planned = plan_jobs(stimuli, device_id, sound, self.cfg.sound_only);
        check_preconditions(&self.cfg, &planned, data)?;

        let scope = Scope {
            fingerprint: stimuli.fingerprint(),
            signature: data.signature(),
            sound,
            sound_only: self.cfg.sound_only,
            uncertainty: self.cfg.uncertainty,
        };
        if self.scope.as_ref() == Some(&scope) {
            info!(
                done = self.jobs.iter().filter(|j| j.tag == JobTag::Done).count(),
                total = self.jobs.len(),
                "resuming training pipeline"
            );
        } else {
            info!(entities = planned.len(), "planning new training pipeline");
            self.jobs = planned;
            self.state_tag = JobTag::NotStarted;
            self.relabel_done = false;
            self.scope = Some(scope);
        }
        self.relabel_started = false;
        self.session_start = Some(Instant::now());
        self.session_units = 0;
        Ok(())
    }

    /// Forget all progress; the next `prepare` plans from scratch.
    pub fn invalidate(&mut self) {
        self.scope = None;
    }

    pub fn stage(&self) -> Stage {
        if self.state_tag != JobTag::Done {
            return Stage::StateModel;
        }
        if !self.relabel_done {
            return Stage::Relabel;
        }
        self.next_pending()
            .map_or(Stage::Done, |i| self.jobs[i].stage())
    }

    pub fn jobs(&self) -> &[TrainingJob] {
        &self.jobs
    }

    pub fn state_tag(&self) -> JobTag {
        self.state_tag
    }

    pub fn is_done(&self) -> bool {
        self.scope.is_some() && self.stage() == Stage::Done
    }

    /// Index of the first entity that is not `Done`.
    pub fn next_pending(&self) -> Option<usize> {
        self.jobs.iter().position(|j| j.tag != JobTag::Done)
    }

    /// Iterations of the active fit and its latest loss.
    pub fn progress(&self) -> (usize, f32) {
        (self.progress.iterations(), self.progress.metric())
    }

    fn total_units(&self) -> usize {
        2 + self.jobs.len()
    }

    fn done_units(&self) -> usize {
        usize::from(self.state_tag == JobTag::Done)
            + usize::from(self.relabel_done)
            + self.jobs.iter().filter(|j| j.tag == JobTag::Done).count()
    }

    pub fn percent(&self) -> f32 {
        100.0 * self.done_units() as f32 / self.total_units() as f32
    }

    /// Remaining time extrapolated from units finished in this session.
    pub fn eta(&self) -> Option<Duration> {
        let start = self.session_start?;
        if self.session_units == 0 {
            return None;
        }
        let remaining = self.total_units().saturating_sub(self.done_units());
        let per_unit = start.elapsed().as_secs_f64() / self.session_units as f64;
        Some(Duration::from_secs_f64(per_unit * remaining as f64))
    }

    /// One bounded unit of work: poll the active job or start the next one.
    pub fn advance(&mut self, ctx: &mut TrainingContext<'_>) -> Result<Advance> {
        if self.scope.is_none() {
            return Err(EngineError::config("training pipeline was not prepared"));
        }
        match self.active.take() {
            Some(work) => self.poll_work(work, ctx)?,
            None => self.start_next(ctx)?,
        }
        Ok(if self.stage() == Stage::Done {
            Advance::Done
        } else {
            Advance::Working
        })
    }

    /// Release the active worker and the relabeler. Whatever was in flight
    /// goes back to `NotStarted`.
    pub fn stop(&mut self) -> std::result::Result<(), WorkerError> {
        let relabel = self.relabeler.stop(self.join_timeout);
        self.relabel_started = false;
        let work = match self.active.take() {
            Some(ActiveWork::StateModel(mut job)) => {
                self.state_tag = JobTag::NotStarted;
                job.stop(self.join_timeout)
            }
            Some(ActiveWork::Point { index, mut job }) => {
                self.revert(index);
                job.stop(self.join_timeout)
            }
            Some(ActiveWork::Posterior { index, mut job }) => {
                self.revert(index);
                job.stop(self.join_timeout)
            }
            None => Ok(()),
        };
        relabel.and(work)
    }

    fn revert(&mut self, index: usize) {
        if let Some(job) = self.jobs.get_mut(index) {
            debug!(entity = %job.name, "training interrupted");
            job.tag = JobTag::NotStarted;
        }
    }

    fn finish_unit(&mut self) {
        self.session_units += 1;
    }

    fn start_next(&mut self, ctx: &mut TrainingContext<'_>) -> Result<()> {
        match self.stage() {
            Stage::StateModel => {
                let signals = ctx.data.lock().stream.signals();
                let (clusters, states) = (self.clusters, self.hidden_states);
                let (km, hmm) = (self.cfg.kmeans_iterations, self.cfg.hmm_iterations);
                let mut rng = self.rng.fork();
                let job = BackgroundJob::spawn("state-model", move |cancel| {
                    HiddenStateModel::fit(&signals, clusters, states, km, hmm, &mut rng, cancel)
                })?;
                info!(clusters, states, "fitting hidden-state model");
                self.state_tag = JobTag::PointEstimating;
                self.active = Some(ActiveWork::StateModel(job));
            }
            Stage::Relabel => {
                if self.relabeler.is_running() {
                    return Ok(());
                }
                if self.relabel_started {
                    info!(samples = self.relabeler.processed_count(), "relabel pass complete");
                    self.relabel_started = false;
                    self.relabel_done = true;
                    self.finish_unit();
                    return Ok(());
                }
                match ctx.estimator.model() {
                    Some(model) => {
                        self.relabeler.start(model, ctx.data.clone(), self.join_timeout)?;
                        self.relabel_started = true;
                    }
                    None => {
                        self.relabel_done = true;
                        self.finish_unit();
                    }
                }
            }
            Stage::SoundModel | Stage::Pictures | Stage::Keywords => {
                let Some(index) = self.next_pending() else {
                    return Ok(());
                };
                let slot = self.jobs[index].slot;
                let (inputs, targets) = ctx
                    .data
                    .lock()
                    .dataset(slot)
                    .map(|d| d.training_pairs())
                    .unwrap_or_default();
                let settings = self.cfg.fit.clone();
                let mut rng = self.rng.fork();
                self.progress = Progress::new();
                let progress = Arc::clone(&self.progress);
                let job = BackgroundJob::spawn("point-estimate", move |cancel| {
                    fit_point_estimate(&inputs, &targets, &settings, &mut rng, cancel, &progress)
                })?;
                let entity = &mut self.jobs[index];
                debug!(entity = %entity.name, "point estimation started");
                entity.tag = JobTag::PointEstimating;
                self.active = Some(ActiveWork::Point { index, job });
            }
            Stage::Done => {}
        }
        Ok(())
    }

    fn poll_work(&mut self, work: ActiveWork, ctx: &mut TrainingContext<'_>) -> Result<()> {
        match work {
            ActiveWork::StateModel(mut job) => match job.poll() {
                JobPoll::Running => self.active = Some(ActiveWork::StateModel(job)),
                JobPoll::Finished(model) => {
                    if let Err(e) = store::save_state_model(ctx.store, ctx.model_dir, ctx.device_id, &model) {
                        error!(error = %e, "failed to persist hidden-state model");
                    }
                    // State lock only; the dataset lock is not held here.
                    ctx.estimator.swap_model(Some(Arc::new(model)), false);
                    info!("hidden-state model published");
                    self.state_tag = JobTag::Done;
                    self.finish_unit();
                }
                JobPoll::Cancelled | JobPoll::Failed => {
                    error!("hidden-state model fit failed; keeping the previous model");
                    self.state_tag = JobTag::Done;
                    self.finish_unit();
                }
            },
            ActiveWork::Point { index, mut job } => match job.poll() {
                JobPoll::Running => self.active = Some(ActiveWork::Point { index, job }),
                JobPoll::Finished(fit) => {
                    info!(
                        entity = %self.jobs[index].name,
                        iterations = fit.iterations,
                        loss = fit.loss,
                        "point estimate converged"
                    );
                    if self.cfg.uncertainty {
                        self.start_posterior(index, fit, ctx)?;
                    } else {
                        self.publish(index, PredictiveModel::from_point(fit), ctx);
                    }
                }
                JobPoll::Cancelled | JobPoll::Failed => self.give_up(index),
            },
            ActiveWork::Posterior { index, mut job } => match job.poll() {
                JobPoll::Running => self.active = Some(ActiveWork::Posterior { index, job }),
                JobPoll::Finished(model) => self.publish(index, model, ctx),
                JobPoll::Cancelled | JobPoll::Failed => self.give_up(index),
            },
        }
        Ok(())
    }

    fn start_posterior(&mut self, index: usize, fit: PointFit, ctx: &mut TrainingContext<'_>) -> Result<()> {
        let slot = self.jobs[index].slot;
        let (inputs, targets) = ctx
            .data
            .lock()
            .dataset(slot)
            .map(|d| d.training_pairs())
            .unwrap_or_default();
        let settings = self.cfg.posterior.clone();
        let l2 = self.cfg.fit.l2;
        let mut rng = self.rng.fork();
        self.progress = Progress::new();
        let progress = Arc::clone(&self.progress);
        let job = BackgroundJob::spawn("posterior", move |cancel| {
            let members = sample_posterior(&fit, &inputs, &targets, &settings, l2, &mut rng, cancel, &progress)?;
            Some(PredictiveModel::from_ensemble(fit, members))
        })?;
        self.jobs[index].tag = JobTag::UncertaintyFitting;
        self.active = Some(ActiveWork::Posterior { index, job });
        Ok(())
    }

    fn publish(&mut self, index: usize, model: PredictiveModel, ctx: &mut TrainingContext<'_>) {
        let job = &mut self.jobs[index];
        if let Err(e) = store::save_model(ctx.store, ctx.model_dir, &job.key, &model) {
            error!(entity = %job.name, error = %e, "failed to persist model");
        }
        ctx.models.publish(job.slot, Arc::new(model));
        job.tag = JobTag::Done;
        info!(entity = %job.name, "model published");
        self.finish_unit();
    }

    /// A fit that panicked or produced nothing: the entity stays without a model.
    fn give_up(&mut self, index: usize) {
        let job = &mut self.jobs[index];
        warn!(entity = %job.name, "training produced no model; skipping entity");
        job.tag = JobTag::Done;
        self.finish_unit();
    }
}

impl Drop for TrainingScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "training workers did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, StaticCatalog};
    use crate::command::MediaSources;
    use crate::dataset::{one_hot, MeasurementSample};
    use crate::model::FitSettings;
    use crate::store::{BlobKind, MemoryStore};

    const DEVICE: &str = "test-device";

    fn stimuli(pictures: &[&str], keywords: &[&str]) -> StimulusSet {
        let media = MediaSources::new("p".into(), "k".into(), "m".into());
        let listing = StaticCatalog::new(pictures, keywords).load(&media).unwrap();
        StimulusSet::new(listing, DEVICE)
    }

    fn quick_config() -> TrainingConfig {
        TrainingConfig {
            min_samples_per_entity: 10,
            min_stream_len: 40,
            fit: FitSettings {
                hidden_units: 4,
                max_iterations: 60,
                ..FitSettings::default()
            },
            kmeans_iterations: 5,
            hmm_iterations: 5,
            ..TrainingConfig::default()
        }
    }

    fn data(pictures: usize, keywords: usize, per_entity: usize, stream_len: usize) -> StimulusData {
        let mut rng = Prng::new(21);
        let mut data = StimulusData::with_catalog(pictures, keywords);
        for seq in 0..stream_len as u64 {
            data.stream.push(seq * 2, vec![rng.next_f32_01(), rng.next_f32_01()]);
        }
        let mut seq = 1;
        for slot in data.slots() {
            if slot == DatasetSlot::Sound {
                continue;
            }
            for _ in 0..per_entity {
                let before = [rng.next_f32_01(), rng.next_f32_01()];
                let after = [rng.next_f32_01(), rng.next_f32_01()];
                let s = MeasurementSample::from_readings(&before, &after, 0.2, one_hot(0, 2), Vec::new(), seq).unwrap();
                seq += 2;
                if let Some(ds) = data.dataset_mut(slot) {
                    ds.push(s);
                }
            }
        }
        data
    }

    fn scheduler(cfg: TrainingConfig) -> TrainingScheduler {
        TrainingScheduler::new(cfg, 2, 3, Duration::from_secs(5), Prng::new(3))
    }

    fn run_until_done(sched: &mut TrainingScheduler, ctx: &mut TrainingContext<'_>) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while sched.advance(ctx).unwrap() == Advance::Working {
            assert!(Instant::now() < deadline, "training did not finish; stage {:?}", sched.stage());
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn preconditions_reject_thin_data() {
        let cfg = quick_config();
        let set = stimuli(&["a.png", "b.png"], &[]);
        let jobs = plan_jobs(&set, DEVICE, false, false);

        let few = data(2, 0, 5, 100);
        assert!(matches!(
            check_preconditions(&cfg, &jobs, &few),
            Err(EngineError::DataInsufficiency(_))
        ));
        let short = data(2, 0, 20, 10);
        assert!(matches!(
            check_preconditions(&cfg, &jobs, &short),
            Err(EngineError::DataInsufficiency(_))
        ));
        assert!(check_preconditions(&cfg, &jobs, &data(2, 0, 20, 100)).is_ok());

        // Sound is planned but its dataset is empty.
        let with_sound = plan_jobs(&set, DEVICE, true, false);
        assert!(check_preconditions(&cfg, &with_sound, &data(2, 0, 20, 100)).is_err());
    }

    /// Counts model saves per entity on top of an in-memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        model_saves: std::sync::Mutex<hashbrown::HashMap<EntityKey, usize>>,
    }

    impl CountingStore {
        fn saves(&self, key: &EntityKey) -> usize {
            self.model_saves.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    impl Store for CountingStore {
        fn load(&self, dir: &Path, key: &EntityKey, kind: BlobKind) -> std::io::Result<Option<Vec<u8>>> {
            self.inner.load(dir, key, kind)
        }

        fn save(&self, dir: &Path, key: &EntityKey, kind: BlobKind, bytes: &[u8]) -> std::io::Result<()> {
            if kind == BlobKind::Model {
                *self.model_saves.lock().unwrap().entry(key.clone()).or_default() += 1;
            }
            self.inner.save(dir, key, kind, bytes)
        }

        fn clear(&self, dir: &Path) -> std::io::Result<usize> {
            self.inner.clear(dir)
        }
    }

    #[test]
    fn interrupted_runs_train_each_entity_exactly_once() {
        let names: Vec<String> = (0..5).map(|i| format!("p{i}.png")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let set = stimuli(&refs, &["calm"]);
        let mut rng = Prng::new(77);

        for round in 0..6 {
            let shared = SharedData::new(data(5, 1, 12, 60));
            let estimator = BrainStateEstimator::new(2, Some(1));
            let store = CountingStore::default();
            let mut book = ModelBook::with_catalog(5, 1);
            let dir = Path::new("m");
            let mut sched = scheduler(quick_config());

            // Stop at random points, then resume from the same data.
            for _ in 0..rng.gen_range_usize(1, 5) {
                sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
                let mut ctx = TrainingContext {
                    data: &shared,
                    estimator: &estimator,
                    models: &mut book,
                    store: &store,
                    model_dir: dir,
                    device_id: DEVICE,
                };
                for _ in 0..rng.gen_range_usize(0, 40) {
                    if sched.advance(&mut ctx).unwrap() == Advance::Done {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(rng.gen_range_usize(0, 4) as u64));
                }
                sched.stop().unwrap();
                let done: Vec<bool> = sched.jobs().iter().map(|j| j.tag == JobTag::Done).collect();
                for (job, finished) in sched.jobs().iter().zip(&done) {
                    assert_eq!(store.saves(&job.key), usize::from(*finished), "round {round}: {}", job.name);
                }
            }

            sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
            let mut ctx = TrainingContext {
                data: &shared,
                estimator: &estimator,
                models: &mut book,
                store: &store,
                model_dir: dir,
                device_id: DEVICE,
            };
            run_until_done(&mut sched, &mut ctx);
            for job in sched.jobs() {
                assert_eq!(store.saves(&job.key), 1, "round {round}: {}", job.name);
            }
            assert_eq!(book.loaded(), (5, 1));
        }
    }

    #[test]
    fn pipeline_publishes_every_entity_once() {
        let set = stimuli(&["a.png", "b.png"], &["calm"]);
        let shared = SharedData::new(data(2, 1, 12, 80));
        let estimator = BrainStateEstimator::new(2, Some(1));
        let store = MemoryStore::new();
        let mut book = ModelBook::with_catalog(2, 1);
        let dir = Path::new("models");

        let mut sched = scheduler(quick_config());
        sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
        assert_eq!(sched.stage(), Stage::StateModel);
        let mut ctx = TrainingContext {
            data: &shared,
            estimator: &estimator,
            models: &mut book,
            store: &store,
            model_dir: dir,
            device_id: DEVICE,
        };
        run_until_done(&mut sched, &mut ctx);

        assert!(sched.is_done());
        assert_eq!(sched.percent(), 100.0);
        assert!(estimator.model().is_some());
        assert_eq!(book.loaded(), (2, 1));
        for e in set.pictures().iter().chain(set.keywords()) {
            assert!(store.contains(dir, &e.key, crate::store::BlobKind::Model), "{}", e.name);
        }
        assert!(store::load_state_model(&store, dir, DEVICE).unwrap().is_some());
    }

    #[test]
    fn stop_keeps_finished_entities_until_data_changes() {
        let set = stimuli(&["a.png", "b.png", "c.png"], &[]);
        let shared = SharedData::new(data(3, 0, 12, 80));
        let estimator = BrainStateEstimator::new(2, Some(1));
        let store = MemoryStore::new();
        let mut book = ModelBook::with_catalog(3, 0);
        let mut sched = scheduler(quick_config());
        sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();

        {
            let mut ctx = TrainingContext {
                data: &shared,
                estimator: &estimator,
                models: &mut book,
                store: &store,
                model_dir: Path::new("m"),
                device_id: DEVICE,
            };
            let deadline = Instant::now() + Duration::from_secs(60);
            while sched.jobs()[0].tag != JobTag::Done {
                assert!(Instant::now() < deadline);
                sched.advance(&mut ctx).unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        sched.stop().unwrap();
        assert!(sched.jobs()[1..].iter().all(|j| j.tag == JobTag::NotStarted));

        // Same catalog and data: progress survives.
        sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
        assert_eq!(sched.jobs()[0].tag, JobTag::Done);
        assert_eq!(sched.next_pending(), Some(1));

        // A new measurement invalidates it.
        {
            let mut guard = shared.lock();
            let s = MeasurementSample::from_readings(&[0.5, 0.5], &[0.6, 0.6], 0.2, one_hot(1, 2), Vec::new(), 10_001)
                .unwrap();
            guard.pictures[2].push(s);
        }
        sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
        assert_eq!(sched.next_pending(), Some(0));
        assert_eq!(sched.stage(), Stage::StateModel);
    }

    #[test]
    fn uncertainty_phase_yields_ensembles() {
        let cfg = TrainingConfig {
            uncertainty: true,
            posterior: crate::model::PosteriorSettings {
                samples: 3,
                burn_in: 5,
                thin: 2,
                ..Default::default()
            },
            ..quick_config()
        };
        let set = stimuli(&["a.png"], &[]);
        let shared = SharedData::new(data(1, 0, 12, 60));
        let estimator = BrainStateEstimator::new(2, Some(1));
        let store = MemoryStore::new();
        let mut book = ModelBook::with_catalog(1, 0);
        let mut sched = scheduler(cfg);
        sched.prepare(&set, &shared.lock(), DEVICE, false).unwrap();
        let mut ctx = TrainingContext {
            data: &shared,
            estimator: &estimator,
            models: &mut book,
            store: &store,
            model_dir: Path::new("m"),
            device_id: DEVICE,
        };
        run_until_done(&mut sched, &mut ctx);
        assert!(book.pictures[0].as_ref().unwrap().is_ensemble());
    }

    #[test]
    fn advance_without_prepare_is_a_configuration_error() {
        let shared = SharedData::default();
        let estimator = BrainStateEstimator::new(2, None);
        let store = MemoryStore::new();
        let mut book = ModelBook::default();
        let mut sched = scheduler(quick_config());
        let mut ctx = TrainingContext {
            data: &shared,
            estimator: &estimator,
            models: &mut book,
            store: &store,
            model_dir: Path::new("m"),
            device_id: DEVICE,
        };
        assert!(matches!(sched.advance(&mut ctx), Err(EngineError::Configuration(_))));
        assert!(sched.stop().is_ok());
    }
}
