//! One [`ModeHandler`] per command kind.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandKind, ExecuteFlags, MediaSources, SignalTarget};
use crate::controller::{EngineContext, ModeHandler, TickOutcome};
use crate::dataset::{DatasetSlot, MeasurementSample};
use crate::decision::{DecisionInput, Selection};
use crate::error::{EngineError, Result};
use crate::program::{self, ExecutionProgram, ProgramStats};
use crate::training::{Advance, TrainingContext};

pub fn handler_for(cmd: Command) -> Box<dyn ModeHandler> {
    match cmd {
        Command::Idle { show_screen } => Box::new(IdleMode::new(show_screen)),
        Command::ShowRandom { media } => Box::new(ShowRandomMode { media }),
        Command::Measure { media } => Box::new(MeasureMode {
            media,
            disconnected: None,
            samples: 0,
        }),
        Command::Optimize { media } => Box::new(OptimizeMode { media }),
        Command::Execute { media, targets, flags } => Box::new(ExecuteMode::new(media, targets, flags)),
        Command::MeasureProgram {
            media_file,
            signals,
            length,
        } => Box::new(MeasureProgramMode {
            media_file,
            signals,
            length,
            columns: Vec::new(),
            buffer: Vec::new(),
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Idle / ShowRandom
// ═══════════════════════════════════════════════════════════════════════════

pub struct IdleMode {
    show_screen: bool,
}

impl IdleMode {
    pub fn new(show_screen: bool) -> Self {
        Self { show_screen }
    }
}

impl ModeHandler for IdleMode {
    fn kind(&self) -> CommandKind {
        CommandKind::Idle
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        ctx.presenter.set_visible(self.show_screen);
        ctx.shared.set_status("idle");
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut EngineContext) -> Result<TickOutcome> {
        Ok(TickOutcome::Continue)
    }

    fn on_exit(&mut self, _ctx: &mut EngineContext) {}
}

struct ShowRandomMode {
    media: MediaSources,
}

impl ModeHandler for ShowRandomMode {
    fn kind(&self) -> CommandKind {
        CommandKind::ShowRandom
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        ctx.load_media(&self.media)?;
        ctx.presenter.set_visible(true);
        ctx.shared.set_status("showing random stimuli");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome> {
        let (p, k) = (ctx.stimuli.pictures().len(), ctx.stimuli.keywords().len());
        let selection = ctx.decision.select_random(p, k);
        ctx.show(&selection);
        Ok(TickOutcome::Continue)
    }

    fn on_exit(&mut self, _ctx: &mut EngineContext) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// Measure
// ═══════════════════════════════════════════════════════════════════════════

struct MeasureMode {
    media: MediaSources,
    disconnected: Option<Instant>,
    samples: usize,
}

impl ModeHandler for MeasureMode {
    fn kind(&self) -> CommandKind {
        CommandKind::Measure
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        ctx.load_media(&self.media)?;
        if ctx.stimuli.is_empty() && ctx.sound_dims() == 0 {
            return Err(EngineError::config("nothing to measure: catalog is empty"));
        }
        ctx.decision.configure(ctx.config.decision.clone());
        ctx.presenter.set_visible(true);
        ctx.recording_stream = true;
        ctx.shared.set_status("measuring");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome> {
        if !ctx.check_device(&mut self.disconnected)? {
            ctx.shared.set_status("measuring (device disconnected)");
            return Ok(TickOutcome::Continue);
        }
        let Some(before) = ctx.read_signal() else {
            return Ok(TickOutcome::Continue);
        };
        let (p, k) = (ctx.stimuli.pictures().len(), ctx.stimuli.keywords().len());
        let selection = ctx.decision.select_random(p, k);
        // Stamp the sample before the hold so stream entries recorded during it sort after.
        let state = ctx.estimator.one_hot();
        let seq = ctx.next_sequence();
        ctx.show(&selection);
        let hold = ctx.config.measure_hold;
        ctx.wait_until(Instant::now() + hold, None);
        let Some(after) = ctx.read_signal() else {
            return Ok(TickOutcome::Continue);
        };

        let mut targets: Vec<(DatasetSlot, Vec<f32>)> = Vec::with_capacity(3);
        if let Some(i) = selection.picture {
            targets.push((DatasetSlot::Picture(i), ctx.stimuli.pictures()[i].features.clone()));
        }
        if let Some(i) = selection.keyword {
            targets.push((DatasetSlot::Keyword(i), ctx.stimuli.keywords()[i].features.clone()));
        }
        if let Some(params) = &selection.sound {
            targets.push((DatasetSlot::Sound, params.clone()));
        }

        let hold_secs = hold.as_secs_f32();
        let mut rejected = None;
        let mut accepted = Vec::with_capacity(targets.len());
        for (slot, features) in targets {
            match MeasurementSample::from_readings(&before, &after, hold_secs, state.clone(), features, seq) {
                Ok(sample) => accepted.push((slot, sample)),
                Err(e) => rejected = Some(e),
            }
        }
        if let Some(e) = rejected {
            warn!(error = %e, "measurement dropped");
            return Ok(TickOutcome::Continue);
        }
        {
            let mut data = ctx.data.lock();
            for (slot, sample) in accepted {
                if let Some(ds) = data.dataset_mut(slot) {
                    ds.push(sample);
                }
            }
        }
        self.samples += 1;
        ctx.shared.set_status(format!("measuring: {} samples", self.samples));
        Ok(TickOutcome::Continue)
    }

    fn on_exit(&mut self, ctx: &mut EngineContext) {
        ctx.recording_stream = false;
        ctx.persist_datasets();
        info!(samples = self.samples, "measurement stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Optimize
// ═══════════════════════════════════════════════════════════════════════════

struct OptimizeMode {
    media: MediaSources,
}

impl ModeHandler for OptimizeMode {
    fn kind(&self) -> CommandKind {
        CommandKind::Optimize
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        ctx.load_media(&self.media)?;
        ctx.training.configure(ctx.config.training.clone());
        let sound = ctx.sound_dims() > 0;
        {
            let data = ctx.data.lock();
            ctx.training.prepare(&ctx.stimuli, &data, &ctx.device_id, sound)?;
        }
        ctx.shared.set_status("optimizing: 0%");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome> {
        let mut tctx = TrainingContext {
            data: &ctx.data,
            estimator: &ctx.estimator,
            models: &mut ctx.models,
            store: ctx.store.as_ref(),
            model_dir: &self.media.model_dir,
            device_id: &ctx.device_id,
        };
        let step = ctx.training.advance(&mut tctx)?;
        let percent = ctx.training.percent();
        let status = match ctx.training.eta() {
            Some(eta) => format!(
                "optimizing: {percent:.1}% ({:?}, ETA {}s)",
                ctx.training.stage(),
                eta.as_secs()
            ),
            None => format!("optimizing: {percent:.1}% ({:?})", ctx.training.stage()),
        };
        ctx.shared.set_status(status);
        Ok(match step {
            Advance::Working => TickOutcome::Continue,
            Advance::Done => TickOutcome::Finished,
        })
    }

    fn on_exit(&mut self, ctx: &mut EngineContext) {
        if let Err(e) = ctx.training.stop() {
            error!(error = %e, "training workers did not stop");
        }
        ctx.persist_datasets();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Execute
// ═══════════════════════════════════════════════════════════════════════════

struct ExecuteMode {
    media: MediaSources,
    targets: Vec<SignalTarget>,
    flags: ExecuteFlags,
    program: Option<ExecutionProgram>,
    random: bool,
    sim_secs: f32,
    started: Instant,
    disconnected: Option<Instant>,
    stats: ProgramStats,
}

impl ExecuteMode {
    fn new(media: MediaSources, targets: Vec<SignalTarget>, flags: ExecuteFlags) -> Self {
        Self {
            media,
            targets,
            flags,
            program: None,
            random: false,
            sim_secs: 0.0,
            started: Instant::now(),
            disconnected: None,
            stats: ProgramStats::default(),
        }
    }
}

impl ModeHandler for ExecuteMode {
    fn kind(&self) -> CommandKind {
        CommandKind::Execute
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        let program = ExecutionProgram::build(&ctx.signal_names, &self.targets)?;
        ctx.load_media(&self.media)?;
        self.random = ctx.config.random_programs;
        self.flags.looping |= ctx.config.default_loop;
        self.flags.blind |= ctx.config.default_blind;
        if !self.random {
            ctx.load_models(&self.media)?;
        }
        ctx.decision.configure(ctx.config.decision.clone());
        ctx.decision.release();
        if let Some(audio) = &self.media.audio_file {
            if !ctx.presenter.play_media(audio) {
                warn!(file = %audio.display(), "audio playback did not start");
            }
        }
        ctx.presenter.set_visible(true);
        ctx.shared.set_program_stats(ProgramStats::default());
        info!(
            steps = program.len(),
            looping = self.flags.looping,
            blind = self.flags.blind,
            random = self.random,
            "executing program"
        );
        self.program = Some(program);
        self.started = Instant::now();
        ctx.shared.set_status("executing");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome> {
        let Some(program) = &self.program else {
            return Ok(TickOutcome::Finished);
        };
        let live = if self.flags.blind {
            None
        } else {
            if !ctx.check_device(&mut self.disconnected)? {
                ctx.shared.set_status("executing (device disconnected)");
                return Ok(TickOutcome::Continue);
            }
            match ctx.read_signal() {
                Some(s) => Some(s),
                None => return Ok(TickOutcome::Continue),
            }
        };

        let mut index = (self.sim_secs * ctx.config.program_hz).floor() as usize;
        if index >= program.len() {
            if !self.flags.looping {
                return Ok(TickOutcome::Finished);
            }
            debug!("program rewound");
            self.sim_secs = 0.0;
            index = 0;
        }
        let Some(step) = program.step(index) else {
            return Ok(TickOutcome::Finished);
        };

        let elapsed = ctx.config.tick_secs();
        let state = ctx.estimator.one_hot();
        let selection = if self.random {
            let (p, k) = (ctx.stimuli.pictures().len(), ctx.stimuli.keywords().len());
            ctx.decision.select_random(p, k)
        } else if let Some(signal) = &live {
            let input = DecisionInput {
                signal,
                state: &state,
                target: &step.target,
                tolerance: &step.tolerance,
                elapsed_secs: elapsed,
            };
            ctx.decision.select_next(&ctx.models, &ctx.stimuli, &input)
        } else {
            ctx.decision
                .select_blind(&ctx.models, &ctx.stimuli, &state, &step.target, &step.tolerance, elapsed)
        };
        if selection == Selection::default() {
            debug!("no usable candidate this tick");
        }
        ctx.show(&selection);
        if self.flags.record_video {
            let ms = self.started.elapsed().as_millis() as u64;
            if !ctx.presenter.insert_frame(ms) {
                warn!(timestamp_ms = ms, "frame not recorded");
            }
        }

        let current = live.or_else(|| ctx.decision.swarm_mean());
        if let Some(current) = current {
            if let Some(rms) = self.stats.record(&current, step) {
                ctx.shared.set_program_stats(self.stats);
                ctx.shared
                    .set_status(format!("executing: step {}/{}, rms {rms:.4}", index + 1, program.len()));
            }
        }
        self.sim_secs += elapsed;
        Ok(TickOutcome::Continue)
    }

    fn on_exit(&mut self, ctx: &mut EngineContext) {
        ctx.decision.release();
        ctx.presenter.stop_media();
        if self.stats.ticks > 0 {
            info!("{}", self.stats);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MeasureProgram
// ═══════════════════════════════════════════════════════════════════════════

struct MeasureProgramMode {
    media_file: PathBuf,
    signals: Vec<String>,
    length: usize,
    /// Device channel of each requested signal.
    columns: Vec<usize>,
    buffer: Vec<Vec<f32>>,
}

impl ModeHandler for MeasureProgramMode {
    fn kind(&self) -> CommandKind {
        CommandKind::MeasureProgram
    }

    fn on_enter(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.columns = self
            .signals
            .iter()
            .map(|s| {
                ctx.signal_names
                    .iter()
                    .position(|n| n == s)
                    .ok_or_else(|| EngineError::config(format!("unknown signal `{s}`")))
            })
            .collect::<Result<_>>()?;
        if !ctx.presenter.play_media(&self.media_file) {
            return Err(EngineError::config(format!(
                "cannot play media file {}",
                self.media_file.display()
            )));
        }
        ctx.shared.set_measured_program(None);
        ctx.shared.set_status("measuring program");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut EngineContext) -> Result<TickOutcome> {
        if ctx.presenter.media_playing() {
            if let Some(reading) = ctx.read_signal() {
                let row = self.columns.iter().filter_map(|&c| reading.get(c).copied()).collect();
                self.buffer.push(row);
            }
            return Ok(TickOutcome::Continue);
        }
        if self.buffer.is_empty() {
            warn!("media ended before any signal was recorded");
        }
        let program = program::resample(&self.buffer, self.columns.len(), self.length);
        info!(readings = self.buffer.len(), steps = self.length, "program measured");
        ctx.shared.set_measured_program(Some(program));
        Ok(TickOutcome::Finished)
    }

    fn on_exit(&mut self, ctx: &mut EngineContext) {
        ctx.presenter.stop_media();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::EngineConfig;
    use crate::controller::EngineShared;
    use crate::device::NoDevice;
    use crate::presenter::{HeadlessPresenter, Presenter};
    use crate::store::MemoryStore;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn context(config: EngineConfig, presenter: HeadlessPresenter) -> (EngineContext, Arc<Mutex<HeadlessPresenter>>) {
        let presenter = Arc::new(Mutex::new(presenter));
        let ctx = EngineContext::new(
            Arc::new(EngineShared::new(config)),
            Box::new(NoDevice::new(2)),
            Box::new(Arc::clone(&presenter)),
            Arc::new(StaticCatalog::new(&["a.png", "b.png"], &["calm"])),
            Arc::new(MemoryStore::new()),
        );
        (ctx, presenter)
    }

    fn media() -> MediaSources {
        MediaSources::new("pics".into(), "words.txt".into(), "models".into())
    }

    /// Ticks until the mode finishes; `None` if it is still running after `limit` ticks.
    fn run(mode: &mut dyn ModeHandler, ctx: &mut EngineContext, limit: usize) -> Option<usize> {
        (1..=limit).find(|_| mode.on_tick(ctx).unwrap() == TickOutcome::Finished)
    }

    fn execute(looping: bool) -> Command {
        Command::Execute {
            media: media(),
            targets: vec![SignalTarget::constant("Empty signal 1", 0.7, 2)],
            flags: ExecuteFlags {
                looping,
                ..ExecuteFlags::default()
            },
        }
    }

    #[test]
    fn measure_program_buffers_while_media_plays() {
        let (mut ctx, presenter) = context(EngineConfig::default(), HeadlessPresenter::new().with_media_length(6));
        let mut mode = handler_for(Command::MeasureProgram {
            media_file: "song.wav".into(),
            signals: vec!["Empty signal 2".to_string()],
            length: 3,
        });
        mode.on_enter(&mut ctx).unwrap();
        assert_eq!(run(mode.as_mut(), &mut ctx, 20), Some(7));
        mode.on_exit(&mut ctx);

        let program = ctx.shared.measured_program().unwrap();
        assert_eq!(program.len(), 3);
        assert!(program.iter().all(|step| step.len() == 1 && (step[0] - 0.5).abs() < 1e-6));
        assert!(!presenter.lock().unwrap().media_playing());
    }

    #[test]
    fn measure_program_needs_known_signals_and_playable_media() {
        let (mut ctx, _) = context(EngineConfig::default(), HeadlessPresenter::new().with_media_length(3));
        let mut unknown = handler_for(Command::MeasureProgram {
            media_file: "song.wav".into(),
            signals: vec!["gamma".to_string()],
            length: 3,
        });
        assert!(matches!(unknown.on_enter(&mut ctx), Err(EngineError::Configuration(_))));

        let (mut silent, _) = context(EngineConfig::default(), HeadlessPresenter::new());
        let mut mode = handler_for(Command::MeasureProgram {
            media_file: "song.wav".into(),
            signals: vec!["Empty signal 1".to_string()],
            length: 3,
        });
        assert!(matches!(mode.on_enter(&mut silent), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn random_execute_stops_at_program_end_unless_looping() {
        let mut config = EngineConfig::default().with_tick(Duration::from_millis(500));
        config.set_parameter("random-programs", "true").unwrap();

        let (mut ctx, presenter) = context(config.clone(), HeadlessPresenter::new());
        let mut once = handler_for(execute(false));
        once.on_enter(&mut ctx).unwrap();
        // Two program seconds at half a second per tick.
        assert_eq!(run(once.as_mut(), &mut ctx, 10), Some(5));
        assert_eq!(presenter.lock().unwrap().shows(), 4);
        let stats = ctx.shared.program_stats();
        assert_eq!(stats.ticks, 4);
        assert!((stats.last_rms - 0.2).abs() < 1e-5);
        once.on_exit(&mut ctx);

        let (mut ctx, _) = context(config, HeadlessPresenter::new());
        let mut looping = handler_for(execute(true));
        looping.on_enter(&mut ctx).unwrap();
        assert_eq!(run(looping.as_mut(), &mut ctx, 20), None);
        looping.on_exit(&mut ctx);
    }

    #[test]
    fn execute_without_models_fails_on_entry() {
        let (mut ctx, _) = context(EngineConfig::default(), HeadlessPresenter::new());
        let mut mode = handler_for(execute(false));
        assert!(matches!(mode.on_enter(&mut ctx), Err(EngineError::ModelLoad { .. })));
    }

    #[test]
    fn measure_records_one_sample_per_tick() {
        let config = EngineConfig::default().with_measure_hold(Duration::from_millis(1));
        let (mut ctx, _) = context(config, HeadlessPresenter::new());
        let mut mode = handler_for(Command::Measure { media: media() });
        mode.on_enter(&mut ctx).unwrap();
        assert!(ctx.recording_stream);
        for _ in 0..5 {
            assert_eq!(mode.on_tick(&mut ctx).unwrap(), TickOutcome::Continue);
        }
        mode.on_exit(&mut ctx);
        assert!(!ctx.recording_stream);

        let data = ctx.data.lock();
        let pictures: usize = data.pictures.iter().map(|d| d.len()).sum();
        assert_eq!(pictures, 5);
        assert_eq!(data.keywords[0].len(), 5);
        let seqs: Vec<u64> = data.keywords[0].sequences();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert!(data.keywords[0].samples().iter().all(|s| s.delta.iter().all(|d| *d == 0.0)));
    }

    #[test]
    fn measured_samples_precede_the_stream_of_their_hold() {
        let config = EngineConfig::default()
            .with_measure_hold(Duration::from_millis(20))
            .with_estimator_period(Duration::from_millis(1));
        let (mut ctx, _) = context(config, HeadlessPresenter::new());
        let mut mode = handler_for(Command::Measure { media: media() });
        mode.on_enter(&mut ctx).unwrap();
        let mut spans = Vec::new();
        for _ in 0..4 {
            let first = ctx.data.lock().stream.entries().len();
            assert_eq!(mode.on_tick(&mut ctx).unwrap(), TickOutcome::Continue);
            let last = ctx.data.lock().stream.entries().len();
            spans.push((first, last));
        }
        mode.on_exit(&mut ctx);

        let data = ctx.data.lock();
        let samples = data.keywords[0].sequences();
        assert_eq!(samples.len(), 4);
        let stream = data.stream.entries();
        assert!(spans.iter().any(|(first, last)| last > first));
        for (seq, (first, last)) in samples.iter().zip(&spans) {
            for entry in &stream[*first..*last] {
                assert!(*seq < entry.sequence);
            }
            for entry in &stream[..*first] {
                assert!(entry.sequence < *seq);
            }
        }
    }
}
