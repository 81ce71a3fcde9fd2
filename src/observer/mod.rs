#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::controller::Controller;
use crate::dataset::Dataset;
use crate::program::ProgramStats;
use crate::training::Stage;

/// A read-only snapshot of what the engine is doing.
///
/// Design intent:
/// - Observers cannot steer the engine; commands go through the pending slot.
/// - The loop publishes one snapshot per tick, so readers never take the
///   dataset or estimator locks themselves.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineSnapshot {
    pub status: String,
    pub command: CommandKind,
    pub busy: bool,

    pub brain_state: usize,
    pub state_count: usize,

    /// Only set while optimizing.
    pub stage: Option<Stage>,
    pub training_percent: Option<f32>,
    pub training_eta_secs: Option<f32>,

    pub program: ProgramStats,

    pub pictures: usize,
    pub keywords: usize,
    pub models_loaded: (usize, usize),
    pub samples: usize,
    pub stream_len: usize,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            status: "idle".to_string(),
            command: CommandKind::Idle,
            busy: false,
            brain_state: 0,
            state_count: 0,
            stage: None,
            training_percent: None,
            training_eta_secs: None,
            program: ProgramStats::default(),
            pictures: 0,
            keywords: 0,
            models_loaded: (0, 0),
            samples: 0,
            stream_len: 0,
        }
    }
}

pub struct ControllerAdapter<'a> {
    controller: &'a Controller,
}

impl<'a> ControllerAdapter<'a> {
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let ctx = self.controller.context();
        let command = self.controller.current_kind();
        let optimizing = command == CommandKind::Optimize;

        let (samples, stream_len) = {
            let data = ctx.data.lock();
            let samples = data
                .slots()
                .iter()
                .filter_map(|s| data.dataset(*s))
                .map(Dataset::len)
                .sum();
            (samples, data.stream.len())
        };

        EngineSnapshot {
            status: ctx.shared.status(),
            command,
            busy: ctx.shared.is_busy(),

            brain_state: ctx.estimator.current_state(),
            state_count: ctx.estimator.state_count(),

            stage: optimizing.then(|| ctx.training.stage()),
            training_percent: optimizing.then(|| ctx.training.percent()),
            training_eta_secs: if optimizing {
                ctx.training.eta().map(|d| d.as_secs_f32())
            } else {
                None
            },

            program: ctx.shared.program_stats(),

            pictures: ctx.stimuli.pictures().len(),
            keywords: ctx.stimuli.keywords().len(),
            models_loaded: ctx.models.loaded(),
            samples,
            stream_len,
        }
    }
}
