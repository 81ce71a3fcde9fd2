//! Adaptive neurofeedback engine.
//!
//! The engine learns, per stimulus, how a measured signal vector tends to
//! change while that stimulus is shown, and then drives the signal toward a
//! target trajectory by choosing what to show next. See [`engine::Engine`] for
//! the public handle.

#[path = "core/analysis.rs"]
pub mod analysis;

#[path = "core/catalog.rs"]
pub mod catalog;

#[path = "core/command.rs"]
pub mod command;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/controller.rs"]
pub mod controller;

#[path = "core/dataset.rs"]
pub mod dataset;

#[path = "core/decision.rs"]
pub mod decision;

#[path = "core/device.rs"]
pub mod device;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/estimator.rs"]
pub mod estimator;

#[path = "core/hidden_state.rs"]
pub mod hidden_state;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/modes.rs"]
pub mod modes;

#[path = "core/presenter.rs"]
pub mod presenter;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/program.rs"]
pub mod program;

#[path = "core/relabel.rs"]
pub mod relabel;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/store.rs"]
pub mod store;

#[path = "core/training.rs"]
pub mod training;

#[path = "core/worker.rs"]
pub mod worker;

pub mod observer;

pub mod prelude {
    pub use crate::catalog::{Catalog, DirCatalog, StaticCatalog};
    pub use crate::command::{Command, CommandKind, ExecuteFlags, MediaSources, SignalTarget};
    pub use crate::config::{DecisionConfig, EngineConfig, TrainingConfig};
    pub use crate::device::{Device, NoDevice, RandomDevice};
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, Result};
    pub use crate::observer::EngineSnapshot;
    pub use crate::presenter::{HeadlessPresenter, Presenter};
    pub use crate::store::{FileStore, MemoryStore, Store};
}
