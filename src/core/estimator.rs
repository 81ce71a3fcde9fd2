//! Online latent brain-state estimation.
//!
//! The estimator owns the state lock: the current [`HiddenStateModel`] pair and
//! the current state index live behind one mutex, so a model swap can never be
//! observed half-done. The lock is held only for a single cluster/transition
//! step and is never held while taking the dataset lock.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::dataset::one_hot;
use crate::hidden_state::HiddenStateModel;
use crate::prng::Prng;

/// State reported while no model is loaded.
pub const DEFAULT_STATE: usize = 0;

#[derive(Debug)]
struct EstimatorState {
    model: Option<Arc<HiddenStateModel>>,
    current: usize,
    /// Width of the one-hot encoding while no model is loaded.
    fallback_states: usize,
    rng: Prng,
}

#[derive(Debug, Clone)]
pub struct BrainStateEstimator {
    inner: Arc<Mutex<EstimatorState>>,
}

impl BrainStateEstimator {
    pub fn new(fallback_states: usize, seed: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EstimatorState {
                model: None,
                current: DEFAULT_STATE,
                fallback_states: fallback_states.max(1),
                rng: Prng::from_seed(seed),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EstimatorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Draw a starting state from the model's initial distribution.
    /// Without a model the state stays at [`DEFAULT_STATE`].
    pub fn initialize(&self) {
        let mut st = self.lock();
        let EstimatorState { model, current, rng, .. } = &mut *st;
        *current = match model {
            Some(m) => m.transitions().sample_initial(rng),
            None => DEFAULT_STATE,
        };
    }

    /// Advance the chain with one live sample and return the new state.
    ///
    /// Inert without a model, and for samples of the wrong dimension.
    pub fn update(&self, sample: &[f32]) -> usize {
        let mut st = self.lock();
        if let Some(model) = &st.model {
            let next = model.step(st.current, sample);
            st.current = next;
        }
        st.current
    }

    /// Replace the model pair in one step. The current state is kept unless
    /// `reset` is set (or it no longer fits the new model).
    pub fn swap_model(&self, model: Option<Arc<HiddenStateModel>>, reset: bool) {
        let mut st = self.lock();
        let states = model.as_ref().map_or(st.fallback_states, |m| m.state_count());
        st.model = model;
        if reset || st.current >= states {
            st.current = DEFAULT_STATE;
        }
    }

    pub fn model(&self) -> Option<Arc<HiddenStateModel>> {
        self.lock().model.clone()
    }

    pub fn current_state(&self) -> usize {
        self.lock().current
    }

    pub fn state_count(&self) -> usize {
        let st = self.lock();
        st.model.as_ref().map_or(st.fallback_states, |m| m.state_count())
    }

    /// Current state and one-hot width read under a single lock acquisition.
    pub fn one_hot(&self) -> Vec<f32> {
        let st = self.lock();
        let states = st.model.as_ref().map_or(st.fallback_states, |m| m.state_count());
        one_hot(st.current, states)
    }
}
