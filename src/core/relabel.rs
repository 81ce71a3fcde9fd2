//! Background re-labeling of collected samples after a state-model swap.
//!
//! Every stored [`MeasurementSample`](crate::dataset::MeasurementSample)
//! carries the hidden state it was measured in, computed under whatever model
//! was active back then. Once a new model is trained, the relabeler walks all
//! datasets and replays the new chain over the raw stream leading up to each
//! sample. It only holds the dataset lock, one dataset at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dataset::{one_hot, SharedData, SignalStream};
use crate::error::WorkerError;
use crate::hidden_state::HiddenStateModel;
use crate::worker::{BackgroundJob, CancelToken, JobPoll};

/// Number of stream positions replayed before a sample's own position.
pub const LOOKBACK: usize = 10;

/// Hidden state at the moment `sequence` was recorded, replayed from
/// [`LOOKBACK`] positions earlier using only stream entries older than it.
pub fn replay_state(model: &HiddenStateModel, stream: &SignalStream, sequence: u64) -> usize {
    let mut state = model.transitions().most_likely_initial();
    let Some(located) = stream.position_at_or_after(sequence) else {
        return state;
    };
    let entries = stream.entries();
    let end = if entries[located].sequence < sequence {
        located + 1
    } else {
        located
    };
    let start = end.saturating_sub(LOOKBACK);
    for entry in &entries[start..end] {
        state = model.step(state, &entry.signal);
    }
    state
}

#[derive(Default)]
pub struct HistoricalRelabeler {
    job: Option<BackgroundJob<usize>>,
    processed: Arc<AtomicUsize>,
}

impl HistoricalRelabeler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass over every dataset. Any previous pass is stopped first.
    pub fn start(
        &mut self,
        model: Arc<HiddenStateModel>,
        data: SharedData,
        join_timeout: Duration,
    ) -> Result<(), WorkerError> {
        self.stop(join_timeout)?;
        self.processed.store(0, Ordering::SeqCst);
        let processed = Arc::clone(&self.processed);
        let job = BackgroundJob::spawn("relabel", move |cancel| {
            relabel_all(&model, &data, &processed, cancel)
        })?;
        self.job = Some(job);
        Ok(())
    }

    pub fn is_running(&mut self) -> bool {
        let Some(job) = self.job.as_mut() else {
            return false;
        };
        match job.poll() {
            JobPoll::Running => true,
            JobPoll::Finished(n) => {
                info!(samples = n, "relabeling pass finished");
                self.job = None;
                false
            }
            JobPoll::Cancelled | JobPoll::Failed => {
                self.job = None;
                false
            }
        }
    }

    /// Samples relabeled so far in the current (or last) pass.
    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Cancel the pass and wait for the worker. Safe when never started.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        match self.job.as_mut() {
            Some(job) => {
                job.stop(timeout)?;
                self.job = None;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn relabel_all(
    model: &HiddenStateModel,
    data: &SharedData,
    processed: &AtomicUsize,
    cancel: &CancelToken,
) -> Option<usize> {
    let (stream, slots) = {
        let guard = data.lock();
        (guard.stream.clone(), guard.slots())
    };
    let states = model.state_count();

    for slot in slots {
        if cancel.is_cancelled() {
            return None;
        }
        let Some(sequences) = data.lock().dataset(slot).map(|d| d.sequences()) else {
            continue;
        };

        let mut labels = Vec::with_capacity(sequences.len());
        for &seq in &sequences {
            if cancel.is_cancelled() {
                return None;
            }
            labels.push(one_hot(replay_state(model, &stream, seq), states));
        }

        let mut guard = data.lock();
        if let Some(ds) = guard.dataset_mut(slot) {
            // Samples are append-only; write back only to the ones we computed.
            for (i, label) in labels.into_iter().enumerate() {
                if ds.samples().get(i).map(|s| s.sequence) == Some(sequences[i]) {
                    ds.relabel(i, label);
                }
            }
        }
        drop(guard);
        processed.fetch_add(sequences.len(), Ordering::SeqCst);
        debug!(?slot, samples = sequences.len(), "relabeled dataset");
    }
    Some(processed.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{MeasurementSample, StimulusData};
    use crate::hidden_state::{ObservationClusterer, TransitionModel};
    use std::thread;
    use std::time::Instant;

    /// State follows the observed cluster: low signal → 0, high → 1.
    fn follower() -> HiddenStateModel {
        HiddenStateModel::new(
            ObservationClusterer::from_centroids(vec![vec![0.0], vec![1.0]]).unwrap(),
            TransitionModel::new(
                vec![0.9, 0.1],
                vec![vec![0.5, 0.5], vec![0.5, 0.5]],
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn sample(seq: u64) -> MeasurementSample {
        MeasurementSample::from_readings(&[0.5], &[0.5], 0.2, vec![1.0, 0.0], vec![], seq).unwrap()
    }

    #[test]
    fn replay_uses_entries_before_the_sample() {
        let model = follower();
        let mut stream = SignalStream::new();
        // Low until index 20, high afterwards (indices are gapped by 2).
        for i in 0..40u64 {
            stream.push(i * 2, vec![if i < 10 { 0.1 } else { 0.9 }]);
        }
        assert_eq!(replay_state(&model, &stream, 10), 0);
        assert_eq!(replay_state(&model, &stream, 20), 0);
        assert_eq!(replay_state(&model, &stream, 21), 1);
        // Past the end of the stream: every entry counts.
        assert_eq!(replay_state(&model, &stream, 500), 1);
        // Before the first entry: nothing to replay.
        assert_eq!(replay_state(&model, &stream, 0), 0);
    }

    #[test]
    fn pass_rewrites_every_label() {
        let mut data = StimulusData::with_catalog(2, 1);
        for i in 0..100u64 {
            data.stream.push(i, vec![if i >= 50 { 0.95 } else { 0.05 }]);
        }
        for seq in [10, 60, 80] {
            data.pictures[0].push(sample(seq));
            data.pictures[1].push(sample(seq + 1));
            data.keywords[0].push(sample(seq + 2));
        }
        let shared = SharedData::new(data);

        let mut relabeler = HistoricalRelabeler::new();
        relabeler
            .start(Arc::new(follower()), shared.clone(), Duration::from_secs(1))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while relabeler.is_running() {
            assert!(Instant::now() < deadline, "relabel pass hung");
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(relabeler.processed_count(), 9);

        let guard = shared.lock();
        let states: Vec<Vec<f32>> = guard.pictures[0].samples().iter().map(|s| s.state.clone()).collect();
        assert_eq!(states, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn stop_is_safe_without_start() {
        let mut relabeler = HistoricalRelabeler::new();
        assert!(relabeler.stop(Duration::from_millis(10)).is_ok());
        assert!(!relabeler.is_running());
        assert_eq!(relabeler.processed_count(), 0);
    }
}
