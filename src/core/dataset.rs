//! Measurement samples, per-entity datasets and the raw signal stream.

use std::io::{self, Cursor};
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::storage;

const TAG_DATASET: [u8; 4] = *b"DSET";
const TAG_STREAM: [u8; 4] = *b"STRM";

/// One stimulus presentation: the signal before it, how fast the signal moved
/// while it was shown, and the hidden state the user was in.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasurementSample {
    pub signal: Vec<f32>,
    /// Signal change per second over the display hold.
    pub delta: Vec<f32>,
    pub state: Vec<f32>,
    /// Entity features (sound parameters for the shared sound dataset, otherwise empty).
    pub features: Vec<f32>,
    pub sequence: u64,
}

impl MeasurementSample {
    /// Build a sample from the signal read before and after a display hold.
    ///
    /// Both readings must be finite and inside `[0, 1]`.
    pub fn from_readings(
        before: &[f32],
        after: &[f32],
        hold_secs: f32,
        state: Vec<f32>,
        features: Vec<f32>,
        sequence: u64,
    ) -> Result<Self, EngineError> {
        if before.is_empty() || before.len() != after.len() {
            return Err(EngineError::NumericAnomaly(format!(
                "reading length mismatch ({} vs {})",
                before.len(),
                after.len()
            )));
        }
        if !(hold_secs.is_finite() && hold_secs > 0.0) {
            return Err(EngineError::NumericAnomaly(format!(
                "hold duration {hold_secs} is not positive"
            )));
        }
        check_unit_range("pre-stimulus signal", before)?;
        check_unit_range("post-stimulus signal", after)?;
        if let Some(bad) = features.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::NumericAnomaly(format!("feature value {bad}")));
        }

        let delta = before
            .iter()
            .zip(after)
            .map(|(b, a)| (a - b) / hold_secs)
            .collect();
        Ok(Self {
            signal: before.to_vec(),
            delta,
            state,
            features,
            sequence,
        })
    }

    /// Model input: signal ⊕ state one-hot ⊕ entity features.
    pub fn input(&self) -> Vec<f32> {
        compose_input(&self.signal, &self.state, &self.features)
    }
}

pub fn compose_input(signal: &[f32], state: &[f32], features: &[f32]) -> Vec<f32> {
    let mut x = Vec::with_capacity(signal.len() + state.len() + features.len());
    x.extend_from_slice(signal);
    x.extend_from_slice(state);
    x.extend_from_slice(features);
    x
}

pub fn one_hot(state: usize, states: usize) -> Vec<f32> {
    let mut v = vec![0.0; states.max(1)];
    if let Some(slot) = v.get_mut(state) {
        *slot = 1.0;
    }
    v
}

pub fn check_unit_range(what: &str, values: &[f32]) -> Result<(), EngineError> {
    match values
        .iter()
        .find(|v| !v.is_finite() || **v < 0.0 || **v > 1.0)
    {
        Some(bad) => Err(EngineError::NumericAnomaly(format!(
            "{what} contains {bad}"
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    samples: Vec<MeasurementSample>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: MeasurementSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[MeasurementSample] {
        &self.samples
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.samples.iter().map(|s| s.sequence).collect()
    }

    /// Rewrite the state label of sample `i`; out-of-range indices are ignored.
    pub fn relabel(&mut self, i: usize, state: Vec<f32>) {
        if let Some(s) = self.samples.get_mut(i) {
            s.state = state;
        }
    }

    /// Training pairs (input, target delta).
    pub fn training_pairs(&self) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        self.samples
            .iter()
            .map(|s| (s.input(), s.delta.clone()))
            .unzip()
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        storage::write_len(&mut payload, self.samples.len())?;
        for s in &self.samples {
            storage::write_u64_le(&mut payload, s.sequence)?;
            storage::write_f32_slice(&mut payload, &s.signal)?;
            storage::write_f32_slice(&mut payload, &s.delta)?;
            storage::write_f32_slice(&mut payload, &s.state)?;
            storage::write_f32_slice(&mut payload, &s.features)?;
        }
        storage::encode_blob(TAG_DATASET, &payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let payload = storage::decode_blob(bytes, TAG_DATASET)?;
        let mut r = Cursor::new(payload);
        let n = storage::read_len(&mut r)?;
        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            let sequence = storage::read_u64_le(&mut r)?;
            let signal = storage::read_f32_vec(&mut r)?;
            let delta = storage::read_f32_vec(&mut r)?;
            let state = storage::read_f32_vec(&mut r)?;
            let features = storage::read_f32_vec(&mut r)?;
            samples.push(MeasurementSample {
                signal,
                delta,
                state,
                features,
                sequence,
            });
        }
        Ok(Self { samples })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub sequence: u64,
    pub signal: Vec<f32>,
}

/// Time-ordered raw signal recording with strictly increasing (possibly gapped) sequence indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalStream {
    entries: Vec<StreamEntry>,
}

impl SignalStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }

    pub fn signals(&self) -> Vec<Vec<f32>> {
        self.entries.iter().map(|e| e.signal.clone()).collect()
    }

    /// Sequence index the next recorded entry should carry.
    pub fn next_sequence(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.sequence + 1)
    }

    /// Append an entry; indices that do not increase are rejected.
    pub fn push(&mut self, sequence: u64, signal: Vec<f32>) -> bool {
        if self.entries.last().is_some_and(|e| e.sequence >= sequence) {
            return false;
        }
        self.entries.push(StreamEntry { sequence, signal });
        true
    }

    /// Smallest position whose sequence index is `>= sequence`, or the last
    /// position when every stored index is smaller. `None` only when empty.
    pub fn position_at_or_after(&self, sequence: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let pos = lower_bound(self.entries.len(), |i| self.entries[i].sequence < sequence);
        Some(pos.min(self.entries.len() - 1))
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        storage::write_len(&mut payload, self.entries.len())?;
        for e in &self.entries {
            storage::write_u64_le(&mut payload, e.sequence)?;
            storage::write_f32_slice(&mut payload, &e.signal)?;
        }
        storage::encode_blob(TAG_STREAM, &payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let payload = storage::decode_blob(bytes, TAG_STREAM)?;
        let mut r = Cursor::new(payload);
        let n = storage::read_len(&mut r)?;
        let mut stream = Self {
            entries: Vec::with_capacity(n),
        };
        for _ in 0..n {
            let sequence = storage::read_u64_le(&mut r)?;
            let signal = storage::read_f32_vec(&mut r)?;
            if !stream.push(sequence, signal) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "stream indices are not increasing",
                ));
            }
        }
        Ok(stream)
    }
}

/// Classic lower bound over `0..len`: first index where `is_before` turns false.
///
/// `is_before` must be monotone (true then false). Uses at most
/// `ceil(log2(len + 1))` comparisons.
pub fn lower_bound(len: usize, mut is_before: impl FnMut(usize) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if is_before(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Everything guarded by the dataset lock.
#[derive(Debug, Clone, Default)]
pub struct StimulusData {
    pub pictures: Vec<Dataset>,
    pub keywords: Vec<Dataset>,
    /// Shared sound-parameter dataset (features = synthesizer parameters).
    pub sound: Dataset,
    pub stream: SignalStream,
}

impl StimulusData {
    pub fn with_catalog(pictures: usize, keywords: usize) -> Self {
        Self {
            pictures: vec![Dataset::new(); pictures],
            keywords: vec![Dataset::new(); keywords],
            ..Self::default()
        }
    }

    /// Total sample count plus stream length and head. Appending a
    /// measurement always changes it; relabeling never does.
    pub fn signature(&self) -> (usize, usize, u64) {
        let samples = self.slots().iter().filter_map(|s| self.dataset(*s)).map(Dataset::len).sum();
        (samples, self.stream.len(), self.stream.next_sequence())
    }

    pub fn dataset(&self, slot: DatasetSlot) -> Option<&Dataset> {
        match slot {
            DatasetSlot::Picture(i) => self.pictures.get(i),
            DatasetSlot::Keyword(i) => self.keywords.get(i),
            DatasetSlot::Sound => Some(&self.sound),
        }
    }

    pub fn dataset_mut(&mut self, slot: DatasetSlot) -> Option<&mut Dataset> {
        match slot {
            DatasetSlot::Picture(i) => self.pictures.get_mut(i),
            DatasetSlot::Keyword(i) => self.keywords.get_mut(i),
            DatasetSlot::Sound => Some(&mut self.sound),
        }
    }

    pub fn slots(&self) -> Vec<DatasetSlot> {
        let mut slots: Vec<DatasetSlot> = (0..self.pictures.len()).map(DatasetSlot::Picture).collect();
        slots.extend((0..self.keywords.len()).map(DatasetSlot::Keyword));
        slots.push(DatasetSlot::Sound);
        slots
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DatasetSlot {
    Picture(usize),
    Keyword(usize),
    Sound,
}

/// Handle to the dataset lock.
#[derive(Debug, Clone, Default)]
pub struct SharedData(Arc<Mutex<StimulusData>>);

impl SharedData {
    pub fn new(data: StimulusData) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    pub fn lock(&self) -> MutexGuard<'_, StimulusData> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn replace(&self, data: StimulusData) {
        *self.lock() = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn gapped_stream(rng: &mut Prng, len: usize) -> SignalStream {
        let mut s = SignalStream::new();
        let mut seq = rng.gen_range_usize(0, 5) as u64;
        for _ in 0..len {
            assert!(s.push(seq, vec![0.5]));
            seq += 1 + rng.gen_range_usize(0, 4) as u64;
        }
        s
    }

    #[test]
    fn sample_rejects_out_of_range_and_nan() {
        let ok = MeasurementSample::from_readings(&[0.2, 0.4], &[0.4, 0.4], 0.2, vec![1.0], vec![], 3)
            .unwrap();
        assert!((ok.delta[0] - 1.0).abs() < 1e-5);
        assert_eq!(ok.delta[1], 0.0);

        assert!(MeasurementSample::from_readings(&[1.2], &[0.5], 0.2, vec![], vec![], 0).is_err());
        assert!(MeasurementSample::from_readings(&[0.5], &[f32::NAN], 0.2, vec![], vec![], 0).is_err());
        assert!(
            MeasurementSample::from_readings(&[0.5], &[0.5], 0.2, vec![], vec![f32::INFINITY], 0)
                .is_err()
        );
    }

    #[test]
    fn stream_rejects_non_increasing_indices() {
        let mut s = SignalStream::new();
        assert!(s.push(4, vec![0.1]));
        assert!(!s.push(4, vec![0.1]));
        assert!(!s.push(2, vec![0.1]));
        assert_eq!(s.next_sequence(), 5);
    }

    #[test]
    fn lower_bound_matches_linear_scan_on_gapped_indices() {
        let mut rng = Prng::new(99);
        for len in [1usize, 2, 3, 17, 256, 1000] {
            let stream = gapped_stream(&mut rng, len);
            let last = stream.entries().last().unwrap().sequence;
            for query in 0..=last + 3 {
                let expected = stream
                    .entries()
                    .iter()
                    .position(|e| e.sequence >= query)
                    .unwrap_or(len - 1);
                assert_eq!(stream.position_at_or_after(query), Some(expected), "len={len} q={query}");
            }
        }
        assert_eq!(SignalStream::new().position_at_or_after(3), None);
    }

    #[test]
    fn lower_bound_uses_logarithmic_comparisons() {
        let mut rng = Prng::new(5);
        let stream = gapped_stream(&mut rng, 4096);
        let entries = stream.entries();
        for _ in 0..200 {
            let query = rng.gen_range_usize(0, entries[4095].sequence as usize + 10) as u64;
            let mut comparisons = 0;
            lower_bound(entries.len(), |i| {
                comparisons += 1;
                entries[i].sequence < query
            });
            assert!(comparisons <= 13, "comparisons={comparisons}");
        }
    }

    #[test]
    fn dataset_and_stream_survive_persistence() {
        let mut ds = Dataset::new();
        ds.push(MeasurementSample::from_readings(&[0.1, 0.9], &[0.2, 0.8], 0.2, one_hot(1, 3), vec![0.3], 7).unwrap());
        let back = Dataset::from_bytes(&ds.to_bytes().unwrap()).unwrap();
        assert_eq!(back, ds);

        let mut rng = Prng::new(1);
        let stream = gapped_stream(&mut rng, 40);
        assert_eq!(SignalStream::from_bytes(&stream.to_bytes().unwrap()).unwrap(), stream);
    }

    #[test]
    fn one_hot_ignores_out_of_range_state() {
        assert_eq!(one_hot(2, 3), vec![0.0, 0.0, 1.0]);
        assert_eq!(one_hot(5, 2), vec![0.0, 0.0]);
    }
}
