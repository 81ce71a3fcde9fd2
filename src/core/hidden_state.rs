//! Latent brain-state model: nearest-centroid observation clusters plus a
//! discrete hidden Markov chain over them.

use std::io::{self, Cursor};

use crate::prng::Prng;
use crate::storage;
use crate::worker::CancelToken;

const TAG_CLUSTERS: [u8; 4] = *b"KMNS";
const TAG_TRANSITIONS: [u8; 4] = *b"HMMS";

/// Probability floor keeping Baum-Welch away from absorbing zeros.
const PROB_FLOOR: f32 = 1e-6;

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn normalize(row: &mut [f32]) {
    for v in row.iter_mut() {
        if !v.is_finite() || *v < PROB_FLOOR {
            *v = PROB_FLOOR;
        }
    }
    let sum: f32 = row.iter().sum();
    for v in row.iter_mut() {
        *v /= sum;
    }
}

fn argmax(values: impl IntoIterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > best_v {
            best = i;
            best_v = v;
        }
    }
    best
}

// ═══════════════════════════════════════════════════════════════════════════
// Observation clusters
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationClusterer {
    centroids: Vec<Vec<f32>>,
}

impl ObservationClusterer {
    pub fn from_centroids(centroids: Vec<Vec<f32>>) -> Option<Self> {
        let dim = centroids.first()?.len();
        if dim == 0 || centroids.iter().any(|c| c.len() != dim) {
            return None;
        }
        Some(Self { centroids })
    }

    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    pub fn dimension(&self) -> usize {
        self.centroids[0].len()
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// Nearest centroid id, or `None` when the sample has the wrong dimension.
    pub fn nearest(&self, sample: &[f32]) -> Option<usize> {
        if sample.len() != self.dimension() {
            return None;
        }
        let mut best = 0;
        let mut best_d = f32::INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let d = squared_distance(c, sample);
            if d < best_d {
                best = i;
                best_d = d;
            }
        }
        Some(best)
    }

    /// Lloyd's k-means with k-means++ seeding. Returns `None` when cancelled or
    /// when there is nothing to cluster.
    pub fn fit(
        points: &[Vec<f32>],
        k: usize,
        iterations: usize,
        rng: &mut Prng,
        cancel: &CancelToken,
    ) -> Option<Self> {
        let first = points.first()?;
        let dim = first.len();
        if dim == 0 || k == 0 || points.iter().any(|p| p.len() != dim) {
            return None;
        }
        let k = k.min(points.len());

        let mut centroids = vec![points[rng.gen_index(points.len())?].clone()];
        while centroids.len() < k {
            let weights: Vec<f32> = points
                .iter()
                .map(|p| {
                    centroids
                        .iter()
                        .map(|c| squared_distance(c, p))
                        .fold(f32::INFINITY, f32::min)
                })
                .collect();
            let pick = rng.sample_weighted(&weights)?;
            centroids.push(points[pick].clone());
        }

        let mut assignment = vec![usize::MAX; points.len()];
        for _ in 0..iterations {
            if cancel.is_cancelled() {
                return None;
            }
            let model = Self {
                centroids: centroids.clone(),
            };
            let mut changed = false;
            for (slot, p) in assignment.iter_mut().zip(points) {
                let c = model.nearest(p)?;
                if *slot != c {
                    *slot = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; k];
            let mut counts = vec![0usize; k];
            for (&c, p) in assignment.iter().zip(points) {
                counts[c] += 1;
                for (s, v) in sums[c].iter_mut().zip(p) {
                    *s += v;
                }
            }
            for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
                // Empty clusters keep their previous centroid.
                if count > 0 {
                    *centroid = sum.into_iter().map(|s| s / count as f32).collect();
                }
            }
        }

        Some(Self { centroids })
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        storage::write_len(&mut payload, self.centroids.len())?;
        for c in &self.centroids {
            storage::write_f32_slice(&mut payload, c)?;
        }
        storage::encode_blob(TAG_CLUSTERS, &payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let payload = storage::decode_blob(bytes, TAG_CLUSTERS)?;
        let mut r = Cursor::new(payload);
        let n = storage::read_len(&mut r)?;
        let mut centroids = Vec::with_capacity(n);
        for _ in 0..n {
            centroids.push(storage::read_f32_vec(&mut r)?);
        }
        Self::from_centroids(centroids)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "inconsistent centroids"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Hidden Markov chain
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionModel {
    initial: Vec<f32>,
    /// `transition[i][j]` = P(next = j | current = i)
    transition: Vec<Vec<f32>>,
    /// `emission[j][k]` = P(observation = k | state = j)
    emission: Vec<Vec<f32>>,
}

impl TransitionModel {
    pub fn new(initial: Vec<f32>, transition: Vec<Vec<f32>>, emission: Vec<Vec<f32>>) -> Option<Self> {
        let h = initial.len();
        let k = emission.first()?.len();
        if h == 0
            || k == 0
            || transition.len() != h
            || emission.len() != h
            || transition.iter().any(|r| r.len() != h)
            || emission.iter().any(|r| r.len() != k)
        {
            return None;
        }
        let mut model = Self {
            initial,
            transition,
            emission,
        };
        normalize(&mut model.initial);
        model.transition.iter_mut().for_each(|r| normalize(r));
        model.emission.iter_mut().for_each(|r| normalize(r));
        Some(model)
    }

    fn random(h: usize, k: usize, rng: &mut Prng) -> Option<Self> {
        let mut row = |n: usize| -> Vec<f32> { (0..n).map(|_| 1.0 + rng.next_f32_01()).collect() };
        let initial = row(h);
        let transition = (0..h).map(|_| row(h)).collect();
        let emission = (0..h).map(|_| row(k)).collect();
        Self::new(initial, transition, emission)
    }

    pub fn state_count(&self) -> usize {
        self.initial.len()
    }

    pub fn observation_count(&self) -> usize {
        self.emission[0].len()
    }

    pub fn initial_distribution(&self) -> &[f32] {
        &self.initial
    }

    pub fn most_likely_initial(&self) -> usize {
        argmax(self.initial.iter().copied())
    }

    pub fn sample_initial(&self, rng: &mut Prng) -> usize {
        rng.sample_weighted(&self.initial).unwrap_or(0)
    }

    /// Most likely next state given the current one and the new observation.
    ///
    /// Unknown states or observations leave the state unchanged.
    pub fn next_state(&self, state: usize, observation: usize) -> usize {
        let (Some(row), true) = (self.transition.get(state), observation < self.observation_count()) else {
            return state;
        };
        argmax(
            row.iter()
                .zip(&self.emission)
                .map(|(a, b)| a * b[observation]),
        )
    }

    /// Scaled Baum-Welch re-estimation over one observation sequence.
    pub fn fit(
        observations: &[usize],
        states: usize,
        symbols: usize,
        iterations: usize,
        rng: &mut Prng,
        cancel: &CancelToken,
    ) -> Option<Self> {
        if observations.len() < 2 || observations.iter().any(|&o| o >= symbols) {
            return None;
        }
        let mut model = Self::random(states, symbols, rng)?;
        let mut last_ll = f32::NEG_INFINITY;
        for _ in 0..iterations {
            if cancel.is_cancelled() {
                return None;
            }
            let ll = model.reestimate(observations);
            if (ll - last_ll).abs() < 1e-4 * ll.abs().max(1.0) {
                break;
            }
            last_ll = ll;
        }
        Some(model)
    }

    fn reestimate(&mut self, obs: &[usize]) -> f32 {
        let h = self.state_count();
        let k = self.observation_count();
        let t_len = obs.len();

        // Forward pass with per-step scaling.
        let mut alpha = vec![vec![0.0f32; h]; t_len];
        let mut scale = vec![0.0f32; t_len];
        for i in 0..h {
            alpha[0][i] = self.initial[i] * self.emission[i][obs[0]];
        }
        scale[0] = alpha[0].iter().sum::<f32>().max(f32::MIN_POSITIVE);
        alpha[0].iter_mut().for_each(|a| *a /= scale[0]);
        for t in 1..t_len {
            for j in 0..h {
                let mut acc = 0.0;
                for i in 0..h {
                    acc += alpha[t - 1][i] * self.transition[i][j];
                }
                alpha[t][j] = acc * self.emission[j][obs[t]];
            }
            scale[t] = alpha[t].iter().sum::<f32>().max(f32::MIN_POSITIVE);
            let s = scale[t];
            alpha[t].iter_mut().for_each(|a| *a /= s);
        }

        // Backward pass using the same scaling.
        let mut beta = vec![vec![1.0f32; h]; t_len];
        for t in (0..t_len - 1).rev() {
            for i in 0..h {
                let mut acc = 0.0;
                for j in 0..h {
                    acc += self.transition[i][j] * self.emission[j][obs[t + 1]] * beta[t + 1][j];
                }
                beta[t][i] = acc / scale[t + 1];
            }
        }

        let mut gamma_sum = vec![0.0f32; h];
        let mut gamma_sum_head = vec![0.0f32; h];
        let mut emit = vec![vec![0.0f32; k]; h];
        let mut xi = vec![vec![0.0f32; h]; h];
        let mut first = vec![0.0f32; h];
        for t in 0..t_len {
            let norm: f32 = (0..h).map(|i| alpha[t][i] * beta[t][i]).sum::<f32>().max(f32::MIN_POSITIVE);
            for i in 0..h {
                let g = alpha[t][i] * beta[t][i] / norm;
                if t == 0 {
                    first[i] = g;
                }
                gamma_sum[i] += g;
                if t + 1 < t_len {
                    gamma_sum_head[i] += g;
                }
                emit[i][obs[t]] += g;
            }
            if t + 1 < t_len {
                let mut step = vec![vec![0.0f32; h]; h];
                let mut total = 0.0f32;
                for i in 0..h {
                    for j in 0..h {
                        let v = alpha[t][i]
                            * self.transition[i][j]
                            * self.emission[j][obs[t + 1]]
                            * beta[t + 1][j];
                        step[i][j] = v;
                        total += v;
                    }
                }
                let total = total.max(f32::MIN_POSITIVE);
                for i in 0..h {
                    for j in 0..h {
                        xi[i][j] += step[i][j] / total;
                    }
                }
            }
        }

        self.initial = first;
        normalize(&mut self.initial);
        for i in 0..h {
            let denom = gamma_sum_head[i].max(f32::MIN_POSITIVE);
            for j in 0..h {
                self.transition[i][j] = xi[i][j] / denom;
            }
            normalize(&mut self.transition[i]);
            let denom = gamma_sum[i].max(f32::MIN_POSITIVE);
            for o in 0..k {
                self.emission[i][o] = emit[i][o] / denom;
            }
            normalize(&mut self.emission[i]);
        }

        scale.iter().map(|s| s.ln()).sum()
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        storage::write_f32_slice(&mut payload, &self.initial)?;
        for row in &self.transition {
            storage::write_f32_slice(&mut payload, row)?;
        }
        for row in &self.emission {
            storage::write_f32_slice(&mut payload, row)?;
        }
        storage::encode_blob(TAG_TRANSITIONS, &payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let payload = storage::decode_blob(bytes, TAG_TRANSITIONS)?;
        let mut r = Cursor::new(payload);
        let initial = storage::read_f32_vec(&mut r)?;
        let h = initial.len();
        let mut transition = Vec::with_capacity(h);
        for _ in 0..h {
            transition.push(storage::read_f32_vec(&mut r)?);
        }
        let mut emission = Vec::with_capacity(h);
        for _ in 0..h {
            emission.push(storage::read_f32_vec(&mut r)?);
        }
        Self::new(initial, transition, emission)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "inconsistent transition model"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// The pair
// ═══════════════════════════════════════════════════════════════════════════

/// Clusterer and transition model that were trained together.
///
/// Construction checks that the chain emits exactly the clusterer's symbols,
/// so a value of this type is always a usable pair.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenStateModel {
    clusterer: ObservationClusterer,
    transitions: TransitionModel,
}

impl HiddenStateModel {
    pub fn new(clusterer: ObservationClusterer, transitions: TransitionModel) -> Option<Self> {
        (clusterer.cluster_count() == transitions.observation_count()).then_some(Self {
            clusterer,
            transitions,
        })
    }

    pub fn clusterer(&self) -> &ObservationClusterer {
        &self.clusterer
    }

    pub fn transitions(&self) -> &TransitionModel {
        &self.transitions
    }

    pub fn state_count(&self) -> usize {
        self.transitions.state_count()
    }

    pub fn signal_dimension(&self) -> usize {
        self.clusterer.dimension()
    }

    /// One observation→cluster→transition step.
    pub fn step(&self, state: usize, sample: &[f32]) -> usize {
        match self.clusterer.nearest(sample) {
            Some(cluster) => self.transitions.next_state(state, cluster),
            None => state,
        }
    }

    /// Fit k-means on the raw stream, then the chain on the cluster sequence.
    pub fn fit(
        signals: &[Vec<f32>],
        clusters: usize,
        states: usize,
        kmeans_iterations: usize,
        hmm_iterations: usize,
        rng: &mut Prng,
        cancel: &CancelToken,
    ) -> Option<Self> {
        let clusterer = ObservationClusterer::fit(signals, clusters, kmeans_iterations, rng, cancel)?;
        let observations: Vec<usize> = signals
            .iter()
            .map(|s| clusterer.nearest(s))
            .collect::<Option<_>>()?;
        let transitions = TransitionModel::fit(
            &observations,
            states,
            clusterer.cluster_count(),
            hmm_iterations,
            rng,
            cancel,
        )?;
        Self::new(clusterer, transitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs(rng: &mut Prng, n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let base = if (i / 25) % 2 == 0 { 0.2 } else { 0.8 };
                vec![base + rng.gen_range_f32(-0.03, 0.03), base + rng.gen_range_f32(-0.03, 0.03)]
            })
            .collect()
    }

    #[test]
    fn kmeans_separates_two_blobs() {
        let mut rng = Prng::new(21);
        let points = two_blobs(&mut rng, 200);
        let km = ObservationClusterer::fit(&points, 2, 50, &mut rng, &CancelToken::new()).unwrap();
        let low = km.nearest(&[0.2, 0.2]).unwrap();
        let high = km.nearest(&[0.8, 0.8]).unwrap();
        assert_ne!(low, high);
        assert_eq!(km.nearest(&[0.5]), None);
    }

    #[test]
    fn cancelled_fit_returns_none() {
        let mut rng = Prng::new(2);
        let points = two_blobs(&mut rng, 100);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(ObservationClusterer::fit(&points, 2, 10, &mut rng, &cancel).is_none());
    }

    #[test]
    fn sticky_chain_keeps_its_state() {
        let hmm = TransitionModel::new(
            vec![0.5, 0.5],
            vec![vec![0.9, 0.1], vec![0.1, 0.9]],
            vec![vec![0.8, 0.2], vec![0.2, 0.8]],
        )
        .unwrap();
        assert_eq!(hmm.next_state(0, 0), 0);
        assert_eq!(hmm.next_state(1, 1), 1);
        // Unknown inputs never move the chain.
        assert_eq!(hmm.next_state(7, 0), 7);
        assert_eq!(hmm.next_state(1, 9), 1);
    }

    #[test]
    fn baum_welch_learns_regime_switching() {
        let mut rng = Prng::new(8);
        let points = two_blobs(&mut rng, 400);
        let model = HiddenStateModel::fit(&points, 2, 2, 30, 40, &mut rng, &CancelToken::new()).unwrap();
        assert_eq!(model.state_count(), 2);

        // Long runs in one blob should settle into different states.
        let mut s_low = 0;
        for _ in 0..20 {
            s_low = model.step(s_low, &[0.2, 0.2]);
        }
        let mut s_high = s_low;
        for _ in 0..20 {
            s_high = model.step(s_high, &[0.8, 0.8]);
        }
        assert_ne!(s_low, s_high);
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let km = ObservationClusterer::from_centroids(vec![vec![0.0], vec![1.0], vec![0.5]]).unwrap();
        let hmm = TransitionModel::new(vec![1.0], vec![vec![1.0]], vec![vec![0.5, 0.5]]).unwrap();
        assert!(HiddenStateModel::new(km, hmm).is_none());
    }
}
