//! Stimulus selection.
//!
//! Every candidate with a published model is scored by how far its predicted
//! next signal lands from the target, weighted by tolerance and inflated by
//! the model's own uncertainty. The next stimulus is then drawn uniformly from
//! the K best of each category so the same winner is not repeated forever.

use tracing::warn;

use crate::catalog::{StimulusEntity, StimulusSet};
use crate::config::{DecisionConfig, MONTE_CARLO_SIZE};
use crate::dataset::compose_input;
use crate::model::{ModelBook, PredictiveModel};
use crate::prng::Prng;

use std::sync::Arc;

/// Everything the scorer needs to know about "now".
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub signal: &'a [f32],
    pub state: &'a [f32],
    pub target: &'a [f32],
    pub tolerance: &'a [f32],
    /// Seconds the chosen stimulus will act before the next decision.
    pub elapsed_secs: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub id: usize,
    pub error: f32,
    pub predicted: Vec<f32>,
    /// Mean predicted standard deviation over signals, already time-scaled.
    pub mean_stddev: f32,
    /// Mean absolute predicted change over signals, already time-scaled.
    pub mean_abs_delta: f32,
}

/// Score one candidate. `None` when the model does not fit the live signal's shape.
pub fn score_candidate(
    id: usize,
    model: &PredictiveModel,
    features: &[f32],
    input: &DecisionInput<'_>,
) -> Option<ScoredCandidate> {
    let n = input.signal.len();
    if model.output_size() != n || input.target.len() != n || input.tolerance.len() != n {
        return None;
    }
    let x = compose_input(input.signal, input.state, features);
    let prediction = model.predict(&x)?;

    let t = input.elapsed_secs.max(0.0);
    let mut sq = 0.0f32;
    let mut stddev_sum = 0.0f32;
    let mut delta_sum = 0.0f32;
    let mut predicted = Vec::with_capacity(n);
    for i in 0..n {
        let delta = prediction.mean[i] * t;
        let stddev = (prediction.variance(i) * t * t).sqrt();
        let p = (input.signal[i] + delta).clamp(0.0, 1.0);
        let p = if p.is_finite() { p } else { input.signal[i].clamp(0.0, 1.0) };
        let e = ((p - input.target[i]).abs() + 0.5 * stddev) / input.tolerance[i].sqrt();
        sq += e * e;
        stddev_sum += stddev;
        delta_sum += delta.abs();
        predicted.push(p);
    }
    let error = sq.sqrt();
    if !error.is_finite() {
        return None;
    }
    Some(ScoredCandidate {
        id,
        error,
        predicted,
        mean_stddev: stddev_sum / n.max(1) as f32,
        mean_abs_delta: delta_sum / n.max(1) as f32,
    })
}

/// Index (into `scored`) of a candidate drawn uniformly from the `k` lowest errors.
pub fn select_top_k(scored: &[ScoredCandidate], k: usize, rng: &mut Prng) -> Option<usize> {
    if scored.is_empty() {
        return None;
    }
    let mut order: Vec<usize> = (0..scored.len()).collect();
    order.sort_by(|&a, &b| scored[a].error.total_cmp(&scored[b].error));
    let pool = k.clamp(1, order.len());
    rng.gen_index(pool).map(|i| order[i])
}

/// True when predicted spread stays below `ratio` times the predicted change.
pub fn confidence_ok(scored: &[&ScoredCandidate], ratio: f32) -> bool {
    if scored.is_empty() {
        return true;
    }
    let n = scored.len() as f32;
    let stddev = scored.iter().map(|c| c.mean_stddev).sum::<f32>() / n;
    let delta = scored.iter().map(|c| c.mean_abs_delta).sum::<f32>() / n;
    if delta <= f32::EPSILON {
        return stddev <= f32::EPSILON;
    }
    stddev / delta <= ratio
}

#[cfg(feature = "parallel")]
fn score_category(
    models: &[Option<Arc<PredictiveModel>>],
    entities: &[StimulusEntity],
    input: &DecisionInput<'_>,
) -> Vec<ScoredCandidate> {
    use rayon::prelude::*;
    models
        .par_iter()
        .enumerate()
        .filter_map(|(id, m)| {
            let model = m.as_ref()?;
            score_candidate(id, model, entity_features(entities, id), input)
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn score_category(
    models: &[Option<Arc<PredictiveModel>>],
    entities: &[StimulusEntity],
    input: &DecisionInput<'_>,
) -> Vec<ScoredCandidate> {
    models
        .iter()
        .enumerate()
        .filter_map(|(id, m)| {
            let model = m.as_ref()?;
            score_candidate(id, model, entity_features(entities, id), input)
        })
        .collect()
}

fn entity_features(entities: &[StimulusEntity], id: usize) -> &[f32] {
    entities.get(id).map(|e| e.features.as_slice()).unwrap_or(&[])
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub keyword: Option<usize>,
    pub picture: Option<usize>,
    pub sound: Option<Vec<f32>>,
    /// Error of the chosen picture (or keyword when no picture was chosen).
    pub expected_error: Option<f32>,
    /// Predicted signal under the chosen picture (or keyword).
    pub predicted: Option<Vec<f32>>,
    pub low_confidence: bool,
}

/// Hypothetical signals propagated without a device.
#[derive(Debug, Clone)]
struct Swarm {
    samples: Vec<Vec<f32>>,
}

impl Swarm {
    fn new(size: usize, dims: usize, rng: &mut Prng) -> Self {
        let samples = (0..size)
            .map(|_| (0..dims).map(|_| rng.next_f32_01()).collect())
            .collect();
        Self { samples }
    }

    fn dims(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    fn mean(&self) -> Vec<f32> {
        let n = self.samples.len().max(1) as f32;
        let mut mean = vec![0.0f32; self.dims()];
        for s in &self.samples {
            for (m, v) in mean.iter_mut().zip(s) {
                *m += v / n;
            }
        }
        mean
    }
}

pub struct DecisionEngine {
    cfg: DecisionConfig,
    rng: Prng,
    sound_params: Vec<f32>,
    swarm: Option<Swarm>,
}

impl DecisionEngine {
    pub fn new(cfg: DecisionConfig, sound_dims: usize, mut rng: Prng) -> Self {
        let sound_params = (0..sound_dims).map(|_| rng.next_f32_01()).collect();
        Self {
            cfg,
            rng,
            sound_params,
            swarm: None,
        }
    }

    pub fn configure(&mut self, cfg: DecisionConfig) {
        self.cfg = cfg;
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.cfg
    }

    pub fn sound_parameters(&self) -> &[f32] {
        &self.sound_params
    }

    /// Mean of the blind swarm, if one is active.
    pub fn swarm_mean(&self) -> Option<Vec<f32>> {
        self.swarm.as_ref().map(Swarm::mean)
    }

    /// Drop simulation buffers.
    pub fn release(&mut self) {
        self.swarm = None;
    }

    /// Score every published model and draw from the top K of each category.
    pub fn select_next(
        &mut self,
        models: &ModelBook,
        stimuli: &StimulusSet,
        input: &DecisionInput<'_>,
    ) -> Selection {
        let pictures = score_category(&models.pictures, stimuli.pictures(), input);
        let keywords = score_category(&models.keywords, stimuli.keywords(), input);

        let k = self.cfg.top_k;
        let picture = select_top_k(&pictures, k, &mut self.rng).map(|i| &pictures[i]);
        let keyword = select_top_k(&keywords, k, &mut self.rng).map(|i| &keywords[i]);

        let (sound_candidates, sound_scored) = self.score_sound(models.sound.as_deref(), input);
        let sound = select_top_k(&sound_scored, k, &mut self.rng).map(|i| sound_scored[i].id);

        let all: Vec<&ScoredCandidate> = pictures.iter().chain(&keywords).chain(&sound_scored).collect();
        let low_confidence = self.low_confidence(&all);

        let sound = sound.and_then(|id| self.adopt_sound(&sound_candidates, id));
        let lead = picture.or(keyword);
        Selection {
            keyword: keyword.map(|c| c.id),
            picture: picture.map(|c| c.id),
            sound,
            expected_error: lead.map(|c| c.error),
            predicted: lead.map(|c| c.predicted.clone()),
            low_confidence,
        }
    }

    /// Uniform pick from each catalog; no scoring at all.
    pub fn select_random(&mut self, pictures: usize, keywords: usize) -> Selection {
        let sound = if self.sound_params.is_empty() {
            None
        } else {
            let params: Vec<f32> = (0..self.sound_params.len()).map(|_| self.rng.next_f32_01()).collect();
            self.sound_params = params.clone();
            Some(params)
        };
        Selection {
            keyword: self.rng.gen_index(keywords),
            picture: self.rng.gen_index(pictures),
            sound,
            ..Selection::default()
        }
    }

    /// Selection without a device: candidates are scored by their average error
    /// over a swarm of hypothetical signals, and the swarm is then pushed
    /// forward through the chosen models with their predicted noise.
    pub fn select_blind(
        &mut self,
        models: &ModelBook,
        stimuli: &StimulusSet,
        state: &[f32],
        target: &[f32],
        tolerance: &[f32],
        elapsed_secs: f32,
    ) -> Selection {
        let dims = target.len();
        if self.swarm.as_ref().map_or(true, |s| s.dims() != dims) {
            let size = self.cfg.swarm_size.clamp(1, MONTE_CARLO_SIZE);
            self.swarm = Some(Swarm::new(size, dims, &mut self.rng));
        }
        let Some(swarm) = self.swarm.take() else {
            return Selection::default();
        };

        let pictures = score_on_swarm(&models.pictures, stimuli.pictures(), &swarm, state, target, tolerance, elapsed_secs);
        let keywords = score_on_swarm(&models.keywords, stimuli.keywords(), &swarm, state, target, tolerance, elapsed_secs);
        let k = self.cfg.top_k;
        let picture = select_top_k(&pictures, k, &mut self.rng).map(|i| pictures[i].clone());
        let keyword = select_top_k(&keywords, k, &mut self.rng).map(|i| keywords[i].clone());

        // Sound is scored against the swarm centre only.
        let centre = swarm.mean();
        let input = DecisionInput {
            signal: &centre,
            state,
            target,
            tolerance,
            elapsed_secs,
        };
        let (sound_candidates, sound_scored) = self.score_sound(models.sound.as_deref(), &input);
        let sound = select_top_k(&sound_scored, k, &mut self.rng)
            .and_then(|i| self.adopt_sound(&sound_candidates, sound_scored[i].id));

        let all: Vec<&ScoredCandidate> = pictures.iter().chain(&keywords).chain(&sound_scored).collect();
        let low_confidence = self.low_confidence(&all);

        let chosen: Vec<(&PredictiveModel, &[f32])> = [
            picture.as_ref().and_then(|c| {
                let m = models.pictures.get(c.id)?.as_deref()?;
                Some((m, entity_features(stimuli.pictures(), c.id)))
            }),
            keyword.as_ref().and_then(|c| {
                let m = models.keywords.get(c.id)?.as_deref()?;
                Some((m, entity_features(stimuli.keywords(), c.id)))
            }),
        ]
        .into_iter()
        .flatten()
        .collect();
        let swarm = self.propagate(swarm, &chosen, state, elapsed_secs);
        self.swarm = Some(swarm);

        let lead = picture.as_ref().or(keyword.as_ref());
        Selection {
            keyword: keyword.as_ref().map(|c| c.id),
            picture: picture.as_ref().map(|c| c.id),
            sound,
            expected_error: lead.map(|c| c.error),
            predicted: lead.map(|c| c.predicted.clone()),
            low_confidence,
        }
    }

    /// Self-check over every scored candidate; warns when it fails.
    fn low_confidence(&self, scored: &[&ScoredCandidate]) -> bool {
        let low = !confidence_ok(scored, self.cfg.confidence_ratio);
        if low {
            warn!(
                candidates = scored.len(),
                "model noise is comparable to or exceeds the predicted signal change"
            );
        }
        low
    }

    fn propagate(
        &mut self,
        mut swarm: Swarm,
        chosen: &[(&PredictiveModel, &[f32])],
        state: &[f32],
        elapsed_secs: f32,
    ) -> Swarm {
        if chosen.is_empty() {
            return swarm;
        }
        let t = elapsed_secs.max(0.0);
        let share = 1.0 / chosen.len() as f32;
        for sample in &mut swarm.samples {
            let mut step = vec![0.0f32; sample.len()];
            for (model, features) in chosen {
                let Some(p) = model.predict(&compose_input(sample, state, features)) else {
                    continue;
                };
                for (i, s) in step.iter_mut().enumerate() {
                    let noise = (p.variance(i) * t * t).sqrt() * self.rng.next_gaussian();
                    *s += share * (p.mean.get(i).copied().unwrap_or(0.0) * t + noise);
                }
            }
            for (v, d) in sample.iter_mut().zip(step) {
                let next = (*v + d).clamp(0.0, 1.0);
                if next.is_finite() {
                    *v = next;
                }
            }
        }
        swarm
    }

    fn sound_candidates(&mut self) -> Vec<Vec<f32>> {
        let dims = self.sound_params.len();
        if dims == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.cfg.sound_candidates + 1);
        out.push(self.sound_params.clone());
        for _ in 0..self.cfg.sound_candidates {
            let candidate = if self.rng.next_f32_01() < self.cfg.random_sound_fraction {
                (0..dims).map(|_| self.rng.next_f32_01()).collect()
            } else {
                let scale = self.cfg.sound_perturbation;
                self.sound_params
                    .iter()
                    .map(|p| (p + scale * self.rng.next_gaussian()).clamp(0.0, 1.0))
                    .collect()
            };
            out.push(candidate);
        }
        out
    }

    /// Generate and score sound candidates; returns the candidate vectors and
    /// the scores, whose `id`s index into the vectors.
    fn score_sound(
        &mut self,
        model: Option<&PredictiveModel>,
        input: &DecisionInput<'_>,
    ) -> (Vec<Vec<f32>>, Vec<ScoredCandidate>) {
        let Some(model) = model else {
            return (Vec::new(), Vec::new());
        };
        let candidates = self.sound_candidates();
        let scored = candidates
            .iter()
            .enumerate()
            .filter_map(|(id, params)| score_candidate(id, model, params, input))
            .collect();
        (candidates, scored)
    }

    fn adopt_sound(&mut self, candidates: &[Vec<f32>], id: usize) -> Option<Vec<f32>> {
        let params = candidates.get(id)?.clone();
        self.sound_params = params.clone();
        Some(params)
    }
}

#[allow(clippy::too_many_arguments)]
fn score_on_swarm(
    models: &[Option<Arc<PredictiveModel>>],
    entities: &[StimulusEntity],
    swarm: &Swarm,
    state: &[f32],
    target: &[f32],
    tolerance: &[f32],
    elapsed_secs: f32,
) -> Vec<ScoredCandidate> {
    let n = swarm.samples.len().max(1) as f32;
    models
        .iter()
        .enumerate()
        .filter_map(|(id, m)| {
            let model = m.as_ref()?;
            let features = entity_features(entities, id);
            let mut error = 0.0f32;
            let mut predicted = vec![0.0f32; target.len()];
            let mut stddev = 0.0f32;
            let mut delta = 0.0f32;
            for sample in &swarm.samples {
                let input = DecisionInput {
                    signal: sample,
                    state,
                    target,
                    tolerance,
                    elapsed_secs,
                };
                let c = score_candidate(id, model, features, &input)?;
                error += c.error / n;
                stddev += c.mean_stddev / n;
                delta += c.mean_abs_delta / n;
                for (p, v) in predicted.iter_mut().zip(&c.predicted) {
                    *p += v / n;
                }
            }
            Some(ScoredCandidate {
                id,
                error,
                predicted,
                mean_stddev: stddev,
                mean_abs_delta: delta,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogListing, PictureEntry};

    const STATE: [f32; 2] = [1.0, 0.0];

    fn input<'a>(signal: &'a [f32], target: &'a [f32], tolerance: &'a [f32], t: f32) -> DecisionInput<'a> {
        DecisionInput {
            signal,
            state: &STATE,
            target,
            tolerance,
            elapsed_secs: t,
        }
    }

    fn stimuli(pictures: usize, keywords: usize) -> StimulusSet {
        let listing = CatalogListing {
            pictures: (0..pictures)
                .map(|i| PictureEntry {
                    name: format!("p{i}.png"),
                    features: Vec::new(),
                })
                .collect(),
            keywords: (0..keywords).map(|i| format!("word{i}")).collect(),
        };
        StimulusSet::new(listing, "test")
    }

    #[test]
    fn predictions_are_clipped_for_any_elapsed_time() {
        let model = PredictiveModel::constant(4, vec![5.0, -5.0], &[0.5, 0.5]);
        for t in [0.0, 0.01, 1.0, 100.0] {
            let c = score_candidate(0, &model, &[], &input(&[0.5, 0.5], &[0.5, 0.5], &[1.0, 1.0], t)).unwrap();
            assert!(c.predicted.iter().all(|p| (0.0..=1.0).contains(p)), "t={t} {:?}", c.predicted);
            assert!(c.error.is_finite());
        }
    }

    #[test]
    fn uncertainty_and_tolerance_weight_the_error() {
        let sure = PredictiveModel::constant(4, vec![0.0, 0.0], &[0.0, 0.0]);
        let noisy = PredictiveModel::constant(4, vec![0.0, 0.0], &[0.04, 0.04]);
        let i = input(&[0.5, 0.5], &[0.5, 0.5], &[1.0, 1.0], 1.0);
        let a = score_candidate(0, &sure, &[], &i).unwrap();
        let b = score_candidate(1, &noisy, &[], &i).unwrap();
        assert!(a.error < 1e-3);
        // 0.5·sqrt(0.04) = 0.1 per signal, two signals.
        assert!((b.error - (2.0f32 * 0.01).sqrt()).abs() < 1e-4, "{}", b.error);

        let loose = input(&[0.5, 0.5], &[0.5, 0.5], &[4.0, 4.0], 1.0);
        let c = score_candidate(1, &noisy, &[], &loose).unwrap();
        assert!((c.error - b.error / 2.0).abs() < 1e-4);
    }

    #[test]
    fn mismatched_models_are_skipped() {
        let wrong_out = PredictiveModel::constant(5, vec![0.0; 3], &[]);
        let wrong_in = PredictiveModel::constant(9, vec![0.0; 2], &[]);
        let i = input(&[0.5, 0.5], &[0.5, 0.5], &[1.0, 1.0], 1.0);
        assert!(score_candidate(0, &wrong_out, &[], &i).is_none());
        assert!(score_candidate(0, &wrong_in, &[], &i).is_none());
    }

    #[test]
    fn top_k_choice_never_worse_than_kth_error() {
        let mut rng = Prng::new(11);
        for round in 0..200 {
            let n = 1 + round % 9;
            let k = 1 + round % 4;
            let scored: Vec<ScoredCandidate> = (0..n)
                .map(|id| ScoredCandidate {
                    id,
                    error: rng.next_f32_01(),
                    predicted: Vec::new(),
                    mean_stddev: 0.0,
                    mean_abs_delta: 0.0,
                })
                .collect();
            let mut errors: Vec<f32> = scored.iter().map(|c| c.error).collect();
            errors.sort_by(f32::total_cmp);
            let kth = errors[k.min(n) - 1];
            let chosen = select_top_k(&scored, k, &mut rng).unwrap();
            assert!(scored[chosen].error <= kth);
        }
        assert_eq!(select_top_k(&[], 3, &mut rng), None);
    }

    #[test]
    fn top_k_explores_more_than_the_single_best() {
        let scored: Vec<ScoredCandidate> = (0..5)
            .map(|id| ScoredCandidate {
                id,
                error: id as f32,
                predicted: Vec::new(),
                mean_stddev: 0.0,
                mean_abs_delta: 0.0,
            })
            .collect();
        let mut rng = Prng::new(3);
        let mut seen = [false; 5];
        for _ in 0..200 {
            seen[select_top_k(&scored, 3, &mut rng).unwrap()] = true;
        }
        assert_eq!(seen, [true, true, true, false, false]);
    }

    #[test]
    fn select_next_prefers_pictures_that_reach_the_target() {
        let mut book = ModelBook::with_catalog(3, 0);
        book.pictures[0] = Some(Arc::new(PredictiveModel::constant(4, vec![-0.3, -0.3], &[])));
        book.pictures[1] = Some(Arc::new(PredictiveModel::constant(4, vec![0.3, 0.3], &[])));
        // Third picture has a model trained on a different signal layout.
        book.pictures[2] = Some(Arc::new(PredictiveModel::constant(6, vec![0.0; 3], &[])));
        let cfg = DecisionConfig {
            top_k: 1,
            ..DecisionConfig::default()
        };
        let mut engine = DecisionEngine::new(cfg, 0, Prng::new(5));
        let set = stimuli(3, 2);
        for _ in 0..20 {
            let sel = engine.select_next(&book, &set, &input(&[0.5, 0.5], &[0.8, 0.8], &[1.0, 1.0], 1.0));
            assert_eq!(sel.picture, Some(1));
            assert_eq!(sel.keyword, None);
            assert_eq!(sel.sound, None);
            assert!(sel.expected_error.unwrap() < 1e-3);
        }
    }

    #[test]
    fn noisy_models_raise_the_confidence_flag() {
        let mut book = ModelBook::with_catalog(1, 0);
        book.pictures[0] = Some(Arc::new(PredictiveModel::constant(4, vec![0.01, 0.01], &[1.0, 1.0])));
        let mut engine = DecisionEngine::new(DecisionConfig::default(), 0, Prng::new(1));
        let sel = engine.select_next(&book, &stimuli(1, 0), &input(&[0.5, 0.5], &[0.5, 0.5], &[1.0, 1.0], 1.0));
        assert_eq!(sel.picture, Some(0));
        assert!(sel.low_confidence);
    }

    #[test]
    fn blind_selection_runs_the_confidence_check() {
        let set = stimuli(1, 0);
        let cfg = DecisionConfig {
            swarm_size: 20,
            ..DecisionConfig::default()
        };

        let mut noisy = ModelBook::with_catalog(1, 0);
        noisy.pictures[0] = Some(Arc::new(PredictiveModel::constant(4, vec![0.01, 0.01], &[1.0, 1.0])));
        let mut engine = DecisionEngine::new(cfg.clone(), 0, Prng::new(4));
        let sel = engine.select_blind(&noisy, &set, &STATE, &[0.5, 0.5], &[1.0, 1.0], 1.0);
        assert_eq!(sel.picture, Some(0));
        assert!(sel.low_confidence);

        let mut sure = ModelBook::with_catalog(1, 0);
        sure.pictures[0] = Some(Arc::new(PredictiveModel::constant(4, vec![0.2, 0.2], &[])));
        let mut engine = DecisionEngine::new(cfg, 0, Prng::new(4));
        let sel = engine.select_blind(&sure, &set, &STATE, &[0.5, 0.5], &[1.0, 1.0], 1.0);
        assert!(!sel.low_confidence);
    }

    #[test]
    fn sound_parameters_follow_the_sound_model() {
        let mut book = ModelBook::default();
        // Inputs: 2 signals + 2 states + 3 sound parameters.
        book.sound = Some(Arc::new(PredictiveModel::constant(7, vec![0.1, 0.1], &[])));
        let mut engine = DecisionEngine::new(DecisionConfig::default(), 3, Prng::new(9));
        let sel = engine.select_next(&book, &stimuli(0, 0), &input(&[0.5, 0.5], &[0.6, 0.6], &[1.0, 1.0], 1.0));
        let sound = sel.sound.unwrap();
        assert_eq!(sound.len(), 3);
        assert!(sound.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(engine.sound_parameters(), sound.as_slice());
        assert_eq!(sel.picture, None);
    }

    #[test]
    fn random_mode_ignores_models() {
        let mut engine = DecisionEngine::new(DecisionConfig::default(), 2, Prng::new(2));
        for _ in 0..50 {
            let sel = engine.select_random(4, 3);
            assert!(sel.picture.unwrap() < 4);
            assert!(sel.keyword.unwrap() < 3);
            assert_eq!(sel.sound.as_ref().map(Vec::len), Some(2));
        }
        let empty = engine.select_random(0, 0);
        assert_eq!((empty.picture, empty.keyword), (None, None));
    }

    #[test]
    fn blind_swarm_drifts_with_the_chosen_model() {
        let mut book = ModelBook::with_catalog(1, 0);
        book.pictures[0] = Some(Arc::new(PredictiveModel::constant(4, vec![0.2, 0.2], &[])));
        let cfg = DecisionConfig {
            swarm_size: 50,
            ..DecisionConfig::default()
        };
        let mut engine = DecisionEngine::new(cfg, 0, Prng::new(8));
        let set = stimuli(1, 0);
        let sel = engine.select_blind(&book, &set, &STATE, &[1.0, 1.0], &[1.0, 1.0], 0.5);
        assert_eq!(sel.picture, Some(0));
        let first = engine.swarm_mean().unwrap();
        for _ in 0..10 {
            engine.select_blind(&book, &set, &STATE, &[1.0, 1.0], &[1.0, 1.0], 0.5);
        }
        let later = engine.swarm_mean().unwrap();
        assert!(later[0] > first[0] && later[1] > first[1]);
        assert!(later.iter().all(|v| *v <= 1.0));

        engine.release();
        assert!(engine.swarm_mean().is_none());
    }
}
