//! Per-entity predictive models.
//!
//! A [`PredictiveModel`] maps `signal ⊕ state one-hot ⊕ entity features` to the
//! expected signal change per second plus its covariance. The body is a small
//! tanh network: either one point estimate (fitted with Adam) or an ensemble
//! of posterior samples (stochastic-gradient Langevin dynamics started from
//! the point estimate).

use std::io::{self, Cursor};
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetSlot;
use crate::prng::Prng;
use crate::storage;
use crate::worker::{CancelToken, Progress};

const TAG_MODEL: [u8; 4] = *b"MODL";
const VARIANCE_FLOOR: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitSettings {
    pub hidden_units: usize,
    pub max_iterations: usize,
    /// Relative loss improvement over a 10-iteration window below which the fit has converged.
    pub tolerance: f32,
    pub learning_rate: f32,
    pub l2: f32,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            hidden_units: 16,
            max_iterations: 1000,
            tolerance: 1e-4,
            learning_rate: 0.01,
            l2: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PosteriorSettings {
    pub samples: usize,
    pub step: f32,
    pub burn_in: usize,
    pub thin: usize,
}

impl Default for PosteriorSettings {
    fn default() -> Self {
        Self {
            samples: 20,
            step: 0.01,
            burn_in: 50,
            thin: 10,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Matrix helpers
// ═══════════════════════════════════════════════════════════════════════════

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Stack equally long rows into an `n × d` matrix; `None` for empty or ragged input.
fn to_matrix(rows: &[Vec<f32>]) -> Option<Array2<f32>> {
    let d = rows.first()?.len();
    if rows.iter().any(|r| r.len() != d) {
        return None;
    }
    Array2::from_shape_vec((rows.len(), d), rows.concat()).ok()
}

fn write_matrix(w: &mut Vec<u8>, a: &Array2<f32>) -> io::Result<()> {
    storage::write_len(w, a.nrows())?;
    storage::write_len(w, a.ncols())?;
    storage::write_f32_slice(w, &a.iter().copied().collect::<Vec<_>>())
}

fn read_matrix(r: &mut Cursor<Vec<u8>>) -> io::Result<Array2<f32>> {
    let rows = storage::read_len(r)?;
    let cols = storage::read_len(r)?;
    let values = storage::read_f32_vec(r)?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn standard_normal(shape: (usize, usize), scale: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_fn(shape, |_| {
        let z: f32 = StandardNormal.sample(&mut *rng);
        z * scale
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    mean: Array1<f32>,
    scale: Array1<f32>,
}

impl Normalizer {
    /// Column-wise mean and standard deviation; constant columns keep scale 1.
    pub fn fit(rows: &Array2<f32>) -> Option<Self> {
        let mean = rows.mean_axis(Axis(0))?;
        let scale = rows
            .var_axis(Axis(0), 0.0)
            .mapv(|v| if v.sqrt() > 1e-6 { v.sqrt() } else { 1.0 });
        Some(Self { mean, scale })
    }

    fn identity(mean: Array1<f32>) -> Self {
        let scale = Array1::ones(mean.len());
        Self { mean, scale }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        (x - &self.mean) / &self.scale
    }

    pub fn apply_row(&self, x: &[f32]) -> Array1<f32> {
        (&ArrayView1::from(x) - &self.mean) / &self.scale
    }

    pub fn invert(&self, y: &Array2<f32>) -> Array2<f32> {
        y * &self.scale + &self.mean
    }

    fn write_to(&self, w: &mut Vec<u8>) -> io::Result<()> {
        storage::write_f32_slice(w, &self.mean.to_vec())?;
        storage::write_f32_slice(w, &self.scale.to_vec())
    }

    fn read_from(r: &mut Cursor<Vec<u8>>) -> io::Result<Self> {
        let mean = storage::read_f32_vec(r)?;
        let scale = storage::read_f32_vec(r)?;
        if mean.len() != scale.len() {
            return Err(invalid("normalizer size mismatch"));
        }
        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Network
// ═══════════════════════════════════════════════════════════════════════════

/// One hidden tanh layer, linear output. Inputs are row-major batches
/// (`n × inputs`); biases are `1 × width` rows broadcast over the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    w1: Array2<f32>,
    b1: Array2<f32>,
    w2: Array2<f32>,
    b2: Array2<f32>,
}

/// Gradients with the same shapes as the [`Network`] parameters.
#[derive(Debug, Clone)]
struct Gradients {
    w1: Array2<f32>,
    b1: Array2<f32>,
    w2: Array2<f32>,
    b2: Array2<f32>,
}

impl Gradients {
    fn tensors(&self) -> [&Array2<f32>; 4] {
        [&self.w1, &self.b1, &self.w2, &self.b2]
    }
}

impl Network {
    pub fn random(inputs: usize, hidden: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let s1 = 1.0 / (inputs.max(1) as f32).sqrt();
        let s2 = 1.0 / (hidden.max(1) as f32).sqrt();
        Self {
            w1: standard_normal((inputs, hidden), s1, rng),
            b1: Array2::zeros((1, hidden)),
            w2: standard_normal((hidden, outputs), s2, rng),
            b2: Array2::zeros((1, outputs)),
        }
    }

    fn zeros(inputs: usize, hidden: usize, outputs: usize) -> Self {
        Self {
            w1: Array2::zeros((inputs, hidden)),
            b1: Array2::zeros((1, hidden)),
            w2: Array2::zeros((hidden, outputs)),
            b2: Array2::zeros((1, outputs)),
        }
    }

    pub fn inputs(&self) -> usize {
        self.w1.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.w2.ncols()
    }

    fn params_mut(&mut self) -> [&mut Array2<f32>; 4] {
        [&mut self.w1, &mut self.b1, &mut self.w2, &mut self.b2]
    }

    fn hidden_activations(&self, x: &Array2<f32>) -> Array2<f32> {
        (x.dot(&self.w1) + &self.b1).mapv(f32::tanh)
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        self.hidden_activations(x).dot(&self.w2) + &self.b2
    }

    /// Mean of `0.5·|f(x) − y|²` over the batch plus its gradient, with L2 penalty.
    fn batch_gradient(&self, x: &Array2<f32>, y: &Array2<f32>, l2: f32) -> (f32, Gradients) {
        let n = x.nrows().max(1) as f32;
        let h = self.hidden_activations(x);
        let err = h.dot(&self.w2) + &self.b2 - y;
        let loss = 0.5 * err.mapv(|e| e * e).sum() / n;

        let dh = err.dot(&self.w2.t()) * &h.mapv(|v| 1.0 - v * v);
        let grads = Gradients {
            w1: x.t().dot(&dh) / n + &self.w1 * l2,
            b1: dh.sum_axis(Axis(0)).insert_axis(Axis(0)) / n + &self.b1 * l2,
            w2: h.t().dot(&err) / n + &self.w2 * l2,
            b2: err.sum_axis(Axis(0)).insert_axis(Axis(0)) / n + &self.b2 * l2,
        };
        (loss, grads)
    }

    fn write_to(&self, w: &mut Vec<u8>) -> io::Result<()> {
        write_matrix(w, &self.w1)?;
        write_matrix(w, &self.b1)?;
        write_matrix(w, &self.w2)?;
        write_matrix(w, &self.b2)
    }

    fn read_from(r: &mut Cursor<Vec<u8>>) -> io::Result<Self> {
        let net = Self {
            w1: read_matrix(r)?,
            b1: read_matrix(r)?,
            w2: read_matrix(r)?,
            b2: read_matrix(r)?,
        };
        let hidden = net.w1.ncols();
        let consistent = net.b1.dim() == (1, hidden)
            && net.w2.nrows() == hidden
            && net.b2.dim() == (1, net.w2.ncols());
        if !consistent {
            return Err(invalid("network size mismatch"));
        }
        Ok(net)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Optimizer
// ═══════════════════════════════════════════════════════════════════════════

/// Adam moments for each parameter tensor of one [`Network`].
#[derive(Debug, Clone)]
struct Adam {
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: [Array2<f32>; 4],
    v: [Array2<f32>; 4],
}

impl Adam {
    fn new(net: &Network) -> Self {
        let zeros = || {
            [
                Array2::zeros(net.w1.raw_dim()),
                Array2::zeros(net.b1.raw_dim()),
                Array2::zeros(net.w2.raw_dim()),
                Array2::zeros(net.b2.raw_dim()),
            ]
        };
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: zeros(),
            v: zeros(),
        }
    }

    fn step(&mut self, net: &mut Network, grads: &Gradients, lr: f32) {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        let c1 = (1.0 - b1.powi(self.t)).max(1e-12);
        let c2 = (1.0 - b2.powi(self.t)).max(1e-12);
        let moments = self.m.iter_mut().zip(self.v.iter_mut());
        for ((p, g), (m, v)) in net.params_mut().into_iter().zip(grads.tensors()).zip(moments) {
            m.zip_mut_with(g, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
            v.zip_mut_with(g, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);
            let denom = (&*v / c2).mapv(|x| x.sqrt() + eps);
            let update = &*m / c1 / &denom * lr;
            *p -= &update;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fitting
// ═══════════════════════════════════════════════════════════════════════════

/// Result of the point-estimate phase.
#[derive(Debug, Clone)]
pub struct PointFit {
    pub network: Network,
    pub input_norm: Normalizer,
    pub output_norm: Normalizer,
    /// Per-output residual variance in signal units.
    pub residual_var: Array1<f32>,
    pub iterations: usize,
    pub loss: f32,
}

/// Full-batch Adam on normalized data until convergence or the iteration cap.
///
/// Returns `None` for empty or ragged data and when cancelled.
pub fn fit_point_estimate(
    inputs: &[Vec<f32>],
    targets: &[Vec<f32>],
    settings: &FitSettings,
    rng: &mut Prng,
    cancel: &CancelToken,
    progress: &Progress,
) -> Option<PointFit> {
    if inputs.len() != targets.len() {
        return None;
    }
    let x = to_matrix(inputs)?;
    let y = to_matrix(targets)?;
    if y.ncols() == 0 {
        return None;
    }

    let input_norm = Normalizer::fit(&x)?;
    let output_norm = Normalizer::fit(&y)?;
    let xs = input_norm.apply(&x);
    let ys = output_norm.apply(&y);

    let mut rng = StdRng::seed_from_u64(rng.next_u64());
    let mut net = Network::random(x.ncols(), settings.hidden_units.max(1), y.ncols(), &mut rng);
    let mut adam = Adam::new(&net);

    let mut loss = f32::INFINITY;
    let mut window_start = f32::INFINITY;
    let mut iterations = 0;
    while iterations < settings.max_iterations {
        if cancel.is_cancelled() {
            return None;
        }
        let (batch_loss, grads) = net.batch_gradient(&xs, &ys, settings.l2);
        loss = batch_loss;
        if !loss.is_finite() {
            break;
        }
        iterations += 1;
        adam.step(&mut net, &grads, settings.learning_rate);
        progress.record(iterations, loss);

        if iterations % 10 == 0 {
            if window_start.is_finite() && window_start - loss < settings.tolerance * window_start.max(1e-12) {
                break;
            }
            window_start = loss;
        }
    }

    let residual_var = residual_variance(&net, &xs, &y, &output_norm)?;
    Some(PointFit {
        network: net,
        input_norm,
        output_norm,
        residual_var,
        iterations,
        loss,
    })
}

fn residual_variance(net: &Network, xs: &Array2<f32>, targets: &Array2<f32>, out: &Normalizer) -> Option<Array1<f32>> {
    let residual = out.invert(&net.forward(xs)) - targets;
    Some(residual.mapv(|r| r * r).mean_axis(Axis(0))?.mapv(|v| v.max(VARIANCE_FLOOR)))
}

/// Langevin sampling around the point estimate; returns the collected members.
#[allow(clippy::too_many_arguments)]
pub fn sample_posterior(
    base: &PointFit,
    inputs: &[Vec<f32>],
    targets: &[Vec<f32>],
    settings: &PosteriorSettings,
    l2: f32,
    rng: &mut Prng,
    cancel: &CancelToken,
    progress: &Progress,
) -> Option<Vec<Network>> {
    if inputs.len() != targets.len() || settings.samples == 0 {
        return None;
    }
    let xs = base.input_norm.apply(&to_matrix(inputs)?);
    let ys = base.output_norm.apply(&to_matrix(targets)?);

    let n = xs.nrows() as f32;
    // Observation noise in normalized units.
    let sigma2 = (&base.residual_var / &base.output_norm.scale.mapv(|s| s * s))
        .mean()
        .unwrap_or(0.0)
        .max(1e-3);
    let epsilon = settings.step * sigma2 / n;
    let noise = epsilon.sqrt();
    // Batch mean gradient → gradient of the potential is n/σ² times it.
    let drift = 0.5 * epsilon * n / sigma2;

    let mut rng = StdRng::seed_from_u64(rng.next_u64());
    let mut net = base.network.clone();
    let mut members = Vec::with_capacity(settings.samples);
    let thin = settings.thin.max(1);
    let total_steps = settings.burn_in + settings.samples * thin;
    for step in 1..=total_steps {
        if cancel.is_cancelled() {
            return None;
        }
        let (loss, grads) = net.batch_gradient(&xs, &ys, l2 / n);
        if !loss.is_finite() {
            return None;
        }
        for (p, g) in net.params_mut().into_iter().zip(grads.tensors()) {
            p.zip_mut_with(g, |w, &g| {
                let z: f32 = StandardNormal.sample(&mut rng);
                *w += -drift * g + noise * z;
            });
        }
        if step > settings.burn_in && (step - settings.burn_in) % thin == 0 {
            members.push(net.clone());
        }
        progress.record(step, loss);
    }
    Some(members)
}

// ═══════════════════════════════════════════════════════════════════════════
// Published model
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum ModelBody {
    Point(Network),
    Ensemble(Vec<Network>),
}

/// Mean change per second and its covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array1<f32>,
    pub cov: Array2<f32>,
}

impl Prediction {
    pub fn variance(&self, i: usize) -> f32 {
        self.cov.get((i, i)).copied().unwrap_or(0.0).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveModel {
    input_norm: Normalizer,
    output_norm: Normalizer,
    residual_var: Array1<f32>,
    body: ModelBody,
}

impl PredictiveModel {
    pub fn from_point(fit: PointFit) -> Self {
        Self {
            input_norm: fit.input_norm,
            output_norm: fit.output_norm,
            residual_var: fit.residual_var,
            body: ModelBody::Point(fit.network),
        }
    }

    pub fn from_ensemble(fit: PointFit, members: Vec<Network>) -> Self {
        if members.is_empty() {
            return Self::from_point(fit);
        }
        Self {
            input_norm: fit.input_norm,
            output_norm: fit.output_norm,
            residual_var: fit.residual_var,
            body: ModelBody::Ensemble(members),
        }
    }

    /// A model predicting the same change everywhere, with fixed variance.
    pub fn constant(inputs: usize, mean: Vec<f32>, variance: &[f32]) -> Self {
        let outputs = mean.len();
        let residual_var = Array1::from_shape_fn(outputs, |i| {
            variance.get(i).copied().unwrap_or(0.0).max(VARIANCE_FLOOR)
        });
        Self {
            input_norm: Normalizer::identity(Array1::zeros(inputs)),
            output_norm: Normalizer::identity(Array1::from(mean)),
            residual_var,
            body: ModelBody::Point(Network::zeros(inputs, 1, outputs)),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_norm.dim()
    }

    pub fn output_size(&self) -> usize {
        self.output_norm.dim()
    }

    pub fn is_ensemble(&self) -> bool {
        matches!(self.body, ModelBody::Ensemble(_))
    }

    /// `None` when `input` does not have the trained dimension.
    pub fn predict(&self, input: &[f32]) -> Option<Prediction> {
        if input.len() != self.input_size() {
            return None;
        }
        let x = self.input_norm.apply_row(input).insert_axis(Axis(0));
        let n = self.output_size();
        let (mean, mut cov) = match &self.body {
            ModelBody::Point(net) => {
                let mean = self.output_norm.invert(&net.forward(&x)).row(0).to_owned();
                (mean, Array2::zeros((n, n)))
            }
            ModelBody::Ensemble(members) => {
                let mut outs = Array2::<f32>::zeros((members.len(), n));
                for (mut row, m) in outs.rows_mut().into_iter().zip(members) {
                    row.assign(&self.output_norm.invert(&m.forward(&x)).row(0));
                }
                let mean = outs.mean_axis(Axis(0))?;
                let centred = &outs - &mean;
                let cov = centred.t().dot(&centred) / members.len() as f32;
                (mean, cov)
            }
        };
        let mut diag = cov.diag_mut();
        diag += &self.residual_var;
        Some(Prediction { mean, cov })
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.input_norm.write_to(&mut payload)?;
        self.output_norm.write_to(&mut payload)?;
        storage::write_f32_slice(&mut payload, &self.residual_var.to_vec())?;
        match &self.body {
            ModelBody::Point(net) => {
                storage::write_u32_le(&mut payload, 0)?;
                net.write_to(&mut payload)?;
            }
            ModelBody::Ensemble(members) => {
                storage::write_u32_le(&mut payload, 1)?;
                storage::write_len(&mut payload, members.len())?;
                for m in members {
                    m.write_to(&mut payload)?;
                }
            }
        }
        storage::encode_blob(TAG_MODEL, &payload)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let payload = storage::decode_blob(bytes, TAG_MODEL)?;
        let mut r = Cursor::new(payload);
        let input_norm = Normalizer::read_from(&mut r)?;
        let output_norm = Normalizer::read_from(&mut r)?;
        let residual_var = Array1::from(storage::read_f32_vec(&mut r)?);
        let body = match storage::read_u32_le(&mut r)? {
            0 => ModelBody::Point(Network::read_from(&mut r)?),
            1 => {
                let n = storage::read_len(&mut r)?;
                let mut members = Vec::with_capacity(n);
                for _ in 0..n {
                    members.push(Network::read_from(&mut r)?);
                }
                ModelBody::Ensemble(members)
            }
            _ => return Err(invalid("unknown model body")),
        };
        let fits = |m: &Network| m.inputs() == input_norm.dim() && m.outputs() == output_norm.dim();
        let shapes_ok = match &body {
            ModelBody::Point(net) => fits(net),
            ModelBody::Ensemble(ms) => !ms.is_empty() && ms.iter().all(fits),
        };
        if !shapes_ok || residual_var.len() != output_norm.dim() {
            return Err(invalid("model shape mismatch"));
        }
        Ok(Self {
            input_norm,
            output_norm,
            residual_var,
            body,
        })
    }
}

/// Published models, one slot per entity plus the shared sound model.
///
/// Slots hold `Arc`s so that publishing a retrained model replaces the old one
/// without disturbing a reader that still holds it.
#[derive(Debug, Clone, Default)]
pub struct ModelBook {
    pub pictures: Vec<Option<Arc<PredictiveModel>>>,
    pub keywords: Vec<Option<Arc<PredictiveModel>>>,
    pub sound: Option<Arc<PredictiveModel>>,
}

impl ModelBook {
    pub fn with_catalog(pictures: usize, keywords: usize) -> Self {
        Self {
            pictures: vec![None; pictures],
            keywords: vec![None; keywords],
            sound: None,
        }
    }

    pub fn publish(&mut self, slot: DatasetSlot, model: Arc<PredictiveModel>) {
        match slot {
            DatasetSlot::Picture(i) => {
                if let Some(s) = self.pictures.get_mut(i) {
                    *s = Some(model);
                }
            }
            DatasetSlot::Keyword(i) => {
                if let Some(s) = self.keywords.get_mut(i) {
                    *s = Some(model);
                }
            }
            DatasetSlot::Sound => self.sound = Some(model),
        }
    }

    pub fn get(&self, slot: DatasetSlot) -> Option<&Arc<PredictiveModel>> {
        match slot {
            DatasetSlot::Picture(i) => self.pictures.get(i)?.as_ref(),
            DatasetSlot::Keyword(i) => self.keywords.get(i)?.as_ref(),
            DatasetSlot::Sound => self.sound.as_ref(),
        }
    }

    /// Number of loaded (picture, keyword) models.
    pub fn loaded(&self) -> (usize, usize) {
        (
            self.pictures.iter().flatten().count(),
            self.keywords.iter().flatten().count(),
        )
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
