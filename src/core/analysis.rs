//! Offline summaries of a model directory.

use std::fmt;
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{StimulusEntity, StimulusSet};
use crate::error::Result;
use crate::store::{self, BlobKind, Store};

/// How far a model directory is from covering its catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelAnalysis {
    pub entities: usize,
    pub with_model: usize,
    pub average_samples: f32,
    pub min_samples: usize,
}

impl ModelAnalysis {
    pub fn percent_with_model(&self) -> f32 {
        if self.entities == 0 {
            return 0.0;
        }
        100.0 * self.with_model as f32 / self.entities as f32
    }
}

impl fmt::Display for ModelAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entities, {:.1}% with a model, {:.1} samples on average (min {})",
            self.entities,
            self.percent_with_model(),
            self.average_samples,
            self.min_samples
        )
    }
}

/// Per-signal spread of the measured signal derivatives.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeltaStatistics {
    pub samples: usize,
    pub mean: Vec<f32>,
    pub stddev: Vec<f32>,
}

fn entities(stimuli: &StimulusSet) -> impl Iterator<Item = &StimulusEntity> {
    stimuli.pictures().iter().chain(stimuli.keywords())
}

/// Unreadable datasets count as empty.
fn sample_count(store: &dyn Store, dir: &Path, e: &StimulusEntity) -> usize {
    match store::load_dataset(store, dir, &e.key) {
        Ok(ds) => ds.map_or(0, |d| d.len()),
        Err(err) => {
            warn!(entity = %e.name, error = %err, "unreadable dataset");
            0
        }
    }
}

pub fn analyze_models(store: &dyn Store, dir: &Path, stimuli: &StimulusSet) -> Result<ModelAnalysis> {
    let mut out = ModelAnalysis::default();
    let mut total = 0usize;
    let mut min = usize::MAX;
    for e in entities(stimuli) {
        out.entities += 1;
        if store.load(dir, &e.key, BlobKind::Model)?.is_some() {
            out.with_model += 1;
        }
        let n = sample_count(store, dir, e);
        total += n;
        min = min.min(n);
    }
    if out.entities > 0 {
        out.average_samples = total as f32 / out.entities as f32;
        out.min_samples = min;
    }
    Ok(out)
}

/// Mean and standard deviation of every delta vector in the picture and keyword datasets.
pub fn delta_statistics(store: &dyn Store, dir: &Path, stimuli: &StimulusSet) -> Result<DeltaStatistics> {
    let mut sum: Vec<f64> = Vec::new();
    let mut sum_sq: Vec<f64> = Vec::new();
    let mut n = 0usize;
    for e in entities(stimuli) {
        let Some(ds) = store::load_dataset(store, dir, &e.key)? else {
            continue;
        };
        for sample in ds.samples() {
            if sum.is_empty() {
                sum = vec![0.0; sample.delta.len()];
                sum_sq = vec![0.0; sample.delta.len()];
            }
            if sample.delta.len() != sum.len() {
                warn!(entity = %e.name, "delta length differs from earlier samples; skipped");
                continue;
            }
            for (i, &d) in sample.delta.iter().enumerate() {
                sum[i] += f64::from(d);
                sum_sq[i] += f64::from(d) * f64::from(d);
            }
            n += 1;
        }
    }
    if n == 0 {
        return Ok(DeltaStatistics::default());
    }
    let count = n as f64;
    let mean: Vec<f64> = sum.iter().map(|s| s / count).collect();
    let stddev = sum_sq
        .iter()
        .zip(&mean)
        .map(|(sq, m)| (sq / count - m * m).max(0.0).sqrt() as f32)
        .collect();
    Ok(DeltaStatistics {
        samples: n,
        mean: mean.into_iter().map(|m| m as f32).collect(),
        stddev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogListing, PictureEntry};
    use crate::dataset::{Dataset, MeasurementSample};
    use crate::model::PredictiveModel;
    use crate::store::MemoryStore;

    fn stimuli() -> StimulusSet {
        let listing = CatalogListing {
            pictures: vec![
                PictureEntry {
                    name: "a.png".into(),
                    features: Vec::new(),
                },
                PictureEntry {
                    name: "b.png".into(),
                    features: Vec::new(),
                },
            ],
            keywords: vec!["calm".into()],
        };
        StimulusSet::new(listing, "dev")
    }

    fn dataset(deltas: &[[f32; 2]]) -> Dataset {
        let mut ds = Dataset::new();
        for (i, d) in deltas.iter().enumerate() {
            let before = [0.5, 0.5];
            let after = [0.5 + d[0], 0.5 + d[1]];
            ds.push(MeasurementSample::from_readings(&before, &after, 1.0, vec![1.0], Vec::new(), i as u64).unwrap());
        }
        ds
    }

    #[test]
    fn analysis_counts_models_and_samples() {
        let store = MemoryStore::new();
        let dir = Path::new("m");
        let s = stimuli();
        store::save_dataset(&store, dir, &s.pictures()[0].key, &dataset(&[[0.1, 0.0]; 4])).unwrap();
        store::save_dataset(&store, dir, &s.keywords()[0].key, &dataset(&[[0.0, 0.1]; 2])).unwrap();
        let model = PredictiveModel::constant(3, vec![0.0, 0.0], &[0.01, 0.01]);
        store::save_model(&store, dir, &s.pictures()[0].key, &model).unwrap();

        let a = analyze_models(&store, dir, &s).unwrap();
        assert_eq!(a.entities, 3);
        assert_eq!(a.with_model, 1);
        assert_eq!(a.min_samples, 0);
        assert!((a.average_samples - 2.0).abs() < 1e-6);
        assert!((a.percent_with_model() - 100.0 / 3.0).abs() < 1e-3);
    }

    #[test]
    fn delta_statistics_pool_every_entity() {
        let store = MemoryStore::new();
        let dir = Path::new("m");
        let s = stimuli();
        store::save_dataset(&store, dir, &s.pictures()[1].key, &dataset(&[[0.2, 0.0], [0.0, 0.0]])).unwrap();
        store::save_dataset(&store, dir, &s.keywords()[0].key, &dataset(&[[0.2, 0.0], [0.0, 0.0]])).unwrap();

        let d = delta_statistics(&store, dir, &s).unwrap();
        assert_eq!(d.samples, 4);
        assert!((d.mean[0] - 0.1).abs() < 1e-4);
        assert!((d.stddev[0] - 0.1).abs() < 1e-4);
        assert!(d.mean[1].abs() < 1e-6);
        assert!(d.stddev[1].abs() < 1e-6);
    }

    #[test]
    fn empty_directory_has_no_statistics() {
        let store = MemoryStore::new();
        let d = delta_statistics(&store, Path::new("none"), &stimuli()).unwrap();
        assert_eq!(d, DeltaStatistics::default());
        let a = analyze_models(&store, Path::new("none"), &StimulusSet::default()).unwrap();
        assert_eq!(a.percent_with_model(), 0.0);
    }
}
