//! Signal source collaborators.
//!
//! Real EEG hardware lives outside this crate; the engine only needs the
//! [`Device`] trait. Two hardware-free sources are provided for demos and
//! tests.

use crate::prng::Prng;

pub trait Device: Send {
    /// Stable identifier mixed into every persistence key.
    fn id(&self) -> String;

    fn connection_ok(&self) -> bool;

    /// Latest normalized reading (each component in `[0, 1]`), `None` when unavailable.
    fn data(&mut self) -> Option<Vec<f32>>;

    fn signal_count(&self) -> usize;

    fn signal_names(&self) -> Vec<String>;
}

/// Always connected, always reports 0.5 on every channel.
#[derive(Debug, Clone)]
pub struct NoDevice {
    channels: usize,
}

impl NoDevice {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
        }
    }
}

impl Default for NoDevice {
    fn default() -> Self {
        Self::new(7)
    }
}

impl Device for NoDevice {
    fn id(&self) -> String {
        "No device".to_string()
    }

    fn connection_ok(&self) -> bool {
        true
    }

    fn data(&mut self) -> Option<Vec<f32>> {
        Some(vec![0.5; self.channels])
    }

    fn signal_count(&self) -> usize {
        self.channels
    }

    fn signal_names(&self) -> Vec<String> {
        (0..self.channels).map(|i| format!("Empty signal {}", i + 1)).collect()
    }
}

/// Bounded random walk per channel.
#[derive(Debug, Clone)]
pub struct RandomDevice {
    values: Vec<f32>,
    step: f32,
    rng: Prng,
}

impl RandomDevice {
    pub fn new(channels: usize, seed: Option<u64>) -> Self {
        let mut rng = Prng::from_seed(seed);
        let values = (0..channels.max(1)).map(|_| rng.next_f32_01()).collect();
        Self {
            values,
            step: 0.02,
            rng,
        }
    }

    pub fn with_step(mut self, step: f32) -> Self {
        self.step = step.abs();
        self
    }
}

impl Device for RandomDevice {
    fn id(&self) -> String {
        "Random device".to_string()
    }

    fn connection_ok(&self) -> bool {
        true
    }

    fn data(&mut self) -> Option<Vec<f32>> {
        for v in self.values.iter_mut() {
            *v = (*v + self.step * self.rng.next_gaussian()).clamp(0.0, 1.0);
        }
        Some(self.values.clone())
    }

    fn signal_count(&self) -> usize {
        self.values.len()
    }

    fn signal_names(&self) -> Vec<String> {
        (0..self.values.len()).map(|i| format!("Random signal {}", i + 1)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_walk_stays_in_unit_range() {
        let mut dev = RandomDevice::new(4, Some(3)).with_step(0.3);
        for _ in 0..500 {
            let v = dev.data().unwrap();
            assert_eq!(v.len(), 4);
            assert!(v.iter().all(|x| (0.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn empty_device_names_every_channel() {
        let dev = NoDevice::default();
        assert_eq!(dev.signal_names().len(), dev.signal_count());
        assert_eq!(dev.signal_names()[0], "Empty signal 1");
    }
}
