//! Daemon settings from the environment.

use std::env;
use std::net::SocketAddr;

pub const DEFAULT_PORT: u16 = 9877;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{var}: cannot parse `{value}`")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    /// Constant mid-range signal.
    None,
    /// Bounded random walk.
    Random,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub device: DeviceChoice,
    pub channels: usize,
    pub sound_params: usize,
    pub seed: Option<u64>,
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, SettingsError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { var: name, value }),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let device = match var("RESONANZ_DEVICE").as_deref().map(str::trim) {
            None | Some("none") => DeviceChoice::None,
            Some("random") => DeviceChoice::Random,
            Some(other) => {
                return Err(SettingsError::Invalid {
                    var: "RESONANZ_DEVICE",
                    value: other.to_string(),
                })
            }
        };
        let seed = match var("RESONANZ_SEED") {
            None => None,
            Some(_) => Some(parse("RESONANZ_SEED", 0u64)?),
        };
        Ok(Self {
            addr: parse("RESONANZ_ADDR", SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))?,
            device,
            channels: parse("RESONANZ_CHANNELS", 4usize)?.max(1),
            sound_params: parse("RESONANZ_SOUND_PARAMS", 0usize)?,
            seed,
        })
    }
}
