//! Commands accepted by the engine and the last-write-wins pending slot.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use hashbrown::HashSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tolerance used for a named target when the caller gives none.
pub const DEFAULT_TOLERANCE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MediaSources {
    pub picture_dir: PathBuf,
    pub keywords_file: PathBuf,
    pub model_dir: PathBuf,
    #[cfg_attr(feature = "serde", serde(default))]
    pub audio_file: Option<PathBuf>,
}

impl MediaSources {
    pub fn new(picture_dir: PathBuf, keywords_file: PathBuf, model_dir: PathBuf) -> Self {
        Self {
            picture_dir,
            keywords_file,
            model_dir,
            audio_file: None,
        }
    }

    pub fn with_audio(mut self, audio_file: PathBuf) -> Self {
        self.audio_file = Some(audio_file);
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.model_dir.as_os_str().is_empty() {
            return Err(EngineError::config("model directory is empty"));
        }
        Ok(())
    }
}

/// Target trajectory for one named signal, one value per program step.
/// `None` marks an unset step that is interpolated from its neighbours.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalTarget {
    pub signal: String,
    pub values: Vec<Option<f32>>,
    #[cfg_attr(feature = "serde", serde(default = "default_tolerance"))]
    pub tolerance: f32,
}

#[cfg(feature = "serde")]
fn default_tolerance() -> f32 {
    DEFAULT_TOLERANCE
}

impl SignalTarget {
    pub fn new(signal: impl Into<String>, values: Vec<Option<f32>>) -> Self {
        Self {
            signal: signal.into(),
            values,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// A target held at `value` for `steps` program steps.
    pub fn constant(signal: impl Into<String>, value: f32, steps: usize) -> Self {
        Self::new(signal, vec![Some(value); steps])
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExecuteFlags {
    /// Rewind to the first step instead of finishing.
    pub looping: bool,
    /// No live signal; simulate it from the models.
    pub blind: bool,
    pub record_video: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum Command {
    Idle {
        show_screen: bool,
    },
    ShowRandom {
        media: MediaSources,
    },
    Measure {
        media: MediaSources,
    },
    Optimize {
        media: MediaSources,
    },
    Execute {
        media: MediaSources,
        targets: Vec<SignalTarget>,
        flags: ExecuteFlags,
    },
    MeasureProgram {
        media_file: PathBuf,
        signals: Vec<String>,
        length: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CommandKind {
    Idle,
    ShowRandom,
    Measure,
    Optimize,
    Execute,
    MeasureProgram,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Idle => "idle",
            CommandKind::ShowRandom => "show-random",
            CommandKind::Measure => "measure",
            CommandKind::Optimize => "optimize",
            CommandKind::Execute => "execute",
            CommandKind::MeasureProgram => "measure-program",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Command {
    pub fn idle() -> Self {
        Command::Idle { show_screen: false }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Idle { .. } => CommandKind::Idle,
            Command::ShowRandom { .. } => CommandKind::ShowRandom,
            Command::Measure { .. } => CommandKind::Measure,
            Command::Optimize { .. } => CommandKind::Optimize,
            Command::Execute { .. } => CommandKind::Execute,
            Command::MeasureProgram { .. } => CommandKind::MeasureProgram,
        }
    }

    pub fn media(&self) -> Option<&MediaSources> {
        match self {
            Command::ShowRandom { media }
            | Command::Measure { media }
            | Command::Optimize { media }
            | Command::Execute { media, .. } => Some(media),
            Command::Idle { .. } | Command::MeasureProgram { .. } => None,
        }
    }

    /// Structural checks that need nothing but the device's signal names.
    pub fn validate(&self, signal_names: &[String]) -> Result<(), EngineError> {
        if let Some(media) = self.media() {
            media.validate()?;
        }
        match self {
            Command::Execute { targets, .. } => {
                crate::program::validate_targets(signal_names, targets).map(|_| ())
            }
            Command::MeasureProgram {
                media_file,
                signals,
                length,
            } => {
                if media_file.as_os_str().is_empty() {
                    return Err(EngineError::config("media file is empty"));
                }
                if signals.is_empty() {
                    return Err(EngineError::config("no signals to measure"));
                }
                if *length == 0 {
                    return Err(EngineError::config("program length must be positive"));
                }
                let mut seen = HashSet::new();
                for s in signals {
                    if !signal_names.contains(s) {
                        return Err(EngineError::config(format!("unknown signal `{s}`")));
                    }
                    if !seen.insert(s) {
                        return Err(EngineError::config(format!("signal `{s}` listed twice")));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// At most one pending command; a newer submission replaces an unconsumed one.
#[derive(Debug, Default)]
pub struct CommandSlot {
    pending: Mutex<Option<Command>>,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `cmd`; returns the command it displaced, if any.
    pub fn submit(&self, cmd: Command) -> Option<Command> {
        self.lock().replace(cmd)
    }

    /// Replace the pending command and run `then` before the slot is released.
    pub fn submit_with(&self, cmd: Command, then: impl FnOnce()) -> Option<Command> {
        let mut pending = self.lock();
        let replaced = pending.replace(cmd);
        then();
        replaced
    }

    /// Run `f` with the pending state; no submission interleaves with it.
    pub fn with_pending<R>(&self, f: impl FnOnce(bool) -> R) -> R {
        let pending = self.lock();
        f(pending.is_some())
    }

    pub fn take(&self) -> Option<Command> {
        self.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Command>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["alpha".to_string(), "beta".to_string()]
    }

    fn media() -> MediaSources {
        MediaSources::new("pics".into(), "words.txt".into(), "models".into())
    }

    #[test]
    fn last_submission_wins() {
        let slot = CommandSlot::new();
        assert!(slot.submit(Command::idle()).is_none());
        assert!(slot.submit(Command::Measure { media: media() }).is_some());
        let displaced = slot.submit(Command::Optimize { media: media() });
        assert_eq!(displaced.map(|c| c.kind()), Some(CommandKind::Measure));
        assert_eq!(slot.take().map(|c| c.kind()), Some(CommandKind::Optimize));
        assert!(slot.take().is_none());
        assert!(!slot.has_pending());
    }

    #[test]
    fn measure_program_needs_known_signals() {
        let ok = Command::MeasureProgram {
            media_file: "track.ogg".into(),
            signals: vec!["beta".into()],
            length: 30,
        };
        assert!(ok.validate(&names()).is_ok());

        let unknown = Command::MeasureProgram {
            media_file: "track.ogg".into(),
            signals: vec!["gamma".into()],
            length: 30,
        };
        assert!(matches!(unknown.validate(&names()), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn empty_model_dir_is_rejected() {
        let cmd = Command::Measure {
            media: MediaSources::new("p".into(), "k".into(), PathBuf::new()),
        };
        assert!(cmd.validate(&names()).is_err());
    }
}
