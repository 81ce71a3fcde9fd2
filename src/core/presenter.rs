//! Display, audio and recording collaborator.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Side-effecting output surface. Rendering, audio synthesis and video
/// encoding all live behind this trait.
pub trait Presenter: Send {
    /// Show a keyword, a picture and sound parameters together.
    fn show(&mut self, text: &str, picture: Option<usize>, sound: &[f32]) -> bool;

    /// Number of synthesizer parameters; zero disables the sound category.
    fn sound_parameter_count(&self) -> usize {
        0
    }

    /// Append the currently shown frame to the recording.
    fn insert_frame(&mut self, _timestamp_ms: u64) -> bool {
        false
    }

    fn play_media(&mut self, _path: &Path) -> bool {
        false
    }

    fn stop_media(&mut self) {}

    /// Polled once per tick while media is expected to play.
    fn media_playing(&mut self) -> bool {
        false
    }

    fn set_visible(&mut self, _visible: bool) {}

    /// True once when the user asked to interrupt (key press, window close).
    fn poll_interrupt(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shown {
    pub text: String,
    pub picture: Option<usize>,
    pub sound: Vec<f32>,
}

/// Presenter without any output device. Remembers what it was asked to show.
///
/// Media "plays" for a fixed number of `media_playing` polls so that
/// program measurement can run without audio hardware.
#[derive(Debug, Clone, Default)]
pub struct HeadlessPresenter {
    sound_params: usize,
    visible: bool,
    shows: u64,
    frames: u64,
    last: Option<Shown>,
    media: Option<PathBuf>,
    media_polls_left: u32,
    media_length_polls: u32,
    interrupt: bool,
}

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sound_parameters(mut self, count: usize) -> Self {
        self.sound_params = count;
        self
    }

    /// How many `media_playing` polls a started media file reports as playing.
    pub fn with_media_length(mut self, polls: u32) -> Self {
        self.media_length_polls = polls;
        self
    }

    pub fn shows(&self) -> u64 {
        self.shows
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_shown(&self) -> Option<&Shown> {
        self.last.as_ref()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Simulate the user asking to stop; reported by the next `poll_interrupt`.
    pub fn request_interrupt(&mut self) {
        self.interrupt = true;
    }
}

impl Presenter for HeadlessPresenter {
    fn show(&mut self, text: &str, picture: Option<usize>, sound: &[f32]) -> bool {
        self.shows += 1;
        debug!(text, ?picture, sound_params = sound.len(), "show");
        self.last = Some(Shown {
            text: text.to_string(),
            picture,
            sound: sound.to_vec(),
        });
        true
    }

    fn sound_parameter_count(&self) -> usize {
        self.sound_params
    }

    fn insert_frame(&mut self, _timestamp_ms: u64) -> bool {
        if self.last.is_none() {
            return false;
        }
        self.frames += 1;
        true
    }

    fn play_media(&mut self, path: &Path) -> bool {
        if self.media_length_polls == 0 {
            return false;
        }
        self.media = Some(path.to_path_buf());
        self.media_polls_left = self.media_length_polls;
        true
    }

    fn stop_media(&mut self) {
        self.media = None;
        self.media_polls_left = 0;
    }

    fn media_playing(&mut self) -> bool {
        if self.media.is_none() || self.media_polls_left == 0 {
            return false;
        }
        self.media_polls_left -= 1;
        true
    }

    fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn poll_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.interrupt)
    }
}

/// Lets a caller keep a handle on a presenter the engine owns.
impl<P: Presenter> Presenter for Arc<Mutex<P>> {
    fn show(&mut self, text: &str, picture: Option<usize>, sound: &[f32]) -> bool {
        lock(self).show(text, picture, sound)
    }

    fn sound_parameter_count(&self) -> usize {
        lock(self).sound_parameter_count()
    }

    fn insert_frame(&mut self, timestamp_ms: u64) -> bool {
        lock(self).insert_frame(timestamp_ms)
    }

    fn play_media(&mut self, path: &Path) -> bool {
        lock(self).play_media(path)
    }

    fn stop_media(&mut self) {
        lock(self).stop_media()
    }

    fn media_playing(&mut self) -> bool {
        lock(self).media_playing()
    }

    fn set_visible(&mut self, visible: bool) {
        lock(self).set_visible(visible)
    }

    fn poll_interrupt(&mut self) -> bool {
        lock(self).poll_interrupt()
    }
}

fn lock<P>(shared: &Arc<Mutex<P>>) -> std::sync::MutexGuard<'_, P> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_plays_for_configured_polls() {
        let mut p = HeadlessPresenter::new().with_media_length(3);
        assert!(p.play_media(Path::new("song.ogg")));
        let polls = std::iter::from_fn(|| p.media_playing().then_some(())).count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn frames_need_something_shown() {
        let mut p = HeadlessPresenter::new();
        assert!(!p.insert_frame(0));
        p.show("calm", Some(2), &[]);
        assert!(p.insert_frame(100));
        assert_eq!(p.frames(), 1);
        assert_eq!(p.last_shown().unwrap().picture, Some(2));
    }
}
