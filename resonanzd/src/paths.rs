//! Cross-platform application paths

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use resonanz::command::MediaSources;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("could not determine the user data directory")]
    NoDataDir,
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, PathError> {
        Self::at(dirs::data_dir().ok_or(PathError::NoDataDir)?.join("resonanz"))
    }

    /// Lay out (and create) the directory tree under `data_dir`.
    pub fn at(data_dir: PathBuf) -> Result<Self, PathError> {
        let paths = Self { data_dir };
        for dir in [paths.data_dir.clone(), paths.models_dir(), paths.pictures_dir()] {
            fs::create_dir_all(&dir).map_err(|source| PathError::Create { path: dir, source })?;
        }
        Ok(paths)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn pictures_dir(&self) -> PathBuf {
        self.data_dir.join("pictures")
    }

    pub fn keywords_file(&self) -> PathBuf {
        self.data_dir.join("keywords.txt")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("resonanzd.log")
    }

    /// Media used when a request names none.
    pub fn default_media(&self) -> MediaSources {
        MediaSources::new(self.pictures_dir(), self.keywords_file(), self.models_dir())
    }
}
