//! Stimulus catalogs and stable entity identities.

use std::fmt;
use std::fs;
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::command::MediaSources;
use crate::error::EngineError;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET ^ seed, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Persistence key: a 128-bit stable digest of `name + device id`, as hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(name: &str, device_id: &str) -> Self {
        let mut joined = Vec::with_capacity(name.len() + device_id.len());
        joined.extend_from_slice(name.as_bytes());
        joined.extend_from_slice(device_id.as_bytes());
        let hi = fnv1a(&joined, 0);
        let lo = fnv1a(&joined, 0x9E3779B97F4A7C15);
        Self(format!("{hi:016x}{lo:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names of the shared (non-entity) persisted objects.
pub mod shared {
    pub const CLUSTERS: &str = "KMeans";
    pub const TRANSITIONS: &str = "HMM";
    pub const STREAM: &str = "EEG";
    pub const SOUND: &str = "Synth";
}

#[derive(Debug, Clone, PartialEq)]
pub struct PictureEntry {
    pub name: String,
    pub features: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogListing {
    pub pictures: Vec<PictureEntry>,
    pub keywords: Vec<String>,
}

pub trait Catalog: Send + Sync {
    fn load(&self, media: &MediaSources) -> Result<CatalogListing, EngineError>;
}

/// Pictures from a directory, keywords from a text file (one per line).
#[derive(Debug, Clone, Copy, Default)]
pub struct DirCatalog;

const PICTURE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

impl DirCatalog {
    fn pictures(dir: &Path) -> Result<Vec<PictureEntry>, EngineError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| EngineError::config(format!("picture directory {dir:?}: {e}")))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|x| x.to_str())
                    .is_some_and(|x| PICTURE_EXTENSIONS.contains(&x.to_ascii_lowercase().as_str()))
            })
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| PictureEntry {
                name,
                features: Vec::new(),
            })
            .collect())
    }

    fn keywords(file: &Path) -> Result<Vec<String>, EngineError> {
        let text = fs::read_to_string(file)
            .map_err(|e| EngineError::config(format!("keyword file {file:?}: {e}")))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| l.chars().count() > 1)
            .map(str::to_string)
            .collect())
    }
}

impl Catalog for DirCatalog {
    fn load(&self, media: &MediaSources) -> Result<CatalogListing, EngineError> {
        Ok(CatalogListing {
            pictures: Self::pictures(&media.picture_dir)?,
            keywords: Self::keywords(&media.keywords_file)?,
        })
    }
}

/// Fixed catalog that ignores the media paths.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    listing: CatalogListing,
}

impl StaticCatalog {
    pub fn new(pictures: &[&str], keywords: &[&str]) -> Self {
        Self {
            listing: CatalogListing {
                pictures: pictures
                    .iter()
                    .map(|p| PictureEntry {
                        name: p.to_string(),
                        features: Vec::new(),
                    })
                    .collect(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
            },
        }
    }

    pub fn from_listing(listing: CatalogListing) -> Self {
        Self { listing }
    }
}

impl Catalog for StaticCatalog {
    fn load(&self, _media: &MediaSources) -> Result<CatalogListing, EngineError> {
        Ok(self.listing.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StimulusKind {
    Picture,
    Keyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StimulusEntity {
    pub kind: StimulusKind,
    pub name: String,
    pub key: EntityKey,
    pub features: Vec<f32>,
}

/// The catalog as seen by one device: entities with their persistence keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StimulusSet {
    pictures: Vec<StimulusEntity>,
    keywords: Vec<StimulusEntity>,
    fingerprint: u64,
}

impl StimulusSet {
    pub fn new(listing: CatalogListing, device_id: &str) -> Self {
        let mut digest = Vec::new();
        let pictures: Vec<StimulusEntity> = listing
            .pictures
            .into_iter()
            .map(|p| {
                digest.extend_from_slice(p.name.as_bytes());
                digest.push(0);
                StimulusEntity {
                    kind: StimulusKind::Picture,
                    key: EntityKey::new(&p.name, device_id),
                    name: p.name,
                    features: p.features,
                }
            })
            .collect();
        digest.push(1);
        let keywords: Vec<StimulusEntity> = listing
            .keywords
            .into_iter()
            .map(|k| {
                digest.extend_from_slice(k.as_bytes());
                digest.push(0);
                StimulusEntity {
                    kind: StimulusKind::Keyword,
                    key: EntityKey::new(&k, device_id),
                    name: k,
                    features: Vec::new(),
                }
            })
            .collect();
        digest.extend_from_slice(device_id.as_bytes());
        Self {
            pictures,
            keywords,
            fingerprint: fnv1a(&digest, 0),
        }
    }

    pub fn pictures(&self) -> &[StimulusEntity] {
        &self.pictures
    }

    pub fn keywords(&self) -> &[StimulusEntity] {
        &self.keywords
    }

    /// Changes whenever the entity list (or device) changes.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty() && self.keywords.is_empty()
    }
}
