// Identity registry: enrolled names and their face embeddings
//
// Persisted as a JSON document next to the event log. Every mutation rewrites
// the file through a temporary sibling so a crash never leaves it half written.

use crate::error::{EnrollmentError, OracleError};
use crate::pipeline::identity::{cosine_distance, IdentityOracle};
use crate::video::list_images;
use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.30;
const REGISTRY_VERSION: u32 = 1;
const MAX_NAME_LEN: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredIdentity {
    name: String,
    embedding: Vec<f32>,
}

#[derive(Serialize, Deserialize, Debug)]
struct RegistryFile {
    version: u32,
    identities: Vec<StoredIdentity>,
}

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub name: String,
    pub distance: f32,
}

pub struct IdentityRegistry {
    path: PathBuf,
    threshold: f32,
    oracle: Arc<dyn IdentityOracle>,
    identities: Mutex<BTreeMap<String, Vec<f32>>>,
}

impl IdentityRegistry {
    /// Open (or create) the registry stored at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        oracle: Arc<dyn IdentityOracle>,
        threshold: f32,
    ) -> Result<Self> {
        let path = path.into();
        let identities = load_identities(&path)?;
        tracing::info!(
            "Identity registry loaded {} identities from {:?}",
            identities.len(),
            path
        );
        Ok(Self {
            path,
            threshold,
            oracle,
            identities: Mutex::new(identities),
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Embed `image` and store it under `name`, replacing any previous entry.
    pub fn enroll(&self, name: &str, image: &RgbImage) -> Result<(), EnrollmentError> {
        let name = validate_name(name)?;
        let embedding = self.oracle.embed(image)?.ok_or(EnrollmentError::NoFace)?;

        let mut identities = self.lock();
        let previous = identities.insert(name.clone(), embedding);
        if let Err(e) = persist(&self.path, &identities) {
            match previous {
                Some(old) => identities.insert(name, old),
                None => identities.remove(&name),
            };
            return Err(EnrollmentError::Persist(format!("{e:#}")));
        }
        tracing::info!("Enrolled identity {:?}", name);
        Ok(())
    }

    /// Remove `name`. Absent names are a successful no-op; returns whether
    /// anything was removed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut identities = self.lock();
        let Some(old) = identities.remove(name) else {
            return Ok(false);
        };
        if let Err(e) = persist(&self.path, &identities) {
            identities.insert(name.to_string(), old);
            return Err(e);
        }
        tracing::info!("Removed identity {:?}", name);
        Ok(true)
    }

    /// Nearest identity whose distance is at most the acceptance threshold.
    ///
    /// Ties on distance go to the lexicographically smallest name.
    pub fn match_embedding(&self, embedding: &[f32]) -> Option<IdentityMatch> {
        let identities = self.lock();
        let mut best: Option<IdentityMatch> = None;
        // BTreeMap iterates in name order, so a strict `<` keeps the smallest name on ties.
        for (name, candidate) in identities.iter() {
            let Some(distance) = cosine_distance(embedding, candidate) else {
                tracing::debug!("Skipping identity {:?}: embeddings are not comparable", name);
                continue;
            };
            if distance > self.threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| distance < b.distance) {
                best = Some(IdentityMatch {
                    name: name.clone(),
                    distance,
                });
            }
        }
        best
    }

    /// Embed a face crop and match it against the enrolled identities.
    pub fn identify(&self, face: &RgbImage) -> Result<Option<IdentityMatch>, OracleError> {
        Ok(self
            .oracle
            .embed(face)?
            .and_then(|embedding| self.match_embedding(&embedding)))
    }

    /// Enrolled names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Enroll every image in `dir` by file stem, skipping names already present.
    /// Returns the number of new enrollments.
    pub fn seed_from_dir(&self, dir: &Path) -> usize {
        let existing = self.list();
        let mut enrolled = 0;
        for path in list_images(dir) {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if existing.iter().any(|n| n == stem.trim()) {
                continue;
            }
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!("Skipping seed image {:?}: {}", path, e);
                    continue;
                }
            };
            match self.enroll(stem, &image) {
                Ok(()) => enrolled += 1,
                Err(e) => tracing::warn!("Could not enroll seed image {:?}: {}", path, e),
            }
        }
        enrolled
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<f32>>> {
        match self.identities.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Enrollment names: trimmed, 1-64 characters of alphanumerics, `-`, `_` or space.
pub fn validate_name(name: &str) -> Result<String, EnrollmentError> {
    let trimmed = name.trim();
    let valid = !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_NAME_LEN
        && trimmed
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == ' ');
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(EnrollmentError::InvalidName(name.to_string()))
    }
}

fn load_identities(path: &Path) -> Result<BTreeMap<String, Vec<f32>>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read registry {:?}", path))?;

    match serde_json::from_str::<RegistryFile>(&content) {
        Ok(file) => Ok(file
            .identities
            .into_iter()
            .map(|i| (i.name, i.embedding))
            .collect()),
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            tracing::warn!(
                "Identity registry {:?} is unreadable ({}); moving it to {:?} and starting empty",
                path,
                e,
                aside
            );
            fs::rename(path, &aside)
                .with_context(|| format!("Failed to move corrupt registry to {:?}", aside))?;
            Ok(BTreeMap::new())
        }
    }
}

fn persist(path: &Path, identities: &BTreeMap<String, Vec<f32>>) -> Result<()> {
    let file = RegistryFile {
        version: REGISTRY_VERSION,
        identities: identities
            .iter()
            .map(|(name, embedding)| StoredIdentity {
                name: name.clone(),
                embedding: embedding.clone(),
            })
            .collect(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(&file)?;
    fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}
