//! C5: profile model. `Profile` records, the `ProfileStore` trait, and a
//! JSON-file-backed implementation (the storage mechanism itself is
//! unspecified upstream; this build picks the simplest one consistent with
//! the "single logical table keyed by id" schema contract).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Stable id used to seed a fresh default profile.
pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_PROFILE_NAME: &str = "Default";

/// Process-wide constant: every layer name known to the system.
pub const LAYER_CATALOG: &[&str] = &[
    "addresses",
    "aerialways",
    "boundaries",
    "boundary_labels",
    "bridges",
    "buildings",
    "dam_lines",
    "ferries",
    "land",
    "ocean",
    "pier_lines",
    "pier_polygons",
    "place_labels",
    "pois",
    "public_transport",
    "sites",
    "streets",
    "street_labels",
    "street_labels_points",
    "street_polygons",
    "streets_polygons_labels",
    "water_lines",
    "water_lines_labels",
    "water_polygons",
    "water_polygons_labels",
];

/// Process-wide constant: subset of `LAYER_CATALOG` excluded from a fresh
/// default profile's seed set.
pub const DEFAULT_NOT_KEPT: &[&str] = &[
    "addresses",
    "aerialways",
    "boundaries",
    "boundary_labels",
    "bridges",
    "buildings",
    "dam_lines",
    "ferries",
    "ocean",
    "pier_lines",
    "pier_polygons",
    "place_labels",
    "pois",
    "public_transport",
    "street_polygons",
    "street_labels_points",
    "streets_polygons_labels",
    "sites",
    "water_lines",
    "water_lines_labels",
    "water_polygons_labels",
];

fn seed_layers_to_keep() -> HashSet<String> {
    let excluded: HashSet<&str> = DEFAULT_NOT_KEPT.iter().copied().collect();
    LAYER_CATALOG
        .iter()
        .filter(|name| !excluded.contains(*name))
        .map(|name| name.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub layers_to_keep: HashSet<String>,
    pub is_default: bool,
}

/// Operations exposed to the rest of the system. A trait so the driver and
/// CLI depend on behavior, not on the JSON file format.
pub trait ProfileStore {
    fn list(&self) -> Vec<Profile>;
    fn get(&self, id: &str) -> Result<Profile, ProfileError>;
    fn get_default(&self) -> Result<Profile, ProfileError>;
    fn insert(&mut self, profile: Profile) -> Result<(), ProfileError>;
    fn update(&mut self, profile: Profile) -> Result<(), ProfileError>;
    fn delete(&mut self, id: &str) -> Result<(), ProfileError>;
    fn set_default(&mut self, id: &str) -> Result<(), ProfileError>;
    fn ensure_valid_default(&mut self) -> Result<()>;
}

/// JSON-file-backed `ProfileStore`. Loaded fully into memory on open and
/// rewritten atomically (write to a sibling temp file, then rename) on
/// every mutating operation, the same stage-then-publish discipline the
/// driver uses for MBTiles output.
pub struct JsonProfileStore {
    path: PathBuf,
    profiles: Vec<Profile>,
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    profiles: Vec<Profile>,
}

impl JsonProfileStore {
    /// Open (creating an empty store if the file doesn't exist yet).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let profiles = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading profile store {}", path.display()))?;
            let store: StoreFile = serde_json::from_str(&raw)
                .with_context(|| format!("parsing profile store {}", path.display()))?;
            store.profiles
        } else {
            Vec::new()
        };
        Ok(JsonProfileStore { path, profiles })
    }

    fn persist(&self) -> Result<()> {
        let store = StoreFile {
            profiles: self.profiles.clone(),
        };
        let json = serde_json::to_string_pretty(&store).context("serializing profile store")?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staged = tempfile::Builder::new()
            .prefix(".profile-store-")
            .suffix(".json.tmp")
            .tempfile_in(dir)
            .context("creating staged profile store file")?;
        fs::write(staged.path(), json).context("writing staged profile store file")?;
        staged
            .persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("publishing profile store {}", self.path.display()))?;
        Ok(())
    }

    fn name_conflict(&self, name: &str, excluding_id: Option<&str>) -> bool {
        self.profiles.iter().any(|p| {
            p.name.eq_ignore_ascii_case(name) && excluding_id != Some(p.id.as_str())
        })
    }
}

impl ProfileStore for JsonProfileStore {
    fn list(&self) -> Vec<Profile> {
        let mut out = self.profiles.clone();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn get(&self, id: &str) -> Result<Profile, ProfileError> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    fn get_default(&self) -> Result<Profile, ProfileError> {
        self.profiles
            .iter()
            .find(|p| p.is_default)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound("<default>".to_string()))
    }

    fn insert(&mut self, profile: Profile) -> Result<(), ProfileError> {
        if self.name_conflict(&profile.name, None) {
            return Err(ProfileError::NameConflict(profile.name));
        }
        if profile.is_default {
            for p in &mut self.profiles {
                p.is_default = false;
            }
        }
        self.profiles.push(profile);
        self.persist().ok();
        Ok(())
    }

    fn update(&mut self, profile: Profile) -> Result<(), ProfileError> {
        if !self.profiles.iter().any(|p| p.id == profile.id) {
            return Err(ProfileError::NotFound(profile.id));
        }
        if self.name_conflict(&profile.name, Some(&profile.id)) {
            return Err(ProfileError::NameConflict(profile.name));
        }
        if profile.is_default {
            for p in &mut self.profiles {
                p.is_default = false;
            }
        }
        if let Some(slot) = self.profiles.iter_mut().find(|p| p.id == profile.id) {
            *slot = profile;
        }
        self.persist().ok();
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<(), ProfileError> {
        let before = self.profiles.len();
        self.profiles.retain(|p| p.id != id);
        if self.profiles.len() == before {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        self.persist().ok();
        Ok(())
    }

    fn set_default(&mut self, id: &str) -> Result<(), ProfileError> {
        if !self.profiles.iter().any(|p| p.id == id) {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        for p in &mut self.profiles {
            p.is_default = p.id == id;
        }
        self.persist().ok();
        Ok(())
    }

    fn ensure_valid_default(&mut self) -> Result<()> {
        let needs_seed = match self.profiles.iter().find(|p| p.is_default) {
            Some(p) => p.layers_to_keep.is_empty(),
            None => true,
        };
        if !needs_seed {
            return Ok(());
        }

        for p in &mut self.profiles {
            p.is_default = false;
        }

        let seed = Profile {
            id: DEFAULT_PROFILE_ID.to_string(),
            name: DEFAULT_PROFILE_NAME.to_string(),
            layers_to_keep: seed_layers_to_keep(),
            is_default: true,
        };

        if let Some(slot) = self.profiles.iter_mut().find(|p| p.id == DEFAULT_PROFILE_ID) {
            *slot = seed;
        } else {
            self.profiles.push(seed);
        }

        self.persist()
    }
}
