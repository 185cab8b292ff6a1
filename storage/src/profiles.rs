use std::collections::BTreeMap;

use anyhow::anyhow;
use stompmiru_core::{
    Result,
    profiles::{LegacyProfile, Profile, ProfileError, ProfileId, ProfileSet},
};

use crate::kv::KeyValueStore;

pub const PROFILES_KEY: &str = "profiles";
pub const ACTIVE_PROFILE_KEY: &str = "active_profile";
pub const LEGACY_PROFILE_KEY: &str = "profile_cache";

/// How the collection came to be on startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Migrated,
    Created,
    /// Stored data could not be read and a default profile replaced it.
    Recovered,
}

/// Profile collection backed by a key-value store.
///
/// Every mutating operation writes the whole collection and the active
/// pointer back. Write failures are logged and otherwise ignored: the
/// in-memory collection stays usable.
#[derive(Debug)]
pub struct ConfigStore<S> {
    backend: S,
    profiles: ProfileSet,
    outcome: LoadOutcome,
}

impl<S: KeyValueStore> ConfigStore<S> {
    /// Never fails; unreadable data degrades to a fresh default profile.
    pub fn load(backend: S) -> Self {
        let (profiles, outcome, dirty) = match read_profiles(&backend) {
            Ok(read) => read,
            Err(err) => {
                tracing::error!("Failed to load profiles, creating default: {err:?}");
                (ProfileSet::with_default(), LoadOutcome::Recovered, true)
            }
        };
        let store = Self {
            backend,
            profiles,
            outcome,
        };
        if dirty && store.persist() && outcome == LoadOutcome::Migrated {
            match store.backend.remove(LEGACY_PROFILE_KEY) {
                Ok(()) => tracing::info!("Migrated legacy profile record"),
                Err(err) => tracing::error!("Failed to remove legacy profile record: {err:?}"),
            }
        }
        store
    }

    pub fn outcome(&self) -> LoadOutcome {
        self.outcome
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    pub fn active(&self) -> &Profile {
        self.profiles.active()
    }

    pub fn save(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self.profiles.profiles())?;
        self.backend.set(PROFILES_KEY, &serialized)?;
        self.backend
            .set(ACTIVE_PROFILE_KEY, &self.profiles.active_id().to_string())?;
        Ok(())
    }

    pub fn switch_active(&mut self, id: ProfileId) -> bool {
        if !self.profiles.switch_active(id) {
            return false;
        }
        if let Err(err) = self.backend.set(ACTIVE_PROFILE_KEY, &id.to_string()) {
            tracing::error!("Failed to save active profile: {err:?}");
        }
        true
    }

    pub fn create(&mut self, name: &str) -> ProfileId {
        let id = self.profiles.create(name);
        self.persist();
        id
    }

    pub fn duplicate(
        &mut self,
        source: ProfileId,
        name: &str,
    ) -> std::result::Result<ProfileId, ProfileError> {
        let id = self.profiles.duplicate(source, name)?;
        self.persist();
        Ok(id)
    }

    pub fn delete(&mut self, id: ProfileId) -> std::result::Result<Profile, ProfileError> {
        let removed = self.profiles.delete(id)?;
        self.persist();
        Ok(removed)
    }

    pub fn update(&mut self, profile: Profile) -> std::result::Result<(), ProfileError> {
        self.profiles.update(profile)?;
        self.persist();
        Ok(())
    }

    pub fn rename(
        &mut self,
        id: ProfileId,
        name: &str,
    ) -> std::result::Result<(), ProfileError> {
        self.profiles.rename(id, name)?;
        self.persist();
        Ok(())
    }

    /// Wipes every persisted key and starts over as on first run.
    pub fn clear_all(&mut self) -> LoadOutcome {
        for key in [PROFILES_KEY, ACTIVE_PROFILE_KEY, LEGACY_PROFILE_KEY] {
            if let Err(err) = self.backend.remove(key) {
                tracing::error!("Failed to remove `{key}`: {err:?}");
            }
        }
        let (profiles, outcome, dirty) = match read_profiles(&self.backend) {
            Ok(read) => read,
            Err(err) => {
                tracing::error!("Failed to reload profiles: {err:?}");
                (ProfileSet::with_default(), LoadOutcome::Recovered, true)
            }
        };
        self.profiles = profiles;
        self.outcome = outcome;
        if dirty {
            self.persist();
        }
        outcome
    }

    fn persist(&self) -> bool {
        match self.save() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("Failed to save profiles: {err:?}");
                false
            }
        }
    }
}

/// Reads the collection, falling back to the legacy record and then to a
/// default profile. The flag tells whether the result differs from storage.
fn read_profiles<S: KeyValueStore>(backend: &S) -> Result<(ProfileSet, LoadOutcome, bool)> {
    if let Some(contents) = backend.get(PROFILES_KEY)? {
        let map: BTreeMap<ProfileId, Profile> = serde_json::from_str(&contents)?;
        let rekeyed = map.iter().any(|(id, profile)| *id != profile.id);
        if rekeyed {
            tracing::warn!("Stored profile ids did not match their keys, using the keys");
        }
        let stored_active = backend
            .get(ACTIVE_PROFILE_KEY)?
            .and_then(|raw| raw.trim().parse::<ProfileId>().ok());
        let profiles = ProfileSet::from_parts(map, stored_active)
            .ok_or_else(|| anyhow!("stored profile collection is empty"))?;
        let repaired = stored_active != Some(profiles.active_id());
        if repaired {
            tracing::warn!("Active profile pointer was missing or stale, using first profile");
        }
        return Ok((profiles, LoadOutcome::Loaded, repaired || rekeyed));
    }

    if let Some(contents) = backend.get(LEGACY_PROFILE_KEY)? {
        let legacy: LegacyProfile = serde_json::from_str(&contents)?;
        return Ok((
            ProfileSet::single(legacy.into_profile()),
            LoadOutcome::Migrated,
            true,
        ));
    }

    Ok((ProfileSet::with_default(), LoadOutcome::Created, true))
}
