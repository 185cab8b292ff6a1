use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProfileId = Uuid;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:61614/stomp";
pub const DEFAULT_DESTINATION: &str = "/topic/<SUB_ID>";
pub const MIGRATED_PROFILE_NAME: &str = "Migrated profile";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Json,
    Array,
}

impl FieldType {
    pub const ALL: [FieldType; 5] = [
        FieldType::String,
        FieldType::Number,
        FieldType::Boolean,
        FieldType::Json,
        FieldType::Array,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Json => "json",
            FieldType::Array => "array",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown field type `{0}` (expected string, number, boolean, json or array)")]
pub struct UnknownFieldType(pub String);

impl FromStr for FieldType {
    type Err = UnknownFieldType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.trim().to_ascii_lowercase();
        FieldType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == lower)
            .ok_or_else(|| UnknownFieldType(value.to_string()))
    }
}

/// A header sent with the CONNECT handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl AuthField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A typed header sent with SUBSCRIBE. `value` always holds the raw text the
/// operator typed; conversion happens when headers are built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionField {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub value: String,
}

impl SubscriptionField {
    pub fn new(name: impl Into<String>, field_type: FieldType, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type,
            value: value.into(),
        }
    }
}

pub fn default_auth_fields() -> Vec<AuthField> {
    vec![AuthField::new("login", ""), AuthField::new("passcode", "")]
}

pub fn default_subscription_fields() -> Vec<SubscriptionField> {
    vec![
        SubscriptionField::new("ack", FieldType::String, "auto"),
        SubscriptionField::new("filter", FieldType::Json, "{}"),
    ]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub auth_fields: Vec<AuthField>,
    #[serde(default)]
    pub fields: Vec<SubscriptionField>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            server_url: DEFAULT_SERVER_URL.into(),
            destination: DEFAULT_DESTINATION.into(),
            auth_fields: default_auth_fields(),
            fields: default_subscription_fields(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Deep copy of the field data under a fresh id and fresh timestamps.
    pub fn duplicate(&self, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            server_url: self.server_url.clone(),
            destination: self.destination.clone(),
            auth_fields: self.auth_fields.clone(),
            fields: self.fields.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Host part of the server URL, for list summaries.
    pub fn server_host(&self) -> Option<String> {
        let trimmed = self.server_url.trim();
        if trimmed.is_empty() {
            return None;
        }
        url::Url::parse(trimmed)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

/// The flat single-profile record written by older versions, before profiles
/// had ids.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub auth_fields: Vec<AuthField>,
    #[serde(default)]
    pub fields: Vec<SubscriptionField>,
}

impl LegacyProfile {
    pub fn into_profile(self) -> Profile {
        let now = Utc::now();
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| MIGRATED_PROFILE_NAME.into());
        Profile {
            id: Uuid::new_v4(),
            name,
            server_url: self.server_url,
            destination: self.destination,
            auth_fields: self.auth_fields,
            fields: self.fields,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("the only remaining profile cannot be deleted; create another one first")]
    LastProfile,
    #[error("profile {0} does not exist")]
    NotFound(ProfileId),
}

/// Non-empty collection of profiles with exactly one active entry.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<ProfileId, Profile>,
    active: ProfileId,
}

impl ProfileSet {
    pub fn single(profile: Profile) -> Self {
        let active = profile.id;
        let mut profiles = BTreeMap::new();
        profiles.insert(active, profile);
        Self { profiles, active }
    }

    pub fn with_default() -> Self {
        Self::single(Profile::new("Profile 1"))
    }

    /// Returns `None` for an empty collection. An active id that does not
    /// resolve falls back to the first profile. Each record takes the id it
    /// is keyed under.
    pub fn from_parts(
        mut profiles: BTreeMap<ProfileId, Profile>,
        active: Option<ProfileId>,
    ) -> Option<Self> {
        for (id, profile) in profiles.iter_mut() {
            profile.id = *id;
        }
        let active = match active {
            Some(id) if profiles.contains_key(&id) => id,
            _ => *profiles.keys().next()?,
        };
        Some(Self { profiles, active })
    }

    pub fn profiles(&self) -> &BTreeMap<ProfileId, Profile> {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn active_id(&self) -> ProfileId {
        self.active
    }

    pub fn active(&self) -> &Profile {
        &self.profiles[&self.active]
    }

    pub fn get(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.get(&id)
    }

    pub fn contains(&self, id: ProfileId) -> bool {
        self.profiles.contains_key(&id)
    }

    /// Most recently updated first.
    pub fn sorted_by_recent(&self) -> Vec<&Profile> {
        let mut list: Vec<&Profile> = self.profiles.values().collect();
        list.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        list
    }

    /// Matches an exact name or an id prefix. Ambiguous prefixes resolve to
    /// nothing.
    pub fn resolve(&self, needle: &str) -> Option<ProfileId> {
        let needle = needle.trim();
        if needle.is_empty() {
            return None;
        }
        if let Some(profile) = self.profiles.values().find(|p| p.name == needle) {
            return Some(profile.id);
        }
        let mut matches = self
            .profiles
            .keys()
            .filter(|id| id.to_string().starts_with(needle));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Some(*id),
            _ => None,
        }
    }

    pub fn switch_active(&mut self, id: ProfileId) -> bool {
        if !self.profiles.contains_key(&id) {
            return false;
        }
        self.active = id;
        true
    }

    pub fn default_new_name(&self) -> String {
        format!("Profile {}", self.profiles.len() + 1)
    }

    pub fn create(&mut self, name: &str) -> ProfileId {
        let name = match name.trim() {
            "" => self.default_new_name(),
            trimmed => trimmed.to_string(),
        };
        self.insert_active(Profile::new(name))
    }

    pub fn duplicate(&mut self, source: ProfileId, name: &str) -> Result<ProfileId, ProfileError> {
        let source = self
            .profiles
            .get(&source)
            .ok_or(ProfileError::NotFound(source))?;
        let name = match name.trim() {
            "" => format!("{} (copy)", source.name),
            trimmed => trimmed.to_string(),
        };
        let copy = source.duplicate(name);
        Ok(self.insert_active(copy))
    }

    pub fn delete(&mut self, id: ProfileId) -> Result<Profile, ProfileError> {
        if !self.profiles.contains_key(&id) {
            return Err(ProfileError::NotFound(id));
        }
        if self.profiles.len() == 1 {
            return Err(ProfileError::LastProfile);
        }
        let removed = self
            .profiles
            .remove(&id)
            .ok_or(ProfileError::NotFound(id))?;
        if self.active == id
            && let Some(next) = self.profiles.keys().next()
        {
            self.active = *next;
        }
        Ok(removed)
    }

    /// Replaces a stored profile wholesale and refreshes its `updated_at`.
    pub fn update(&mut self, mut profile: Profile) -> Result<(), ProfileError> {
        let Some(slot) = self.profiles.get_mut(&profile.id) else {
            return Err(ProfileError::NotFound(profile.id));
        };
        profile.touch();
        *slot = profile;
        Ok(())
    }

    pub fn rename(&mut self, id: ProfileId, name: &str) -> Result<(), ProfileError> {
        let profile = self.profiles.get_mut(&id).ok_or(ProfileError::NotFound(id))?;
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            profile.name = trimmed.to_string();
        }
        profile.touch();
        Ok(())
    }

    fn insert_active(&mut self, profile: Profile) -> ProfileId {
        let id = profile.id;
        self.profiles.insert(id, profile);
        self.active = id;
        id
    }
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self::with_default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn active_resolves(set: &ProfileSet) -> bool {
        !set.is_empty() && set.contains(set.active_id())
    }

    #[test]
    fn create_duplicate_delete_keep_active_valid() {
        let mut set = ProfileSet::with_default();
        let first = set.active_id();
        let second = set.create("second");
        assert_eq!(set.active_id(), second);
        let copy = set.duplicate(second, "").unwrap();
        assert_eq!(set.get(copy).unwrap().name, "second (copy)");
        assert!(active_resolves(&set));

        set.delete(copy).unwrap();
        assert!(active_resolves(&set));
        set.delete(second).unwrap();
        assert_eq!(set.active_id(), first);
        assert_eq!(set.delete(first), Err(ProfileError::LastProfile));
        assert_eq!(set.len(), 1);
        assert!(active_resolves(&set));
    }

    #[test]
    fn deleting_sole_profile_leaves_collection_unchanged() {
        let mut set = ProfileSet::with_default();
        let before = set.clone();
        assert_eq!(set.delete(set.active_id()), Err(ProfileError::LastProfile));
        assert_eq!(set, before);
    }

    #[test]
    fn deleting_inactive_profile_keeps_active() {
        let mut set = ProfileSet::with_default();
        let first = set.active_id();
        let second = set.create("b");
        set.switch_active(first);
        set.delete(second).unwrap();
        assert_eq!(set.active_id(), first);
    }

    #[test]
    fn create_with_blank_name_uses_counter() {
        let mut set = ProfileSet::with_default();
        let id = set.create("   ");
        assert_eq!(set.get(id).unwrap().name, "Profile 2");
    }

    #[test]
    fn duplicate_copies_fields_under_new_identity() {
        let mut set = ProfileSet::with_default();
        let source = set.active_id();
        let mut edited = set.active().clone();
        edited.destination = "/queue/orders".into();
        edited.fields.push(SubscriptionField::new("n", FieldType::Number, "3"));
        set.update(edited).unwrap();

        let copy = set.duplicate(source, "copy").unwrap();
        let original = set.get(source).unwrap().clone();
        let duplicated = set.get(copy).unwrap();
        assert_ne!(duplicated.id, original.id);
        assert_eq!(duplicated.destination, original.destination);
        assert_eq!(duplicated.fields, original.fields);
        assert_eq!(duplicated.auth_fields, original.auth_fields);
        assert!(duplicated.created_at >= original.created_at);
    }

    #[test]
    fn switch_to_unknown_id_is_noop() {
        let mut set = ProfileSet::with_default();
        let active = set.active_id();
        assert!(!set.switch_active(Uuid::new_v4()));
        assert_eq!(set.active_id(), active);
    }

    #[test]
    fn sorted_by_recent_puts_latest_update_first() {
        let mut set = ProfileSet::with_default();
        let old = set.active_id();
        let new = set.create("new");
        let mut stale = set.get(new).unwrap().clone();
        stale.updated_at = Utc::now() - Duration::hours(1);
        set.profiles.insert(new, stale);

        let order: Vec<ProfileId> = set.sorted_by_recent().iter().map(|p| p.id).collect();
        assert_eq!(order, vec![old, new]);
    }

    #[test]
    fn from_parts_repairs_dangling_active_id() {
        let profile = Profile::new("only");
        let id = profile.id;
        let mut map = BTreeMap::new();
        map.insert(id, profile);
        let set = ProfileSet::from_parts(map, Some(Uuid::new_v4())).unwrap();
        assert_eq!(set.active_id(), id);
        assert!(ProfileSet::from_parts(BTreeMap::new(), None).is_none());
    }

    #[test]
    fn from_parts_rekeys_records_and_keeps_them_editable() {
        let key = Uuid::new_v4();
        let mut map = BTreeMap::new();
        map.insert(key, Profile::new("misfiled"));
        let mut set = ProfileSet::from_parts(map, Some(key)).unwrap();
        assert_eq!(set.active().id, key);

        let mut edited = set.active().clone();
        edited.destination = "/topic/edited".into();
        set.update(edited).unwrap();
        assert_eq!(set.active().destination, "/topic/edited");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn resolve_by_name_or_prefix() {
        let mut set = ProfileSet::with_default();
        let id = set.create("orders");
        assert_eq!(set.resolve("orders"), Some(id));
        let prefix = &id.to_string()[..8];
        assert_eq!(set.resolve(prefix), Some(id));
        assert_eq!(set.resolve(""), None);
    }

    #[test]
    fn legacy_record_keeps_name_or_gets_default() {
        let legacy: LegacyProfile = serde_json::from_str(
            r#"{"serverUrl":"ws://broker:8080/ws","destination":"/topic/a","authFields":[{"name":"token","value":"t"}]}"#,
        )
        .unwrap();
        let profile = legacy.into_profile();
        assert_eq!(profile.name, MIGRATED_PROFILE_NAME);
        assert_eq!(profile.server_url, "ws://broker:8080/ws");
        assert_eq!(profile.auth_fields, vec![AuthField::new("token", "t")]);
        assert!(profile.fields.is_empty());

        let named = LegacyProfile {
            name: Some("prod".into()),
            ..LegacyProfile::default()
        };
        assert_eq!(named.into_profile().name, "prod");
    }

    #[test]
    fn profile_serializes_camel_case_with_type_key() {
        let mut profile = Profile::new("p");
        profile.fields = vec![SubscriptionField::new("n", FieldType::Number, "1")];
        let value = serde_json::to_value(&profile).unwrap();
        assert!(value.get("serverUrl").is_some());
        assert!(value.get("authFields").is_some());
        assert!(value.get("updatedAt").is_some());
        assert_eq!(value["fields"][0]["type"], "number");
    }

    #[test]
    fn server_host_handles_blank_and_garbage() {
        let mut profile = Profile::new("p");
        profile.server_url = "ws://broker.local:61614/stomp".into();
        assert_eq!(profile.server_host().as_deref(), Some("broker.local"));
        profile.server_url = "not a url".into();
        assert_eq!(profile.server_host(), None);
        profile.server_url = String::new();
        assert_eq!(profile.server_host(), None);
    }

    #[test]
    fn field_type_parses_case_insensitively() {
        assert_eq!("JSON".parse::<FieldType>(), Ok(FieldType::Json));
        assert!("csv".parse::<FieldType>().is_err());
    }
}
