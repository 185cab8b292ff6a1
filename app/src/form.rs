use stompmiru_core::{
    headers::{ValidationError, validate_field},
    profiles::{
        AuthField, Profile, SubscriptionField, default_auth_fields, default_subscription_fields,
    },
};

/// Editable copy of the active profile's connection settings. Every edit is
/// written back as a whole profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileForm {
    pub server_url: String,
    pub destination: String,
    pub auth_fields: Vec<AuthField>,
    pub fields: Vec<SubscriptionField>,
}

impl ProfileForm {
    /// Empty field lists are replaced by the default sets.
    pub fn from_profile(profile: &Profile) -> Self {
        let auth_fields = if profile.auth_fields.is_empty() {
            default_auth_fields()
        } else {
            profile.auth_fields.clone()
        };
        let fields = if profile.fields.is_empty() {
            default_subscription_fields()
        } else {
            profile.fields.clone()
        };
        Self {
            server_url: profile.server_url.clone(),
            destination: profile.destination.clone(),
            auth_fields,
            fields,
        }
    }

    /// The stored profile with every editable value taken from the form.
    pub fn apply_to(&self, profile: &Profile) -> Profile {
        Profile {
            server_url: self.server_url.clone(),
            destination: self.destination.clone(),
            auth_fields: self.auth_fields.clone(),
            fields: self.fields.clone(),
            ..profile.clone()
        }
    }

    /// Subscription fields whose current value does not match their type.
    pub fn field_issues(&self) -> Vec<(usize, ValidationError)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(index, field)| validate_field(field).err().map(|err| (index, err)))
            .collect()
    }
}
