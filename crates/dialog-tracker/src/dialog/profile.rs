//! Dialog profiles
//!
//! A profile is a named grouping of dialogs, optionally keyed by a value
//! (for example a `caller` profile valued with the subscriber's URI). Each
//! dialog keeps the list of its [`ProfileLink`]s; the [`ProfileIndex`] keeps
//! the reverse direction so sizes and memberships can be queried without
//! walking the registry.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dialog::DialogId;
use crate::errors::{DialogError, DialogResult};

/// Membership of one dialog in one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileLink {
    /// Unique link id
    pub id: Uuid,
    /// Profile name
    pub profile: String,
    /// Value for valued profiles
    pub value: Option<String>,
}

#[derive(Debug)]
struct ProfileMember {
    dialog: DialogId,
    value: Option<String>,
}

/// A named dialog grouping
#[derive(Debug)]
pub struct DialogProfile {
    name: String,
    has_value: bool,
    members: DashMap<Uuid, ProfileMember>,
}

impl DialogProfile {
    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether links carry a value
    pub fn has_value(&self) -> bool {
        self.has_value
    }

    fn count(&self, value: Option<&str>) -> usize {
        match value {
            None => self.members.len(),
            Some(value) => self
                .members
                .iter()
                .filter(|m| m.value.as_deref() == Some(value))
                .count(),
        }
    }
}

/// Reverse index from profiles to dialogs
#[derive(Debug, Default)]
pub struct ProfileIndex {
    profiles: DashMap<String, Arc<DialogProfile>>,
}

impl ProfileIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a profile; declaring it again with the same shape is a no-op
    pub fn define(&self, name: &str, has_value: bool) -> DialogResult<()> {
        if name.is_empty() {
            return Err(DialogError::config_error("profile name must not be empty"));
        }
        let profile = self
            .profiles
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DialogProfile {
                    name: name.to_string(),
                    has_value,
                    members: DashMap::new(),
                })
            })
            .clone();
        if profile.has_value != has_value {
            return Err(DialogError::config_error(format!(
                "profile '{}' already defined with has_value = {}",
                name, profile.has_value
            )));
        }
        Ok(())
    }

    fn get(&self, name: &str) -> DialogResult<Arc<DialogProfile>> {
        self.profiles
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| DialogError::config_error(format!("unknown profile '{}'", name)))
    }

    /// Add a dialog to a profile and return the link the dialog must keep
    pub fn link(&self, dialog: DialogId, name: &str, value: Option<&str>) -> DialogResult<ProfileLink> {
        let profile = self.get(name)?;
        match (profile.has_value, value) {
            (true, None) => {
                return Err(DialogError::config_error(format!("profile '{}' requires a value", name)));
            }
            (false, Some(_)) => {
                return Err(DialogError::config_error(format!("profile '{}' takes no value", name)));
            }
            _ => {}
        }

        let link = ProfileLink {
            id: Uuid::new_v4(),
            profile: name.to_string(),
            value: value.map(str::to_string),
        };
        profile.members.insert(
            link.id,
            ProfileMember {
                dialog,
                value: link.value.clone(),
            },
        );
        Ok(link)
    }

    /// Remove a link from the index
    pub fn unlink(&self, link: &ProfileLink) {
        if let Some(profile) = self.profiles.get(&link.profile) {
            profile.members.remove(&link.id);
        }
    }

    /// Number of dialogs in a profile, optionally restricted to one value
    pub fn size(&self, name: &str, value: Option<&str>) -> DialogResult<usize> {
        Ok(self.get(name)?.count(value))
    }

    /// Dialogs in a profile, optionally restricted to one value
    pub fn members(&self, name: &str, value: Option<&str>) -> DialogResult<Vec<DialogId>> {
        let profile = self.get(name)?;
        let mut members: Vec<DialogId> = profile
            .members
            .iter()
            .filter(|m| value.is_none() || m.value.as_deref() == value)
            .map(|m| m.dialog)
            .collect();
        members.sort();
        members.dedup();
        Ok(members)
    }

    /// Names of the declared profiles
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }
}
