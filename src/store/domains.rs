// Domain value types for the file-backed stores.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Domain;

/// A financial goal. The id is assigned by the store at creation; the rest
/// of the record (name, metric, target value, deadline, ...) is freeform and
/// round-trips untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Goal {
    pub fn new(id: String, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Shallow-merge a patch into the goal's freeform fields. An `id` key in
    /// the patch is ignored; ids are immutable once assigned.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// Next goal id for a user's list: millisecond stamp, bumped past any
/// existing id so two goals created in the same millisecond stay distinct.
pub fn next_goal_id(existing: &[Goal]) -> String {
    let mut candidate = Utc::now().timestamp_millis();
    while existing.iter().any(|g| g.id == candidate.to_string()) {
        candidate += 1;
    }
    candidate.to_string()
}

/// A user profile: a single record, created lazily with defaults on first
/// read and shallow-merged on every write, never fully replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile {
    pub fields: Map<String, Value>,
}

impl Default for Profile {
    fn default() -> Self {
        let mut fields = Map::new();
        fields.insert("name".into(), "".into());
        fields.insert("currency".into(), "USD".into());
        fields.insert("plan".into(), "starter".into());
        fields.insert("preferredProvider".into(), "gemini".into());
        Self { fields }
    }
}

impl Profile {
    /// Shallow merge: top-level keys from the patch overwrite, everything
    /// else is retained.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// A registered push device. `token` is the dedup key within a user's list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub token: String,
    pub platform: String,
    #[serde(rename = "registeredAt")]
    pub registered_at: String,
}

impl DeviceRegistration {
    pub fn new(token: String, platform: String) -> Self {
        Self {
            token,
            platform,
            registered_at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct GoalsDomain;

impl Domain for GoalsDomain {
    const NAME: &'static str = "goals";
    type Value = Vec<Goal>;
}

pub struct ProfileDomain;

impl Domain for ProfileDomain {
    const NAME: &'static str = "profile";
    type Value = Profile;
}

pub struct DevicesDomain;

impl Domain for DevicesDomain {
    const NAME: &'static str = "devices";
    type Value = Vec<DeviceRegistration>;
}
