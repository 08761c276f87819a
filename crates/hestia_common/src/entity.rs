//! Device inventory model.
//!
//! `EntityRecord` is one controllable device or sensor as seen in the
//! registry snapshot. Records are refreshed at the start of each resolution
//! cycle and never mutated by scoring logic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Device category. Mirrors the `domain` prefix of an entity id
/// (`light.office_ceiling` → `Light`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Light,
    Switch,
    Climate,
    Cover,
    Lock,
    Fan,
    MediaPlayer,
    Sensor,
    BinarySensor,
    Camera,
    Vacuum,
    Scene,
}

impl Domain {
    /// Canonical lowercase name, as used in entity ids and service calls.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Climate => "climate",
            Self::Cover => "cover",
            Self::Lock => "lock",
            Self::Fan => "fan",
            Self::MediaPlayer => "media_player",
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Camera => "camera",
            Self::Vacuum => "vacuum",
            Self::Scene => "scene",
        }
    }

    /// Parse the domain prefix of an entity id (`"light.office"` → `Light`).
    pub fn from_entity_id(entity_id: &str) -> Option<Self> {
        let prefix = entity_id.split('.').next()?;
        Self::from_str_opt(prefix)
    }

    fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "light" => Self::Light,
            "switch" => Self::Switch,
            "climate" => Self::Climate,
            "cover" => Self::Cover,
            "lock" => Self::Lock,
            "fan" => Self::Fan,
            "media_player" => Self::MediaPlayer,
            "sensor" => Self::Sensor,
            "binary_sensor" => Self::BinarySensor,
            "camera" => Self::Camera,
            "vacuum" => Self::Vacuum,
            "scene" => Self::Scene,
            _ => return None,
        })
    }

    /// Map an extracted device term to the domain it implies.
    ///
    /// Covers common synonyms and plurals ("lamps" → `Light`). Terms that
    /// imply no domain return `None` and do not constrain blocking.
    pub fn from_device_term(term: &str) -> Option<Self> {
        let t = term.trim().to_lowercase();
        let t = t.strip_suffix('s').unwrap_or(&t);
        Some(match t {
            "light" | "lamp" | "bulb" | "led" => Self::Light,
            "switch" | "outlet" | "plug" | "socket" => Self::Switch,
            "thermostat" | "heater" | "heating" | "ac" | "aircon" => Self::Climate,
            "cover" | "blind" | "shutter" | "curtain" | "garage" | "shade" => Self::Cover,
            "lock" | "deadbolt" => Self::Lock,
            "fan" | "ventilator" => Self::Fan,
            "tv" | "speaker" | "player" | "stereo" | "radio" => Self::MediaPlayer,
            "sensor" | "thermometer" => Self::Sensor,
            "camera" | "cam" => Self::Camera,
            "vacuum" | "roomba" => Self::Vacuum,
            "scene" => Self::Scene,
            _ => return Self::from_str_opt(&t),
        })
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of an entity as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State value, e.g. "on", "off", "23.5"
    pub state: String,
    /// Free-form attribute map from the registry
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// When the registry reported this state
    pub updated_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(state: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            state: state.into(),
            attributes: serde_json::Value::Null,
            updated_at,
        }
    }

    /// A snapshot older than `max_age_secs` does not count as ground truth.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        now - self.updated_at > Duration::seconds(max_age_secs)
    }
}

/// One controllable device or sensor from the registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable identifier, `<domain>.<object_id>`
    pub entity_id: String,
    /// Device category
    pub domain: Domain,
    /// Area/location tag, lowercase ("office", "bedroom")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    /// Human-readable name ("Office Ceiling Light")
    pub name: String,
    /// System- and user-defined alias strings
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Cached embedding of name + aliases, if computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Last known state, if the registry has reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_state: Option<StateSnapshot>,
}

impl EntityRecord {
    pub fn new(entity_id: impl Into<String>, domain: Domain, name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            domain,
            area: None,
            name: name.into(),
            aliases: vec![],
            embedding: None,
            last_state: None,
        }
    }

    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into().to_lowercase());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Case-insensitive area comparison.
    pub fn area_matches(&self, location: &str) -> bool {
        self.area
            .as_deref()
            .map(|a| a.eq_ignore_ascii_case(location.trim()))
            .unwrap_or(false)
    }
}
