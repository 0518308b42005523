use serde::{Deserialize, Serialize};

use crate::ids::BodyId;
use crate::CoreError;

/// The four child collections hanging off an example. Each is its own
/// ordered list scoped to the owning example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyKind {
    Form,
    UrlEncoded,
    Header,
    Query,
}

impl BodyKind {
    pub const ALL: [BodyKind; 4] = [Self::Form, Self::UrlEncoded, Self::Header, Self::Query];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::UrlEncoded => "url_encoded",
            Self::Header => "header",
            Self::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "form" => Ok(Self::Form),
            "url_encoded" => Ok(Self::UrlEncoded),
            "header" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            _ => Err(CoreError::InvalidArgument(format!("unknown body kind: {s}"))),
        }
    }

    /// Backing table for rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Form => "body_form",
            Self::UrlEncoded => "body_urlencoded",
            Self::Header => "example_header",
            Self::Query => "example_query",
        }
    }
}

/// Which request body an example carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExampleBodyKind {
    #[default]
    None,
    FormData,
    UrlEncoded,
    Raw,
}

impl ExampleBodyKind {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::FormData => 1,
            Self::UrlEncoded => 2,
            Self::Raw => 3,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self, CoreError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::FormData),
            2 => Ok(Self::UrlEncoded),
            3 => Ok(Self::Raw),
            _ => Err(CoreError::InvalidArgument(format!("unknown example body kind: {v}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePosition {
    Before,
    After,
}

/// Where a row of the merged overlay list comes from. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaSource {
    Origin,
    Delta,
    Mixed,
    DeltaOnly,
}

impl DeltaSource {
    pub fn classify(example_is_delta: bool, delta_parent: Option<BodyId>, has_overrides: bool) -> Self {
        match (example_is_delta, delta_parent) {
            (false, _) => Self::Origin,
            (true, None) => Self::DeltaOnly,
            (true, Some(_)) if has_overrides => Self::Mixed,
            (true, Some(_)) => Self::Delta,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::Delta => "delta",
            Self::Mixed => "mixed",
            Self::DeltaOnly => "delta_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyFields {
    pub key: String,
    pub value: String,
    pub description: String,
    pub enabled: bool,
}

impl BodyFields {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            description: String::new(),
            enabled: true,
        }
    }
}

/// Partial update of a body row. `None` leaves a field untouched; `Some`
/// writes it, including empty strings and `false`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldPatch {
    pub key: Option<String>,
    pub value: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none() && self.description.is_none() && self.enabled.is_none()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Overlay `self` on top of `base`.
    pub fn apply_to(&self, base: &BodyFields) -> BodyFields {
        BodyFields {
            key: self.key.clone().unwrap_or_else(|| base.key.clone()),
            value: self.value.clone().unwrap_or_else(|| base.value.clone()),
            description: self.description.clone().unwrap_or_else(|| base.description.clone()),
            enabled: self.enabled.unwrap_or(base.enabled),
        }
    }

    /// Fields set in either patch; `other` wins where both are set.
    pub fn merge(&self, other: &FieldPatch) -> FieldPatch {
        FieldPatch {
            key: other.key.clone().or_else(|| self.key.clone()),
            value: other.value.clone().or_else(|| self.value.clone()),
            description: other.description.clone().or_else(|| self.description.clone()),
            enabled: other.enabled.or(self.enabled),
        }
    }
}

impl From<BodyFields> for FieldPatch {
    fn from(f: BodyFields) -> Self {
        FieldPatch {
            key: Some(f.key),
            value: Some(f.value),
            description: Some(f.description),
            enabled: Some(f.enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_every_source() {
        let parent = Some(BodyId::new());
        assert_eq!(DeltaSource::classify(false, None, false), DeltaSource::Origin);
        assert_eq!(DeltaSource::classify(false, parent, true), DeltaSource::Origin);
        assert_eq!(DeltaSource::classify(true, None, false), DeltaSource::DeltaOnly);
        assert_eq!(DeltaSource::classify(true, parent, false), DeltaSource::Delta);
        assert_eq!(DeltaSource::classify(true, parent, true), DeltaSource::Mixed);
    }

    #[test]
    fn patch_writes_zero_values() {
        let base = BodyFields {
            key: "k".into(),
            value: "v".into(),
            description: "d".into(),
            enabled: true,
        };
        let patch = FieldPatch::default().value("").enabled(false);
        let out = patch.apply_to(&base);
        assert_eq!(out.key, "k");
        assert_eq!(out.value, "");
        assert_eq!(out.description, "d");
        assert!(!out.enabled);
        assert!(!patch.is_empty());
        assert!(FieldPatch::default().is_empty());
    }

    #[test]
    fn merge_prefers_newer_fields() {
        let old = FieldPatch::default().key("a").value("1");
        let new = FieldPatch::default().value("2").enabled(false);
        let merged = old.merge(&new);
        assert_eq!(merged.key.as_deref(), Some("a"));
        assert_eq!(merged.value.as_deref(), Some("2"));
        assert_eq!(merged.enabled, Some(false));
        assert_eq!(merged.description, None);
    }

    #[test]
    fn body_kind_round_trips_names() {
        for kind in BodyKind::ALL {
            assert_eq!(BodyKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(BodyKind::parse("cookie").is_err());
    }
}
