//! Instrument link value object (one element of a snapshot payload).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value_object::ValueObject;

/// One instrument linked to a datasheet.
///
/// Serialized with camelCase field names; this is the element type of the
/// snapshot payload array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentLink {
    pub instrument_id: i64,
    pub instrument_tag: String,
    pub instrument_tag_norm: Option<String>,
    pub instrument_type: Option<String>,
    pub link_role: Option<String>,
    #[serde(default)]
    pub loop_tags: Vec<String>,
}

impl ValueObject for InstrumentLink {}

impl InstrumentLink {
    pub fn new(instrument_id: i64, instrument_tag: impl Into<String>) -> Self {
        Self {
            instrument_id,
            instrument_tag: instrument_tag.into(),
            instrument_tag_norm: None,
            instrument_type: None,
            link_role: None,
            loop_tags: Vec::new(),
        }
    }

    pub fn with_tag_norm(mut self, tag_norm: impl Into<String>) -> Self {
        self.instrument_tag_norm = Some(tag_norm.into());
        self
    }

    pub fn with_type(mut self, instrument_type: impl Into<String>) -> Self {
        self.instrument_type = Some(instrument_type.into());
        self
    }

    pub fn with_role(mut self, link_role: impl Into<String>) -> Self {
        self.link_role = Some(link_role.into());
        self
    }

    pub fn with_loop_tags<I, T>(mut self, loop_tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.loop_tags = loop_tags.into_iter().map(Into::into).collect();
        self
    }

    /// Lenient decode of one payload element.
    ///
    /// Returns `None` when `instrumentId` is not an integral number or
    /// `instrumentTag` is not a string. Optional fields of the wrong type decode
    /// as `None`; non-string loop tags are dropped.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;

        let instrument_id = obj.get("instrumentId").and_then(integral_number)?;
        let instrument_tag = obj.get("instrumentTag")?.as_str()?.to_string();

        let optional_str = |field: &str| {
            obj.get(field)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        };

        let loop_tags = match obj.get("loopTags") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            instrument_id,
            instrument_tag,
            instrument_tag_norm: optional_str("instrumentTagNorm"),
            instrument_type: optional_str("instrumentType"),
            link_role: optional_str("linkRole"),
            loop_tags,
        })
    }
}

fn integral_number(value: &JsonValue) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
