//! Core data types shared by the parser, the worker pool and the caches.
//!
//! Unit-level types (`UnitContent`, `TextElement`, `DocumentMetadata`) use camelCase on the
//! wire because they are produced by the external extractor as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Background color used for placeholder units.
pub const PLACEHOLDER_BACKGROUND: &str = "#FFFFFF";

/// Bounding box of an element on a unit, in the extractor's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

/// A run of text on a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TextElement {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Font, color and other styling the extractor reports, kept verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Background {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Structured content of a single unit (slide).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UnitContent {
    pub index: usize,

    /// Rendered image of the unit, if the extractor produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default)]
    pub text_elements: Vec<TextElement>,

    /// Shapes are passed through untouched.
    #[serde(default)]
    pub shapes: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Background>,

    /// Set when the unit stands in for one whose extraction failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl UnitContent {
    /// An empty unit at `index`: no text, no shapes, white background.
    pub fn placeholder(index: usize, error: Option<String>) -> Self {
        Self {
            index,
            background: Some(Background {
                color: Some(PLACEHOLDER_BACKGROUND.to_string()),
                image_url: None,
            }),
            placeholder: true,
            error,
            ..Default::default()
        }
    }
}

/// Document-level metadata reported by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Creation timestamp (ISO 8601 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Last modification timestamp (ISO 8601 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_format: Option<String>,

    #[serde(flatten)]
    pub additional: HashMap<String, Value>,
}

impl DocumentMetadata {
    /// Metadata used when the extractor cannot report any: the file stem as title.
    pub fn fallback_for(path: &Path) -> Self {
        Self {
            title: Some(file_stem(path)),
            author: Some("Unknown".to_string()),
            revision: Some(1),
            ..Default::default()
        }
    }
}

/// Why a [`ParseResult`] is partial or empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub message: String,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp of the failure.
    pub timestamp: String,
}

/// Outcome of parsing one document.
///
/// `units` is ordered by index and `total_units == units.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub file_name: String,
    pub units: Vec<UnitContent>,
    pub total_units: usize,
    pub metadata: DocumentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ParseFailure>,
}

impl ParseResult {
    pub fn new(file_name: String, units: Vec<UnitContent>, metadata: DocumentMetadata) -> Self {
        let total_units = units.len();
        Self {
            file_name,
            units,
            total_units,
            metadata,
            error: None,
        }
    }

    /// Number of units that hold real extracted content.
    pub fn populated_units(&self) -> usize {
        self.units.iter().filter(|unit| !unit.placeholder).count()
    }

    /// Number of units replaced by placeholders.
    pub fn failed_units(&self) -> usize {
        self.units.len() - self.populated_units()
    }
}

/// Per-call switches for [`crate::DocumentParser::parse`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParseOptions {
    /// Neither read from nor write to the result cache.
    #[serde(default)]
    pub skip_cache: bool,
    /// Ignore any cached result but store the fresh one.
    #[serde(default)]
    pub force_reparse: bool,
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
