//! Operational-transform adapter: documents, steps, and position maps.
//!
//! The coordination layer treats documents and steps as opaque
//! JSON-serializable values; this module is the one place that interprets
//! them. It provides the minimal contract the rest of the crate needs:
//!
//! - [`Schema::empty_doc`] — the version-0 document,
//! - [`Step::apply`] — total-or-fail application, never partial,
//! - [`Step`] to/from JSON (`{"stepType": "replace", ...}`),
//! - [`Mapping`] — composed position maps for rebasing concurrent steps.
//!
//! The document model is a linear rich-text body addressed by character
//! positions. Position mapping follows the association-side rules of
//! editor transform libraries: a mapped position keeps its side relative
//! to concurrent insertions, and a position strictly inside a replaced
//! range is reported as deleted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Adapter errors. Step application failures carry enough context for
/// the server's `apply_failed` reason string.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("replace range {from}..{to} is inverted")]
    InvertedRange { from: usize, to: usize },
    #[error("replace range {from}..{to} outside document of length {len}")]
    OutOfBounds { from: usize, to: usize, len: usize },
    #[error("malformed step: {0}")]
    MalformedStep(String),
    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

/// Document schema. Constructs empty documents and deserializes steps
/// and documents from their JSON wire forms.
#[derive(Debug, Clone, Copy, Default)]
pub struct Schema;

impl Schema {
    /// The initial document every room starts from (version 0).
    pub fn empty_doc(&self) -> Document {
        Document::default()
    }

    pub fn doc_from_json(&self, value: &Value) -> Result<Document, TransformError> {
        let object = value
            .as_object()
            .ok_or_else(|| TransformError::MalformedDocument("not an object".to_string()))?;
        if object.get("type").and_then(Value::as_str) != Some("doc") {
            return Err(TransformError::MalformedDocument(
                "missing \"doc\" type tag".to_string(),
            ));
        }
        let text = object
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::MalformedDocument("missing content".to_string()))?;
        Ok(Document {
            text: text.to_string(),
        })
    }

    pub fn step_from_json(&self, value: &Value) -> Result<Step, TransformError> {
        serde_json::from_value(value.clone())
            .map_err(|e| TransformError::MalformedStep(e.to_string()))
    }
}

/// An opaque-to-the-coordinator document tree.
///
/// JSON form: `{"type": "doc", "content": "..."}`. The serialized shape
/// is stable, so JSON equality is usable to compare documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    text: String,
}

impl Document {
    /// Document length in character positions.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({"type": "doc", "content": self.text})
    }

    /// Byte offset of character position `pos` (== `text.len()` at the end).
    fn byte_offset(&self, pos: usize) -> usize {
        self.text
            .char_indices()
            .nth(pos)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}

/// An atomic, serializable document transformation.
///
/// Wire form is tagged by `stepType`; unknown step types fail to
/// deserialize, which surfaces as `apply_failed` on the server and as the
/// rebase fallback on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum Step {
    /// Replace the characters in `[from, to)` with `insert`.
    Replace {
        from: usize,
        to: usize,
        #[serde(default)]
        insert: String,
    },
}

impl Step {
    pub fn replace(from: usize, to: usize, insert: impl Into<String>) -> Self {
        Step::Replace {
            from,
            to,
            insert: insert.into(),
        }
    }

    /// Insert `text` at `pos`.
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::replace(pos, pos, text)
    }

    /// Delete the characters in `[from, to)`.
    pub fn delete(from: usize, to: usize) -> Self {
        Self::replace(from, to, "")
    }

    /// Apply to `doc`, producing a new document. Fails without side
    /// effects when the step does not fit the document.
    pub fn apply(&self, doc: &Document) -> Result<Document, TransformError> {
        match self {
            Step::Replace { from, to, insert } => {
                if from > to {
                    return Err(TransformError::InvertedRange {
                        from: *from,
                        to: *to,
                    });
                }
                let len = doc.len();
                if *to > len {
                    return Err(TransformError::OutOfBounds {
                        from: *from,
                        to: *to,
                        len,
                    });
                }
                let start = doc.byte_offset(*from);
                let end = doc.byte_offset(*to);
                let mut text = String::with_capacity(doc.text.len() + insert.len());
                text.push_str(&doc.text[..start]);
                text.push_str(insert);
                text.push_str(&doc.text[end..]);
                Ok(Document { text })
            }
        }
    }

    /// The position map of this step.
    pub fn pos_map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, insert } => StepMap::new(vec![MapRange {
                start: *from,
                old_len: to - from,
                new_len: insert.chars().count(),
            }]),
        }
    }

    /// Map this step through the position changes of `mapping`.
    ///
    /// Returns `None` when the step's context was deleted by the
    /// intervening edits (both endpoints fell strictly inside replaced
    /// ranges).
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        match self {
            Step::Replace { from, to, insert } => {
                let from = mapping.map_result(*from, 1);
                let to = mapping.map_result(*to, -1);
                if from.deleted && to.deleted {
                    return None;
                }
                Some(Step::Replace {
                    from: from.pos,
                    to: to.pos.max(from.pos),
                    insert: insert.clone(),
                })
            }
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One replaced region of a [`StepMap`], in pre-step coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    pub start: usize,
    pub old_len: usize,
    pub new_len: usize,
}

/// Result of mapping a position: the new position, and whether the old
/// position fell strictly inside a replaced range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    pub deleted: bool,
}

/// Position map of a single step: an ordered set of replaced ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    ranges: Vec<MapRange>,
}

impl StepMap {
    pub fn new(ranges: Vec<MapRange>) -> Self {
        Self { ranges }
    }

    /// Map `pos` across this step's replacements.
    ///
    /// `assoc` decides which side a position at an insertion point sticks
    /// to: negative stays before inserted content, positive moves after.
    pub fn map_result(&self, pos: usize, assoc: i8) -> MapResult {
        let mut diff: isize = 0;
        for range in &self.ranges {
            if range.start > pos {
                break;
            }
            let end = range.start + range.old_len;
            if pos <= end {
                let side = if range.old_len == 0 {
                    assoc
                } else if pos == range.start {
                    -1
                } else if pos == end {
                    1
                } else {
                    assoc
                };
                let base = (range.start as isize + diff) as usize;
                let mapped = if side < 0 { base } else { base + range.new_len };
                let deleted = pos > range.start && pos < end;
                return MapResult {
                    pos: mapped,
                    deleted,
                };
            }
            diff += range.new_len as isize - range.old_len as isize;
        }
        MapResult {
            pos: (pos as isize + diff) as usize,
            deleted: false,
        }
    }

    pub fn map(&self, pos: usize, assoc: i8) -> usize {
        self.map_result(pos, assoc).pos
    }
}

/// An ordered composition of step position maps.
///
/// Built from the server steps that intervened between a client's base
/// version and the authoritative head; queued local steps are mapped
/// through it during rebase.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: &[Step]) -> Self {
        let mut mapping = Self::new();
        for step in steps {
            mapping.append_map(step.pos_map());
        }
        mapping
    }

    pub fn append_map(&mut self, map: StepMap) {
        self.maps.push(map);
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Fold `pos` through every map in order; deletion is sticky.
    pub fn map_result(&self, pos: usize, assoc: i8) -> MapResult {
        let mut result = MapResult {
            pos,
            deleted: false,
        };
        for map in &self.maps {
            let next = map.map_result(result.pos, assoc);
            result.pos = next.pos;
            result.deleted |= next.deleted;
        }
        result
    }

    pub fn map(&self, pos: usize, assoc: i8) -> usize {
        self.map_result(pos, assoc).pos
    }
}
