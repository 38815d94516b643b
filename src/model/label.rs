// * Label - Group-by Dimension Identity
// * Identifies one series within a grouped query result and keys its evaluation state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// * Characters with structural meaning inside an identity string
const ESCAPED: [char; 5] = ['\\', ',', '=', '{', '}'];

/// An immutable, ordered set of dimension values
///
/// The identity string is a pure function of the dimension map: dimensions are
/// kept sorted by name and structural characters are escaped, so reordering
/// never changes it and distinct maps never collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Label {
    dimensions: BTreeMap<String, String>,
    id: String,
}

impl Label {
    /// The label of an ungrouped series
    pub fn empty() -> Self {
        Self::from(BTreeMap::new())
    }

    pub fn builder() -> LabelBuilder {
        LabelBuilder::default()
    }

    /// Stable identity used as a state-store key component
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.dimensions.get(dimension).map(String::as_str)
    }

    pub fn dimensions(&self) -> &BTreeMap<String, String> {
        &self.dimensions
    }

    /// Rebuilds a label from its identity string
    pub fn from_identity(identity: &str) -> Option<Label> {
        let inner = identity.strip_prefix('{')?.strip_suffix('}')?;
        let mut dimensions = BTreeMap::new();
        if inner.is_empty() {
            return Some(Label::from(dimensions));
        }

        for pair in split_unescaped(inner, ',') {
            let mut parts = split_unescaped(&pair, '=');
            if parts.len() != 2 {
                return None;
            }
            let value = unescape(&parts.pop()?);
            let name = unescape(&parts.pop()?);
            dimensions.insert(name, value);
        }

        let label = Label::from(dimensions);
        // * Reject non-canonical input so identities stay one-to-one
        (label.id == identity).then_some(label)
    }

    fn compute_id(dimensions: &BTreeMap<String, String>) -> String {
        let body = dimensions
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{}}}", body)
    }
}

impl From<BTreeMap<String, String>> for Label {
    fn from(dimensions: BTreeMap<String, String>) -> Self {
        let id = Self::compute_id(&dimensions);
        Self { dimensions, id }
    }
}

impl From<Label> for BTreeMap<String, String> {
    fn from(label: Label) -> Self {
        label.dimensions
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Incremental builder for [`Label`]; a repeated dimension keeps its last value
#[derive(Debug, Clone, Default)]
pub struct LabelBuilder {
    dimensions: BTreeMap<String, String>,
}

impl LabelBuilder {
    pub fn add(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(dimension.into(), value.into());
        self
    }

    pub fn build(self) -> Label {
        Label::from(self.dimensions)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

// * Splits on `sep` while keeping escape sequences intact
fn split_unescaped(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}
