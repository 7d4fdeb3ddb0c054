use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a content record. UUIDv7 everywhere, minted by the store.
pub type ContentId = Uuid;

/// Number of characters an auto-rendered excerpt is limited to.
pub const EXCERPT_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Publication,
    Style,
    Fragment,
    Template,
    Space,
}

impl ContentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Publication => "publication",
            Self::Style => "style",
            Self::Fragment => "fragment",
            Self::Template => "template",
            Self::Space => "space",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "publication" => Some(Self::Publication),
            "style" => Some(Self::Style),
            "fragment" => Some(Self::Fragment),
            "template" => Some(Self::Template),
            "space" => Some(Self::Space),
            _ => None,
        }
    }
}

/// Editorial workflow position of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Draft,
    Review,
    Published,
    Archived,
}

impl WorkflowStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "review" => Some(Self::Review),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// The three fixed outbound link categories of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCategory {
    Styles,
    Contents,
    Linked,
}

impl LinkCategory {
    pub const ALL: [LinkCategory; 3] = [Self::Styles, Self::Contents, Self::Linked];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Styles => "styles",
            Self::Contents => "contents",
            Self::Linked => "linked",
        }
    }
}

/// Outbound links of a record, one list per category. `linked` holds
/// generic references that carry no styling or composition meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLinks {
    #[serde(default)]
    pub styles: Vec<ContentId>,
    #[serde(default)]
    pub contents: Vec<ContentId>,
    #[serde(default)]
    pub linked: Vec<ContentId>,
}

impl ContentLinks {
    pub fn category(&self, category: LinkCategory) -> &[ContentId] {
        match category {
            LinkCategory::Styles => &self.styles,
            LinkCategory::Contents => &self.contents,
            LinkCategory::Linked => &self.linked,
        }
    }

    pub fn category_mut(&mut self, category: LinkCategory) -> &mut Vec<ContentId> {
        match category {
            LinkCategory::Styles => &mut self.styles,
            LinkCategory::Contents => &mut self.contents,
            LinkCategory::Linked => &mut self.linked,
        }
    }

    pub fn total(&self) -> usize {
        self.styles.len() + self.contents.len() + self.linked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One record in the content library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: ContentId,
    pub kind: ContentKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Container the record lives in; `None` for top-level records
    /// (including spaces themselves).
    #[serde(default)]
    pub space_id: Option<ContentId>,
    pub owner_id: Uuid,
    pub workflow_step: WorkflowStep,
    #[serde(default)]
    pub links: ContentLinks,
    /// Free-form metadata map. Reserved keys (editor locks, rating
    /// aggregates, provenance) are managed by the engine.
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    /// Taxonomy terms attached to the record.
    #[serde(default)]
    pub terms: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    /// Render a short plain-text excerpt of the body, cut at a character
    /// boundary with an ellipsis when truncated.
    pub fn excerpt(&self) -> String {
        excerpt_of(&self.body, EXCERPT_MAX_CHARS)
    }
}

pub fn excerpt_of(body: &str, max_chars: usize) -> String {
    let collapsed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(max_chars).collect();
    let cut = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}…", &truncated[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_step_parse_roundtrip() {
        for kind in [
            ContentKind::Publication,
            ContentKind::Style,
            ContentKind::Fragment,
            ContentKind::Template,
            ContentKind::Space,
        ] {
            assert_eq!(ContentKind::parse(kind.as_str()), Some(kind));
        }
        for step in [
            WorkflowStep::Draft,
            WorkflowStep::Review,
            WorkflowStep::Published,
            WorkflowStep::Archived,
        ] {
            assert_eq!(WorkflowStep::parse(step.as_str()), Some(step));
        }
        assert_eq!(ContentKind::parse("post"), None);
        assert_eq!(WorkflowStep::parse("live"), None);
    }

    #[test]
    fn excerpt_collapses_whitespace_and_truncates_on_word_boundary() {
        assert_eq!(excerpt_of("a  b\n\nc", 100), "a b c");
        let long = "word ".repeat(100);
        let excerpt = excerpt_of(&long, 24);
        assert!(excerpt.chars().count() <= 25);
        assert!(excerpt.ends_with("word…"));
    }

    #[test]
    fn link_categories_are_addressable() {
        let mut links = ContentLinks::default();
        let id = Uuid::now_v7();
        links.category_mut(LinkCategory::Contents).push(id);
        assert_eq!(links.category(LinkCategory::Contents), &[id]);
        assert_eq!(links.total(), 1);
        assert!(!links.is_empty());
        assert_eq!(LinkCategory::Styles.as_str(), "styles");
    }
}
