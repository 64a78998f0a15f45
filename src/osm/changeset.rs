//! Changeset metadata model
//!
//! A changeset is a user session container carrying the hashtags, comment,
//! editor and bounding box of an upload. The feature data itself arrives on
//! the osmChange stream; the two are aligned by timestamp.

use crate::osm::objects::Tags;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Data structure for a single changeset
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// The changeset id
    pub id: i64,
    /// Creation starting timestamp
    pub created_at: Option<DateTime<Utc>>,
    /// Creation ending timestamp; None while the changeset is open
    pub closed_at: Option<DateTime<Utc>>,
    /// Whether this changeset is still in progress
    pub open: bool,
    /// The OSM user name making this change
    pub user: String,
    /// The OSM user id making this change
    pub uid: i64,
    /// Minimum longitude of the bounding box
    pub min_lon: f64,
    /// Minimum latitude of the bounding box
    pub min_lat: f64,
    /// Maximum longitude of the bounding box
    pub max_lon: f64,
    /// Maximum latitude of the bounding box
    pub max_lat: f64,
    /// Number of changes in this changeset
    pub num_changes: i32,
    /// Hashtags, in upload order, without the leading '#'
    pub hashtags: Vec<String>,
    /// The changeset comment
    pub comment: String,
    /// The editor the end user used
    pub editor: String,
    /// The imagery source
    pub source: String,
    /// All raw tags of the changeset element
    pub tags: Tags,
    /// Set by the area filter when the bbox intersects the boundary
    pub priority: bool,
}

impl ChangeSet {
    /// Add hashtags from the dedicated `hashtags` tag (`;`-separated)
    pub fn add_hashtags(&mut self, text: &str) {
        for tag in text.split(';') {
            let tag = fix_string(tag.trim_start_matches('#'));
            if !tag.is_empty() && !self.hashtags.contains(&tag) {
                self.hashtags.push(tag);
            }
        }
    }

    /// Add the comment field and harvest any `#hashtag` tokens it contains
    pub fn add_comment(&mut self, text: &str) {
        self.comment = fix_string(text);
        for tag in harvest_hashtags(text) {
            if !self.hashtags.contains(&tag) {
                self.hashtags.push(tag);
            }
        }
    }

    /// Add the editor field
    pub fn add_editor(&mut self, text: &str) {
        self.editor = fix_string(text);
    }

    /// Bounding box center, used for area filtering
    pub fn bbox_center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

/// Scrub control characters and single quotes out of user supplied text
///
/// Changeset comments arrive with embedded newlines and the occasional
/// control character; these break log lines and SQL literals downstream.
pub fn fix_string(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() && *c != '\'')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extract `#hashtag` tokens from free text
pub fn harvest_hashtags(text: &str) -> Vec<String> {
    static HASHTAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = HASHTAG_RE.get_or_init(|| Regex::new(r"#([\w-]+)").expect("valid hashtag regex"));
    re.captures_iter(text)
        .map(|cap| fix_string(&cap[1]))
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_string_scrubs_controls() {
        assert_eq!(fix_string("hot\nosm\t'x'"), "hotosmx");
        assert_eq!(fix_string("  padded  "), "padded");
    }

    #[test]
    fn test_add_hashtags_splits_and_dedupes() {
        let mut cs = ChangeSet::default();
        cs.add_hashtags("#hotosm-project-1;missingmaps;#hotosm-project-1");
        assert_eq!(cs.hashtags, vec!["hotosm-project-1", "missingmaps"]);
    }

    #[test]
    fn test_comment_harvesting() {
        let mut cs = ChangeSet::default();
        cs.add_comment("Mapping buildings #missingmaps #tanzania task 42");
        assert_eq!(cs.comment, "Mapping buildings #missingmaps #tanzania task 42");
        assert_eq!(cs.hashtags, vec!["missingmaps", "tanzania"]);
    }

    #[test]
    fn test_bbox_center() {
        let cs = ChangeSet {
            min_lon: 10.0,
            max_lon: 12.0,
            min_lat: -2.0,
            max_lat: 2.0,
            ..Default::default()
        };
        assert_eq!(cs.bbox_center(), (11.0, 0.0));
    }
}
