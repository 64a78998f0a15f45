//! Tag category configuration
//!
//! A YAML file maps category names to the recognised (tag, value) pairs per
//! OSM object type. The value `"*"` matches any value. The built-in default
//! covers the categories the dashboards expect when no file is supplied.
//!
//! ```yaml
//! - name: highway
//!   way:
//!     highway: ["*"]
//! - name: building
//!   way:
//!     building: ["*"]
//!   node:
//!     building: ["*"]
//! ```

use crate::domain::{Result, UnderpassError};
use crate::osm::objects::{OsmType, Tags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One category with its recognised tag/value pairs per object type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Category name as it appears in the stats counters
    pub name: String,

    /// Recognised (tag, values) pairs for nodes
    #[serde(default)]
    pub node: HashMap<String, Vec<String>>,

    /// Recognised (tag, values) pairs for ways
    #[serde(default)]
    pub way: HashMap<String, Vec<String>>,

    /// Recognised (tag, values) pairs for relations
    #[serde(default)]
    pub relation: HashMap<String, Vec<String>>,
}

impl CategoryConfig {
    fn table(&self, osm_type: OsmType) -> &HashMap<String, Vec<String>> {
        match osm_type {
            OsmType::Node => &self.node,
            OsmType::Way => &self.way,
            OsmType::Relation => &self.relation,
        }
    }

    fn matches(&self, tag: &str, value: &str, osm_type: OsmType) -> bool {
        self.table(osm_type)
            .get(tag)
            .map(|values| values.iter().any(|v| v == "*" || v == value))
            .unwrap_or(false)
    }
}

/// The loaded tag statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsConfig {
    /// Categories in priority order; the first match wins per tag
    pub categories: Vec<CategoryConfig>,
}

impl StatsConfig {
    /// Parse a YAML configuration string
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the YAML does not match the
    /// expected shape.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| UnderpassError::Configuration(format!("stats config: {e}")))
    }

    /// Read a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UnderpassError::Configuration(format!("stats config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Find the category for a single (tag, value) pair
    pub fn search(&self, tag: &str, value: &str, osm_type: OsmType) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.matches(tag, value, osm_type))
            .map(|c| c.name.as_str())
    }

    /// Classify a tag set: one hit per matching tag, in tag order
    ///
    /// Tags with empty values never match.
    pub fn classify(&self, tags: &Tags, osm_type: OsmType) -> Vec<String> {
        let mut hits = Vec::new();
        for (tag, value) in tags {
            if value.is_empty() {
                continue;
            }
            if let Some(category) = self.search(tag, value, osm_type) {
                hits.push(category.to_string());
            }
        }
        hits
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        fn any(tag: &str) -> HashMap<String, Vec<String>> {
            HashMap::from([(tag.to_string(), vec!["*".to_string()])])
        }

        Self {
            categories: vec![
                CategoryConfig {
                    name: "building".to_string(),
                    node: any("building"),
                    way: any("building"),
                    relation: any("building"),
                },
                CategoryConfig {
                    name: "highway".to_string(),
                    node: HashMap::new(),
                    way: any("highway"),
                    relation: HashMap::new(),
                },
                CategoryConfig {
                    name: "waterway".to_string(),
                    node: HashMap::new(),
                    way: any("waterway"),
                    relation: any("waterway"),
                },
                CategoryConfig {
                    name: "landuse".to_string(),
                    node: HashMap::new(),
                    way: any("landuse"),
                    relation: any("landuse"),
                },
                CategoryConfig {
                    name: "place".to_string(),
                    node: any("place"),
                    way: any("place"),
                    relation: HashMap::new(),
                },
            ],
        }
    }
}
