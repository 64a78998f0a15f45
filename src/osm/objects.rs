//! OSM object model
//!
//! Nodes, ways and relations as they appear in osmChange replication files.
//! Objects reference one another by id only; geometry is resolved through
//! the node cache, never through owning pointers.

use chrono::{DateTime, Utc};
use geo_types::{Coord, LineString, Point, Polygon};
use std::collections::BTreeMap;

/// The action recorded on a change frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeAction {
    /// Plain data element outside any change frame
    #[default]
    None,
    /// `<create>` frame
    Create,
    /// `<modify>` frame
    Modify,
    /// `<delete>` frame ("delete" is a reserved word, the original calls
    /// this remove)
    Remove,
}

impl ChangeAction {
    /// Lowercase name as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::None => "none",
            ChangeAction::Create => "create",
            ChangeAction::Modify => "modify",
            ChangeAction::Remove => "delete",
        }
    }
}

/// The OSM feature kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OsmType {
    /// A point feature
    Node,
    /// An ordered list of node refs
    Way,
    /// An ordered list of typed members
    Relation,
}

impl OsmType {
    /// Lowercase name as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            OsmType::Node => "node",
            OsmType::Way => "way",
            OsmType::Relation => "relation",
        }
    }
}

/// Tag mapping with unique keys; ordered so rendered literals are stable
pub type Tags = BTreeMap<String, String>;

/// A single OSM node
#[derive(Debug, Clone)]
pub struct OsmNode {
    /// OSM id
    pub id: i64,
    /// Object version
    pub version: i32,
    /// Last edit timestamp
    pub timestamp: DateTime<Utc>,
    /// Changeset this edit belongs to
    pub change_id: i64,
    /// Editing user id
    pub uid: i64,
    /// Editing user name
    pub user: String,
    /// WGS-84 location; (0, 0) until both attributes are seen
    pub point: Point<f64>,
    /// Feature tags
    pub tags: Tags,
    /// Action of the surrounding change frame
    pub action: ChangeAction,
    /// Set by the area filter when the node is inside the priority boundary
    pub priority: bool,
}

impl Default for OsmNode {
    fn default() -> Self {
        Self {
            id: 0,
            version: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            change_id: 0,
            uid: 0,
            user: String::new(),
            point: Point::new(0.0, 0.0),
            tags: Tags::new(),
            action: ChangeAction::None,
            priority: false,
        }
    }
}

impl OsmNode {
    /// Set the latitude, keeping the longitude
    pub fn set_latitude(&mut self, lat: f64) {
        self.point = Point::new(self.point.x(), lat);
    }

    /// Set the longitude, keeping the latitude
    pub fn set_longitude(&mut self, lon: f64) {
        self.point = Point::new(lon, self.point.y());
    }

    /// Whether this node carries the given tag key
    pub fn contains_key(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Nodes whose only tag is the legacy `created_at` are noise and are
    /// ignored by the stats engine
    pub fn is_legacy_noise(&self) -> bool {
        self.tags.len() == 1 && self.tags.contains_key("created_at")
    }
}

/// A single OSM way
#[derive(Debug, Clone)]
pub struct OsmWay {
    /// OSM id
    pub id: i64,
    /// Object version
    pub version: i32,
    /// Last edit timestamp
    pub timestamp: DateTime<Utc>,
    /// Changeset this edit belongs to
    pub change_id: i64,
    /// Editing user id
    pub uid: i64,
    /// Editing user name
    pub user: String,
    /// Feature tags
    pub tags: Tags,
    /// Action of the surrounding change frame
    pub action: ChangeAction,
    /// Set by the area filter
    pub priority: bool,
    /// Ordered node references
    pub refs: Vec<i64>,
    /// Geometry assembled from the node cache; empty when any ref is
    /// unresolved (the way is then geometry-unknown)
    pub linestring: LineString<f64>,
    /// Closed-ring polygon, populated iff the way is closed and its tags
    /// indicate a polygonal feature
    pub polygon: Option<Polygon<f64>>,
    /// Centroid, computed when the linestring is non-empty
    pub center: Option<Point<f64>>,
    /// Tags indicate a polygonal feature
    pub is_polygon: bool,
    /// Tags indicate a road (z-index classification)
    pub is_road: bool,
}

impl Default for OsmWay {
    fn default() -> Self {
        Self {
            id: 0,
            version: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            change_id: 0,
            uid: 0,
            user: String::new(),
            tags: Tags::new(),
            action: ChangeAction::None,
            priority: false,
            refs: Vec::new(),
            linestring: LineString::new(Vec::new()),
            polygon: None,
            center: None,
            is_polygon: false,
            is_road: false,
        }
    }
}

impl OsmWay {
    /// Whether the first and last refs are the same node
    pub fn is_closed(&self) -> bool {
        self.refs.len() > 2 && self.refs.first() == self.refs.last()
    }

    /// Number of resolved geometry points
    pub fn num_points(&self) -> usize {
        self.linestring.0.len()
    }

    /// Whether this way carries the given tag key
    pub fn contains_key(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Ways whose only tag is the legacy `created_at` are ignored by the
    /// stats engine
    pub fn is_legacy_noise(&self) -> bool {
        self.tags.len() == 1 && self.tags.contains_key("created_at")
    }

    /// Classify the way from its tags: polygon and road flags
    pub fn classify(&mut self) {
        self.is_polygon = tags_indicate_polygon(&self.tags);
        let (_z_order, is_road) = z_index(&self.tags);
        self.is_road = is_road;
    }
}

/// One member of a relation
#[derive(Debug, Clone)]
pub struct OsmRelationMember {
    /// Member kind
    pub member_type: OsmType,
    /// Referenced object id
    pub ref_id: i64,
    /// Role, e.g. "outer" or "inner"
    pub role: String,
}

/// A single OSM relation
#[derive(Debug, Clone)]
pub struct OsmRelation {
    /// OSM id
    pub id: i64,
    /// Object version
    pub version: i32,
    /// Last edit timestamp
    pub timestamp: DateTime<Utc>,
    /// Changeset this edit belongs to
    pub change_id: i64,
    /// Editing user id
    pub uid: i64,
    /// Editing user name
    pub user: String,
    /// Feature tags
    pub tags: Tags,
    /// Action of the surrounding change frame
    pub action: ChangeAction,
    /// Set by the area filter
    pub priority: bool,
    /// Ordered, typed members
    pub members: Vec<OsmRelationMember>,
}

impl Default for OsmRelation {
    fn default() -> Self {
        Self {
            id: 0,
            version: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            change_id: 0,
            uid: 0,
            user: String::new(),
            tags: Tags::new(),
            action: ChangeAction::None,
            priority: false,
            members: Vec::new(),
        }
    }
}

impl OsmRelation {
    /// Whether this relation is tagged `type=multipolygon`
    pub fn is_multipolygon(&self) -> bool {
        self.tags.get("type").map(String::as_str) == Some("multipolygon")
    }

    /// Whether this relation is tagged `type=multilinestring`
    pub fn is_multilinestring(&self) -> bool {
        self.tags.get("type").map(String::as_str) == Some("multilinestring")
    }

    /// Way members in document order
    pub fn way_members(&self) -> impl Iterator<Item = &OsmRelationMember> {
        self.members
            .iter()
            .filter(|m| m.member_type == OsmType::Way)
    }
}

/// Build a closed polygon from a linestring ring
pub fn polygon_from_ring(ring: &LineString<f64>) -> Polygon<f64> {
    Polygon::new(ring.clone(), Vec::new())
}

/// Build a point from raw coordinates
pub fn point(lon: f64, lat: f64) -> Point<f64> {
    Point::new(lon, lat)
}

/// Build a linestring from (lon, lat) pairs
pub fn linestring(coords: &[(f64, f64)]) -> LineString<f64> {
    LineString::new(coords.iter().map(|&(x, y)| Coord { x, y }).collect())
}

/// Tag keys that make a closed way polygonal
const POLYGON_TAGS: &[&str] = &[
    "aeroway",
    "amenity",
    "area",
    "building",
    "harbour",
    "historic",
    "landuse",
    "leisure",
    "man_made",
    "military",
    "natural",
    "office",
    "place",
    "power",
    "public_transport",
    "shop",
    "sport",
    "tourism",
    "water",
    "waterway",
    "wetland",
];

/// Whether the tags indicate a polygonal feature
pub fn tags_indicate_polygon(tags: &Tags) -> bool {
    tags.iter().any(|(k, v)| {
        !v.is_empty()
            && (POLYGON_TAGS.contains(&k.as_str()) || (k == "area" && v == "yes"))
    })
}

/// z-order contributions per (tag, value); an empty value matches any.
/// The second field flags the feature as a road.
const Z_INDEX_MAP: &[(&str, &str, i32, bool)] = &[
    ("railway", "", 5, true),
    ("boundary", "administrative", 0, true),
    ("bridge", "yes", 10, false),
    ("bridge", "true", 10, false),
    ("bridge", "1", 10, false),
    ("tunnel", "yes", -10, false),
    ("tunnel", "true", -10, false),
    ("tunnel", "1", -10, false),
    ("highway", "minor", 3, false),
    ("highway", "road", 3, false),
    ("highway", "unclassified", 3, false),
    ("highway", "residential", 3, false),
    ("highway", "tertiary_link", 4, false),
    ("highway", "tertiary", 4, false),
    ("highway", "secondary_link", 6, true),
    ("highway", "secondary", 6, true),
    ("highway", "primary_link", 7, true),
    ("highway", "primary", 7, true),
    ("highway", "trunk_link", 8, true),
    ("highway", "trunk", 8, true),
    ("highway", "motorway_link", 9, true),
    ("highway", "motorway", 9, true),
];

/// Compute the z-order and road flag for a tag set
///
/// A `layer` tag contributes ten times its integer value. Unparseable
/// layers are ignored.
pub fn z_index(tags: &Tags) -> (i32, bool) {
    let mut z_order = 0;
    let mut is_road = false;
    for (key, value) in tags {
        for (zk, zv, contribution, road) in Z_INDEX_MAP {
            if key == zk && (zv.is_empty() || value == zv) {
                z_order += contribution;
                is_road = is_road || *road;
            }
        }
        if key == "layer" {
            if let Ok(layer) = value.parse::<i32>() {
                z_order += layer * 10;
            }
        }
    }
    (z_order, is_road)
}
