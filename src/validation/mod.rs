//! Data quality validation
//!
//! Rule plugins check tagged POIs and ways and report a set of status
//! flags. Plugins are compiled in and selected by name from configuration;
//! the stable [`Validator`] trait keeps the host independent of any single
//! rule set. A plugin never mutates shared state; everything it decides is
//! carried in the returned [`ValidateStatus`].

mod building;
mod highway;
mod landuse;
mod place;
mod waterway;

use crate::domain::{Result, UnderpassError};
use crate::osm::objects::{ChangeAction, OsmNode, OsmType, OsmWay};
use crate::parser::FileBatch;
use chrono::{DateTime, Utc};
use geo::Intersects;
use geo_types::Point;
use std::collections::BTreeSet;
use std::fmt;

/// A single validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusKind {
    /// The primary tag value is a recognised one
    Correct,
    /// Tagging is missing expected detail
    Incomplete,
    /// Tagging carries the expected detail
    Complete,
    /// The building overlaps another building in the same file
    Overlaping,
    /// The building duplicates another building in the same file
    Duplicate,
    /// The primary tag value is not a recognised one
    BadValue,
    /// The geometry is degenerate
    BadGeometry,
}

impl StatusKind {
    /// Name as stored in the validation table
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Correct => "correct",
            StatusKind::Incomplete => "incomplete",
            StatusKind::Complete => "complete",
            // Historical spelling, kept for dashboard compatibility.
            StatusKind::Overlaping => "overlaping",
            StatusKind::Duplicate => "duplicate",
            StatusKind::BadValue => "badvalue",
            StatusKind::BadGeometry => "badgeom",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of validating one object against one source key
#[derive(Debug, Clone)]
pub struct ValidateStatus {
    /// The object id
    pub osm_id: i64,
    /// The object kind
    pub osm_type: OsmType,
    /// The changeset of the edit under validation
    pub change_id: i64,
    /// Status flags; an empty set means nothing to report
    pub status: BTreeSet<StatusKind>,
    /// The source key that produced the finding (building, highway, ...)
    pub source: String,
    /// Timestamp of the edit
    pub timestamp: DateTime<Utc>,
    /// A representative location, when one is known
    pub location: Option<Point<f64>>,
}

impl ValidateStatus {
    fn for_node(node: &OsmNode, source: &str) -> Self {
        Self {
            osm_id: node.id,
            osm_type: OsmType::Node,
            change_id: node.change_id,
            status: BTreeSet::new(),
            source: source.to_string(),
            timestamp: node.timestamp,
            location: Some(node.point),
        }
    }

    fn for_way(way: &OsmWay, source: &str) -> Self {
        Self {
            osm_id: way.id,
            osm_type: OsmType::Way,
            change_id: way.change_id,
            status: BTreeSet::new(),
            source: source.to_string(),
            timestamp: way.timestamp,
            location: way.center,
        }
    }

    /// Whether a flag is present
    pub fn has(&self, kind: StatusKind) -> bool {
        self.status.contains(&kind)
    }

    /// Whether there is anything to persist
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

/// A compiled-in validation rule set
pub trait Validator: Send + Sync {
    /// Plugin name, as selected from configuration
    fn name(&self) -> &'static str;

    /// Check a tagged POI against one source key
    fn check_node(&self, node: &OsmNode, key: &str) -> Result<ValidateStatus>;

    /// Check a way against one source key
    fn check_way(&self, way: &OsmWay, key: &str) -> Result<ValidateStatus>;

    /// Whether `way` overlaps any other building in the batch
    fn overlaps(&self, others: &[&OsmWay], way: &OsmWay) -> bool {
        let Some(polygon) = &way.polygon else {
            return false;
        };
        others.iter().any(|other| {
            other.id != way.id
                && other
                    .polygon
                    .as_ref()
                    .map(|p| polygon.intersects(p) && !same_ring(way, other))
                    .unwrap_or(false)
        })
    }

    /// Whether `way` duplicates another building in the batch
    fn duplicate(&self, others: &[&OsmWay], way: &OsmWay) -> bool {
        others
            .iter()
            .any(|other| other.id != way.id && same_ring(way, other))
    }
}

fn same_ring(a: &OsmWay, b: &OsmWay) -> bool {
    if !a.refs.is_empty() && a.refs == b.refs {
        return true;
    }
    match (a.center, b.center) {
        (Some(ca), Some(cb)) => {
            (ca.x() - cb.x()).abs() < 1e-9
                && (ca.y() - cb.y()).abs() < 1e-9
                && a.num_points() == b.num_points()
                && a.num_points() > 0
        }
        _ => false,
    }
}

/// The default rule set used by the HOT data quality dashboards
pub struct HotosmValidator;

impl Validator for HotosmValidator {
    fn name(&self) -> &'static str {
        "hotosm"
    }

    fn check_node(&self, node: &OsmNode, key: &str) -> Result<ValidateStatus> {
        let mut status = ValidateStatus::for_node(node, key);
        match key {
            "building" => building::check_node(node, &mut status.status),
            "place" => place::check_node(node, &mut status.status),
            "waterway" => waterway::check_node(node, &mut status.status),
            "natural" => {}
            other => {
                return Err(UnderpassError::Plugin(format!(
                    "no node rule for key '{other}'"
                )))
            }
        }
        Ok(status)
    }

    fn check_way(&self, way: &OsmWay, key: &str) -> Result<ValidateStatus> {
        let mut status = ValidateStatus::for_way(way, key);
        match key {
            "building" => building::check_way(way, &mut status.status),
            "highway" => highway::check_way(way, &mut status.status),
            "landuse" => landuse::check_way(way, &mut status.status),
            "place" => place::check_way(way, &mut status.status),
            "waterway" => waterway::check_way(way, &mut status.status),
            "natural" => {}
            other => {
                return Err(UnderpassError::Plugin(format!(
                    "no way rule for key '{other}'"
                )))
            }
        }
        Ok(status)
    }
}

/// Instantiate a validator plugin by name
///
/// # Errors
///
/// Returns a configuration error for an unknown plugin name.
pub fn create_validator(name: &str) -> Result<Box<dyn Validator>> {
    match name.to_lowercase().as_str() {
        "hotosm" => Ok(Box::new(HotosmValidator)),
        other => Err(UnderpassError::Configuration(format!(
            "Unsupported validator: {other}. Supported validators: hotosm"
        ))),
    }
}

/// Tag keys checked on POIs
const NODE_TESTS: &[&str] = &["building", "natural", "place", "waterway"];

/// Tag keys checked on ways
const WAY_TESTS: &[&str] = &[
    "building", "highway", "landuse", "natural", "place", "waterway",
];

/// Runs the selected plugin over parsed file batches
pub struct ValidationHost {
    plugin: Box<dyn Validator>,
}

impl ValidationHost {
    /// Create a host running the named plugin
    pub fn new(plugin_name: &str) -> Result<Self> {
        Ok(Self {
            plugin: create_validator(plugin_name)?,
        })
    }

    /// Validate the priority POIs of a batch
    pub fn validate_nodes(&self, batch: &FileBatch) -> Vec<ValidateStatus> {
        let mut totals = Vec::new();
        for node in batch.nodes() {
            // A node with no tags is probably part of a way.
            if !node.priority || node.tags.is_empty() || node.action == ChangeAction::Remove {
                continue;
            }
            for key in NODE_TESTS {
                if !node.contains_key(key) {
                    continue;
                }
                match self.plugin.check_node(node, key) {
                    Ok(status) => {
                        if status.has(StatusKind::Correct) && status.has(StatusKind::Incomplete) {
                            continue;
                        }
                        if !status.is_empty() {
                            totals.push(status);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(node = node.id, error = %e, "validator failed, skipping");
                    }
                }
            }
        }
        totals
    }

    /// Validate the priority ways of a batch
    ///
    /// Building ways additionally get the pairwise overlap and duplicate
    /// checks against the other ways of the same file; cross-file detection
    /// belongs to a separate batch job.
    pub fn validate_ways(&self, batch: &FileBatch) -> Vec<ValidateStatus> {
        let all_ways: Vec<&OsmWay> = batch.ways().collect();
        let mut totals = Vec::new();

        for way in &all_ways {
            if !way.priority || way.action == ChangeAction::Remove {
                continue;
            }
            for key in WAY_TESTS {
                if !way.contains_key(key) {
                    continue;
                }
                match self.plugin.check_way(way, key) {
                    Ok(mut status) => {
                        if way.contains_key("building") {
                            if self.plugin.overlaps(&all_ways, way) {
                                status.status.insert(StatusKind::Overlaping);
                            }
                            if self.plugin.duplicate(&all_ways, way) {
                                status.status.insert(StatusKind::Duplicate);
                            }
                        }
                        if !status.is_empty() {
                            totals.push(status);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(way = way.id, error = %e, "validator failed, skipping");
                    }
                }
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::Tags;
    use crate::parser::OsmChange;
    use geo_types::{Coord, LineString};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn square_way(id: i64, origin: f64, side: f64, refs_base: i64) -> OsmWay {
        let ring = vec![
            Coord { x: origin, y: origin },
            Coord { x: origin + side, y: origin },
            Coord { x: origin + side, y: origin + side },
            Coord { x: origin, y: origin + side },
            Coord { x: origin, y: origin },
        ];
        let linestring = LineString::new(ring);
        let mut way = OsmWay {
            id,
            priority: true,
            action: ChangeAction::Create,
            refs: vec![
                refs_base,
                refs_base + 1,
                refs_base + 2,
                refs_base + 3,
                refs_base,
            ],
            tags: tags(&[("building", "yes")]),
            linestring,
            ..Default::default()
        };
        way.classify();
        way.center = Some(Point::new(origin + side / 2.0, origin + side / 2.0));
        way.polygon = Some(crate::osm::objects::polygon_from_ring(&way.linestring));
        way
    }

    fn batch_with_ways(ways: Vec<OsmWay>) -> FileBatch {
        let mut change = OsmChange {
            action: ChangeAction::Create,
            ..Default::default()
        };
        change.ways = ways;
        FileBatch {
            changes: vec![change],
            final_entry: None,
        }
    }

    #[test]
    fn test_unknown_validator_rejected() {
        assert!(create_validator("osmose").is_err());
        assert!(create_validator("hotosm").is_ok());
    }

    #[test]
    fn test_overlapping_buildings_flagged() {
        let a = square_way(1, 0.0, 1.0, 100);
        let b = square_way(2, 0.5, 1.0, 200);
        let batch = batch_with_ways(vec![a, b]);
        let host = ValidationHost::new("hotosm").unwrap();
        let results = host.validate_ways(&batch);
        assert!(results
            .iter()
            .any(|s| s.osm_id == 1 && s.has(StatusKind::Overlaping)));
        assert!(results
            .iter()
            .any(|s| s.osm_id == 2 && s.has(StatusKind::Overlaping)));
    }

    #[test]
    fn test_duplicate_buildings_flagged() {
        let a = square_way(1, 0.0, 1.0, 100);
        let mut b = square_way(2, 0.0, 1.0, 100);
        b.refs = a.refs.clone();
        let batch = batch_with_ways(vec![a, b]);
        let host = ValidationHost::new("hotosm").unwrap();
        let results = host.validate_ways(&batch);
        assert!(results
            .iter()
            .any(|s| s.osm_id == 2 && s.has(StatusKind::Duplicate)));
    }

    #[test]
    fn test_separated_buildings_not_flagged() {
        let a = square_way(1, 0.0, 1.0, 100);
        let b = square_way(2, 5.0, 1.0, 200);
        let batch = batch_with_ways(vec![a, b]);
        let host = ValidationHost::new("hotosm").unwrap();
        let results = host.validate_ways(&batch);
        for status in &results {
            assert!(!status.has(StatusKind::Overlaping));
            assert!(!status.has(StatusKind::Duplicate));
        }
    }

    #[test]
    fn test_non_priority_ways_skipped() {
        let mut way = square_way(1, 0.0, 1.0, 100);
        way.priority = false;
        let batch = batch_with_ways(vec![way]);
        let host = ValidationHost::new("hotosm").unwrap();
        assert!(host.validate_ways(&batch).is_empty());
    }

    #[test]
    fn test_bad_highway_value_reported() {
        let mut way = OsmWay {
            id: 9,
            priority: true,
            action: ChangeAction::Create,
            tags: tags(&[("highway", "superhighway")]),
            ..Default::default()
        };
        way.classify();
        let batch = batch_with_ways(vec![way]);
        let host = ValidationHost::new("hotosm").unwrap();
        let results = host.validate_ways(&batch);
        assert_eq!(results.len(), 1);
        assert!(results[0].has(StatusKind::BadValue));
        assert_eq!(results[0].source, "highway");
    }
}
