//! Priority area filtering
//!
//! Prunes objects outside the region of interest. An empty boundary means
//! "pass all". Nodes are tested by containment, ways by centroid, and a way
//! whose geometry is unresolved survives when its changeset already touched
//! the priority area (that captures modifications whose nodes are not
//! cached). Deletes always pass since they carry no geometry.

use crate::osm::objects::ChangeAction;
use crate::osm::OsmRelation;
use crate::parser::{ChangeSetFile, FileBatch};
use geo::Contains;
use geo_types::{MultiPolygon, Point};
use std::collections::HashSet;
use std::path::Path;

use crate::domain::Result;

/// Interface for the on-disk priority polygon reader
///
/// Reading the boundary file (GeoJSON or any GDAL-supported format in the
/// deployment) is handled by an external collaborator; the filter itself
/// only consumes the parsed multipolygon.
pub trait BoundaryReader {
    /// Read a boundary file into a multipolygon
    fn read_boundary(&self, path: &Path) -> Result<MultiPolygon<f64>>;
}

/// The priority polygon filter
#[derive(Debug, Clone)]
pub struct AreaFilter {
    boundary: MultiPolygon<f64>,
}

impl AreaFilter {
    /// Filter over an explicit boundary
    pub fn new(boundary: MultiPolygon<f64>) -> Self {
        Self { boundary }
    }

    /// A filter that retains everything
    pub fn pass_all() -> Self {
        Self {
            boundary: MultiPolygon(Vec::new()),
        }
    }

    /// Whether the boundary is empty, meaning every object is retained
    pub fn is_pass_all(&self) -> bool {
        self.boundary.0.is_empty()
    }

    /// Point-in-multipolygon test
    pub fn contains(&self, point: &Point<f64>) -> bool {
        self.boundary.contains(point)
    }

    /// Prune a file batch in place
    ///
    /// Returns the set of changeset ids that touched the priority area,
    /// which the caller feeds back into stats and validation.
    pub fn filter_batch(&self, batch: &mut FileBatch) -> HashSet<i64> {
        let mut priority: HashSet<i64> = HashSet::new();

        for change in &mut batch.changes {
            change.nodes.retain_mut(|node| {
                if node.action == ChangeAction::Remove {
                    return true;
                }
                if self.is_pass_all() {
                    node.priority = true;
                    priority.insert(node.change_id);
                    return true;
                }
                if self.contains(&node.point) {
                    node.priority = true;
                    priority.insert(node.change_id);
                    true
                } else {
                    false
                }
            });

            change.ways.retain_mut(|way| {
                if way.action == ChangeAction::Remove {
                    return true;
                }
                if self.is_pass_all() {
                    way.priority = true;
                    priority.insert(way.change_id);
                    return true;
                }
                if way.num_points() == 0 {
                    // Geometry unknown; keep the way only when its changeset
                    // already touched the area.
                    if priority.contains(&way.change_id) {
                        way.priority = true;
                        if way.action == ChangeAction::Create {
                            tracing::warn!(way = way.id, "created way has no geometry");
                        }
                        return true;
                    }
                    return false;
                }
                let in_area = way
                    .center
                    .map(|center| self.contains(&center))
                    .unwrap_or(false);
                if in_area {
                    way.priority = true;
                    priority.insert(way.change_id);
                    true
                } else if priority.contains(&way.change_id) {
                    way.priority = true;
                    true
                } else {
                    false
                }
            });
        }

        // Relations are retained when any member survived; member ids are
        // gathered after node/way pruning so the check sees the result.
        let mut retained_ids: HashSet<(char, i64)> = HashSet::new();
        for change in &batch.changes {
            for node in &change.nodes {
                retained_ids.insert(('n', node.id));
            }
            for way in &change.ways {
                retained_ids.insert(('w', way.id));
            }
        }

        for change in &mut batch.changes {
            change.relations.retain_mut(|relation| {
                if relation.action == ChangeAction::Remove || self.is_pass_all() {
                    relation.priority = true;
                    return true;
                }
                if relation_retained(relation, &retained_ids, &priority) {
                    relation.priority = true;
                    priority.insert(relation.change_id);
                    true
                } else {
                    tracing::debug!(relation = relation.id, "deferring out-of-area relation");
                    false
                }
            });
        }

        priority
    }

    /// Prune a changeset file in place, keeping changesets whose bounding
    /// box center lies in the priority area
    pub fn filter_changesets(&self, file: &mut ChangeSetFile) {
        file.changes.retain_mut(|cs| {
            if self.is_pass_all() {
                cs.priority = true;
                return true;
            }
            let (lon, lat) = cs.bbox_center();
            if self.contains(&Point::new(lon, lat)) {
                cs.priority = true;
                true
            } else {
                false
            }
        });
    }
}

fn relation_retained(
    relation: &OsmRelation,
    retained_ids: &HashSet<(char, i64)>,
    priority: &HashSet<i64>,
) -> bool {
    if priority.contains(&relation.change_id) {
        return true;
    }
    relation.members.iter().any(|member| {
        let kind = match member.member_type {
            crate::osm::OsmType::Node => 'n',
            crate::osm::OsmType::Way => 'w',
            crate::osm::OsmType::Relation => 'r',
        };
        retained_ids.contains(&(kind, member.ref_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::{OsmNode, OsmWay};
    use crate::osm::NodeCache;
    use crate::parser::{parse_osmchange, OsmChange};
    use geo_types::{polygon, Coord, LineString};
    use std::io::Cursor;

    fn unit_square() -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ]])
    }

    fn node_at(id: i64, change_id: i64, lon: f64, lat: f64) -> OsmNode {
        OsmNode {
            id,
            change_id,
            point: Point::new(lon, lat),
            action: ChangeAction::Create,
            ..Default::default()
        }
    }

    fn batch_of(change: OsmChange) -> FileBatch {
        FileBatch {
            changes: vec![change],
            final_entry: None,
        }
    }

    #[test]
    fn test_empty_boundary_passes_everything() {
        let filter = AreaFilter::pass_all();
        let mut change = OsmChange::default();
        change.nodes.push(node_at(1, 10, 500.0, 500.0));
        let mut batch = batch_of(change);
        let priority = filter.filter_batch(&mut batch);
        assert_eq!(batch.nodes().count(), 1);
        assert!(batch.nodes().next().unwrap().priority);
        assert!(priority.contains(&10));
    }

    #[test]
    fn test_out_of_area_node_dropped() {
        let filter = AreaFilter::new(unit_square());
        let mut change = OsmChange::default();
        change.nodes.push(node_at(1, 10, 5.0, 5.0));
        change.nodes.push(node_at(2, 11, 50.0, 50.0));
        let mut batch = batch_of(change);
        let priority = filter.filter_batch(&mut batch);
        assert_eq!(batch.nodes().count(), 1);
        assert_eq!(batch.nodes().next().unwrap().id, 1);
        assert!(priority.contains(&10));
        assert!(!priority.contains(&11));
    }

    #[test]
    fn test_removed_node_always_passes() {
        let filter = AreaFilter::new(unit_square());
        let mut change = OsmChange::default();
        let mut node = node_at(1, 10, 50.0, 50.0);
        node.action = ChangeAction::Remove;
        change.nodes.push(node);
        let mut batch = batch_of(change);
        filter.filter_batch(&mut batch);
        assert_eq!(batch.nodes().count(), 1);
    }

    #[test]
    fn test_way_retained_by_centroid() {
        let filter = AreaFilter::new(unit_square());
        let mut change = OsmChange::default();
        let mut way = OsmWay {
            id: 7,
            change_id: 20,
            action: ChangeAction::Create,
            refs: vec![1, 2],
            ..Default::default()
        };
        way.linestring = LineString::new(vec![
            Coord { x: 1.0, y: 1.0 },
            Coord { x: 2.0, y: 2.0 },
        ]);
        way.center = Some(Point::new(1.5, 1.5));
        change.ways.push(way);
        let mut batch = batch_of(change);
        let priority = filter.filter_batch(&mut batch);
        assert_eq!(batch.ways().count(), 1);
        assert!(priority.contains(&20));
    }

    #[test]
    fn test_geometry_unknown_modify_rescued_by_priority_set() {
        let filter = AreaFilter::new(unit_square());
        let mut change = OsmChange::default();
        // A node from the same changeset lands inside the area first.
        change.nodes.push(node_at(1, 30, 2.0, 2.0));
        change.ways.push(OsmWay {
            id: 8,
            change_id: 30,
            action: ChangeAction::Modify,
            refs: vec![900, 901],
            ..Default::default()
        });
        // A second geometry-less way from an unrelated changeset is dropped.
        change.ways.push(OsmWay {
            id: 9,
            change_id: 31,
            action: ChangeAction::Modify,
            refs: vec![902],
            ..Default::default()
        });
        let mut batch = batch_of(change);
        filter.filter_batch(&mut batch);
        let ways: Vec<_> = batch.ways().collect();
        assert_eq!(ways.len(), 1);
        assert_eq!(ways[0].id, 8);
        assert!(ways[0].priority);
    }

    #[test]
    fn test_relation_follows_members() {
        let cache = NodeCache::new();
        let xml = r#"<osmChange version="0.6"><create>
          <node id="1" version="1" timestamp="2021-01-01T00:00:00Z" uid="1" user="a" changeset="40" lat="5.0" lon="5.0"/>
          <relation id="70" version="1" timestamp="2021-01-01T00:00:01Z" uid="1" user="a" changeset="41">
            <member type="node" ref="1" role=""/>
            <tag k="type" v="multipolygon"/>
          </relation>
          <relation id="71" version="1" timestamp="2021-01-01T00:00:02Z" uid="1" user="a" changeset="42">
            <member type="node" ref="999" role=""/>
            <tag k="type" v="multipolygon"/>
          </relation>
        </create></osmChange>"#;
        let mut batch = parse_osmchange(Cursor::new(xml), &cache).unwrap();
        let filter = AreaFilter::new(unit_square());
        filter.filter_batch(&mut batch);
        let relations: Vec<_> = batch.relations().collect();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].id, 70);
    }

    #[test]
    fn test_changeset_bbox_filtering() {
        let filter = AreaFilter::new(unit_square());
        let mut file = ChangeSetFile::default();
        file.changes.push(crate::osm::ChangeSet {
            id: 1,
            min_lon: 1.0,
            max_lon: 3.0,
            min_lat: 1.0,
            max_lat: 3.0,
            ..Default::default()
        });
        file.changes.push(crate::osm::ChangeSet {
            id: 2,
            min_lon: 100.0,
            max_lon: 103.0,
            min_lat: 1.0,
            max_lat: 3.0,
            ..Default::default()
        });
        filter.filter_changesets(&mut file);
        assert_eq!(file.changes.len(), 1);
        assert_eq!(file.changes[0].id, 1);
        assert!(file.changes[0].priority);
    }
}
