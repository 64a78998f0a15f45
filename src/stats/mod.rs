//! Per-changeset contribution statistics
//!
//! Classifies tagged objects through the category configuration and
//! accumulates added/modified counters per changeset, plus road and
//! waterway kilometres measured with the haversine formula on the WGS-84
//! spheroid. Deletes are never counted so a feature is not scored twice
//! across file batches.

pub mod config;

pub use config::StatsConfig;

use crate::osm::objects::{ChangeAction, OsmType};
use crate::osm::NodeCache;
use crate::parser::FileBatch;
use chrono::{DateTime, Utc};
use geo_types::Point;
use serde::Serialize;
use std::collections::BTreeMap;

/// Earth radius used for all length calculations, in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Accumulated statistics for one changeset within one ingest
#[derive(Debug, Clone, Serialize)]
pub struct ChangeStats {
    /// The changeset id
    pub change_id: i64,
    /// The user id
    pub user_id: i64,
    /// The user name
    pub username: String,
    /// Timestamp of the newest contributing object
    pub closed_at: DateTime<Utc>,
    /// Created feature counts per category
    pub added: BTreeMap<String, i64>,
    /// Modified feature counts per category
    pub modified: BTreeMap<String, i64>,
    /// Created kilometres for the linear categories
    /// (`highway_km`, `waterway_km`)
    pub added_km: BTreeMap<String, f64>,
}

impl ChangeStats {
    fn new(change_id: i64, user_id: i64, username: &str, closed_at: DateTime<Utc>) -> Self {
        Self {
            change_id,
            user_id,
            username: username.to_string(),
            closed_at,
            added: BTreeMap::new(),
            modified: BTreeMap::new(),
            added_km: BTreeMap::new(),
        }
    }

    /// Whether nothing was accumulated; empty stats are not persisted
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.added_km.is_empty()
    }
}

/// Great-circle distance between two WGS-84 points in kilometres
pub fn haversine_km(a: Point<f64>, b: Point<f64>) -> f64 {
    let lat1 = a.y().to_radians();
    let lat2 = b.y().to_radians();
    let dlat = (b.y() - a.y()).to_radians();
    let dlon = (b.x() - a.x()).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Length of a way in kilometres, resolved through the node cache
///
/// Unresolved refs and literal (0, 0) coordinates are skipped and do not
/// start a new segment; the remaining points are measured consecutively.
pub fn way_length_km(refs: &[i64], cache: &NodeCache) -> f64 {
    let points: Vec<Point<f64>> = refs
        .iter()
        .filter_map(|&id| cache.get(id))
        .filter(|p| p.x() != 0.0 || p.y() != 0.0)
        .collect();

    points
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .sum()
}

/// Collect statistics for every changeset contributing to a file batch
///
/// An entry exists only for changesets that scored at least one category
/// hit. Untagged objects and legacy `created_at`-only objects are ignored,
/// and removes contribute nothing.
pub fn collect_stats(
    batch: &FileBatch,
    cache: &NodeCache,
    config: &StatsConfig,
) -> BTreeMap<i64, ChangeStats> {
    let mut stats: BTreeMap<i64, ChangeStats> = BTreeMap::new();

    for change in &batch.changes {
        for node in &change.nodes {
            if node.tags.is_empty() || node.is_legacy_noise() || node.action == ChangeAction::Remove
            {
                continue;
            }
            let hits = config.classify(&node.tags, OsmType::Node);
            if hits.is_empty() {
                continue;
            }
            let entry = stats.entry(node.change_id).or_insert_with(|| {
                ChangeStats::new(node.change_id, node.uid, &node.user, node.timestamp)
            });
            for hit in hits {
                match node.action {
                    ChangeAction::Create => *entry.added.entry(hit).or_insert(0) += 1,
                    ChangeAction::Modify => *entry.modified.entry(hit).or_insert(0) += 1,
                    _ => {}
                }
            }
        }

        for way in &change.ways {
            if way.tags.is_empty() || way.is_legacy_noise() || way.action == ChangeAction::Remove {
                continue;
            }
            let hits = config.classify(&way.tags, OsmType::Way);
            if hits.is_empty() {
                continue;
            }
            let entry = stats.entry(way.change_id).or_insert_with(|| {
                ChangeStats::new(way.change_id, way.uid, &way.user, way.timestamp)
            });
            for hit in hits {
                match way.action {
                    ChangeAction::Create => *entry.added.entry(hit.clone()).or_insert(0) += 1,
                    ChangeAction::Modify => *entry.modified.entry(hit.clone()).or_insert(0) += 1,
                    _ => {}
                }

                if (hit == "highway" || hit == "waterway") && way.action == ChangeAction::Create {
                    let length = way_length_km(&way.refs, cache);
                    if length > 0.0 {
                        *entry.added_km.entry(format!("{hit}_km")).or_insert(0.0) += length;
                    }
                }
            }
        }

        for relation in &change.relations {
            if relation.tags.is_empty() || relation.action == ChangeAction::Remove {
                continue;
            }
            let hits = config.classify(&relation.tags, OsmType::Relation);
            if hits.is_empty() {
                continue;
            }
            let entry = stats.entry(relation.change_id).or_insert_with(|| {
                ChangeStats::new(
                    relation.change_id,
                    relation.uid,
                    &relation.user,
                    relation.timestamp,
                )
            });
            for hit in hits {
                match relation.action {
                    ChangeAction::Create => *entry.added.entry(hit).or_insert(0) += 1,
                    ChangeAction::Modify => *entry.modified.entry(hit).or_insert(0) += 1,
                    _ => {}
                }
            }
        }
    }

    stats.retain(|_, s| !s.is_empty());
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::{OsmNode, OsmWay, Tags};
    use crate::parser::OsmChange;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_haversine_one_degree_longitude_at_equator() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(1.0, 0.0);
        // One degree of arc on a 6371 km sphere.
        let expected = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
        assert!((haversine_km(a, b) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_zero_distance() {
        let p = Point::new(21.726, 4.620);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn test_way_length_skips_unknown_points() {
        let cache = NodeCache::new();
        cache.insert(1, Point::new(0.0, 0.0)); // literal origin, skipped
        cache.insert(2, Point::new(1.0, 0.0));
        cache.insert(3, Point::new(2.0, 0.0));
        // Node 4 is not cached at all.
        let length = way_length_km(&[1, 2, 4, 3], &cache);
        let expected = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;
        assert!((length - expected).abs() < 1e-9);
    }

    fn batch_with(change: OsmChange) -> FileBatch {
        FileBatch {
            changes: vec![change],
            final_entry: None,
        }
    }

    #[test]
    fn test_created_highway_counts_and_km() {
        let cache = NodeCache::new();
        cache.insert(1, Point::new(0.0, 0.0001));
        cache.insert(2, Point::new(1.0, 0.0001));

        let mut change = OsmChange {
            action: ChangeAction::Create,
            ..Default::default()
        };
        change.ways.push(OsmWay {
            id: 7,
            change_id: 100,
            uid: 9,
            user: "mapper".to_string(),
            action: ChangeAction::Create,
            refs: vec![1, 2],
            tags: tags(&[("highway", "residential")]),
            ..Default::default()
        });

        let stats = collect_stats(&batch_with(change), &cache, &StatsConfig::default());
        let entry = stats.get(&100).unwrap();
        assert_eq!(entry.added.get("highway"), Some(&1));
        let km = entry.added_km.get("highway_km").unwrap();
        let expected = haversine_km(Point::new(0.0, 0.0001), Point::new(1.0, 0.0001));
        assert!((km - expected).abs() < 1e-6);
        assert_eq!(entry.username, "mapper");
    }

    #[test]
    fn test_modified_building_counts_no_km() {
        let cache = NodeCache::new();
        let mut change = OsmChange {
            action: ChangeAction::Modify,
            ..Default::default()
        };
        change.ways.push(OsmWay {
            id: 8,
            change_id: 101,
            action: ChangeAction::Modify,
            tags: tags(&[("building", "yes")]),
            ..Default::default()
        });
        let stats = collect_stats(&batch_with(change), &cache, &StatsConfig::default());
        let entry = stats.get(&101).unwrap();
        assert_eq!(entry.modified.get("building"), Some(&1));
        assert!(entry.added.is_empty());
        assert!(entry.added_km.is_empty());
    }

    #[test]
    fn test_removes_and_noise_score_nothing() {
        let cache = NodeCache::new();
        let mut change = OsmChange {
            action: ChangeAction::Remove,
            ..Default::default()
        };
        change.nodes.push(OsmNode {
            id: 1,
            change_id: 102,
            action: ChangeAction::Remove,
            tags: tags(&[("building", "yes")]),
            ..Default::default()
        });
        change.nodes.push(OsmNode {
            id: 2,
            change_id: 102,
            action: ChangeAction::Create,
            tags: tags(&[("created_at", "2012-01-01")]),
            ..Default::default()
        });
        let stats = collect_stats(&batch_with(change), &cache, &StatsConfig::default());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_untagged_objects_score_nothing() {
        let cache = NodeCache::new();
        let mut change = OsmChange {
            action: ChangeAction::Create,
            ..Default::default()
        };
        change.nodes.push(OsmNode {
            id: 1,
            change_id: 103,
            action: ChangeAction::Create,
            ..Default::default()
        });
        let stats = collect_stats(&batch_with(change), &cache, &StatsConfig::default());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_added_sum_matches_created_matches() {
        let cache = NodeCache::new();
        let mut change = OsmChange {
            action: ChangeAction::Create,
            ..Default::default()
        };
        for i in 0..5 {
            change.nodes.push(OsmNode {
                id: i,
                change_id: 104,
                action: ChangeAction::Create,
                tags: tags(&[("building", "yes")]),
                ..Default::default()
            });
        }
        let stats = collect_stats(&batch_with(change), &cache, &StatsConfig::default());
        let total: i64 = stats.get(&104).unwrap().added.values().sum();
        assert_eq!(total, 5);
    }
}
