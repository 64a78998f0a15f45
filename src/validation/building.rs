//! Building checks
//!
//! A building is complete when it carries detail beyond the bare
//! `building=*` tag, and geometrically sound when its ring has at least
//! four corners. Overlap and duplicate detection run in the host, across
//! the whole file.

use crate::osm::objects::{OsmNode, OsmWay};
use crate::validation::StatusKind;
use std::collections::BTreeSet;

/// Recognised `building=*` values; everything else is flagged
const KNOWN_VALUES: &[&str] = &[
    "yes",
    "apartments",
    "bungalow",
    "cabin",
    "commercial",
    "church",
    "detached",
    "garage",
    "hospital",
    "hotel",
    "house",
    "hut",
    "industrial",
    "kindergarten",
    "mosque",
    "office",
    "public",
    "residential",
    "retail",
    "roof",
    "school",
    "semidetached_house",
    "service",
    "shed",
    "temple",
    "terrace",
    "university",
    "warehouse",
];

/// Keys that count as building detail
const DETAIL_KEYS: &[&str] = &[
    "building:levels",
    "building:material",
    "roof:material",
    "name",
    "amenity",
    "addr:street",
    "addr:housenumber",
];

pub(super) fn check_node(node: &OsmNode, status: &mut BTreeSet<StatusKind>) {
    check_value(node.tags.get("building").map(String::as_str), status);
    check_detail(
        DETAIL_KEYS.iter().any(|k| node.tags.contains_key(*k)),
        status,
    );
}

pub(super) fn check_way(way: &OsmWay, status: &mut BTreeSet<StatusKind>) {
    check_value(way.tags.get("building").map(String::as_str), status);
    check_detail(DETAIL_KEYS.iter().any(|k| way.tags.contains_key(*k)), status);

    // A closed building ring needs at least four distinct corners; the
    // last point repeats the first.
    if way.is_closed() && way.num_points() > 0 && way.num_points() < 5 {
        status.insert(StatusKind::BadGeometry);
    }
}

fn check_value(value: Option<&str>, status: &mut BTreeSet<StatusKind>) {
    match value {
        Some(v) if KNOWN_VALUES.contains(&v) => {
            status.insert(StatusKind::Correct);
        }
        Some(_) => {
            status.insert(StatusKind::BadValue);
        }
        None => {}
    }
}

fn check_detail(has_detail: bool, status: &mut BTreeSet<StatusKind>) {
    if has_detail {
        status.insert(StatusKind::Complete);
    } else {
        status.insert(StatusKind::Incomplete);
    }
}
