//! Highway checks

use crate::osm::objects::OsmWay;
use crate::validation::StatusKind;
use std::collections::BTreeSet;

const KNOWN_VALUES: &[&str] = &[
    "bridleway",
    "bus_guideway",
    "busway",
    "construction",
    "corridor",
    "cycleway",
    "footway",
    "living_street",
    "motorway",
    "motorway_link",
    "path",
    "pedestrian",
    "primary",
    "primary_link",
    "raceway",
    "residential",
    "road",
    "secondary",
    "secondary_link",
    "service",
    "steps",
    "tertiary",
    "tertiary_link",
    "track",
    "trunk",
    "trunk_link",
    "unclassified",
];

/// Classes where a missing surface tag is reported
const SURFACE_CLASSES: &[&str] = &[
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "residential",
    "unclassified",
];

pub(super) fn check_way(way: &OsmWay, status: &mut BTreeSet<StatusKind>) {
    let Some(value) = way.tags.get("highway") else {
        return;
    };

    if KNOWN_VALUES.contains(&value.as_str()) {
        status.insert(StatusKind::Correct);
    } else {
        status.insert(StatusKind::BadValue);
    }

    if SURFACE_CLASSES.contains(&value.as_str()) {
        if way.tags.contains_key("surface") {
            status.insert(StatusKind::Complete);
        } else {
            status.insert(StatusKind::Incomplete);
        }
    }

    // A road of one point cannot be rendered.
    if way.num_points() == 1 {
        status.insert(StatusKind::BadGeometry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::Tags;

    fn way_with(pairs: &[(&str, &str)]) -> OsmWay {
        OsmWay {
            tags: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Tags>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_residential_without_surface_incomplete() {
        let mut status = BTreeSet::new();
        check_way(&way_with(&[("highway", "residential")]), &mut status);
        assert!(status.contains(&StatusKind::Correct));
        assert!(status.contains(&StatusKind::Incomplete));
    }

    #[test]
    fn test_residential_with_surface_complete() {
        let mut status = BTreeSet::new();
        check_way(
            &way_with(&[("highway", "residential"), ("surface", "asphalt")]),
            &mut status,
        );
        assert!(status.contains(&StatusKind::Complete));
    }

    #[test]
    fn test_track_needs_no_surface() {
        let mut status = BTreeSet::new();
        check_way(&way_with(&[("highway", "track")]), &mut status);
        assert!(status.contains(&StatusKind::Correct));
        assert!(!status.contains(&StatusKind::Incomplete));
    }

    #[test]
    fn test_unknown_class_flagged() {
        let mut status = BTreeSet::new();
        check_way(&way_with(&[("highway", "hyperloop")]), &mut status);
        assert!(status.contains(&StatusKind::BadValue));
    }
}
