//! Waterway checks

use crate::osm::objects::{OsmNode, OsmWay};
use crate::validation::StatusKind;
use std::collections::BTreeSet;

const KNOWN_VALUES: &[&str] = &[
    "river",
    "riverbank",
    "stream",
    "tidal_channel",
    "canal",
    "drain",
    "ditch",
    "pressurised",
    "fairway",
    "dock",
    "boatyard",
    "dam",
    "weir",
    "waterfall",
    "lock_gate",
];

fn check_value(value: Option<&str>, status: &mut BTreeSet<StatusKind>) {
    let Some(value) = value else {
        return;
    };
    if KNOWN_VALUES.contains(&value) {
        status.insert(StatusKind::Correct);
    } else {
        status.insert(StatusKind::BadValue);
    }
}

pub(super) fn check_node(node: &OsmNode, status: &mut BTreeSet<StatusKind>) {
    check_value(node.tags.get("waterway").map(String::as_str), status);
}

pub(super) fn check_way(way: &OsmWay, status: &mut BTreeSet<StatusKind>) {
    check_value(way.tags.get("waterway").map(String::as_str), status);

    // A linear waterway of one point is degenerate.
    if way.num_points() == 1 {
        status.insert(StatusKind::BadGeometry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::Tags;

    #[test]
    fn test_known_and_unknown_values() {
        let mut status = BTreeSet::new();
        let node = OsmNode {
            tags: [("waterway".to_string(), "stream".to_string())]
                .into_iter()
                .collect::<Tags>(),
            ..Default::default()
        };
        check_node(&node, &mut status);
        assert!(status.contains(&StatusKind::Correct));

        let mut status = BTreeSet::new();
        let node = OsmNode {
            tags: [("waterway".to_string(), "lava_flow".to_string())]
                .into_iter()
                .collect::<Tags>(),
            ..Default::default()
        };
        check_node(&node, &mut status);
        assert!(status.contains(&StatusKind::BadValue));
    }
}
