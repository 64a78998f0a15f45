//! Place checks

use crate::osm::objects::{OsmNode, OsmWay};
use crate::validation::StatusKind;
use std::collections::BTreeSet;

const KNOWN_VALUES: &[&str] = &[
    "city",
    "borough",
    "suburb",
    "quarter",
    "neighbourhood",
    "town",
    "village",
    "hamlet",
    "isolated_dwelling",
    "farm",
    "locality",
    "island",
    "islet",
    "square",
    "region",
];

fn check_value(value: Option<&str>, has_name: bool, status: &mut BTreeSet<StatusKind>) {
    let Some(value) = value else {
        return;
    };
    if KNOWN_VALUES.contains(&value) {
        status.insert(StatusKind::Correct);
    } else {
        status.insert(StatusKind::BadValue);
    }
    // A place without a name cannot be searched for.
    if has_name {
        status.insert(StatusKind::Complete);
    } else {
        status.insert(StatusKind::Incomplete);
    }
}

pub(super) fn check_node(node: &OsmNode, status: &mut BTreeSet<StatusKind>) {
    check_value(
        node.tags.get("place").map(String::as_str),
        node.tags.contains_key("name"),
        status,
    );
}

pub(super) fn check_way(way: &OsmWay, status: &mut BTreeSet<StatusKind>) {
    check_value(
        way.tags.get("place").map(String::as_str),
        way.tags.contains_key("name"),
        status,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::Tags;

    #[test]
    fn test_unnamed_place_incomplete() {
        let node = OsmNode {
            tags: [("place".to_string(), "village".to_string())]
                .into_iter()
                .collect::<Tags>(),
            ..Default::default()
        };
        let mut status = BTreeSet::new();
        check_node(&node, &mut status);
        assert!(status.contains(&StatusKind::Correct));
        assert!(status.contains(&StatusKind::Incomplete));
    }

    #[test]
    fn test_named_place_complete() {
        let node = OsmNode {
            tags: [
                ("place".to_string(), "village".to_string()),
                ("name".to_string(), "Bangassou".to_string()),
            ]
            .into_iter()
            .collect::<Tags>(),
            ..Default::default()
        };
        let mut status = BTreeSet::new();
        check_node(&node, &mut status);
        assert!(status.contains(&StatusKind::Complete));
    }
}
