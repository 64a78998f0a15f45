//! Landuse checks

use crate::osm::objects::OsmWay;
use crate::validation::StatusKind;
use std::collections::BTreeSet;

const KNOWN_VALUES: &[&str] = &[
    "allotments",
    "basin",
    "brownfield",
    "cemetery",
    "commercial",
    "construction",
    "farmland",
    "farmyard",
    "forest",
    "garages",
    "grass",
    "greenfield",
    "industrial",
    "landfill",
    "meadow",
    "military",
    "orchard",
    "quarry",
    "railway",
    "recreation_ground",
    "religious",
    "reservoir",
    "residential",
    "retail",
    "village_green",
    "vineyard",
];

pub(super) fn check_way(way: &OsmWay, status: &mut BTreeSet<StatusKind>) {
    let Some(value) = way.tags.get("landuse") else {
        return;
    };

    if KNOWN_VALUES.contains(&value.as_str()) {
        status.insert(StatusKind::Correct);
    } else {
        status.insert(StatusKind::BadValue);
    }

    // Landuse areas should be closed rings.
    if way.num_points() > 0 && !way.is_closed() {
        status.insert(StatusKind::BadGeometry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::objects::Tags;

    #[test]
    fn test_known_landuse_value() {
        let way = OsmWay {
            tags: [("landuse".to_string(), "farmland".to_string())]
                .into_iter()
                .collect::<Tags>(),
            ..Default::default()
        };
        let mut status = BTreeSet::new();
        check_way(&way, &mut status);
        assert!(status.contains(&StatusKind::Correct));
    }

    #[test]
    fn test_open_landuse_ring_flagged() {
        let mut way = OsmWay {
            refs: vec![1, 2, 3],
            tags: [("landuse".to_string(), "forest".to_string())]
                .into_iter()
                .collect::<Tags>(),
            ..Default::default()
        };
        way.linestring =
            crate::osm::objects::linestring(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]);
        let mut status = BTreeSet::new();
        check_way(&way, &mut status);
        assert!(status.contains(&StatusKind::BadGeometry));
    }
}
