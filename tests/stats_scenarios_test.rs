//! Statistics scenarios over a one-minute replication file
//!
//! With the supplied tag config, N created highways of total length L and
//! M modified buildings must produce added["highway"] == N,
//! added_km["highway_km"] == L and modified["building"] == M.

use geo_types::Point;
use underpass::osm::NodeCache;
use underpass::parser::parse_osmchange;
use underpass::stats::{collect_stats, haversine_km, StatsConfig};

const STATS_YAML: &str = r#"
- name: highway
  way:
    highway: ["*"]
- name: building
  way:
    building: ["*"]
  node:
    building: ["*"]
- name: waterway
  way:
    waterway: ["*"]
"#;

fn replication_minute() -> &'static str {
    r#"<osmChange version="0.6">
  <create>
    <node id="1" version="1" timestamp="2021-06-01T00:00:01Z" uid="5" user="roadworks" changeset="900" lat="0.0" lon="0.0001"/>
    <node id="2" version="1" timestamp="2021-06-01T00:00:02Z" uid="5" user="roadworks" changeset="900" lat="0.0" lon="0.5"/>
    <node id="3" version="1" timestamp="2021-06-01T00:00:03Z" uid="5" user="roadworks" changeset="900" lat="0.0" lon="1.0"/>
    <node id="4" version="1" timestamp="2021-06-01T00:00:04Z" uid="5" user="roadworks" changeset="900" lat="0.5" lon="1.0"/>
    <way id="10" version="1" timestamp="2021-06-01T00:00:10Z" uid="5" user="roadworks" changeset="900">
      <nd ref="1"/><nd ref="2"/><nd ref="3"/>
      <tag k="highway" v="residential"/>
    </way>
    <way id="11" version="1" timestamp="2021-06-01T00:00:11Z" uid="5" user="roadworks" changeset="900">
      <nd ref="3"/><nd ref="4"/>
      <tag k="highway" v="service"/>
    </way>
  </create>
  <modify>
    <way id="20" version="2" timestamp="2021-06-01T00:00:20Z" uid="5" user="roadworks" changeset="900">
      <nd ref="1"/><nd ref="2"/>
      <tag k="building" v="warehouse"/>
    </way>
    <way id="21" version="3" timestamp="2021-06-01T00:00:21Z" uid="5" user="roadworks" changeset="900">
      <nd ref="2"/><nd ref="3"/>
      <tag k="building" v="yes"/>
    </way>
    <way id="22" version="2" timestamp="2021-06-01T00:00:22Z" uid="5" user="roadworks" changeset="900">
      <nd ref="3"/><nd ref="4"/>
      <tag k="building" v="yes"/>
    </way>
  </modify>
</osmChange>"#
}

#[test]
fn highway_and_building_counters() {
    let cache = NodeCache::new();
    let batch = parse_osmchange(replication_minute().as_bytes(), &cache).unwrap();
    let config = StatsConfig::from_yaml(STATS_YAML).unwrap();

    let stats = collect_stats(&batch, &cache, &config);
    let entry = stats.get(&900).expect("changeset 900 accrued stats");

    // Two created highways, three modified buildings.
    assert_eq!(entry.added.get("highway"), Some(&2));
    assert_eq!(entry.modified.get("building"), Some(&3));
    assert!(entry.added.get("building").is_none());

    // Total length is the haversine sum over both created ways.
    let expected = haversine_km(Point::new(0.0001, 0.0), Point::new(0.5, 0.0))
        + haversine_km(Point::new(0.5, 0.0), Point::new(1.0, 0.0))
        + haversine_km(Point::new(1.0, 0.0), Point::new(1.0, 0.5));
    let km = entry.added_km.get("highway_km").expect("length accrued");
    assert!((km - expected).abs() < 1e-6);

    assert_eq!(entry.user_id, 5);
    assert_eq!(entry.username, "roadworks");
}

#[test]
fn no_entry_without_category_hits() {
    let cache = NodeCache::new();
    let xml = r#"<osmChange version="0.6">
  <create>
    <node id="1" version="1" timestamp="2021-06-01T00:00:01Z" uid="5" user="x" changeset="901" lat="1.0" lon="1.0">
      <tag k="power" v="tower"/>
    </node>
  </create>
</osmChange>"#;
    let batch = parse_osmchange(xml.as_bytes(), &cache).unwrap();
    let config = StatsConfig::from_yaml(STATS_YAML).unwrap();
    assert!(collect_stats(&batch, &cache, &config).is_empty());
}

#[test]
fn deletes_do_not_double_count() {
    let cache = NodeCache::new();
    let xml = r#"<osmChange version="0.6">
  <delete>
    <way id="10" version="2" timestamp="2021-06-01T00:01:00Z" uid="5" user="x" changeset="902">
      <nd ref="1"/><nd ref="2"/>
      <tag k="highway" v="residential"/>
    </way>
  </delete>
</osmChange>"#;
    let batch = parse_osmchange(xml.as_bytes(), &cache).unwrap();
    let config = StatsConfig::from_yaml(STATS_YAML).unwrap();
    assert!(collect_stats(&batch, &cache, &config).is_empty());
}

#[test]
fn serialized_stats_are_json_friendly() {
    let cache = NodeCache::new();
    let batch = parse_osmchange(replication_minute().as_bytes(), &cache).unwrap();
    let config = StatsConfig::from_yaml(STATS_YAML).unwrap();
    let stats = collect_stats(&batch, &cache, &config);

    let json = serde_json::to_value(stats.get(&900).unwrap()).unwrap();
    assert_eq!(json["change_id"], 900);
    assert_eq!(json["added"]["highway"], 2);
    assert_eq!(json["modified"]["building"], 3);
}
