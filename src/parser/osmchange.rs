//! osmChange file parser
//!
//! Streams `<osmChange>` documents into change frames. Each
//! `<create>|<modify>|<delete>` element opens a frame; inner `<node>`,
//! `<way>` and `<relation>` elements attach to the most recent frame until
//! their closing tag. Node coordinates are fed into the node cache during
//! the parse (in document order, before the ways that reference them), and
//! way geometry is assembled from the cache afterwards.
//!
//! Files downloaded from planet are often missing a trailing newline after
//! gzip truncation; a parse error after useful content is therefore
//! tolerated and any partially constructed object is discarded.

use crate::domain::{Result, UnderpassError};
use crate::osm::objects::{
    polygon_from_ring, ChangeAction, OsmNode, OsmRelation, OsmRelationMember, OsmType, OsmWay,
};
use crate::osm::NodeCache;
use crate::parser::parse_osm_timestamp;
use chrono::{DateTime, Utc};
use geo::Centroid;
use geo_types::{Coord, LineString, Point};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;

/// One change frame: an action applied to a group of objects
#[derive(Debug, Clone, Default)]
pub struct OsmChange {
    /// The change action
    pub action: ChangeAction,
    /// The nodes in this change
    pub nodes: Vec<OsmNode>,
    /// The ways in this change
    pub ways: Vec<OsmWay>,
    /// The relations in this change
    pub relations: Vec<OsmRelation>,
}

impl OsmChange {
    fn new(action: ChangeAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// Whether the frame holds no objects
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }
}

/// The parsed content of one replication file
#[derive(Debug, Default)]
pub struct FileBatch {
    /// Ordered change frames
    pub changes: Vec<OsmChange>,
    /// The timestamp of the last change in the file
    pub final_entry: Option<DateTime<Utc>>,
}

impl FileBatch {
    /// Iterate all nodes across frames
    pub fn nodes(&self) -> impl Iterator<Item = &OsmNode> {
        self.changes.iter().flat_map(|c| c.nodes.iter())
    }

    /// Iterate all ways across frames
    pub fn ways(&self) -> impl Iterator<Item = &OsmWay> {
        self.changes.iter().flat_map(|c| c.ways.iter())
    }

    /// Iterate all relations across frames
    pub fn relations(&self) -> impl Iterator<Item = &OsmRelation> {
        self.changes.iter().flat_map(|c| c.relations.iter())
    }

    /// Total object count
    pub fn len(&self) -> usize {
        self.changes
            .iter()
            .map(|c| c.nodes.len() + c.ways.len() + c.relations.len())
            .sum()
    }

    /// Whether the batch holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render a batch back to osmChange XML
///
/// Used by the test suite to check parse/serialize round trips and handy
/// for debugging a filtered batch.
pub fn to_xml(batch: &FileBatch) -> String {
    use std::fmt::Write as _;

    fn escape(value: &str) -> String {
        value
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('"', "&quot;")
    }

    let mut out = String::from("<osmChange version=\"0.6\" generator=\"underpass\">\n");
    for change in &batch.changes {
        let frame = match change.action {
            ChangeAction::Create => "create",
            ChangeAction::Modify => "modify",
            ChangeAction::Remove => "delete",
            ChangeAction::None => continue,
        };
        let _ = writeln!(out, "  <{frame}>");
        for node in &change.nodes {
            let _ = write!(
                out,
                "    <node id=\"{}\" version=\"{}\" timestamp=\"{}\" uid=\"{}\" user=\"{}\" changeset=\"{}\" lat=\"{}\" lon=\"{}\"",
                node.id,
                node.version,
                node.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                node.uid,
                escape(&node.user),
                node.change_id,
                node.point.y(),
                node.point.x(),
            );
            if node.tags.is_empty() {
                let _ = writeln!(out, "/>");
            } else {
                let _ = writeln!(out, ">");
                for (k, v) in &node.tags {
                    let _ = writeln!(out, "      <tag k=\"{}\" v=\"{}\"/>", escape(k), escape(v));
                }
                let _ = writeln!(out, "    </node>");
            }
        }
        for way in &change.ways {
            let _ = writeln!(
                out,
                "    <way id=\"{}\" version=\"{}\" timestamp=\"{}\" uid=\"{}\" user=\"{}\" changeset=\"{}\">",
                way.id,
                way.version,
                way.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                way.uid,
                escape(&way.user),
                way.change_id,
            );
            for r in &way.refs {
                let _ = writeln!(out, "      <nd ref=\"{r}\"/>");
            }
            for (k, v) in &way.tags {
                let _ = writeln!(out, "      <tag k=\"{}\" v=\"{}\"/>", escape(k), escape(v));
            }
            let _ = writeln!(out, "    </way>");
        }
        for relation in &change.relations {
            let _ = writeln!(
                out,
                "    <relation id=\"{}\" version=\"{}\" timestamp=\"{}\" uid=\"{}\" user=\"{}\" changeset=\"{}\">",
                relation.id,
                relation.version,
                relation.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                relation.uid,
                escape(&relation.user),
                relation.change_id,
            );
            for member in &relation.members {
                let _ = writeln!(
                    out,
                    "      <member type=\"{}\" ref=\"{}\" role=\"{}\"/>",
                    member.member_type.as_str(),
                    member.ref_id,
                    escape(&member.role),
                );
            }
            for (k, v) in &relation.tags {
                let _ = writeln!(out, "      <tag k=\"{}\" v=\"{}\"/>", escape(k), escape(v));
            }
            let _ = writeln!(out, "    </relation>");
        }
        let _ = writeln!(out, "  </{frame}>");
    }
    out.push_str("</osmChange>\n");
    out
}

enum Current {
    None,
    Node(OsmNode),
    Way(OsmWay),
    Relation(OsmRelation),
}

struct ParseState {
    changes: Vec<OsmChange>,
    current: Current,
    final_entry: Option<DateTime<Utc>>,
    seen_root: bool,
}

impl ParseState {
    fn action(&self) -> ChangeAction {
        self.changes
            .last()
            .map(|c| c.action)
            .unwrap_or(ChangeAction::None)
    }

    fn touch_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.final_entry.map(|cur| ts > cur).unwrap_or(true) {
            self.final_entry = Some(ts);
        }
    }

    fn finish_current(&mut self, cache: &NodeCache) {
        let current = std::mem::replace(&mut self.current, Current::None);
        let Some(frame) = self.changes.last_mut() else {
            return;
        };
        match current {
            Current::None => {}
            Current::Node(node) => {
                if node.point != Point::new(0.0, 0.0) {
                    cache.insert(node.id, node.point);
                }
                frame.nodes.push(node);
            }
            Current::Way(way) => frame.ways.push(way),
            Current::Relation(relation) => frame.relations.push(relation),
        }
    }
}

/// Parse an osmChange document
///
/// `cache` receives the coordinates of every node seen, whether or not the
/// node survives later filtering; this is what resolves way geometry across
/// files.
///
/// # Errors
///
/// Returns `MalformedInput` only when the document yields no usable frames;
/// a truncated trailer after valid content is tolerated.
pub fn parse_osmchange<R: BufRead>(reader: R, cache: &NodeCache) -> Result<FileBatch> {
    let mut xml = Reader::from_reader(reader);

    let mut state = ParseState {
        changes: Vec::new(),
        current: Current::None,
        final_entry: None,
        seen_root: false,
    };
    let mut buf = Vec::new();

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => handle_element(&e, false, &mut state, cache)?,
            Ok(Event::Empty(e)) => handle_element(&e, true, &mut state, cache)?,
            Ok(Event::End(e)) => {
                if matches!(e.name().as_ref(), b"node" | b"way" | b"relation") {
                    state.finish_current(cache);
                }
            }
            Ok(_) => {}
            Err(e) => {
                // Partially constructed objects are discarded; everything
                // already finished stays in the batch.
                if state.seen_root {
                    tracing::debug!(error = %e, "tolerating truncated osmChange trailer");
                    state.current = Current::None;
                    break;
                }
                return Err(UnderpassError::MalformedInput(format!(
                    "osmChange parse failed before any content: {e}"
                )));
            }
        }
        buf.clear();
    }

    if !state.seen_root {
        return Err(UnderpassError::MalformedInput(
            "not an osmChange document".to_string(),
        ));
    }

    state.finish_current(cache);

    let mut batch = FileBatch {
        changes: state.changes,
        final_entry: state.final_entry,
    };
    assemble_way_geometry(&mut batch, cache);

    Ok(batch)
}

fn handle_element(
    e: &BytesStart<'_>,
    is_empty: bool,
    state: &mut ParseState,
    cache: &NodeCache,
) -> Result<()> {
    match e.name().as_ref() {
        b"osmChange" => {
            state.seen_root = true;
        }
        b"create" => state.changes.push(OsmChange::new(ChangeAction::Create)),
        b"modify" => state.changes.push(OsmChange::new(ChangeAction::Modify)),
        b"delete" => state.changes.push(OsmChange::new(ChangeAction::Remove)),
        b"node" => {
            state.finish_current(cache);
            let mut node = OsmNode {
                action: state.action(),
                ..Default::default()
            };
            apply_common_attributes(e, &mut CommonTarget::Node(&mut node), state)?;
            state.current = Current::Node(node);
            if is_empty {
                state.finish_current(cache);
            }
        }
        b"way" => {
            state.finish_current(cache);
            let mut way = OsmWay {
                action: state.action(),
                ..Default::default()
            };
            apply_common_attributes(e, &mut CommonTarget::Way(&mut way), state)?;
            state.current = Current::Way(way);
            if is_empty {
                state.finish_current(cache);
            }
        }
        b"relation" => {
            state.finish_current(cache);
            let mut relation = OsmRelation {
                action: state.action(),
                ..Default::default()
            };
            apply_common_attributes(e, &mut CommonTarget::Relation(&mut relation), state)?;
            state.current = Current::Relation(relation);
            if is_empty {
                state.finish_current(cache);
            }
        }
        b"tag" => {
            let (mut key, mut value) = (None, None);
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"k" => key = Some(attr_string(&attr)?),
                    b"v" => value = Some(attr_string(&attr)?),
                    _ => {}
                }
            }
            if let (Some(key), Some(value)) = (key, value) {
                match &mut state.current {
                    Current::Node(n) => {
                        n.tags.insert(key, value);
                    }
                    Current::Way(w) => {
                        w.tags.insert(key, value);
                    }
                    Current::Relation(r) => {
                        r.tags.insert(key, value);
                    }
                    Current::None => {}
                }
            }
        }
        b"nd" => {
            if let Current::Way(way) = &mut state.current {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"ref" {
                        way.refs.push(attr_parse(&attr)?);
                    }
                }
            }
        }
        b"member" => {
            let mut member_type = None;
            let mut ref_id: Option<i64> = None;
            let mut role = String::new();
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"type" => {
                        member_type = match attr.value.as_ref() {
                            b"node" => Some(OsmType::Node),
                            b"way" => Some(OsmType::Way),
                            b"relation" => Some(OsmType::Relation),
                            other => {
                                tracing::debug!(
                                    member_type = %String::from_utf8_lossy(other),
                                    "invalid relation member type"
                                );
                                None
                            }
                        }
                    }
                    b"ref" => ref_id = Some(attr_parse(&attr)?),
                    b"role" => role = attr_string(&attr)?,
                    _ => {}
                }
            }
            if let (Current::Relation(relation), Some(member_type), Some(ref_id)) =
                (&mut state.current, member_type, ref_id)
            {
                relation.members.push(OsmRelationMember {
                    member_type,
                    ref_id,
                    role,
                });
            }
        }
        other => {
            tracing::debug!(
                element = %String::from_utf8_lossy(other),
                "skipping unknown osmChange element"
            );
        }
    }
    Ok(())
}

enum CommonTarget<'a> {
    Node(&'a mut OsmNode),
    Way(&'a mut OsmWay),
    Relation(&'a mut OsmRelation),
}

fn apply_common_attributes(
    e: &BytesStart<'_>,
    target: &mut CommonTarget<'_>,
    state: &mut ParseState,
) -> Result<()> {
    for attr in e.attributes().flatten() {
        let value = attr_string(&attr)?;
        match attr.key.as_ref() {
            b"id" => {
                let id = parse_num::<i64>(&value)?;
                match target {
                    CommonTarget::Node(n) => n.id = id,
                    CommonTarget::Way(w) => w.id = id,
                    CommonTarget::Relation(r) => r.id = id,
                }
            }
            b"version" => {
                let version = parse_num::<i32>(&value)?;
                match target {
                    CommonTarget::Node(n) => n.version = version,
                    CommonTarget::Way(w) => w.version = version,
                    CommonTarget::Relation(r) => r.version = version,
                }
            }
            b"timestamp" => {
                let ts = parse_osm_timestamp(&value)?;
                state.touch_timestamp(ts);
                match target {
                    CommonTarget::Node(n) => n.timestamp = ts,
                    CommonTarget::Way(w) => w.timestamp = ts,
                    CommonTarget::Relation(r) => r.timestamp = ts,
                }
            }
            b"uid" => {
                let uid = parse_num::<i64>(&value)?;
                match target {
                    CommonTarget::Node(n) => n.uid = uid,
                    CommonTarget::Way(w) => w.uid = uid,
                    CommonTarget::Relation(r) => r.uid = uid,
                }
            }
            b"user" => match target {
                CommonTarget::Node(n) => n.user = value,
                CommonTarget::Way(w) => w.user = value,
                CommonTarget::Relation(r) => r.user = value,
            },
            b"changeset" => {
                let change_id = parse_num::<i64>(&value)?;
                match target {
                    CommonTarget::Node(n) => n.change_id = change_id,
                    CommonTarget::Way(w) => w.change_id = change_id,
                    CommonTarget::Relation(r) => r.change_id = change_id,
                }
            }
            b"lat" => {
                if let CommonTarget::Node(n) = target {
                    n.set_latitude(parse_num::<f64>(&value)?);
                }
            }
            b"lon" => {
                if let CommonTarget::Node(n) = target {
                    n.set_longitude(parse_num::<f64>(&value)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn attr_string(attr: &quick_xml::events::attributes::Attribute<'_>) -> Result<String> {
    attr.unescape_value()
        .map(|v| v.into_owned())
        .map_err(|e| UnderpassError::MalformedInput(format!("bad attribute value: {e}")))
}

fn attr_parse<T: std::str::FromStr>(
    attr: &quick_xml::events::attributes::Attribute<'_>,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    parse_num(&attr_string(attr)?)
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| UnderpassError::MalformedInput(format!("bad number '{value}': {e}")))
}

/// Resolve way geometry from the node cache
///
/// A linestring is only materialised when every ref resolves; a way with
/// any unresolved ref stays geometry-unknown. Closed, polygon-tagged ways
/// additionally get their ring polygon and every way with geometry gets a
/// centroid.
fn assemble_way_geometry(batch: &mut FileBatch, cache: &NodeCache) {
    for change in &mut batch.changes {
        for way in &mut change.ways {
            way.classify();
            let resolved = cache.resolve(&way.refs);
            if resolved.is_empty() || resolved.iter().any(Option::is_none) {
                continue;
            }
            way.linestring = LineString::new(
                resolved
                    .into_iter()
                    .map(|p| {
                        let p = p.expect("all refs resolved");
                        Coord { x: p.x(), y: p.y() }
                    })
                    .collect(),
            );
            way.center = way.linestring.centroid();
            if way.is_closed() && way.is_polygon {
                way.polygon = Some(polygon_from_ring(&way.linestring));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SINGLE_NODE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="openstreetmap-cgimap">
  <create>
    <node id="34567" version="1" timestamp="2020-10-30T20:15:24Z" uid="3333333"
          user="bar" changeset="93309184" lat="45.4303763" lon="10.9837526">
      <tag k="amenity" v="cafe"/>
      <tag k="name" v="Bar &amp; Grill"/>
    </node>
  </create>
</osmChange>"#;

    #[test]
    fn test_parse_single_created_node() {
        let cache = NodeCache::new();
        let batch = parse_osmchange(Cursor::new(SINGLE_NODE), &cache).unwrap();

        assert_eq!(batch.changes.len(), 1);
        let change = &batch.changes[0];
        assert_eq!(change.action, ChangeAction::Create);
        assert_eq!(change.nodes.len(), 1);

        let node = &change.nodes[0];
        assert_eq!(node.id, 34567);
        assert_eq!(node.change_id, 93309184);
        assert_eq!(node.uid, 3333333);
        assert_eq!(node.user, "bar");
        assert_eq!(node.point.x(), 10.9837526);
        assert_eq!(node.point.y(), 45.4303763);
        assert_eq!(node.tags.get("amenity").unwrap(), "cafe");
        assert_eq!(node.tags.get("name").unwrap(), "Bar & Grill");
        assert_eq!(node.action, ChangeAction::Create);

        // Coordinates land in the cache in document order.
        assert_eq!(cache.get(34567), Some(Point::new(10.9837526, 45.4303763)));
        assert_eq!(
            batch.final_entry.unwrap(),
            parse_osm_timestamp("2020-10-30T20:15:24Z").unwrap()
        );
    }

    const NODES_AND_WAY: &str = r#"<osmChange version="0.6">
  <create>
    <node id="101" version="1" timestamp="2021-01-01T00:00:01Z" uid="1" user="a" changeset="500" lat="4.62042952837" lon="21.726001473"/>
    <node id="102" version="1" timestamp="2021-01-01T00:00:02Z" uid="1" user="a" changeset="500" lat="4.62042742837" lon="21.726086573"/>
    <node id="103" version="1" timestamp="2021-01-01T00:00:03Z" uid="1" user="a" changeset="500" lat="4.62036492836" lon="21.726084973"/>
    <node id="104" version="1" timestamp="2021-01-01T00:00:04Z" uid="1" user="a" changeset="500" lat="4.62036702836" lon="21.725999873"/>
    <way id="201" version="1" timestamp="2021-01-01T00:00:05Z" uid="1" user="a" changeset="500">
      <nd ref="101"/>
      <nd ref="102"/>
      <nd ref="103"/>
      <nd ref="104"/>
      <nd ref="101"/>
      <tag k="building" v="yes"/>
    </way>
  </create>
</osmChange>"#;

    #[test]
    fn test_way_geometry_assembled_from_same_file() {
        let cache = NodeCache::new();
        let batch = parse_osmchange(Cursor::new(NODES_AND_WAY), &cache).unwrap();

        let way = batch.ways().next().unwrap();
        assert_eq!(way.refs, vec![101, 102, 103, 104, 101]);
        assert_eq!(way.num_points(), 5);
        assert!(way.is_polygon);
        assert!(way.polygon.is_some());
        assert!(way.center.is_some());
    }

    #[test]
    fn test_way_geometry_from_earlier_file() {
        let cache = NodeCache::new();
        // Nodes arrived in an earlier replication file.
        cache.insert(101, Point::new(21.726001473, 4.62042952837));
        cache.insert(102, Point::new(21.726086573, 4.62042742837));
        cache.insert(103, Point::new(21.726084973, 4.62036492836));
        cache.insert(104, Point::new(21.725999873, 4.62036702836));

        let only_way = r#"<osmChange version="0.6"><create>
            <way id="202" version="1" timestamp="2021-01-02T00:00:00Z" uid="1" user="a" changeset="501">
              <nd ref="101"/><nd ref="102"/><nd ref="103"/><nd ref="104"/><nd ref="101"/>
              <tag k="building" v="yes"/>
            </way></create></osmChange>"#;
        let batch = parse_osmchange(Cursor::new(only_way), &cache).unwrap();
        let way = batch.ways().next().unwrap();
        assert_eq!(way.num_points(), 5);
        assert!(way.polygon.is_some());
    }

    #[test]
    fn test_unresolved_refs_leave_geometry_unknown() {
        let cache = NodeCache::new();
        let only_way = r#"<osmChange version="0.6"><modify>
            <way id="203" version="2" timestamp="2021-01-02T00:00:00Z" uid="1" user="a" changeset="502">
              <nd ref="7"/><nd ref="8"/>
              <tag k="highway" v="residential"/>
            </way></modify></osmChange>"#;
        let batch = parse_osmchange(Cursor::new(only_way), &cache).unwrap();
        let way = batch.ways().next().unwrap();
        // |linestring| is 0 or |refs|, never partial.
        assert_eq!(way.num_points(), 0);
        assert!(way.polygon.is_none());
    }

    #[test]
    fn test_relation_members_in_order() {
        let cache = NodeCache::new();
        let xml = r#"<osmChange version="0.6"><create>
            <relation id="301" version="1" timestamp="2021-01-03T00:00:00Z" uid="1" user="a" changeset="503">
              <member type="way" ref="211" role="inner"/>
              <member type="way" ref="210" role="outer"/>
              <member type="node" ref="105" role=""/>
              <tag k="type" v="multipolygon"/>
            </relation></create></osmChange>"#;
        let batch = parse_osmchange(Cursor::new(xml), &cache).unwrap();
        let relation = batch.relations().next().unwrap();
        assert!(relation.is_multipolygon());
        assert_eq!(relation.members.len(), 3);
        assert_eq!(relation.members[0].role, "inner");
        assert_eq!(relation.members[1].ref_id, 210);
        assert_eq!(relation.members[2].member_type, OsmType::Node);
    }

    #[test]
    fn test_truncated_trailer_is_tolerated() {
        let cache = NodeCache::new();
        let truncated = r#"<osmChange version="0.6">
  <create>
    <node id="1" version="1" timestamp="2021-01-01T00:00:00Z" uid="1" user="a" changeset="9" lat="1.0" lon="2.0"/>
  </create>
  <modify>
    <node id="2" version="2" timestamp="2021-01-01T00:01:00Z" uid="1" user="a" changeset="9" lat="3.0" lon="4.0"#;
        let batch = parse_osmchange(Cursor::new(truncated), &cache).unwrap();
        // The complete object survives, the partial one is discarded.
        assert_eq!(batch.nodes().count(), 1);
        assert_eq!(batch.nodes().next().unwrap().id, 1);
    }

    #[test]
    fn test_garbage_input_is_malformed() {
        let cache = NodeCache::new();
        let result = parse_osmchange(Cursor::new("<<<not xml"), &cache);
        assert!(matches!(result, Err(UnderpassError::MalformedInput(_))));
    }

    #[test]
    fn test_delete_frame_action() {
        let cache = NodeCache::new();
        let xml = r#"<osmChange version="0.6"><delete>
            <node id="23456" version="7" timestamp="2020-10-30T20:40:38Z" uid="22222" user="foo" changeset="93310152" lat="50.9176152" lon="-1.3751891"/>
        </delete></osmChange>"#;
        let batch = parse_osmchange(Cursor::new(xml), &cache).unwrap();
        assert_eq!(batch.changes[0].action, ChangeAction::Remove);
        assert_eq!(batch.nodes().next().unwrap().action, ChangeAction::Remove);
    }

    #[test]
    fn test_final_entry_is_max_timestamp() {
        let cache = NodeCache::new();
        let batch = parse_osmchange(Cursor::new(NODES_AND_WAY), &cache).unwrap();
        assert_eq!(
            batch.final_entry.unwrap(),
            parse_osm_timestamp("2021-01-01T00:00:05Z").unwrap()
        );
    }
}
