//! Changeset replication file parser
//!
//! Streams `<osm><changeset …/></osm>` documents. The changeset file carries
//! no feature data, only the metadata of each upload session: bbox, user,
//! comment and hashtags.

use crate::domain::{Result, UnderpassError};
use crate::osm::ChangeSet;
use crate::parser::parse_osm_timestamp;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;

/// The parsed content of one changeset replication file
#[derive(Debug, Default)]
pub struct ChangeSetFile {
    /// All changesets in the file, in document order
    pub changes: Vec<ChangeSet>,
    /// Latest `closed_at` observed, used for stream alignment
    pub last_closed_at: Option<DateTime<Utc>>,
}

/// Parse a changeset replication document
///
/// # Errors
///
/// Returns `MalformedInput` when the document yields no usable content;
/// a truncated trailer after valid content is tolerated.
pub fn parse_changesets<R: BufRead>(reader: R) -> Result<ChangeSetFile> {
    let mut xml = Reader::from_reader(reader);

    let mut file = ChangeSetFile::default();
    let mut current: Option<ChangeSet> = None;
    let mut seen_root = false;
    let mut buf = Vec::new();

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                handle_element(&e, false, &mut file, &mut current, &mut seen_root)?
            }
            Ok(Event::Empty(e)) => {
                handle_element(&e, true, &mut file, &mut current, &mut seen_root)?
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"changeset" {
                    finish(&mut file, &mut current);
                }
            }
            Ok(_) => {}
            Err(e) => {
                if seen_root {
                    tracing::debug!(error = %e, "tolerating truncated changeset trailer");
                    current = None;
                    break;
                }
                return Err(UnderpassError::MalformedInput(format!(
                    "changeset parse failed before any content: {e}"
                )));
            }
        }
        buf.clear();
    }

    if !seen_root {
        return Err(UnderpassError::MalformedInput(
            "not a changeset document".to_string(),
        ));
    }

    finish(&mut file, &mut current);
    Ok(file)
}

fn finish(file: &mut ChangeSetFile, current: &mut Option<ChangeSet>) {
    if let Some(cs) = current.take() {
        if let Some(closed) = cs.closed_at {
            if file.last_closed_at.map(|cur| closed > cur).unwrap_or(true) {
                file.last_closed_at = Some(closed);
            }
        }
        file.changes.push(cs);
    }
}

fn handle_element(
    e: &BytesStart<'_>,
    is_empty: bool,
    file: &mut ChangeSetFile,
    current: &mut Option<ChangeSet>,
    seen_root: &mut bool,
) -> Result<()> {
    match e.name().as_ref() {
        b"osm" => {
            *seen_root = true;
        }
        b"changeset" => {
            finish(file, current);
            let mut cs = ChangeSet::default();
            for attr in e.attributes().flatten() {
                let value = attr
                    .unescape_value()
                    .map_err(|e| {
                        UnderpassError::MalformedInput(format!("bad attribute value: {e}"))
                    })?
                    .into_owned();
                match attr.key.as_ref() {
                    b"id" => cs.id = parse_num(&value)?,
                    b"created_at" => cs.created_at = Some(parse_osm_timestamp(&value)?),
                    b"closed_at" => cs.closed_at = Some(parse_osm_timestamp(&value)?),
                    b"open" => cs.open = value == "true",
                    b"user" => cs.user = crate::osm::changeset::fix_string(&value),
                    b"uid" => cs.uid = parse_num(&value)?,
                    b"min_lon" => cs.min_lon = parse_num(&value)?,
                    b"min_lat" => cs.min_lat = parse_num(&value)?,
                    b"max_lon" => cs.max_lon = parse_num(&value)?,
                    b"max_lat" => cs.max_lat = parse_num(&value)?,
                    b"num_changes" => cs.num_changes = parse_num(&value)?,
                    _ => {}
                }
            }
            if is_empty {
                *current = Some(cs);
                finish(file, current);
            } else {
                *current = Some(cs);
            }
        }
        b"tag" => {
            let (mut key, mut value) = (None, None);
            for attr in e.attributes().flatten() {
                let v = attr
                    .unescape_value()
                    .map_err(|e| {
                        UnderpassError::MalformedInput(format!("bad attribute value: {e}"))
                    })?
                    .into_owned();
                match attr.key.as_ref() {
                    b"k" => key = Some(v),
                    b"v" => value = Some(v),
                    _ => {}
                }
            }
            if let (Some(cs), Some(key), Some(value)) = (current.as_mut(), key, value) {
                match key.as_str() {
                    "comment" => cs.add_comment(&value),
                    "created_by" => cs.add_editor(&value),
                    "source" => cs.source = crate::osm::changeset::fix_string(&value),
                    "hashtags" => cs.add_hashtags(&value),
                    _ => {}
                }
                cs.tags.insert(key, value);
            }
        }
        other => {
            tracing::debug!(
                element = %String::from_utf8_lossy(other),
                "skipping unknown changeset element"
            );
        }
    }
    Ok(())
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| UnderpassError::MalformedInput(format!("bad number '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CHANGESETS: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="planet-dump-ng">
  <changeset id="93309184" created_at="2020-10-30T20:10:00Z" closed_at="2020-10-30T20:20:00Z"
             open="false" user="bar" uid="3333333" min_lat="45.42" min_lon="10.97"
             max_lat="45.44" max_lon="10.99" num_changes="12" comments_count="0">
    <tag k="comment" v="Adding cafes #missingmaps"/>
    <tag k="created_by" v="JOSM/1.5 (17428 en)"/>
    <tag k="source" v="Bing"/>
    <tag k="hashtags" v="#missingmaps;#hotosm-project-9"/>
  </changeset>
  <changeset id="93309185" created_at="2020-10-30T20:15:00Z" open="true"
             user="baz" uid="444" min_lat="1.0" min_lon="2.0" max_lat="1.1" max_lon="2.1" num_changes="1"/>
</osm>"##;

    #[test]
    fn test_parse_changesets() {
        let file = parse_changesets(Cursor::new(CHANGESETS)).unwrap();
        assert_eq!(file.changes.len(), 2);

        let cs = &file.changes[0];
        assert_eq!(cs.id, 93309184);
        assert!(!cs.open);
        assert_eq!(cs.user, "bar");
        assert_eq!(cs.editor, "JOSM/1.5 (17428 en)");
        assert_eq!(cs.source, "Bing");
        assert_eq!(cs.comment, "Adding cafes #missingmaps");
        // Hashtags from the hashtags tag plus the comment, deduplicated.
        assert_eq!(cs.hashtags, vec!["missingmaps", "hotosm-project-9"]);
        assert_eq!(cs.num_changes, 12);

        let open = &file.changes[1];
        assert!(open.open);
        assert!(open.closed_at.is_none());

        assert_eq!(
            file.last_closed_at.unwrap(),
            parse_osm_timestamp("2020-10-30T20:20:00Z").unwrap()
        );
    }

    #[test]
    fn test_truncated_changeset_file() {
        let truncated = r#"<osm version="0.6">
  <changeset id="1" created_at="2020-01-01T00:00:00Z" closed_at="2020-01-01T00:01:00Z" open="false" user="a" uid="1" min_lat="0" min_lon="0" max_lat="1" max_lon="1" num_changes="1"/>
  <changeset id="2" created_at="2020-01-01T00:02:00Z" closed"#;
        let file = parse_changesets(Cursor::new(truncated)).unwrap();
        assert_eq!(file.changes.len(), 1);
        assert_eq!(file.changes[0].id, 1);
    }

    #[test]
    fn test_not_a_changeset_document() {
        assert!(parse_changesets(Cursor::new("plain text")).is_err());
    }
}
