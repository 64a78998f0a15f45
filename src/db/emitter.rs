//! SQL emitter
//!
//! Renders parameterised upserts for nodes, ways, relations, changesets,
//! statistics and validation results. Every object is written in its own
//! short transaction; a failure rolls back that object only and the batch
//! continues, but three consecutive failures escalate the whole file.
//!
//! Geometry handling follows the replication model: the metadata upsert is
//! the "middle" write, the geometry columns are fully rewritten from the
//! resolved coordinates, and editing a node cascades into the linestrings,
//! polygons and relation geometries that reference it.

use crate::db::client::PgClient;
use crate::domain::{Result, UnderpassError};
use crate::osm::objects::{
    z_index, ChangeAction, OsmNode, OsmRelation, OsmType, OsmWay, Tags,
};
use crate::osm::ChangeSet;
use crate::parser::FileBatch;
use crate::stats::ChangeStats;
use crate::validation::ValidateStatus;
use deadpool_postgres::Object;
use geo_types::{LineString, Polygon};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_postgres::Transaction;

/// Coordinate scale for the fixed-point lon/lat columns
const COORD_SCALE: f64 = 10_000_000.0;

/// How many consecutive per-object failures fail the file
const MAX_CONSECUTIVE_FAILURES: usize = 3;

/// Counters for one emitted batch
#[derive(Debug, Default, Clone)]
pub struct EmitSummary {
    /// Nodes upserted
    pub nodes: usize,
    /// Ways upserted
    pub ways: usize,
    /// Relations upserted
    pub relations: usize,
    /// Objects removed
    pub removed: usize,
    /// Objects skipped after a rolled-back transaction
    pub failures: usize,
}

impl EmitSummary {
    /// Total objects written
    pub fn written(&self) -> usize {
        self.nodes + self.ways + self.relations + self.removed
    }
}

/// The SQL emitter
pub struct Emitter {
    client: Arc<PgClient>,
    schema: String,
}

impl Emitter {
    /// Create an emitter writing into the client's schema
    pub fn new(client: Arc<PgClient>) -> Self {
        let schema = client.schema().to_string();
        Self { client, schema }
    }

    /// Emit every object of a file batch, atomically per object
    ///
    /// # Errors
    ///
    /// Returns an `Emit` error only after three consecutive object
    /// failures; individual failures are logged and counted.
    pub async fn emit_batch(&self, batch: &FileBatch) -> Result<EmitSummary> {
        let mut summary = EmitSummary::default();
        let mut consecutive = 0usize;

        for change in &batch.changes {
            for node in &change.nodes {
                let outcome = match node.action {
                    ChangeAction::Remove => self.remove_node(node).await,
                    _ => self.upsert_node(node).await,
                };
                self.track(
                    outcome,
                    "node",
                    node.id,
                    node.action,
                    &mut summary,
                    &mut consecutive,
                )?;
            }
            for way in &change.ways {
                let outcome = match way.action {
                    ChangeAction::Remove => self.remove_way(way).await,
                    _ => self.upsert_way(way).await,
                };
                self.track(
                    outcome,
                    "way",
                    way.id,
                    way.action,
                    &mut summary,
                    &mut consecutive,
                )?;
            }
            for relation in &change.relations {
                let outcome = match relation.action {
                    ChangeAction::Remove => self.remove_relation(relation).await,
                    _ => self.upsert_relation(relation).await,
                };
                self.track(
                    outcome,
                    "relation",
                    relation.id,
                    relation.action,
                    &mut summary,
                    &mut consecutive,
                )?;
            }
        }

        Ok(summary)
    }

    fn track(
        &self,
        outcome: Result<()>,
        which: &str,
        id: i64,
        action: ChangeAction,
        summary: &mut EmitSummary,
        consecutive: &mut usize,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                *consecutive = 0;
                match (which, action) {
                    (_, ChangeAction::Remove) => summary.removed += 1,
                    ("node", _) => summary.nodes += 1,
                    ("way", _) => summary.ways += 1,
                    _ => summary.relations += 1,
                }
                Ok(())
            }
            Err(e) => {
                summary.failures += 1;
                *consecutive += 1;
                tracing::error!(kind = which, id, error = %e, "emit failed, object skipped");
                if *consecutive >= MAX_CONSECUTIVE_FAILURES {
                    return Err(UnderpassError::Emit {
                        which: which.to_string(),
                        cause: format!("{} consecutive emit failures", *consecutive),
                    });
                }
                Ok(())
            }
        }
    }

    async fn connection(&self) -> Result<Object> {
        self.client.get_connection().await
    }

    fn emit_error(which: &str, e: impl std::fmt::Display) -> UnderpassError {
        UnderpassError::Emit {
            which: which.to_string(),
            cause: e.to_string(),
        }
    }

    /// Upsert one node and cascade into dependent geometries
    pub async fn upsert_node(&self, node: &OsmNode) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("node", e))?;

        let sql = format!(
            "INSERT INTO {s}.nodes \
               (id, version, user_id, username, tstamp, changeset_id, lon, lat, tags, geom) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::hstore, \
                     ST_SetSRID(ST_MakePoint($10, $11), 4326)) \
             ON CONFLICT (id) DO UPDATE SET \
               version = EXCLUDED.version, user_id = EXCLUDED.user_id, \
               username = EXCLUDED.username, tstamp = EXCLUDED.tstamp, \
               changeset_id = EXCLUDED.changeset_id, lon = EXCLUDED.lon, \
               lat = EXCLUDED.lat, tags = EXCLUDED.tags, geom = EXCLUDED.geom \
             WHERE {s}.nodes.version <= EXCLUDED.version",
            s = self.schema
        );

        let lon_fixed = (node.point.x() * COORD_SCALE).round() as i64;
        let lat_fixed = (node.point.y() * COORD_SCALE).round() as i64;
        let tags_literal = hstore_literal(&node.tags);

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(
                &sql,
                &[
                    &node.id,
                    &node.version,
                    &node.uid,
                    &node.user,
                    &node.timestamp,
                    &node.change_id,
                    &lon_fixed,
                    &lat_fixed,
                    &tags_literal,
                    &node.point.x(),
                    &node.point.y(),
                ],
            )
            .await?;
            self.cascade_node_change(&tx, node.id).await?;
            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("node", e))
    }

    /// Re-compute the geometry of every way and relation that references a
    /// changed node
    async fn cascade_node_change(
        &self,
        tx: &Transaction<'_>,
        node_id: i64,
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let rebuild_ways = format!(
            "UPDATE {s}.ways w SET linestring = (\
               SELECT ST_MakeLine(ARRAY(\
                 SELECT n.geom FROM {s}.nodes n \
                 JOIN UNNEST(w.refs) WITH ORDINALITY t(id, ord) ON n.id = t.id \
                 ORDER BY t.ord)))\
             WHERE $1 = ANY(w.refs) RETURNING w.id",
            s = self.schema
        );
        let touched: Vec<i64> = tx
            .query(&rebuild_ways, &[&node_id])
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        if touched.is_empty() {
            return Ok(());
        }

        let rebuild_polygons = format!(
            "UPDATE {s}.ways SET \
               polygon = ST_MakePolygon(linestring), \
               way_area = ST_Area(ST_MakePolygon(linestring)) \
             WHERE id = ANY($1) AND polygon IS NOT NULL \
               AND linestring IS NOT NULL AND ST_IsClosed(linestring)",
            s = self.schema
        );
        tx.execute(&rebuild_polygons, &[&touched]).await?;

        self.refresh_relations_for_ways(tx, &touched).await
    }

    /// Upsert one way: metadata, geometry rewrite, relation refresh
    pub async fn upsert_way(&self, way: &OsmWay) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("way", e))?;

        let (z_order, is_road) = z_index(&way.tags);
        let tags_literal = hstore_literal(&way.tags);

        let middle_sql = format!(
            "INSERT INTO {s}.ways \
               (id, version, user_id, username, tstamp, changeset_id, refs, tags, is_road, z_order) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8::hstore, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET \
               version = EXCLUDED.version, user_id = EXCLUDED.user_id, \
               username = EXCLUDED.username, tstamp = EXCLUDED.tstamp, \
               changeset_id = EXCLUDED.changeset_id, refs = EXCLUDED.refs, \
               tags = EXCLUDED.tags, is_road = EXCLUDED.is_road, \
               z_order = EXCLUDED.z_order \
             WHERE {s}.ways.version <= EXCLUDED.version",
            s = self.schema
        );

        // Tags can mark a possible polygon on an open way; that is stored as
        // a linestring.
        if way.is_polygon && !way.is_closed() {
            tracing::debug!(
                way = way.id,
                "way is tagged as a possible polygon but it isn't closed, storing as linestring"
            );
        }

        let linestring_wkt = (way.num_points() > 0).then(|| wkt_linestring(&way.linestring));
        let polygon_wkt = way.polygon.as_ref().map(wkt_polygon);

        let geometry_sql = format!(
            "UPDATE {s}.ways SET \
               linestring = CASE WHEN $2::text IS NULL THEN NULL \
                                 ELSE ST_GeomFromText($2, 4326) END, \
               polygon = CASE WHEN $3::text IS NULL THEN NULL \
                              ELSE ST_GeomFromText($3, 4326) END, \
               way_area = CASE WHEN $3::text IS NULL THEN NULL \
                               ELSE ST_Area(ST_GeomFromText($3, 4326)) END \
             WHERE id = $1 AND version = $4",
            s = self.schema
        );

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(
                &middle_sql,
                &[
                    &way.id,
                    &way.version,
                    &way.uid,
                    &way.user,
                    &way.timestamp,
                    &way.change_id,
                    &way.refs,
                    &tags_literal,
                    &is_road,
                    &z_order,
                ],
            )
            .await?;
            tx.execute(
                &geometry_sql,
                &[&way.id, &linestring_wkt, &polygon_wkt, &way.version],
            )
            .await?;
            self.refresh_relations_for_ways(&tx, &[way.id]).await?;
            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("way", e))
    }

    /// Upsert one relation and assemble its geometry
    pub async fn upsert_relation(&self, relation: &OsmRelation) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("relation", e))?;

        // The parts array stores node members first, then ways, then
        // relations; members interleaves refs and roles.
        let mut ordered: Vec<&crate::osm::OsmRelationMember> = Vec::new();
        for kind in [OsmType::Node, OsmType::Way, OsmType::Relation] {
            ordered.extend(relation.members.iter().filter(|m| m.member_type == kind));
        }
        let way_off = relation
            .members
            .iter()
            .filter(|m| m.member_type == OsmType::Node)
            .count() as i16;
        let rel_off = way_off
            + relation
                .members
                .iter()
                .filter(|m| m.member_type == OsmType::Way)
                .count() as i16;

        let parts: Vec<i64> = ordered.iter().map(|m| m.ref_id).collect();
        let members: Vec<String> = ordered
            .iter()
            .flat_map(|m| {
                let prefix = match m.member_type {
                    OsmType::Node => 'n',
                    OsmType::Way => 'w',
                    OsmType::Relation => 'r',
                };
                [format!("{prefix}{}", m.ref_id), m.role.clone()]
            })
            .collect();

        let tags_literal = hstore_literal(&relation.tags);

        let middle_sql = format!(
            "INSERT INTO {s}.relations \
               (id, version, user_id, username, tstamp, changeset_id, \
                way_off, rel_off, parts, members, tags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::hstore) \
             ON CONFLICT (id) DO UPDATE SET \
               version = EXCLUDED.version, user_id = EXCLUDED.user_id, \
               username = EXCLUDED.username, tstamp = EXCLUDED.tstamp, \
               changeset_id = EXCLUDED.changeset_id, way_off = EXCLUDED.way_off, \
               rel_off = EXCLUDED.rel_off, parts = EXCLUDED.parts, \
               members = EXCLUDED.members, tags = EXCLUDED.tags \
             WHERE {s}.relations.version <= EXCLUDED.version",
            s = self.schema
        );

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(
                &middle_sql,
                &[
                    &relation.id,
                    &relation.version,
                    &relation.uid,
                    &relation.user,
                    &relation.timestamp,
                    &relation.change_id,
                    &way_off,
                    &rel_off,
                    &parts,
                    &members,
                    &tags_literal,
                ],
            )
            .await?;

            if relation.is_multipolygon() {
                let way_members: Vec<(i64, String)> = relation
                    .way_members()
                    .map(|m| (m.ref_id, m.role.clone()))
                    .collect();
                let groups = parse_polygon_groups(&way_members);
                if groups.is_empty() {
                    tracing::warn!(
                        relation = relation.id,
                        "multipolygon relation has no complete polygon, skipping geometry"
                    );
                } else {
                    let sql = self.multipolygon_update_sql(relation.id, &groups);
                    tx.batch_execute(&sql).await?;
                }
            } else if relation.is_multilinestring() {
                let sql = self.multilinestring_update_sql();
                tx.execute(&sql, &[&relation.id]).await?;
            }

            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("relation", e))
    }

    /// Build the geometry update for a multipolygon relation
    ///
    /// Each polygon is assembled database-side: the outer ring from the
    /// member way's linestring, the inner rings from the exterior rings of
    /// the member ways' existing polygons.
    fn multipolygon_update_sql(&self, relation_id: i64, groups: &[PolygonGroup]) -> String {
        let mut parts_sql = String::new();
        for group in groups {
            if !parts_sql.is_empty() {
                parts_sql.push_str(", ");
            }
            if group.inners.is_empty() {
                let _ = write!(
                    parts_sql,
                    "(SELECT ST_MakePolygon(w.linestring) FROM {s}.ways w \
                     WHERE w.id = {outer} AND ST_IsClosed(w.linestring))",
                    s = self.schema,
                    outer = group.outer
                );
            } else {
                let inners = group
                    .inners
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = write!(
                    parts_sql,
                    "(SELECT ST_MakePolygon(w.linestring, ARRAY(\
                       SELECT ST_ExteriorRing(p.polygon) FROM {s}.ways p \
                       WHERE p.id IN ({inners}) AND p.polygon IS NOT NULL)) \
                     FROM {s}.ways w WHERE w.id = {outer} AND ST_IsClosed(w.linestring))",
                    s = self.schema,
                    outer = group.outer
                );
            }
        }
        format!(
            "UPDATE {s}.relations SET geom = ST_Multi(ST_Collect(ARRAY[{parts_sql}])) \
             WHERE id = {relation_id};",
            s = self.schema
        )
    }

    /// Geometry update for a multilinestring relation, preserving member
    /// order
    fn multilinestring_update_sql(&self) -> String {
        format!(
            "UPDATE {s}.relations r SET geom = (\
               SELECT ST_Multi(ST_Collect(ARRAY(\
                 SELECT w.linestring FROM {s}.ways w \
                 JOIN UNNEST(r.parts) WITH ORDINALITY t(id, ord) ON w.id = t.id \
                 WHERE w.linestring IS NOT NULL \
                 ORDER BY t.ord)))) \
             WHERE r.id = $1",
            s = self.schema
        )
    }

    /// Refresh the geometry of relations whose member ways changed
    async fn refresh_relations_for_ways(
        &self,
        tx: &Transaction<'_>,
        way_ids: &[i64],
    ) -> std::result::Result<(), tokio_postgres::Error> {
        let way_ids = way_ids.to_vec();

        // Multilinestrings rebuild entirely in SQL.
        let mls_sql = format!(
            "UPDATE {s}.relations r SET geom = (\
               SELECT ST_Multi(ST_Collect(ARRAY(\
                 SELECT w.linestring FROM {s}.ways w \
                 JOIN UNNEST(r.parts) WITH ORDINALITY t(id, ord) ON w.id = t.id \
                 WHERE w.linestring IS NOT NULL \
                 ORDER BY t.ord)))) \
             WHERE r.parts && $1 AND r.tags -> 'type' = 'multilinestring'",
            s = self.schema
        );
        tx.execute(&mls_sql, &[&way_ids]).await?;

        // Multipolygons need the member roles, which live in the members
        // array; parse them and rebuild per relation.
        let rels_sql = format!(
            "SELECT id, parts, members FROM {s}.relations \
             WHERE parts && $1 AND tags -> 'type' = 'multipolygon'",
            s = self.schema
        );
        let rows = tx.query(&rels_sql, &[&way_ids]).await?;

        for row in rows {
            let rel_id: i64 = row.get(0);
            let parts: Vec<i64> = row.get(1);
            let members: Vec<String> = row.get(2);

            match way_members_from_row(&parts, &members) {
                Some(way_members) => {
                    let groups = parse_polygon_groups(&way_members);
                    if groups.is_empty() {
                        tracing::warn!(
                            relation = rel_id,
                            "multipolygon relation has no complete polygon, skipping refresh"
                        );
                        continue;
                    }
                    let sql = self.multipolygon_update_sql(rel_id, &groups);
                    tx.batch_execute(&sql).await?;
                }
                None => {
                    // The correct handling of the mismatch is undefined;
                    // report it and leave the stored geometry alone.
                    tracing::warn!(
                        relation = rel_id,
                        parts = parts.len(),
                        members = members.len(),
                        "size mismatch between parts and members, skipping refresh"
                    );
                }
            }
        }

        Ok(())
    }

    /// Delete a node
    pub async fn remove_node(&self, node: &OsmNode) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("node", e))?;

        let sql = format!("DELETE FROM {s}.nodes WHERE id = $1", s = self.schema);

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(&sql, &[&node.id]).await?;
            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("node", e))
    }

    /// Way removal is recorded but does not cascade
    pub async fn remove_way(&self, way: &OsmWay) -> Result<()> {
        tracing::debug!(way = way.id, "way removal recorded, geometry left in place");
        Ok(())
    }

    /// Relation removal drops the assembled geometry but keeps the row
    pub async fn remove_relation(&self, relation: &OsmRelation) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("relation", e))?;

        let sql = format!(
            "UPDATE {s}.relations SET geom = NULL WHERE id = $1",
            s = self.schema
        );

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(&sql, &[&relation.id]).await?;
            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("relation", e))
    }

    /// Persist a changeset with its user, hashtags and bounding box
    pub async fn apply_changeset(&self, cs: &ChangeSet) -> Result<()> {
        let mut conn = self.connection().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| Self::emit_error("changeset", e))?;

        let user_sql = format!(
            "INSERT INTO {s}.users (id, username) VALUES ($1, $2) \
             ON CONFLICT (id) DO NOTHING",
            s = self.schema
        );
        let changeset_sql = format!(
            "INSERT INTO {s}.changesets \
               (id, editor, user_id, created_at, closed_at, comment, source, hashtags, bbox, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                     ST_MakeEnvelope($9, $10, $11, $12, 4326), now()) \
             ON CONFLICT (id) DO UPDATE SET \
               editor = EXCLUDED.editor, user_id = EXCLUDED.user_id, \
               created_at = EXCLUDED.created_at, closed_at = EXCLUDED.closed_at, \
               comment = EXCLUDED.comment, source = EXCLUDED.source, \
               hashtags = EXCLUDED.hashtags, bbox = EXCLUDED.bbox, updated_at = now()",
            s = self.schema
        );
        let hashtag_sql = format!(
            "INSERT INTO {s}.hashtags (hashtag) VALUES ($1) \
             ON CONFLICT (hashtag) DO NOTHING",
            s = self.schema
        );
        let hashtag_id_sql = format!(
            "SELECT id FROM {s}.hashtags WHERE hashtag = $1",
            s = self.schema
        );
        let join_sql = format!(
            "INSERT INTO {s}.changesets_hashtags (changeset_id, hashtag_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
            s = self.schema
        );

        // An open changeset has no closed_at yet; the row is completed when
        // the close arrives on a later file.
        let closed_at = if cs.open { None } else { cs.closed_at };

        let result: std::result::Result<(), tokio_postgres::Error> = async {
            tx.execute(&user_sql, &[&cs.uid, &cs.user]).await?;
            tx.execute(
                &changeset_sql,
                &[
                    &cs.id,
                    &cs.editor,
                    &cs.uid,
                    &cs.created_at,
                    &closed_at,
                    &cs.comment,
                    &cs.source,
                    &cs.hashtags,
                    &cs.min_lon,
                    &cs.min_lat,
                    &cs.max_lon,
                    &cs.max_lat,
                ],
            )
            .await?;

            for hashtag in &cs.hashtags {
                tx.execute(&hashtag_sql, &[hashtag]).await?;
                let row = tx.query_one(&hashtag_id_sql, &[hashtag]).await?;
                let hashtag_id: i64 = row.get(0);
                tx.execute(&join_sql, &[&cs.id, &hashtag_id]).await?;
            }

            tx.commit().await
        }
        .await;

        result.map_err(|e| Self::emit_error("changeset", e))
    }

    /// Upsert the statistics rows for one file batch
    pub async fn apply_stats(&self, stats: &BTreeMap<i64, ChangeStats>) -> Result<()> {
        let conn = self.connection().await?;
        let sql = format!(
            "INSERT INTO {s}.changestats \
               (change_id, user_id, username, closed_at, added, modified, updated_at) \
             VALUES ($1, $2, $3, $4, $5::hstore, $6::hstore, now()) \
             ON CONFLICT (change_id) DO UPDATE SET \
               user_id = EXCLUDED.user_id, username = EXCLUDED.username, \
               closed_at = EXCLUDED.closed_at, added = EXCLUDED.added, \
               modified = EXCLUDED.modified, updated_at = now()",
            s = self.schema
        );

        for entry in stats.values() {
            let added = counters_literal(&entry.added, &entry.added_km);
            let modified = counters_literal(&entry.modified, &BTreeMap::new());
            conn.execute(
                &sql,
                &[
                    &entry.change_id,
                    &entry.user_id,
                    &entry.username,
                    &entry.closed_at,
                    &added,
                    &modified,
                ],
            )
            .await
            .map_err(|e| Self::emit_error("changestats", e))?;
        }
        Ok(())
    }

    /// Replace the validation findings for the checked objects
    pub async fn apply_validation(&self, statuses: &[ValidateStatus]) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let delete_sql = format!(
            "DELETE FROM {s}.validation WHERE osm_id = $1 AND source = $2",
            s = self.schema
        );
        let insert_sql = format!(
            "INSERT INTO {s}.validation \
               (osm_id, change_id, osm_type, status, source, timestamp, geom) \
             VALUES ($1, $2, $3, $4, $5, $6, \
                     CASE WHEN $7::float8 IS NULL THEN NULL \
                          ELSE ST_SetSRID(ST_MakePoint($7, $8), 4326) END)",
            s = self.schema
        );

        for status in statuses {
            let tx = conn
                .transaction()
                .await
                .map_err(|e| Self::emit_error("validation", e))?;
            let flags: Vec<String> = status.status.iter().map(|k| k.to_string()).collect();
            let lon = status.location.map(|p| p.x());
            let lat = status.location.map(|p| p.y());

            let result: std::result::Result<(), tokio_postgres::Error> = async {
                tx.execute(&delete_sql, &[&status.osm_id, &status.source])
                    .await?;
                tx.execute(
                    &insert_sql,
                    &[
                        &status.osm_id,
                        &status.change_id,
                        &status.osm_type.as_str(),
                        &flags,
                        &status.source,
                        &status.timestamp,
                        &lon,
                        &lat,
                    ],
                )
                .await?;
                tx.commit().await
            }
            .await;

            result.map_err(|e| Self::emit_error("validation", e))?;
        }
        Ok(())
    }
}

/// One assembled polygon of a multipolygon relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolygonGroup {
    /// Way providing the outer ring
    pub outer: i64,
    /// Ways providing inner rings
    pub inners: Vec<i64>,
}

/// Group way members into polygons by role
///
/// Inner rings are sometimes listed before their outer ring; in that case a
/// polygon is opened without an outer and completed by the next `outer`
/// member. A group that never receives an outer ring is invalid and is
/// dropped with a warning.
pub fn parse_polygon_groups(way_members: &[(i64, String)]) -> Vec<PolygonGroup> {
    struct Open {
        outer: Option<i64>,
        inners: Vec<i64>,
    }

    let mut open: Vec<Open> = Vec::new();
    for (ref_id, role) in way_members {
        match role.as_str() {
            "inner" => {
                if open.is_empty() {
                    open.push(Open {
                        outer: None,
                        inners: Vec::new(),
                    });
                }
                open.last_mut().expect("group exists").inners.push(*ref_id);
            }
            "outer" => {
                if let Some(last) = open.last_mut() {
                    if last.outer.is_none() {
                        last.outer = Some(*ref_id);
                        continue;
                    }
                }
                open.push(Open {
                    outer: Some(*ref_id),
                    inners: Vec::new(),
                });
            }
            _ => {}
        }
    }

    open.into_iter()
        .filter_map(|group| match group.outer {
            Some(outer) => Some(PolygonGroup {
                outer,
                inners: group.inners,
            }),
            None => {
                tracing::warn!("a polygon with no outer ring is invalid, skipping");
                None
            }
        })
        .collect()
}

/// Recover (way id, role) pairs from the stored parts/members arrays
///
/// Returns `None` on a size mismatch between the two arrays.
fn way_members_from_row(parts: &[i64], members: &[String]) -> Option<Vec<(i64, String)>> {
    if members.len() != 2 * parts.len() {
        return None;
    }
    Some(
        parts
            .iter()
            .zip(members.chunks(2))
            .filter(|(_, pair)| pair[0].starts_with('w'))
            .map(|(part, pair)| (*part, pair[1].clone()))
            .collect(),
    )
}

/// Escape a string for use inside an hstore or array literal
///
/// Double quotes and backslashes are prefixed with a backslash.
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render tags as an hstore literal; empty values are dropped
pub fn hstore_literal(tags: &Tags) -> String {
    let mut out = String::new();
    for (key, value) in tags {
        if value.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(
            out,
            "\"{}\" => \"{}\"",
            escape_literal(key),
            escape_literal(value)
        );
    }
    out
}

/// Render count and kilometre maps into a single hstore literal
fn counters_literal(counts: &BTreeMap<String, i64>, kms: &BTreeMap<String, f64>) -> String {
    let mut out = String::new();
    for (key, value) in counts {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(out, "\"{}\" => \"{value}\"", escape_literal(key));
    }
    for (key, value) in kms {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(out, "\"{}\" => \"{value:.6}\"", escape_literal(key));
    }
    out
}

/// Render a linestring as WKT
pub fn wkt_linestring(linestring: &LineString<f64>) -> String {
    let mut out = String::from("LINESTRING(");
    for (i, coord) in linestring.0.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{} {}", coord.x, coord.y);
    }
    out.push(')');
    out
}

/// Render a polygon exterior as WKT
pub fn wkt_polygon(polygon: &Polygon<f64>) -> String {
    let mut out = String::from("POLYGON((");
    for (i, coord) in polygon.exterior().0.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{} {}", coord.x, coord.y);
    }
    out.push_str("))");
    out
}
