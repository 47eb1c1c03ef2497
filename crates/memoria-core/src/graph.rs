//! Knowledge graph store (spec §4.6).
//!
//! Entities dedupe by `(type, lower(name))`; edges dedupe by
//! `(source_id, target_id, relation)` with additive weight accumulation
//! clamped to a ceiling. Traversal is iterative BFS — never recursion — with
//! a visited-set to guarantee termination on cyclic graphs.

use crate::error::GraphError;
use crate::ledger::Ledger;
use crate::tenant::TenantHandle;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// Edge weight ceiling: repeated reinforcement of the same relation
/// saturates rather than growing unbounded.
pub const MAX_EDGE_WEIGHT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: i64,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    pub properties: serde_json::Value,
    pub confidence: f64,
    pub mention_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub id: i64,
    pub source_id: i64,
    pub target_id: i64,
    pub relation: String,
    pub weight: f64,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub entity_count: i64,
    pub edge_count: i64,
    pub distinct_relations: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Centrality {
    pub degree: i64,
    pub weighted_degree: f64,
    pub betweenness: f64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct GraphStore;

impl GraphStore {
    /// Creates an entity, or returns the existing one for `(type, lower(name))`,
    /// bumping its mention count and `last_seen_ms`.
    pub fn create_entity(
        handle: &TenantHandle,
        entity_type: &str,
        name: &str,
        properties: serde_json::Value,
    ) -> Result<Entity, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let lower_name = name.to_lowercase();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM entities WHERE type = ?1 AND lower_name = ?2 AND deleted_at_ms IS NULL",
                params![entity_type, lower_name],
                |r| r.get(0),
            )
            .optional()?;

        let ts = now_ms();
        if let Some(id) = existing {
            conn.execute(
                "UPDATE entities SET mention_count = mention_count + 1, last_seen_ms = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
            return Self::get_entity(handle, id);
        }

        conn.execute(
            "INSERT INTO entities (type, name, lower_name, properties, confidence, mention_count, first_seen_ms, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, 0.5, 1, ?5, ?5)",
            params![entity_type, name, lower_name, properties.to_string(), ts],
        )?;
        let id = conn.last_insert_rowid();
        Self::get_entity(handle, id)
    }

    pub fn get_entity(handle: &TenantHandle, id: i64) -> Result<Entity, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_entity_conn(&conn, id)
    }

    fn get_entity_conn(conn: &rusqlite::Connection, id: i64) -> Result<Entity, GraphError> {
        conn.query_row(
            "SELECT id, type, name, properties, confidence, mention_count FROM entities
             WHERE id = ?1 AND deleted_at_ms IS NULL",
            params![id],
            row_to_entity,
        )
        .optional()?
        .ok_or(GraphError::EntityNotFound(id))
    }

    /// Deep-merges `properties` into the entity's existing properties
    /// (nested objects merge field-wise, non-object values and arrays are
    /// replaced wholesale), matching the profile merge semantics elsewhere
    /// in this crate.
    pub fn update_entity(
        handle: &TenantHandle,
        id: i64,
        properties: serde_json::Value,
    ) -> Result<Entity, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let current = Self::get_entity_conn(&conn, id)?;
        let merged = crate::profile::deep_merge(current.properties, properties);
        let ts = now_ms();
        conn.execute(
            "UPDATE entities SET properties = ?1, last_seen_ms = ?2 WHERE id = ?3",
            params![merged.to_string(), ts, id],
        )?;
        Self::get_entity_conn(&conn, id)
    }

    /// Soft-deletes an entity. Any `memory_meta` row registered under a
    /// `source_ref` of the form `entity:{id}` is flipped to `rejected` so
    /// the ledger reflects the retraction.
    pub fn delete_entity(handle: &TenantHandle, id: i64) -> Result<(), GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_entity_conn(&conn, id)?;
        let ts = now_ms();
        conn.execute("UPDATE entities SET deleted_at_ms = ?1 WHERE id = ?2", params![ts, id])?;

        let source_ref = format!("entity:{id}");
        let meta_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM memory_meta WHERE source_ref = ?1",
                params![source_ref],
                |r| r.get(0),
            )
            .optional()?;
        drop(conn);
        if let Some(meta_id) = meta_id {
            let _ = reject_meta(handle, meta_id);
        }
        Ok(())
    }

    /// Lists entities, optionally filtered by `entity_type` and a
    /// `[min_confidence, max_confidence]` band, ordered by confidence DESC
    /// then name ASC, paginated by `limit`/`offset`.
    pub fn list_entities(
        handle: &TenantHandle,
        entity_type: Option<&str>,
        min_confidence: Option<f64>,
        max_confidence: Option<f64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entity>, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id, type, name, properties, confidence, mention_count FROM entities
             WHERE deleted_at_ms IS NULL
             AND (?1 IS NULL OR type = ?1)
             AND (?2 IS NULL OR confidence >= ?2)
             AND (?3 IS NULL OR confidence <= ?3)
             ORDER BY confidence DESC, name ASC
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt
            .query_map(params![entity_type, min_confidence, max_confidence, limit, offset], row_to_entity)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Creates an edge, or reinforces the existing one for the same
    /// `(source, target, relation)` triple: weight accumulates additively up
    /// to [`MAX_EDGE_WEIGHT`]. Every call — new or reinforcing — appends one
    /// evidence entry, so `evidence.len()` always equals the call count.
    pub fn create_edge(
        handle: &TenantHandle,
        source_id: i64,
        target_id: i64,
        relation: &str,
        weight: f64,
        evidence: Option<&str>,
    ) -> Result<Edge, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_entity_conn(&conn, source_id)?;
        Self::get_entity_conn(&conn, target_id)?;

        let existing: Option<(i64, f64)> = conn
            .query_row(
                "SELECT id, weight FROM edges WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3 AND deleted_at_ms IS NULL",
                params![source_id, target_id, relation],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let ts = now_ms();
        let evidence_entry = evidence.unwrap_or(relation).to_string();

        if let Some((id, current_weight)) = existing {
            let new_weight = (current_weight + weight).min(MAX_EDGE_WEIGHT);
            let evidence_json: String =
                conn.query_row("SELECT evidence FROM edges WHERE id = ?1", params![id], |r| r.get(0))?;
            let mut list: Vec<String> = serde_json::from_str(&evidence_json).unwrap_or_default();
            list.push(evidence_entry);
            conn.execute(
                "UPDATE edges SET weight = ?1, last_seen_ms = ?2, evidence = ?3 WHERE id = ?4",
                params![new_weight, ts, serde_json::to_string(&list).unwrap_or_default(), id],
            )?;
            return Self::get_edge_conn(&conn, id);
        }

        let evidence_list = vec![evidence_entry];
        conn.execute(
            "INSERT INTO edges (source_id, target_id, relation, weight, confidence, evidence, first_seen_ms, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, 0.5, ?5, ?6, ?6)",
            params![source_id, target_id, relation, weight.min(MAX_EDGE_WEIGHT), serde_json::to_string(&evidence_list).unwrap_or_default(), ts],
        )?;
        let id = conn.last_insert_rowid();
        Self::get_edge_conn(&conn, id)
    }

    pub fn get_edge(handle: &TenantHandle, id: i64) -> Result<Edge, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_edge_conn(&conn, id)
    }

    fn get_edge_conn(conn: &rusqlite::Connection, id: i64) -> Result<Edge, GraphError> {
        conn.query_row(
            "SELECT id, source_id, target_id, relation, weight, confidence, evidence FROM edges
             WHERE id = ?1 AND deleted_at_ms IS NULL",
            params![id],
            row_to_edge,
        )
        .optional()?
        .ok_or(GraphError::EdgeNotFound(id))
    }

    /// Updates an edge's relation label and/or confidence; weight is only
    /// ever changed through [`Self::create_edge`] reinforcement.
    pub fn update_edge(
        handle: &TenantHandle,
        id: i64,
        confidence: Option<f64>,
        properties: Option<serde_json::Value>,
    ) -> Result<Edge, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_edge_conn(&conn, id)?;
        let ts = now_ms();
        if let Some(c) = confidence {
            conn.execute("UPDATE edges SET confidence = ?1, last_seen_ms = ?2 WHERE id = ?3", params![c, ts, id])?;
        }
        if let Some(props) = properties {
            conn.execute(
                "UPDATE edges SET properties = ?1, last_seen_ms = ?2 WHERE id = ?3",
                params![props.to_string(), ts, id],
            )?;
        }
        Self::get_edge_conn(&conn, id)
    }

    pub fn delete_edge(handle: &TenantHandle, id: i64) -> Result<(), GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        Self::get_edge_conn(&conn, id)?;
        conn.execute("UPDATE edges SET deleted_at_ms = ?1 WHERE id = ?2", params![now_ms(), id])?;
        Ok(())
    }

    pub fn list_edges(
        handle: &TenantHandle,
        relation: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Edge>, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, relation, weight, confidence, evidence FROM edges
             WHERE deleted_at_ms IS NULL AND (?1 IS NULL OR relation = ?1)
             ORDER BY weight DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![relation, limit, offset], row_to_edge)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// One-hop neighbor listing with direction/relation/confidence-floor
    /// filters, sorted by edge weight DESC.
    pub fn get_neighbors(
        handle: &TenantHandle,
        entity_id: i64,
        direction: Direction,
        relation: Option<&str>,
        confidence_min: Option<f64>,
    ) -> Result<Vec<(Entity, Edge)>, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut out_edges = Vec::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, target_id, relation, weight, confidence, evidence FROM edges
                 WHERE source_id = ?1 AND deleted_at_ms IS NULL
                 AND (?2 IS NULL OR relation = ?2) AND (?3 IS NULL OR confidence >= ?3)
                 ORDER BY weight DESC",
            )?;
            out_edges = stmt
                .query_map(params![entity_id, relation, confidence_min], row_to_edge)?
                .collect::<Result<Vec<_>, _>>()?;
        }
        let mut in_edges = Vec::new();
        if matches!(direction, Direction::In | Direction::Both) {
            let mut stmt = conn.prepare(
                "SELECT id, source_id, target_id, relation, weight, confidence, evidence FROM edges
                 WHERE target_id = ?1 AND deleted_at_ms IS NULL
                 AND (?2 IS NULL OR relation = ?2) AND (?3 IS NULL OR confidence >= ?3)
                 ORDER BY weight DESC",
            )?;
            in_edges = stmt
                .query_map(params![entity_id, relation, confidence_min], row_to_edge)?
                .collect::<Result<Vec<_>, _>>()?;
        }

        let mut combined: Vec<Edge> = out_edges.into_iter().chain(in_edges).collect();
        combined.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));

        let mut result = Vec::with_capacity(combined.len());
        for edge in combined {
            let other_id = if edge.source_id == entity_id { edge.target_id } else { edge.source_id };
            let entity = Self::get_entity_conn(&conn, other_id)?;
            result.push((entity, edge));
        }
        Ok(result)
    }

    /// Breadth-first traversal out to `max_depth` hops from `start_id`,
    /// honoring an optional relation filter, entity-type filter, and
    /// confidence floor. Iterative (queue-based), never recursive, with a
    /// visited set so cycles terminate the search rather than looping
    /// forever. Results are capped at `limit` (default unbounded within the
    /// depth budget when `None`).
    pub fn traverse(
        handle: &TenantHandle,
        start_id: i64,
        max_depth: u32,
        relation_filter: Option<&str>,
        type_filter: Option<&str>,
        confidence_min: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut visited: HashSet<i64> = HashSet::new();
        let mut queue: VecDeque<(i64, u32)> = VecDeque::new();
        let mut result = Vec::new();

        visited.insert(start_id);
        queue.push_back((start_id, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if let Some(limit) = limit {
                if result.len() >= limit {
                    break;
                }
            }
            if depth > 0 {
                if let Ok(entity) = Self::get_entity_conn(&conn, current) {
                    let type_ok = type_filter.map(|t| entity.entity_type == t).unwrap_or(true);
                    if type_ok {
                        result.push(entity);
                    }
                }
            }
            if depth >= max_depth {
                continue;
            }
            let neighbors = Self::adjacent(&conn, current, relation_filter, confidence_min)?;
            for n in neighbors {
                if visited.insert(n) {
                    queue.push_back((n, depth + 1));
                }
            }
        }
        Ok(result)
    }

    fn adjacent(
        conn: &rusqlite::Connection,
        node: i64,
        relation_filter: Option<&str>,
        confidence_min: Option<f64>,
    ) -> Result<Vec<i64>, GraphError> {
        let mut stmt = conn.prepare(
            "SELECT target_id FROM edges WHERE source_id = ?1 AND deleted_at_ms IS NULL
             AND (?2 IS NULL OR relation = ?2) AND (?3 IS NULL OR confidence >= ?3)
             UNION
             SELECT source_id FROM edges WHERE target_id = ?1 AND deleted_at_ms IS NULL
             AND (?2 IS NULL OR relation = ?2) AND (?3 IS NULL OR confidence >= ?3)",
        )?;
        let ids = stmt
            .query_map(params![node, relation_filter, confidence_min], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Shortest path between two entities by hop count (BFS with
    /// parent-pointer reconstruction): edge weight is used only as a
    /// tie-breaker among neighbors discovered at the same BFS level, since
    /// BFS already minimizes hop count and the per-tenant graph has no
    /// negative or zero-cost edges that would call for a true weighted
    /// shortest-path algorithm. Returns `None` when no path exists within
    /// `max_depth` hops.
    pub fn path_between(
        handle: &TenantHandle,
        from_id: i64,
        to_id: i64,
        max_depth: u32,
    ) -> Result<Option<Vec<i64>>, GraphError> {
        if from_id == to_id {
            return Ok(Some(vec![from_id]));
        }
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut visited: HashSet<i64> = HashSet::new();
        let mut parent: HashMap<i64, i64> = HashMap::new();
        let mut queue: VecDeque<(i64, u32)> = VecDeque::new();

        visited.insert(from_id);
        queue.push_back((from_id, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let neighbors = Self::weighted_adjacent(&conn, current)?;
            for (n, _weight) in neighbors {
                if visited.insert(n) {
                    parent.insert(n, current);
                    if n == to_id {
                        let mut path = vec![to_id];
                        let mut cur = to_id;
                        while let Some(&p) = parent.get(&cur) {
                            path.push(p);
                            cur = p;
                        }
                        path.reverse();
                        return Ok(Some(path));
                    }
                    queue.push_back((n, depth + 1));
                }
            }
        }
        Ok(None)
    }

    /// Neighbors sorted by edge weight DESC, so `path_between`'s BFS visits
    /// the strongest relation first among same-level candidates.
    fn weighted_adjacent(conn: &rusqlite::Connection, node: i64) -> Result<Vec<(i64, f64)>, GraphError> {
        let mut stmt = conn.prepare(
            "SELECT target_id, weight FROM edges WHERE source_id = ?1 AND deleted_at_ms IS NULL
             UNION
             SELECT source_id, weight FROM edges WHERE target_id = ?1 AND deleted_at_ms IS NULL
             ORDER BY weight DESC",
        )?;
        let rows = stmt
            .query_map(params![node], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Very small fuzzy matcher used by `findByName`: scores candidates by
    /// trigram overlap against `query`, since the bundled SQLite build here
    /// has no `fts5`/trigram tokenizer enabled by default and pulling in a
    /// full-text-search dependency for single-tenant-sized tables is overkill.
    /// An exact (case-insensitive) match always sorts first.
    pub fn find_by_name(
        handle: &TenantHandle,
        query: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let mut stmt = conn.prepare(
            "SELECT id, type, name, properties, confidence, mention_count FROM entities
             WHERE deleted_at_ms IS NULL AND (?1 IS NULL OR type = ?1)",
        )?;
        let lower_query = query.to_lowercase();
        let mut candidates: Vec<(f64, Entity)> = stmt
            .query_map(params![entity_type], row_to_entity)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| {
                let score = if e.name.to_lowercase() == lower_query {
                    1.0
                } else {
                    trigram_similarity(query, &e.name)
                };
                (score, e)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    pub fn stats(handle: &TenantHandle) -> Result<GraphStats, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let entity_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM entities WHERE deleted_at_ms IS NULL", [], |r| r.get(0))?;
        let edge_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM edges WHERE deleted_at_ms IS NULL", [], |r| r.get(0))?;
        let distinct_relations: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT relation) FROM edges WHERE deleted_at_ms IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(GraphStats { entity_count, edge_count, distinct_relations })
    }

    /// Degree, weighted-degree (sum of incident edge weights), and a
    /// betweenness approximation: the fraction of other reachable-pair
    /// shortest paths (within `max_depth` hops) that pass through
    /// `entity_id`, sampled over all node pairs — bounded to the tenant's
    /// small single-user graph size, never meant for a dataset of unbounded
    /// scale.
    pub fn centrality(handle: &TenantHandle, entity_id: i64) -> Result<Centrality, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let degree: i64 = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM edges WHERE source_id = ?1 AND deleted_at_ms IS NULL) +
                (SELECT COUNT(*) FROM edges WHERE target_id = ?1 AND deleted_at_ms IS NULL)",
            params![entity_id],
            |r| r.get(0),
        )?;
        let weighted_degree: f64 = conn.query_row(
            "SELECT
                COALESCE((SELECT SUM(weight) FROM edges WHERE source_id = ?1 AND deleted_at_ms IS NULL), 0.0) +
                COALESCE((SELECT SUM(weight) FROM edges WHERE target_id = ?1 AND deleted_at_ms IS NULL), 0.0)",
            params![entity_id],
            |r| r.get(0),
        )?;

        let mut all_ids_stmt = conn.prepare("SELECT id FROM entities WHERE deleted_at_ms IS NULL")?;
        let all_ids: Vec<i64> = all_ids_stmt.query_map([], |r| r.get(0))?.collect::<Result<Vec<_>, _>>()?;
        drop(all_ids_stmt);

        let max_depth = 6;
        let mut through_count = 0u64;
        let mut total_paths = 0u64;
        for &source in &all_ids {
            if source == entity_id {
                continue;
            }
            for &target in &all_ids {
                if target == entity_id || target == source {
                    continue;
                }
                if let Some(path) = Self::path_between(handle, source, target, max_depth)? {
                    total_paths += 1;
                    if path.len() > 2 && path[1..path.len() - 1].contains(&entity_id) {
                        through_count += 1;
                    }
                }
            }
        }
        let betweenness = if total_paths == 0 { 0.0 } else { through_count as f64 / total_paths as f64 };

        Ok(Centrality { degree, weighted_degree, betweenness })
    }

    /// Local clustering coefficient: fraction of pairs of `entity_id`'s
    /// neighbors that are themselves connected, out of all possible pairs.
    pub fn clustering_coefficient(handle: &TenantHandle, entity_id: i64) -> Result<f64, GraphError> {
        let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
        let neighbors = Self::adjacent(&conn, entity_id, None, None)?;

        let k = neighbors.len();
        if k < 2 {
            return Ok(0.0);
        }

        let mut connected_pairs = 0;
        for i in 0..neighbors.len() {
            for j in (i + 1)..neighbors.len() {
                let (a, b) = (neighbors[i], neighbors[j]);
                let linked: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM edges WHERE deleted_at_ms IS NULL
                     AND ((source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1))",
                    params![a, b],
                    |r| r.get(0),
                )?;
                if linked > 0 {
                    connected_pairs += 1;
                }
            }
        }
        let possible_pairs = (k * (k - 1)) / 2;
        Ok(connected_pairs as f64 / possible_pairs as f64)
    }

    /// Parses one of three fixed pattern templates into a concrete query
    /// against the graph: "what X do I like?" (relation=likes, type=X),
    /// "where do I Y?" (relation=Y, type=place), "who do I X with?"
    /// (relation=X, type=person). Unrecognized phrasing is a
    /// [`GraphError::PatternNotRecognized`].
    pub fn query_pattern(handle: &TenantHandle, pattern: &str) -> Result<Vec<Entity>, GraphError> {
        let trimmed = pattern.trim();

        if let Some(caps) = WHAT_LIKE.captures(trimmed) {
            let entity_type = caps[1].trim().to_lowercase();
            return entities_with_relation(handle, "likes", Some(&entity_type));
        }
        if WHERE_DO_I.is_match(trimmed) {
            return entities_with_relation(handle, "visited", Some("place"));
        }
        if let Some(caps) = WHO_WITH.captures(trimmed) {
            let relation = caps[1].trim().to_lowercase();
            return entities_with_relation(handle, &relation, Some("person"));
        }

        Err(GraphError::PatternNotRecognized(pattern.to_string()))
    }
}

static WHAT_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^what\s+(.+?)\s+do\s+i\s+like\??$").unwrap());
static WHERE_DO_I: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^where\s+do\s+i\s+\w+\??$").unwrap());
static WHO_WITH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^who\s+do\s+i\s+(.+?)\s+with\??$").unwrap());

fn entities_with_relation(
    handle: &TenantHandle,
    relation: &str,
    entity_type: Option<&str>,
) -> Result<Vec<Entity>, GraphError> {
    let conn = handle.connect().map_err(|_| GraphError::Sqlite(rusqlite::Error::InvalidQuery))?;
    let mut stmt = conn.prepare(
        "SELECT e.id, e.type, e.name, e.properties, e.confidence, e.mention_count
         FROM entities e JOIN edges g ON g.target_id = e.id
         WHERE g.relation = ?1 AND g.deleted_at_ms IS NULL AND e.deleted_at_ms IS NULL
         AND (?2 IS NULL OR e.type = ?2)
         ORDER BY g.weight DESC",
    )?;
    let rows = stmt.query_map(params![relation, entity_type], row_to_entity)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn reject_meta(handle: &TenantHandle, meta_id: i64) -> Result<(), crate::error::LedgerError> {
    let meta = Ledger::get(handle, meta_id)?;
    if meta.status == "review" {
        Ledger::resolve(handle, meta_id, crate::ledger::ResolveAction::Reject)?;
    }
    Ok(())
}

fn row_to_entity(r: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let props_str: String = r.get(3)?;
    Ok(Entity {
        id: r.get(0)?,
        entity_type: r.get(1)?,
        name: r.get(2)?,
        properties: serde_json::from_str(&props_str).unwrap_or(serde_json::Value::Null),
        confidence: r.get(4)?,
        mention_count: r.get(5)?,
    })
}

fn row_to_edge(r: &rusqlite::Row) -> rusqlite::Result<Edge> {
    let evidence_str: String = r.get(6)?;
    Ok(Edge {
        id: r.get(0)?,
        source_id: r.get(1)?,
        target_id: r.get(2)?,
        relation: r.get(3)?,
        weight: r.get(4)?,
        confidence: r.get(5)?,
        evidence: serde_json::from_str(&evidence_str).unwrap_or_default(),
    })
}

fn trigrams(s: &str) -> HashSet<String> {
    let padded = format!("  {}  ", s.to_lowercase());
    let chars: Vec<char> = padded.chars().collect();
    let mut set = HashSet::new();
    if chars.len() < 3 {
        set.insert(padded);
        return set;
    }
    for w in chars.windows(3) {
        set.insert(w.iter().collect());
    }
    set
}

fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantManager;

    fn handle() -> (tempfile::TempDir, std::sync::Arc<crate::tenant::TenantHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TenantManager::new(dir.path().to_path_buf()).unwrap();
        let h = mgr.tenant_or_create("alice").unwrap();
        (dir, h)
    }

    #[test]
    fn duplicate_entity_name_case_insensitive_dedupes() {
        let (_d, h) = handle();
        let e1 = GraphStore::create_entity(&h, "person", "Alice", serde_json::json!({})).unwrap();
        let e2 = GraphStore::create_entity(&h, "person", "alice", serde_json::json!({})).unwrap();
        assert_eq!(e1.id, e2.id);
        assert_eq!(e2.mention_count, 2);
    }

    #[test]
    fn edge_weight_accumulates_then_clamps() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "Alice", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "place", "Cafe", serde_json::json!({})).unwrap();
        let mut last = GraphStore::create_edge(&h, a.id, b.id, "visited", 1.0, None).unwrap();
        for _ in 0..50 {
            last = GraphStore::create_edge(&h, a.id, b.id, "visited", 1.0, None).unwrap();
        }
        assert!(last.weight <= MAX_EDGE_WEIGHT);
        assert_eq!(last.weight, MAX_EDGE_WEIGHT);
    }

    #[test]
    fn edge_accumulation_matches_spec_scenario_5() {
        let (_d, h) = handle();
        let alice = GraphStore::create_entity(&h, "person", "Alice", serde_json::json!({})).unwrap();
        let restaurant = GraphStore::create_entity(&h, "place", "Luigi's", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, alice.id, restaurant.id, "visited", 1.0, None).unwrap();
        let edge = GraphStore::create_edge(&h, alice.id, restaurant.id, "visited", 0.5, None).unwrap();
        assert!((edge.weight - 1.5).abs() < 1e-9);
        assert_eq!(edge.evidence.len(), 2);
    }

    #[test]
    fn bfs_traversal_respects_depth_and_terminates_on_cycle() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "person", "B", serde_json::json!({})).unwrap();
        let c = GraphStore::create_entity(&h, "person", "C", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, b.id, c.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, c.id, a.id, "knows", 1.0, None).unwrap();

        let result = GraphStore::traverse(&h, a.id, 10, None, None, None, None).unwrap();
        assert_eq!(result.len(), 2, "cycle must not revisit nodes regardless of depth budget");
    }

    #[test]
    fn traverse_respects_type_filter() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "place", "Park", serde_json::json!({})).unwrap();
        let c = GraphStore::create_entity(&h, "person", "C", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "visited", 1.0, None).unwrap();
        GraphStore::create_edge(&h, a.id, c.id, "knows", 1.0, None).unwrap();

        let result = GraphStore::traverse(&h, a.id, 1, None, Some("place"), None, None).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].entity_type, "place");
    }

    #[test]
    fn path_between_finds_shortest_hop_path() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "person", "B", serde_json::json!({})).unwrap();
        let c = GraphStore::create_entity(&h, "person", "C", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, b.id, c.id, "knows", 1.0, None).unwrap();

        let path = GraphStore::path_between(&h, a.id, c.id, 10).unwrap().unwrap();
        assert_eq!(path, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn get_neighbors_sorts_by_weight_descending() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "person", "B", serde_json::json!({})).unwrap();
        let c = GraphStore::create_entity(&h, "person", "C", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, a.id, c.id, "knows", 5.0, None).unwrap();

        let neighbors = GraphStore::get_neighbors(&h, a.id, Direction::Out, None, None).unwrap();
        assert_eq!(neighbors[0].0.id, c.id);
        assert_eq!(neighbors[1].0.id, b.id);
    }

    #[test]
    fn list_entities_orders_by_confidence_desc_then_name_asc() {
        let (_d, h) = handle();
        GraphStore::create_entity(&h, "person", "Zed", serde_json::json!({})).unwrap();
        GraphStore::create_entity(&h, "person", "Amy", serde_json::json!({})).unwrap();
        let rows = GraphStore::list_entities(&h, Some("person"), None, None, 10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Amy");
    }

    #[test]
    fn delete_entity_is_excluded_from_subsequent_lookups() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        GraphStore::delete_entity(&h, a.id).unwrap();
        assert!(matches!(GraphStore::get_entity(&h, a.id), Err(GraphError::EntityNotFound(_))));
    }

    #[test]
    fn clustering_coefficient_of_triangle_is_one() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "person", "B", serde_json::json!({})).unwrap();
        let c = GraphStore::create_entity(&h, "person", "C", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, b.id, c.id, "knows", 1.0, None).unwrap();
        GraphStore::create_edge(&h, a.id, c.id, "knows", 1.0, None).unwrap();

        let coeff = GraphStore::clustering_coefficient(&h, a.id).unwrap();
        assert!((coeff - 1.0).abs() < 1e-9);
    }

    #[test]
    fn centrality_reports_degree_and_weighted_degree() {
        let (_d, h) = handle();
        let a = GraphStore::create_entity(&h, "person", "A", serde_json::json!({})).unwrap();
        let b = GraphStore::create_entity(&h, "person", "B", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, a.id, b.id, "knows", 2.0, None).unwrap();

        let c = GraphStore::centrality(&h, a.id).unwrap();
        assert_eq!(c.degree, 1);
        assert!((c.weighted_degree - 2.0).abs() < 1e-9);
    }

    #[test]
    fn query_pattern_what_do_i_like_filters_by_type_and_relation() {
        let (_d, h) = handle();
        let me = GraphStore::create_entity(&h, "person", "me", serde_json::json!({})).unwrap();
        let pizza = GraphStore::create_entity(&h, "food", "pizza", serde_json::json!({})).unwrap();
        GraphStore::create_edge(&h, me.id, pizza.id, "likes", 1.0, None).unwrap();

        let results = GraphStore::query_pattern(&h, "what food do I like?").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "pizza");
    }

    #[test]
    fn query_pattern_rejects_unrecognized_phrasing() {
        let (_d, h) = handle();
        let err = GraphStore::query_pattern(&h, "tell me a joke");
        assert!(matches!(err, Err(GraphError::PatternNotRecognized(_))));
    }
}
