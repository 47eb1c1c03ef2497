//! Read-only SQL sandbox (spec §4.4).
//!
//! This is a *validator*, not an executor: it inspects a query string and
//! rejects anything that is not a single, schema-bare `SELECT` (optionally
//! preceded by a read-only `WITH` clause) before the caller ever opens a
//! connection. There is no SQL parser dependency here on purpose — the
//! teacher's stack carries none, and the rule set below is a small, auditable
//! set of regexes rather than a general-purpose grammar.
//!
//! The source this port is modeled on runs against Postgres, so its literal
//! test vocabulary (`pg_tables`, `information_schema`, `public.users`,
//! `user_xxx.profile`) names Postgres system schemas even though this port's
//! storage engine is per-tenant SQLite. Those substrings are blocked
//! unconditionally — never valid identifiers in this system — alongside the
//! SQLite-native catalog (`sqlite_master` and friends) and a general
//! schema-qualified-reference check that only exempts names bound by a
//! preceding `WITH ... AS (...)` clause.

use crate::error::SandboxError;
use once_cell::sync::Lazy;
use regex::Regex;

const MAX_QUERY_LEN: usize = 8192;

static FORBIDDEN_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|truncate|replace|attach|detach|pragma|vacuum|reindex|grant|revoke|copy|call|do|analyze)\b")
        .unwrap()
});

/// Schema/catalog names that are never valid on the left of a dotted
/// reference, regardless of storage engine: SQLite's own temp/master
/// aliases, plus the Postgres vocabulary the source's test suite uses
/// (`pg_*`, `information_schema`, `public`) so a straight port of its
/// literal test inputs behaves identically here.
static SYSTEM_CATALOG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(sqlite_(master|schema|sequence|stat1|stat4)|pg_\w*|information_schema|public)\b")
        .unwrap()
});

static SELECT_OR_WITH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(with|select)\b").unwrap());

static VALID_IDENTIFIER_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^[\x20-\x7e\r\n\t]*$"#).unwrap());

/// Captures `name AS (` to build the set of CTE aliases a `WITH` clause
/// defines, since a dotted reference whose left side is a CTE alias (e.g.
/// `recent.col` where `recent` is a `WITH recent AS (...)`) is not a schema
/// reference at all.
static CTE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(").unwrap());

/// Any `ident.ident` chain — the general form of rule 3 (spec §4.4): no
/// schema-qualified identifier in a FROM/JOIN context except a known CTE
/// alias.
static SCHEMA_QUALIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_*]*)").unwrap());

/// Validates `query` against the read-only sandbox rules. Returns `Ok(())`
/// when the query is safe to hand to a real connection, `Err` otherwise.
/// Callers still execute with a read-only-opened connection as defense in
/// depth; this function is the first gate.
pub fn validate(query: &str) -> Result<(), SandboxError> {
    if query.len() > MAX_QUERY_LEN {
        return Err(SandboxError::TooLong(MAX_QUERY_LEN));
    }
    if !VALID_IDENTIFIER_CHARS.is_match(query) {
        return Err(SandboxError::InvalidIdentifier);
    }

    let trimmed = query.trim();
    let stripped = trimmed.trim_end_matches(';').trim_end();
    if stripped.contains(';') {
        return Err(SandboxError::MultipleStatements);
    }

    if !SELECT_OR_WITH.is_match(stripped) {
        let first_word = stripped.split_whitespace().next().unwrap_or("").to_string();
        return Err(SandboxError::NotReadOnly(first_word));
    }

    if let Some(m) = FORBIDDEN_KEYWORDS.find(stripped) {
        return Err(SandboxError::NotReadOnly(m.as_str().to_string()));
    }

    if let Some(m) = SYSTEM_CATALOG.find(stripped) {
        return Err(SandboxError::SystemCatalog(m.as_str().to_string()));
    }

    let cte_names: std::collections::HashSet<String> =
        CTE_NAME.captures_iter(stripped).map(|c| c[1].to_lowercase()).collect();

    for caps in SCHEMA_QUALIFIED.captures_iter(stripped) {
        let prefix = caps[1].to_lowercase();
        if !cte_names.contains(&prefix) {
            return Err(SandboxError::SchemaQualifiedReference(format!("{}.{}", &caps[1], &caps[2])));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_passes() {
        assert!(validate("SELECT * FROM workouts WHERE type = 'run'").is_ok());
    }

    #[test]
    fn with_clause_select_passes() {
        assert!(validate("WITH recent AS (SELECT * FROM memory_meta) SELECT * FROM recent").is_ok());
    }

    #[test]
    fn cte_alias_is_not_a_schema_qualified_violation() {
        assert!(validate("WITH recent AS (SELECT * FROM memory_meta) SELECT recent.id FROM recent").is_ok());
    }

    #[test]
    fn insert_is_rejected() {
        assert!(matches!(validate("INSERT INTO entities (name) VALUES ('x')"), Err(SandboxError::NotReadOnly(_))));
    }

    #[test]
    fn drop_table_is_rejected() {
        assert!(matches!(validate("DROP TABLE workouts"), Err(SandboxError::NotReadOnly(_))));
    }

    #[test]
    fn delete_is_rejected() {
        assert!(matches!(validate("DELETE FROM workouts"), Err(SandboxError::NotReadOnly(_))));
    }

    #[test]
    fn multiple_statements_via_semicolon_rejected() {
        assert!(matches!(validate("SELECT 1; DROP TABLE entities;"), Err(SandboxError::MultipleStatements)));
        assert!(matches!(validate("SELECT 1; SELECT 2"), Err(SandboxError::MultipleStatements)));
    }

    #[test]
    fn pragma_is_rejected() {
        assert!(validate("PRAGMA table_info(entities)").is_err());
    }

    #[test]
    fn sqlite_master_is_rejected() {
        assert!(matches!(validate("SELECT * FROM sqlite_master"), Err(SandboxError::SystemCatalog(_))));
    }

    #[test]
    fn pg_tables_is_rejected() {
        assert!(matches!(validate("SELECT * FROM pg_tables"), Err(SandboxError::SystemCatalog(_))));
    }

    #[test]
    fn information_schema_is_rejected() {
        assert!(matches!(validate("SELECT * FROM information_schema.columns"), Err(SandboxError::SystemCatalog(_))));
    }

    #[test]
    fn cross_tenant_schema_qualified_reference_is_rejected() {
        assert!(matches!(
            validate("SELECT * FROM user_xxx.profile"),
            Err(SandboxError::SchemaQualifiedReference(_))
        ));
    }

    #[test]
    fn public_schema_reference_is_rejected() {
        assert!(matches!(validate("SELECT * FROM public.users"), Err(SandboxError::SystemCatalog(_))));
    }

    #[test]
    fn oversized_query_is_rejected() {
        let huge = format!("SELECT '{}'", "a".repeat(MAX_QUERY_LEN));
        assert!(matches!(validate(&huge), Err(SandboxError::TooLong(_))));
    }

    #[test]
    fn update_disguised_in_cte_is_still_rejected() {
        assert!(matches!(
            validate("WITH x AS (UPDATE entities SET name = 'y') SELECT * FROM x"),
            Err(SandboxError::NotReadOnly(_))
        ));
    }
}
