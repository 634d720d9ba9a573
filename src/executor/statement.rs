//! Just enough statement parsing to name and route commands.
//!
//! Full planning belongs to the query engine; here we only need the kind of
//! statement, the entity it targets and the sources it reads.

use crate::core::{CommandAction, CommandError, CommandId, EntityType, Result};
use crate::executor::metastore::SourceKind;
use lazy_static::lazy_static;
use regex::Regex;

const IDENT: &str = r#"(`[^`]+`|"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)"#;

lazy_static! {
    static ref CREATE_AS_SELECT: Regex = Regex::new(&format!(
        r"(?is)^\s*CREATE\s+(STREAM|TABLE)\s+(IF\s+NOT\s+EXISTS\s+)?{IDENT}(?:\s+WITH\s*\([^)]*\))?\s+AS\s+SELECT\s+(.+)$"
    ))
    .unwrap();
    static ref CREATE_SOURCE: Regex = Regex::new(&format!(
        r"(?is)^\s*CREATE\s+(STREAM|TABLE)\s+(IF\s+NOT\s+EXISTS\s+)?{IDENT}(.*)$"
    ))
    .unwrap();
    static ref INSERT_INTO: Regex = Regex::new(&format!(
        r"(?is)^\s*INSERT\s+INTO\s+{IDENT}\s+SELECT\s+(.+)$"
    ))
    .unwrap();
    static ref DROP_SOURCE: Regex = Regex::new(&format!(
        r"(?is)^\s*DROP\s+(STREAM|TABLE)\s+(IF\s+EXISTS\s+)?{IDENT}(\s+DELETE\s+TOPIC)?\s*;?\s*$"
    ))
    .unwrap();
    static ref TERMINATE_CLUSTER: Regex = Regex::new(
        r"(?is)^\s*TERMINATE\s+CLUSTER(?:\s+DELETE\s+TOPICS\s*\(([^)]*)\))?\s*;?\s*$"
    )
    .unwrap();
    static ref TERMINATE_QUERY: Regex = Regex::new(&format!(
        r"(?is)^\s*TERMINATE\s+(?:QUERY\s+)?{IDENT}\s*;?\s*$"
    ))
    .unwrap();
    static ref KAFKA_TOPIC: Regex = Regex::new(r"(?is)KAFKA_TOPIC\s*=\s*'([^']+)'").unwrap();
    static ref SOURCE_REF: Regex =
        Regex::new(&format!(r"(?is)\b(?:FROM|JOIN)\s+{IDENT}")).unwrap();
}

/// Entity name used in the id of every cluster-terminate command.
pub const TERMINATE_CLUSTER_ENTITY: &str = "TerminateCluster";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateSource {
        kind: SourceKind,
        name: String,
        topic: Option<String>,
        if_not_exists: bool,
    },
    CreateAsSelect {
        kind: SourceKind,
        name: String,
        sources: Vec<String>,
        if_not_exists: bool,
    },
    InsertInto {
        target: String,
        sources: Vec<String>,
    },
    DropSource {
        kind: SourceKind,
        name: String,
        if_exists: bool,
        delete_topic: bool,
    },
    TerminateQuery {
        query_id: String,
    },
    TerminateCluster {
        delete_topics: Vec<String>,
    },
}

impl Statement {
    pub fn is_terminate_cluster(&self) -> bool {
        matches!(self, Statement::TerminateCluster { .. })
    }
}

/// Unquoted identifiers are case-insensitive and stored upper-cased.
fn normalize_identifier(raw: &str) -> String {
    let quoted = (raw.starts_with('`') && raw.ends_with('`'))
        || (raw.starts_with('"') && raw.ends_with('"'));
    if quoted && raw.len() >= 2 {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_ascii_uppercase()
    }
}

fn source_kind(raw: &str) -> SourceKind {
    if raw.eq_ignore_ascii_case("table") {
        SourceKind::Table
    } else {
        SourceKind::Stream
    }
}

fn referenced_sources(select_body: &str) -> Vec<String> {
    let mut sources = Vec::new();
    for caps in SOURCE_REF.captures_iter(select_body) {
        let name = normalize_identifier(&caps[1]);
        if !sources.contains(&name) {
            sources.push(name);
        }
    }
    sources
}

pub fn parse_statement(text: &str) -> Result<Statement> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CommandError::ParseError("Empty statement".to_string()));
    }

    if let Some(caps) = CREATE_AS_SELECT.captures(trimmed) {
        let sources = referenced_sources(&caps[4]);
        if sources.is_empty() {
            return Err(CommandError::ParseError(format!(
                "Query in '{}' has no FROM clause",
                trimmed
            )));
        }
        return Ok(Statement::CreateAsSelect {
            kind: source_kind(&caps[1]),
            name: normalize_identifier(&caps[3]),
            sources,
            if_not_exists: caps.get(2).is_some(),
        });
    }

    if let Some(caps) = CREATE_SOURCE.captures(trimmed) {
        let topic = KAFKA_TOPIC
            .captures(&caps[4])
            .map(|topic| topic[1].to_string());
        return Ok(Statement::CreateSource {
            kind: source_kind(&caps[1]),
            name: normalize_identifier(&caps[3]),
            topic,
            if_not_exists: caps.get(2).is_some(),
        });
    }

    if let Some(caps) = INSERT_INTO.captures(trimmed) {
        let sources = referenced_sources(&caps[2]);
        if sources.is_empty() {
            return Err(CommandError::ParseError(format!(
                "Query in '{}' has no FROM clause",
                trimmed
            )));
        }
        return Ok(Statement::InsertInto {
            target: normalize_identifier(&caps[1]),
            sources,
        });
    }

    if let Some(caps) = DROP_SOURCE.captures(trimmed) {
        return Ok(Statement::DropSource {
            kind: source_kind(&caps[1]),
            name: normalize_identifier(&caps[3]),
            if_exists: caps.get(2).is_some(),
            delete_topic: caps.get(4).is_some(),
        });
    }

    // Must come before TERMINATE <query id>, which would take CLUSTER as an id.
    if let Some(caps) = TERMINATE_CLUSTER.captures(trimmed) {
        let delete_topics = caps
            .get(1)
            .map(|list| {
                list.as_str()
                    .split(',')
                    .map(|t| t.trim().trim_matches('\'').to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        return Ok(Statement::TerminateCluster { delete_topics });
    }

    if let Some(caps) = TERMINATE_QUERY.captures(trimmed) {
        return Ok(Statement::TerminateQuery {
            // Query ids are generated upper-case; keep quoting rules consistent.
            query_id: normalize_identifier(&caps[1]),
        });
    }

    Err(CommandError::ParseError(format!(
        "Statement is not a distributed command: '{}'",
        trimmed
    )))
}

/// Derives the [`CommandId`] a statement is logged under.
pub struct CommandIdAssigner;

impl CommandIdAssigner {
    pub fn command_id_for(statement: &Statement) -> CommandId {
        match statement {
            Statement::CreateSource { kind, name, .. }
            | Statement::CreateAsSelect { kind, name, .. } => {
                CommandId::new(kind.entity_type(), name.clone(), CommandAction::Create)
            }
            Statement::InsertInto { target, .. } => CommandId::new(
                EntityType::Stream,
                format!("InsertInto_{}", target),
                CommandAction::Execute,
            ),
            Statement::DropSource { kind, name, .. } => {
                CommandId::new(kind.entity_type(), name.clone(), CommandAction::Drop)
            }
            Statement::TerminateQuery { query_id } => {
                CommandId::new(EntityType::Terminate, query_id.clone(), CommandAction::Execute)
            }
            Statement::TerminateCluster { .. } => CommandId::new(
                EntityType::Cluster,
                TERMINATE_CLUSTER_ENTITY,
                CommandAction::Terminate,
            ),
        }
    }

    pub fn command_id_for_text(text: &str) -> Result<CommandId> {
        parse_statement(text).map(|statement| Self::command_id_for(&statement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_stream_with_topic() {
        let statement = parse_statement(
            "CREATE STREAM pageviews (viewtime BIGINT, userid VARCHAR) WITH (KAFKA_TOPIC='pageviews_topic', VALUE_FORMAT='JSON');",
        )
        .unwrap();
        assert_eq!(
            statement,
            Statement::CreateSource {
                kind: SourceKind::Stream,
                name: "PAGEVIEWS".to_string(),
                topic: Some("pageviews_topic".to_string()),
                if_not_exists: false,
            }
        );
        assert_eq!(
            CommandIdAssigner::command_id_for(&statement).to_string(),
            "stream/PAGEVIEWS/create"
        );
    }

    #[test]
    fn create_table_as_select_collects_sources() {
        let statement = parse_statement(
            "CREATE TABLE enriched WITH (PARTITIONS=4) AS SELECT * FROM pageviews p JOIN users u ON p.userid = u.userid;",
        )
        .unwrap();
        match statement {
            Statement::CreateAsSelect { kind, name, sources, .. } => {
                assert_eq!(kind, SourceKind::Table);
                assert_eq!(name, "ENRICHED");
                assert_eq!(sources, vec!["PAGEVIEWS".to_string(), "USERS".to_string()]);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn quoted_identifiers_keep_case() {
        let statement = parse_statement("CREATE STREAM `MixedCase` (X INT);").unwrap();
        assert_eq!(
            CommandIdAssigner::command_id_for(&statement).entity,
            "MixedCase"
        );
    }

    #[test]
    fn insert_into_gets_its_own_id() {
        let id = CommandIdAssigner::command_id_for_text("INSERT INTO sink SELECT * FROM src;").unwrap();
        assert_eq!(id.to_string(), "stream/InsertInto_SINK/execute");
    }

    #[test]
    fn drop_with_delete_topic() {
        let statement = parse_statement("DROP TABLE IF EXISTS users DELETE TOPIC;").unwrap();
        assert_eq!(
            statement,
            Statement::DropSource {
                kind: SourceKind::Table,
                name: "USERS".to_string(),
                if_exists: true,
                delete_topic: true,
            }
        );
    }

    #[test]
    fn terminate_cluster_is_not_a_query_id() {
        let statement =
            parse_statement("TERMINATE CLUSTER DELETE TOPICS ('a', 'b');").unwrap();
        assert_eq!(
            statement,
            Statement::TerminateCluster {
                delete_topics: vec!["a".to_string(), "b".to_string()],
            }
        );
        assert!(CommandIdAssigner::command_id_for(&statement).is_cluster_terminate());

        let statement = parse_statement("TERMINATE CSAS_OUT_3;").unwrap();
        assert_eq!(
            CommandIdAssigner::command_id_for(&statement).to_string(),
            "terminate/CSAS_OUT_3/execute"
        );
    }

    #[test]
    fn non_distributed_statements_are_rejected() {
        assert!(parse_statement("SELECT * FROM pageviews;").is_err());
        assert!(parse_statement("   ").is_err());
        assert!(parse_statement("CREATE STREAM s AS SELECT 1;").is_err());
    }
}
