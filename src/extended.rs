// Prepared statements, portals, and the buffered extended-protocol queue.
// Work is queued between Sync boundaries and flushed on Sync or Flush; the
// connection handler drives the queue against the backend.

// Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// External crate imports
use chrono_tz::Tz;

// Internal crate imports
use crate::backend::ResultRows;
use crate::errors::{PgError, SqlState};
use crate::messages::frontend::{Bind, Parse};
use crate::parsers::{self, FormatCode, Value};
use crate::sql::{self, StatementKind};

/// A parsed SQL template with declared parameter types.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
    pub kind: StatementKind,
    pub param_types: Vec<i32>,
}

impl PreparedStatement {
    pub fn from_parse(message: &Parse) -> PreparedStatement {
        PreparedStatement {
            name: message.name.clone(),
            sql: message.query.clone(),
            kind: sql::classify(&message.query),
            param_types: message.param_types.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortalState {
    Bound,
    /// A previous Execute hit its row limit; the rest of the result is
    /// retained for the next Execute on this portal.
    Suspended { rows: ResultRows, offset: usize },
    Done,
}

/// A bound, named instance of a prepared statement ready for execution.
#[derive(Debug, Clone)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub params: Vec<Value>,
    pub result_formats: Vec<i16>,
    pub state: PortalState,
    /// A RowDescription was already sent for this portal; Execute must not
    /// repeat it.
    pub described: bool,
}

impl Portal {
    /// The format for result column `index`: none given means text, one
    /// given applies to all columns.
    pub fn result_format(&self, index: usize) -> Result<FormatCode, PgError> {
        let code = match self.result_formats.len() {
            0 => 0,
            1 => self.result_formats[0],
            _ => *self.result_formats.get(index).ok_or_else(|| {
                PgError::new(
                    SqlState::ProtocolViolation,
                    "not enough result format codes",
                )
            })?,
        };
        FormatCode::from_i16(code)
    }
}

/// One element of the pending queue: a message acked immediately but only
/// acted on at the next Flush or Sync boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedMessage {
    Parse(Parse),
    Bind(Bind),
    Describe { target: char, name: String },
    Execute { portal: String, max_rows: i32 },
    Close { target: char, name: String },
}

/// Per-connection named statements and portals.
#[derive(Default)]
pub struct StatementStore {
    statements: HashMap<String, Arc<PreparedStatement>>,
    portals: HashMap<String, Portal>,
}

impl StatementStore {
    pub fn new() -> StatementStore {
        StatementStore::default()
    }

    /// Parse: store the statement. The unnamed statement is silently
    /// replaced; a named one must not exist.
    pub fn register(&mut self, statement: PreparedStatement) -> Result<(), PgError> {
        if !statement.name.is_empty() && self.statements.contains_key(&statement.name) {
            return Err(PgError::new(
                SqlState::DuplicatePreparedStatement,
                format!("prepared statement \"{}\" already exists", statement.name),
            ));
        }
        if statement.name.is_empty() {
            // Replacing the unnamed statement invalidates its portals.
            self.invalidate_portals_of("");
        }
        self.statements
            .insert(statement.name.clone(), Arc::new(statement));
        Ok(())
    }

    pub fn statement(&self, name: &str) -> Result<Arc<PreparedStatement>, PgError> {
        self.statements.get(name).cloned().ok_or_else(|| {
            PgError::new(
                SqlState::InvalidSqlStatementName,
                format!("prepared statement \"{name}\" does not exist"),
            )
        })
    }

    /// Bind: decode parameters and create the portal. The parameter value
    /// count must match the statement's declared parameters.
    pub fn bind(&mut self, message: &Bind, timezone: Tz) -> Result<(), PgError> {
        let statement = self.statement(&message.statement)?;

        if !statement.param_types.is_empty()
            && statement.param_types.len() != message.params.len()
        {
            return Err(PgError::new(
                SqlState::ProtocolViolation,
                format!(
                    "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                    message.params.len(),
                    statement.name,
                    statement.param_types.len()
                ),
            ));
        }

        let mut params = Vec::with_capacity(message.params.len());
        for (index, raw) in message.params.iter().enumerate() {
            let format = match message.param_formats.len() {
                0 => FormatCode::Text,
                1 => FormatCode::from_i16(message.param_formats[0])?,
                _ => FormatCode::from_i16(*message.param_formats.get(index).ok_or_else(
                    || {
                        PgError::new(
                            SqlState::ProtocolViolation,
                            "not enough parameter format codes",
                        )
                    },
                )?)?,
            };
            let type_oid = statement.param_types.get(index).copied().unwrap_or(0);
            let value = match raw {
                None => Value::Null,
                Some(bytes) => parsers::decode(bytes, format, type_oid, timezone)?,
            };
            params.push(value);
        }

        self.portals.insert(
            message.portal.clone(),
            Portal {
                name: message.portal.clone(),
                statement,
                params,
                result_formats: message.result_formats.clone(),
                state: PortalState::Bound,
                described: false,
            },
        );
        Ok(())
    }

    pub fn portal(&self, name: &str) -> Result<&Portal, PgError> {
        self.portals.get(name).ok_or_else(|| {
            PgError::new(
                SqlState::InvalidSqlStatementName,
                format!("portal \"{name}\" does not exist"),
            )
        })
    }

    pub fn portal_mut(&mut self, name: &str) -> Result<&mut Portal, PgError> {
        self.portals.get_mut(name).ok_or_else(|| {
            PgError::new(
                SqlState::InvalidSqlStatementName,
                format!("portal \"{name}\" does not exist"),
            )
        })
    }

    /// Close: dropping an absent entry is a no-op per the protocol. Closing
    /// a statement invalidates its portals.
    pub fn close(&mut self, target: char, name: &str) {
        if target == 'S' {
            if self.statements.remove(name).is_some() {
                self.invalidate_portals_of(name);
            }
        } else {
            self.portals.remove(name);
        }
    }

    /// Portals only live until the end of the enclosing transaction.
    pub fn close_all_portals(&mut self) {
        self.portals.clear();
    }

    fn invalidate_portals_of(&mut self, statement_name: &str) {
        self.portals
            .retain(|_, portal| portal.statement.name != statement_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parse_message(name: &str, query: &str, param_types: Vec<i32>) -> Parse {
        Parse {
            name: name.to_string(),
            query: query.to_string(),
            param_types,
        }
    }

    fn bind_message(portal: &str, statement: &str, params: Vec<Option<&[u8]>>) -> Bind {
        Bind {
            portal: portal.to_string(),
            statement: statement.to_string(),
            param_formats: vec![],
            params: params
                .into_iter()
                .map(|p| p.map(|bytes| BytesMut::from(bytes)))
                .collect(),
            result_formats: vec![],
        }
    }

    #[test]
    fn test_named_statement_must_not_exist() {
        let mut store = StatementStore::new();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "s1",
                "SELECT 1",
                vec![],
            )))
            .unwrap();

        let err = store
            .register(PreparedStatement::from_parse(&parse_message(
                "s1",
                "SELECT 2",
                vec![],
            )))
            .unwrap_err();
        assert_eq!(err.code, SqlState::DuplicatePreparedStatement);
    }

    #[test]
    fn test_unnamed_statement_is_replaceable() {
        let mut store = StatementStore::new();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "",
                "SELECT 1",
                vec![],
            )))
            .unwrap();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "",
                "SELECT 2",
                vec![],
            )))
            .unwrap();
        assert_eq!(store.statement("").unwrap().sql, "SELECT 2");
    }

    #[test]
    fn test_bind_unknown_statement() {
        let mut store = StatementStore::new();
        let err = store
            .bind(&bind_message("", "missing", vec![]), Tz::UTC)
            .unwrap_err();
        assert_eq!(err.code, SqlState::InvalidSqlStatementName);
    }

    #[test]
    fn test_bind_parameter_count_mismatch() {
        let mut store = StatementStore::new();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "s1",
                "SELECT $1::int",
                vec![parsers::oid::INT4],
            )))
            .unwrap();

        let err = store
            .bind(&bind_message("", "s1", vec![]), Tz::UTC)
            .unwrap_err();
        assert_eq!(err.code, SqlState::ProtocolViolation);
    }

    #[test]
    fn test_bind_decodes_parameters() {
        let mut store = StatementStore::new();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "s1",
                "SELECT $1::int",
                vec![parsers::oid::INT4],
            )))
            .unwrap();
        store
            .bind(&bind_message("p1", "s1", vec![Some(b"42")]), Tz::UTC)
            .unwrap();

        let portal = store.portal("p1").unwrap();
        assert_eq!(portal.params, vec![Value::Int4(42)]);
        assert_eq!(portal.state, PortalState::Bound);
    }

    #[test]
    fn test_close_statement_invalidates_portals() {
        let mut store = StatementStore::new();
        store
            .register(PreparedStatement::from_parse(&parse_message(
                "s1",
                "SELECT 1",
                vec![],
            )))
            .unwrap();
        store.bind(&bind_message("p1", "s1", vec![]), Tz::UTC).unwrap();

        store.close('S', "s1");
        assert!(store.statement("s1").is_err());
        assert!(store.portal("p1").is_err());
    }

    #[test]
    fn test_close_absent_is_noop() {
        let mut store = StatementStore::new();
        store.close('S', "missing");
        store.close('P', "missing");
    }
}
