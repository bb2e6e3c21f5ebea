// The backend session facade. Every client connection owns exactly one
// `BackendSession`; the protocol engine only ever talks to the backend
// through this trait. The real cloud client is wired in by the embedder;
// the in-tree `memory` implementation backs tests and the `-x`
// local-development mode.

// Standard library imports
use std::collections::HashMap;

// External crate imports
use async_trait::async_trait;

// Internal crate imports
use crate::errors::{PgError, SqlState};
use crate::parsers::{self, oid, FormatCode, Value};
use crate::sql::{self, TableOrIndexName, TokenKind};

/// One column of a result set or table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_oid: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: i32) -> Column {
        Column {
            name: name.into(),
            type_oid,
        }
    }
}

/// A fully materialized query result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultRows {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

/// Outcome of `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    Rows(ResultRows),
    Update { count: u64 },
    DdlAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

/// A typed row write targeted at one table. Columns not listed are left
/// untouched by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub op: MutationOp,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

/// The abstract backend connection. One logical session per client
/// connection; calls are strictly sequential per session.
#[async_trait]
pub trait BackendSession: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteResult, PgError>;

    /// Result-set metadata for a statement, or None when it returns no rows.
    async fn describe(&mut self, sql: &str) -> Result<Option<Vec<Column>>, PgError>;

    async fn execute_ddl(&mut self, sql: &str) -> Result<(), PgError>;

    async fn begin(&mut self) -> Result<(), PgError>;
    async fn commit(&mut self) -> Result<(), PgError>;
    async fn rollback(&mut self) -> Result<(), PgError>;

    async fn buffer_mutation(&mut self, mutation: Mutation) -> Result<(), PgError>;

    /// Apply all buffered mutations; returns the applied row count.
    async fn flush_mutations(&mut self) -> Result<u64, PgError>;

    async fn table_exists(&mut self, name: &TableOrIndexName) -> Result<bool, PgError>;
    async fn index_exists(&mut self, name: &TableOrIndexName) -> Result<bool, PgError>;

    /// Column schema of a table, for COPY decoding. None for unknown tables.
    async fn table_columns(
        &mut self,
        name: &TableOrIndexName,
    ) -> Result<Option<Vec<Column>>, PgError>;

    /// Forward a vendor (`spanner.*`) setting to the backend verbatim.
    async fn set_remote_setting(&mut self, name: &str, value: &str) -> Result<(), PgError>;
}

pub mod memory {
    //! A small in-memory backend. It records DDL, collects mutations, and
    //! evaluates literal projections and parameter echoes; just enough to
    //! drive local development and the protocol tests without a remote.

    use super::*;

    #[derive(Default)]
    pub struct MemoryBackend {
        tables: HashMap<String, Vec<Column>>,
        indexes: Vec<String>,
        in_transaction: bool,
        buffered: Vec<Mutation>,
        pub committed: Vec<Mutation>,
        pub remote_settings: HashMap<String, String>,
        pub ddl_log: Vec<String>,
    }

    impl MemoryBackend {
        pub fn new() -> MemoryBackend {
            MemoryBackend::default()
        }

        pub fn with_table(mut self, name: &str, columns: Vec<Column>) -> MemoryBackend {
            self.tables.insert(name.to_string(), columns);
            self
        }

        pub fn with_index(mut self, name: &str) -> MemoryBackend {
            self.indexes.push(name.to_string());
            self
        }

        /// Evaluate a projection of literals and parameters: the only query
        /// shape the stand-in understands is `SELECT <expr>[, <expr>…]`
        /// without a FROM clause, plus `SELECT … FROM <known table>` which
        /// yields the table's (empty) row set.
        fn eval_select(&self, query: &str, params: &[Value]) -> Result<ResultRows, PgError> {
            let tokens = sql::tokenize(query);

            // SELECT ... FROM <table>
            if let Some(from_index) = tokens
                .iter()
                .position(|token| token.is_keyword(query, "from"))
            {
                let (name, _) = sql::parse_object_name(query, &tokens, from_index + 1)
                    .ok_or_else(|| {
                        PgError::new(SqlState::SyntaxError, format!("syntax error in \"{query}\""))
                    })?;
                let columns = self
                    .tables
                    .get(&name.unquoted_name())
                    .ok_or_else(|| undefined_table(&name))?;
                return Ok(ResultRows {
                    columns: columns.clone(),
                    rows: Vec::new(),
                });
            }

            let mut columns = Vec::new();
            let mut row = Vec::new();
            let mut index = 1;
            while index < tokens.len() {
                let token = &tokens[index];
                let value = match token.kind {
                    TokenKind::Number => {
                        let text = token.text(query);
                        if text.contains('.') || text.contains('e') || text.contains('E') {
                            Value::Numeric(parsers::numeric::normalize(text)?)
                        } else {
                            match text.parse::<i32>() {
                                Ok(v) => Value::Int4(v),
                                Err(_) => Value::Int8(text.parse::<i64>().map_err(|_| {
                                    PgError::new(
                                        SqlState::NumericValueOutOfRange,
                                        format!("value out of range: \"{text}\""),
                                    )
                                })?),
                            }
                        }
                    }
                    TokenKind::StringLiteral => {
                        let text = token.text(query);
                        Value::Text(text[1..text.len() - 1].replace("''", "'"))
                    }
                    TokenKind::Parameter => {
                        let number: usize =
                            token.text(query)[1..].parse().map_err(|_| {
                                PgError::new(SqlState::SyntaxError, "invalid parameter reference")
                            })?;
                        params
                            .get(number - 1)
                            .cloned()
                            .ok_or_else(|| {
                                PgError::new(
                                    SqlState::ProtocolViolation,
                                    format!("there is no parameter ${number}"),
                                )
                            })?
                    }
                    TokenKind::Ident if token.is_keyword(query, "null") => Value::Null,
                    TokenKind::Ident if token.is_keyword(query, "true") => Value::Bool(true),
                    TokenKind::Ident if token.is_keyword(query, "false") => Value::Bool(false),
                    _ => {
                        return Err(PgError::new(
                            SqlState::SyntaxError,
                            format!("unsupported expression in \"{query}\""),
                        ))
                    }
                };
                index += 1;

                // Optional ::type cast; the cast decides the column type
                // even when the value is null.
                let mut value = value;
                let mut column_oid = value.type_oid();
                if is_symbol(&tokens, index, query, ":") && is_symbol(&tokens, index + 1, query, ":")
                {
                    let type_token = tokens.get(index + 2).ok_or_else(|| {
                        PgError::new(SqlState::SyntaxError, "missing type after cast")
                    })?;
                    let (cast, oid) = cast_value(value, type_token.text(query))?;
                    value = cast;
                    column_oid = oid;
                    index += 3;
                }

                columns.push(Column::new("?column?", column_oid));
                row.push(value);

                if is_symbol(&tokens, index, query, ",") {
                    index += 1;
                } else {
                    break;
                }
            }

            Ok(ResultRows {
                columns,
                rows: vec![row],
            })
        }
    }

    fn is_symbol(tokens: &[sql::Token], index: usize, query: &str, symbol: &str) -> bool {
        tokens
            .get(index)
            .map(|t| t.kind == TokenKind::Symbol && t.text(query) == symbol)
            .unwrap_or(false)
    }

    fn undefined_table(name: &TableOrIndexName) -> PgError {
        PgError::new(
            SqlState::UndefinedTable,
            format!("relation \"{name}\" does not exist"),
        )
    }

    fn cast_value(value: Value, type_name: &str) -> Result<(Value, i32), PgError> {
        let target = match type_name.to_ascii_lowercase().as_str() {
            "int2" | "smallint" => oid::INT2,
            "int" | "int4" | "integer" => oid::INT4,
            "int8" | "bigint" => oid::INT8,
            "text" | "varchar" => oid::TEXT,
            "bool" | "boolean" => oid::BOOL,
            "float4" | "real" => oid::FLOAT4,
            "float8" => oid::FLOAT8,
            "numeric" | "decimal" => oid::NUMERIC,
            _ => {
                return Err(PgError::new(
                    SqlState::UndefinedObject,
                    format!("type \"{type_name}\" does not exist"),
                ))
            }
        };

        let cast = match value {
            Value::Text(text) => {
                parsers::decode(text.as_bytes(), FormatCode::Text, target, chrono_tz::Tz::UTC)?
            }
            Value::Null => Value::Null,
            same if same.type_oid() == target => same,
            Value::Int4(v) if target == oid::INT8 => Value::Int8(v as i64),
            Value::Int4(v) if target == oid::INT2 => Value::Int2(v as i16),
            Value::Int4(v) if target == oid::TEXT => Value::Text(v.to_string()),
            Value::Int4(v) if target == oid::NUMERIC => Value::Numeric(v.to_string()),
            Value::Int8(v) if target == oid::INT4 => Value::Int4(v as i32),
            _ => {
                return Err(PgError::new(
                    SqlState::InvalidTextRepresentation,
                    format!("cannot cast to {type_name}"),
                ))
            }
        };
        Ok((cast, target))
    }

    /// Register a table from a `create table` statement: column names and
    /// types are read from the parenthesized definition list.
    fn parse_created_table(ddl: &str) -> Option<(String, Vec<Column>)> {
        let tokens = sql::tokenize(ddl);
        if tokens.len() < 3
            || !tokens[0].is_keyword(ddl, "create")
            || !tokens[1].is_keyword(ddl, "table")
        {
            return None;
        }
        let (name, mut index) = sql::parse_object_name(ddl, &tokens, 2)?;

        let mut columns = Vec::new();
        // Expect "(", then "col type" pairs at depth 1.
        let mut depth = 0;
        while index < tokens.len() {
            let token = &tokens[index];
            let text = token.text(ddl);
            if token.kind == TokenKind::Symbol && text == "(" {
                depth += 1;
                index += 1;
                if depth == 1 {
                    index = parse_column(ddl, &tokens, index, &mut columns);
                }
                continue;
            }
            if token.kind == TokenKind::Symbol && text == ")" {
                depth -= 1;
            } else if depth == 1 && token.kind == TokenKind::Symbol && text == "," {
                index = parse_column(ddl, &tokens, index + 1, &mut columns);
                continue;
            }
            index += 1;
        }

        Some((name.unquoted_name(), columns))
    }

    fn parse_column(
        ddl: &str,
        tokens: &[sql::Token],
        index: usize,
        columns: &mut Vec<Column>,
    ) -> usize {
        let name_token = match tokens.get(index) {
            Some(t) if t.kind == TokenKind::Ident || t.kind == TokenKind::QuotedIdent => t,
            _ => return index,
        };
        // Table constraints, not columns.
        for keyword in ["primary", "constraint", "foreign", "check", "unique"] {
            if name_token.is_keyword(ddl, keyword) {
                return index;
            }
        }
        let type_token = match tokens.get(index + 1) {
            Some(t) if t.kind == TokenKind::Ident => t,
            _ => return index,
        };
        let type_oid = match type_token.text(ddl).to_ascii_lowercase().as_str() {
            "bool" | "boolean" => oid::BOOL,
            "smallint" | "int2" => oid::INT2,
            "int" | "integer" | "int4" => oid::INT4,
            "bigint" | "int8" => oid::INT8,
            "real" | "float4" => oid::FLOAT4,
            "float8" | "double" => oid::FLOAT8,
            "numeric" | "decimal" => oid::NUMERIC,
            "bytea" => oid::BYTEA,
            "date" => oid::DATE,
            "timestamptz" | "timestamp" => oid::TIMESTAMPTZ,
            "jsonb" => oid::JSONB,
            _ => oid::TEXT,
        };
        columns.push(Column::new(
            sql::unquote_identifier(name_token.text(ddl)),
            type_oid,
        ));
        index + 2
    }

    #[async_trait]
    impl BackendSession for MemoryBackend {
        async fn execute(&mut self, sql_text: &str, params: &[Value]) -> Result<ExecuteResult, PgError> {
            match sql::classify(sql_text) {
                sql::StatementKind::Query => {
                    self.eval_select(sql_text, params).map(ExecuteResult::Rows)
                }
                sql::StatementKind::Dml => {
                    let tokens = sql::tokenize(sql_text);
                    let values_at = tokens
                        .iter()
                        .position(|t| t.is_keyword(sql_text, "values"));
                    let count = match values_at {
                        // One row per top-level tuple after VALUES.
                        Some(values_at) => {
                            let mut depth = 0;
                            let mut count = 0u64;
                            for token in &tokens[values_at..] {
                                let text = token.text(sql_text);
                                if token.kind == TokenKind::Symbol && text == "(" {
                                    if depth == 0 {
                                        count += 1;
                                    }
                                    depth += 1;
                                } else if token.kind == TokenKind::Symbol && text == ")" {
                                    depth -= 1;
                                }
                            }
                            count.max(1)
                        }
                        None => 0,
                    };
                    Ok(ExecuteResult::Update { count })
                }
                sql::StatementKind::Ddl => {
                    self.execute_ddl(sql_text).await?;
                    Ok(ExecuteResult::DdlAck)
                }
                _ => Err(PgError::new(
                    SqlState::SyntaxError,
                    format!("cannot execute \"{sql_text}\""),
                )),
            }
        }

        async fn describe(&mut self, sql_text: &str) -> Result<Option<Vec<Column>>, PgError> {
            match sql::classify(sql_text) {
                sql::StatementKind::Query => {
                    // Parameter values are unknown at describe time; nulls
                    // flow through casts without changing the column types.
                    let placeholders: Vec<Value> = vec![Value::Null; 64];
                    let rows = self.eval_select(sql_text, &placeholders)?;
                    Ok(Some(rows.columns))
                }
                _ => Ok(None),
            }
        }

        async fn execute_ddl(&mut self, sql_text: &str) -> Result<(), PgError> {
            self.ddl_log.push(sql_text.to_string());
            let tokens = sql::tokenize(sql_text);
            if let Some((name, columns)) = parse_created_table(sql_text) {
                self.tables.insert(name, columns);
            } else if tokens.len() >= 3 && tokens[0].is_keyword(sql_text, "drop") {
                if let Some((name, _)) = sql::parse_object_name(sql_text, &tokens, 2) {
                    if tokens[1].is_keyword(sql_text, "table") {
                        self.tables.remove(&name.unquoted_name());
                    } else {
                        self.indexes.retain(|i| *i != name.unquoted_name());
                    }
                }
            } else if tokens.len() >= 2 && tokens[0].is_keyword(sql_text, "create") {
                // create [unique] index <name> ...
                let index_at = if tokens[1].is_keyword(sql_text, "unique") { 2 } else { 1 };
                if tokens
                    .get(index_at)
                    .map(|t| t.is_keyword(sql_text, "index"))
                    .unwrap_or(false)
                {
                    if let Some((name, _)) = sql::parse_object_name(sql_text, &tokens, index_at + 1)
                    {
                        self.indexes.push(name.unquoted_name());
                    }
                }
            }
            Ok(())
        }

        async fn begin(&mut self) -> Result<(), PgError> {
            self.in_transaction = true;
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), PgError> {
            self.in_transaction = false;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), PgError> {
            self.in_transaction = false;
            self.buffered.clear();
            Ok(())
        }

        async fn buffer_mutation(&mut self, mutation: Mutation) -> Result<(), PgError> {
            self.buffered.push(mutation);
            Ok(())
        }

        async fn flush_mutations(&mut self) -> Result<u64, PgError> {
            let count = self.buffered.len() as u64;
            self.committed.append(&mut self.buffered);
            Ok(count)
        }

        async fn table_exists(&mut self, name: &TableOrIndexName) -> Result<bool, PgError> {
            Ok(self.tables.contains_key(&name.unquoted_name()))
        }

        async fn index_exists(&mut self, name: &TableOrIndexName) -> Result<bool, PgError> {
            Ok(self.indexes.contains(&name.unquoted_name()))
        }

        async fn table_columns(
            &mut self,
            name: &TableOrIndexName,
        ) -> Result<Option<Vec<Column>>, PgError> {
            Ok(self.tables.get(&name.unquoted_name()).cloned())
        }

        async fn set_remote_setting(&mut self, name: &str, value: &str) -> Result<(), PgError> {
            self.remote_settings
                .insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_select_literal() {
            let mut backend = MemoryBackend::new();
            match backend.execute("SELECT 1", &[]).await.unwrap() {
                ExecuteResult::Rows(rows) => {
                    assert_eq!(rows.columns, vec![Column::new("?column?", oid::INT4)]);
                    assert_eq!(rows.rows, vec![vec![Value::Int4(1)]]);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_select_parameter_with_cast() {
            let mut backend = MemoryBackend::new();
            match backend
                .execute("SELECT $1::int", &[Value::Text("42".to_string())])
                .await
                .unwrap()
            {
                ExecuteResult::Rows(rows) => {
                    assert_eq!(rows.columns[0].type_oid, oid::INT4);
                    assert_eq!(rows.rows, vec![vec![Value::Int4(42)]]);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_create_table_registers_schema() {
            let mut backend = MemoryBackend::new();
            backend
                .execute_ddl("create table keyvalue (id bigint primary key, value text)")
                .await
                .unwrap();
            let name = TableOrIndexName::new("keyvalue");
            assert!(backend.table_exists(&name).await.unwrap());
            assert_eq!(
                backend.table_columns(&name).await.unwrap().unwrap(),
                vec![
                    Column::new("id", oid::INT8),
                    Column::new("value", oid::TEXT)
                ]
            );
        }

        #[tokio::test]
        async fn test_mutation_buffering() {
            let mut backend = MemoryBackend::new();
            backend
                .buffer_mutation(Mutation {
                    table: "t".to_string(),
                    op: MutationOp::Insert,
                    columns: vec!["id".to_string()],
                    values: vec![Value::Int8(1)],
                })
                .await
                .unwrap();
            assert_eq!(backend.committed.len(), 0);
            assert_eq!(backend.flush_mutations().await.unwrap(), 1);
            assert_eq!(backend.committed.len(), 1);
        }

        #[tokio::test]
        async fn test_insert_counts_values_tuples() {
            let mut backend = MemoryBackend::new();
            match backend
                .execute("insert into t (a) values (1), (2), (3)", &[])
                .await
                .unwrap()
            {
                ExecuteResult::Update { count } => assert_eq!(count, 3),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }
}
