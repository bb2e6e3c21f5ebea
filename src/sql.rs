// A forgiving SQL scanner. This is not a grammar: it knows just enough
// lexical structure (quoted identifiers, string literals, dollar quoting,
// nested comments) to classify statements, split simple-query batches at
// unquoted semicolons, and extract identifiers for DDL translation.

// Internal crate imports
use crate::errors::{PgError, SqlState};

/// Statement classification used to route execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Dml,
    Ddl,
    ClientSide,
    Copy,
    Begin,
    Commit,
    Rollback,
    Show,
    Set,
    Other,
}

/// One lexical token, referencing the source by byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Ident,
    /// `"Name"` quoted identifier, range includes the quotes.
    QuotedIdent,
    /// String literal of any flavor, range includes the quotes.
    StringLiteral,
    Number,
    /// `$n` positional parameter.
    Parameter,
    /// Any single operator or punctuation character.
    Symbol,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..self.end]
    }

    /// Case-insensitive keyword match for unquoted identifiers.
    pub fn is_keyword(&self, sql: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Ident && self.text(sql).eq_ignore_ascii_case(keyword)
    }
}

/// Tokenize a statement. Comments are skipped; unterminated constructs take
/// the rest of the input rather than erroring, matching the forgiving
/// behavior clients expect from a proxy.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Line comment.
        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        // Block comment, nesting allowed.
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let mut depth = 1;
            i += 2;
            while i < bytes.len() && depth > 0 {
                if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                    depth += 1;
                    i += 2;
                } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            continue;
        }

        let start = i;

        // Quoted identifier; "" is an escaped quote.
        if c == b'"' {
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'"' {
                    if bytes.get(i + 1) == Some(&b'"') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::QuotedIdent,
                start,
                end: i,
            });
            continue;
        }

        // String literal; '' is an escaped quote. E'...' additionally
        // honors backslash escapes.
        let escape_string = (c == b'e' || c == b'E') && bytes.get(i + 1) == Some(&b'\'');
        if c == b'\'' || escape_string {
            i += if escape_string { 2 } else { 1 };
            while i < bytes.len() {
                if escape_string && bytes[i] == b'\\' {
                    i += 2;
                    continue;
                }
                if bytes[i] == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::StringLiteral,
                start,
                end: i,
            });
            continue;
        }

        // Dollar-quoted string: $tag$ ... $tag$.
        if c == b'$' {
            if let Some(tag_end) = dollar_tag_end(bytes, i) {
                let tag = &sql[i..tag_end];
                let rest = &sql[tag_end..];
                match rest.find(tag) {
                    Some(close) => {
                        let end = tag_end + close + tag.len();
                        tokens.push(Token {
                            kind: TokenKind::StringLiteral,
                            start,
                            end,
                        });
                        i = end;
                    }
                    None => {
                        tokens.push(Token {
                            kind: TokenKind::StringLiteral,
                            start,
                            end: bytes.len(),
                        });
                        i = bytes.len();
                    }
                }
                continue;
            }
            // $n positional parameter.
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Parameter,
                start,
                end: i,
            });
            continue;
        }

        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                start,
                end: i,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Ident,
                start,
                end: i,
            });
            continue;
        }

        i += 1;
        tokens.push(Token {
            kind: TokenKind::Symbol,
            start,
            end: i,
        });
    }

    tokens
}

/// If position `i` starts a `$tag$` opener, return the index just past it.
fn dollar_tag_end(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    if bytes.get(j) == Some(&b'$') {
        Some(j + 1)
    } else {
        None
    }
}

/// Classify a single statement by its leading keywords.
pub fn classify(sql: &str) -> StatementKind {
    let tokens = tokenize(sql);
    let first = match tokens.first() {
        Some(token) if token.kind == TokenKind::Ident => token.text(sql).to_ascii_lowercase(),
        _ => return StatementKind::Other,
    };

    match first.as_str() {
        "select" | "with" | "values" | "table" | "explain" | "analyze" => StatementKind::Query,
        "insert" | "update" | "delete" => StatementKind::Dml,
        "create" | "drop" | "alter" | "grant" | "revoke" | "truncate" => StatementKind::Ddl,
        "copy" => StatementKind::Copy,
        "begin" | "start" => StatementKind::Begin,
        "commit" | "end" => StatementKind::Commit,
        "rollback" | "abort" => StatementKind::Rollback,
        "show" => StatementKind::Show,
        "set" => StatementKind::Set,
        "reset" | "deallocate" | "discard" => StatementKind::ClientSide,
        _ => StatementKind::Other,
    }
}

/// Split a simple-query string at unquoted semicolons. Empty fragments are
/// dropped; a batch of only whitespace yields no statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    let tokens = tokenize(sql);
    let mut statements = Vec::new();
    let mut fragment_start = 0;

    for token in &tokens {
        if token.kind == TokenKind::Symbol && token.text(sql) == ";" {
            let fragment = sql[fragment_start..token.start].trim();
            if !fragment.is_empty() {
                statements.push(fragment.to_string());
            }
            fragment_start = token.end;
        }
    }
    let tail = sql[fragment_start..].trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

/// Unquote an identifier: `"Name"` preserves case, unquoted folds to
/// lowercase.
pub fn unquote_identifier(identifier: &str) -> String {
    if identifier.len() >= 2 && identifier.starts_with('"') && identifier.ends_with('"') {
        identifier[1..identifier.len() - 1].replace("\"\"", "\"")
    } else {
        identifier.to_ascii_lowercase()
    }
}

/// A possibly schema-qualified table or index name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOrIndexName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableOrIndexName {
    pub fn new(name: impl Into<String>) -> TableOrIndexName {
        TableOrIndexName {
            schema: None,
            name: name.into(),
        }
    }

    /// The unquoted object name, schema ignored.
    pub fn unquoted_name(&self) -> String {
        unquote_identifier(&self.name)
    }
}

impl std::fmt::Display for TableOrIndexName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Read a (possibly qualified) object name starting at token `index`.
/// Returns the parsed name and the index of the first token after it.
pub fn parse_object_name(
    sql: &str,
    tokens: &[Token],
    index: usize,
) -> Option<(TableOrIndexName, usize)> {
    let first = tokens.get(index)?;
    if first.kind != TokenKind::Ident && first.kind != TokenKind::QuotedIdent {
        return None;
    }
    let first_text = first.text(sql).to_string();

    if let Some(dot) = tokens.get(index + 1) {
        if dot.kind == TokenKind::Symbol && dot.text(sql) == "." {
            let second = tokens.get(index + 2)?;
            if second.kind == TokenKind::Ident || second.kind == TokenKind::QuotedIdent {
                return Some((
                    TableOrIndexName {
                        schema: Some(first_text),
                        name: second.text(sql).to_string(),
                    },
                    index + 3,
                ));
            }
            return None;
        }
    }

    Some((TableOrIndexName::new(first_text), index + 1))
}

/// Detect statements the backend rejects outright. Returns the error to
/// report, or None when the statement is acceptable.
pub fn check_unsupported(sql: &str) -> Option<PgError> {
    let tokens = tokenize(sql);
    let first = tokens.first()?;

    if first.is_keyword(sql, "savepoint") || first.is_keyword(sql, "release") {
        return Some(PgError::new(
            SqlState::FeatureNotSupported,
            "savepoints are not supported",
        ));
    }
    if first.is_keyword(sql, "declare") {
        return Some(PgError::new(
            SqlState::FeatureNotSupported,
            "server-side cursors are not supported",
        ));
    }

    if first.is_keyword(sql, "select") || first.is_keyword(sql, "with") {
        let mut iter = tokens.iter().peekable();
        while let Some(token) = iter.next() {
            if token.is_keyword(sql, "for") {
                if let Some(next) = iter.peek() {
                    if next.is_keyword(sql, "update") || next.is_keyword(sql, "share") {
                        return Some(PgError::new(
                            SqlState::FeatureNotSupported,
                            "SELECT ... FOR UPDATE is not supported",
                        ));
                    }
                }
            }
        }
    }

    if first.is_keyword(sql, "insert") {
        let mut iter = tokens.iter().peekable();
        while let Some(token) = iter.next() {
            if token.is_keyword(sql, "on") {
                if let Some(next) = iter.peek() {
                    if next.is_keyword(sql, "conflict") {
                        return Some(PgError::new(
                            SqlState::FeatureNotSupported,
                            "INSERT ... ON CONFLICT is not supported",
                        ));
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("SELECT 1"), StatementKind::Query);
        assert_eq!(classify("  with t as (select 1) select * from t"), StatementKind::Query);
        assert_eq!(classify("INSERT INTO t VALUES (1)"), StatementKind::Dml);
        assert_eq!(classify("update t set a = 1"), StatementKind::Dml);
        assert_eq!(classify("create table t (id bigint)"), StatementKind::Ddl);
        assert_eq!(classify("DROP INDEX i"), StatementKind::Ddl);
        assert_eq!(classify("COPY t FROM STDIN"), StatementKind::Copy);
        assert_eq!(classify("BEGIN"), StatementKind::Begin);
        assert_eq!(classify("start transaction"), StatementKind::Begin);
        assert_eq!(classify("COMMIT"), StatementKind::Commit);
        assert_eq!(classify("rollback"), StatementKind::Rollback);
        assert_eq!(classify("SHOW server_version"), StatementKind::Show);
        assert_eq!(classify("SET application_name = 'x'"), StatementKind::Set);
        assert_eq!(classify("RESET all"), StatementKind::ClientSide);
        assert_eq!(classify("-- only a comment"), StatementKind::Other);
        assert_eq!(classify(""), StatementKind::Other);
    }

    #[test]
    fn test_classify_skips_comments() {
        assert_eq!(
            classify("/* leading */ -- another\nSELECT 1"),
            StatementKind::Query
        );
        assert_eq!(
            classify("/* nested /* comment */ still */ insert into t values (1)"),
            StatementKind::Dml
        );
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(
            split_statements("SELECT 1; SELECT 2;"),
            vec!["SELECT 1", "SELECT 2"]
        );
        assert_eq!(
            split_statements("select ';'; select 2"),
            vec!["select ';'", "select 2"]
        );
        assert_eq!(
            split_statements("select \";\"; select 2"),
            vec!["select \";\"", "select 2"]
        );
        assert_eq!(
            split_statements("select $$a;b$$; select 2"),
            vec!["select $$a;b$$", "select 2"]
        );
        assert_eq!(
            split_statements("select 1 -- trailing; comment\n; select 2"),
            vec!["select 1 -- trailing; comment", "select 2"]
        );
        assert_eq!(split_statements("  ;;  "), Vec::<String>::new());
    }

    #[test]
    fn test_dollar_quotes_with_tag() {
        assert_eq!(
            split_statements("select $fn$ body; still body $fn$; select 2"),
            vec!["select $fn$ body; still body $fn$", "select 2"]
        );
    }

    #[test]
    fn test_escape_string_literals() {
        // The \' inside an E-string does not terminate it.
        assert_eq!(
            split_statements("select E'a\\';b'; select 2"),
            vec!["select E'a\\';b'", "select 2"]
        );
    }

    #[test]
    fn test_unquote_identifier() {
        assert_eq!(unquote_identifier("foo"), "foo");
        assert_eq!(unquote_identifier("FOO"), "foo");
        assert_eq!(unquote_identifier("Foo"), "foo");
        assert_eq!(unquote_identifier("\"foo\""), "foo");
        assert_eq!(unquote_identifier("\"FOO\""), "FOO");
        assert_eq!(unquote_identifier("\"Foo\""), "Foo");
        assert_eq!(unquote_identifier(""), "");
        assert_eq!(unquote_identifier("a"), "a");
        assert_eq!(unquote_identifier("\"\""), "");
    }

    #[test]
    fn test_parse_object_name() {
        let sql = "create table s.\"Foo\" (id int)";
        let tokens = tokenize(sql);
        let (name, next) = parse_object_name(sql, &tokens, 2).unwrap();
        assert_eq!(name.schema.as_deref(), Some("s"));
        assert_eq!(name.name, "\"Foo\"");
        assert_eq!(tokens[next].text(sql), "(");
    }

    #[test]
    fn test_check_unsupported() {
        assert!(check_unsupported("savepoint a").is_some());
        assert!(check_unsupported("select * from t for update").is_some());
        assert!(check_unsupported("select * from t for share").is_some());
        assert!(check_unsupported("insert into t values (1) on conflict do nothing").is_some());
        assert!(check_unsupported("declare c cursor for select 1").is_some());
        assert!(check_unsupported("select 1").is_none());
        // "for update" inside a string literal is fine.
        assert!(check_unsupported("select 'for update'").is_none());
    }
}
