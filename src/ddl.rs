// DDL translation for a backend without `IF [NOT] EXISTS` and with unnamed
// primary-key constraints. `IF NOT EXISTS` / `IF EXISTS` are emulated with
// existence checks; a primary-key constraint named exactly `pk_<table>` is
// reduced to a bare `primary key` clause.

// Internal crate imports
use crate::backend::BackendSession;
use crate::errors::PgError;
use crate::sql::{self, Token, TokenKind};

/// The translated statement, or None when the statement is a no-op because
/// the object already exists (or is already gone).
pub async fn translate(
    backend: &mut (dyn BackendSession + '_),
    sql_text: &str,
) -> Result<Option<String>, PgError> {
    let tokens = sql::tokenize(sql_text);

    let translated = match detect(sql_text, &tokens) {
        Some(DdlShape::CreateTable { conditional, name_at }) => {
            apply_conditional(
                backend,
                sql_text,
                &tokens,
                conditional,
                name_at,
                Existence::Table,
                // create: skip when the object exists.
                true,
            )
            .await?
        }
        Some(DdlShape::CreateIndex { conditional, name_at }) => {
            apply_conditional(
                backend,
                sql_text,
                &tokens,
                conditional,
                name_at,
                Existence::Index,
                true,
            )
            .await?
        }
        Some(DdlShape::DropTable { conditional, name_at }) => {
            apply_conditional(
                backend,
                sql_text,
                &tokens,
                conditional,
                name_at,
                Existence::Table,
                // drop: skip when the object is missing.
                false,
            )
            .await?
        }
        Some(DdlShape::DropIndex { conditional, name_at }) => {
            apply_conditional(
                backend,
                sql_text,
                &tokens,
                conditional,
                name_at,
                Existence::Index,
                false,
            )
            .await?
        }
        None => Some(sql_text.to_string()),
    };

    Ok(translated.map(|sql_text| maybe_remove_primary_key_constraint_name(&sql_text)))
}

enum DdlShape {
    CreateTable { conditional: Option<(usize, usize)>, name_at: usize },
    CreateIndex { conditional: Option<(usize, usize)>, name_at: usize },
    DropTable { conditional: Option<(usize, usize)>, name_at: usize },
    DropIndex { conditional: Option<(usize, usize)>, name_at: usize },
}

enum Existence {
    Table,
    Index,
}

fn detect(sql_text: &str, tokens: &[Token]) -> Option<DdlShape> {
    let first = tokens.first()?;

    if first.is_keyword(sql_text, "create") {
        let second = tokens.get(1)?;
        if second.is_keyword(sql_text, "table") {
            let (conditional, name_at) = conditional_at(sql_text, tokens, 2, &["if", "not", "exists"]);
            return Some(DdlShape::CreateTable { conditional, name_at });
        }
        if second.is_keyword(sql_text, "unique")
            && tokens.get(2).map(|t| t.is_keyword(sql_text, "index")) == Some(true)
        {
            let (conditional, name_at) = conditional_at(sql_text, tokens, 3, &["if", "not", "exists"]);
            return Some(DdlShape::CreateIndex { conditional, name_at });
        }
        if second.is_keyword(sql_text, "index") {
            let (conditional, name_at) = conditional_at(sql_text, tokens, 2, &["if", "not", "exists"]);
            return Some(DdlShape::CreateIndex { conditional, name_at });
        }
        return None;
    }

    if first.is_keyword(sql_text, "drop") {
        let second = tokens.get(1)?;
        if second.is_keyword(sql_text, "table") {
            let (conditional, name_at) = conditional_at(sql_text, tokens, 2, &["if", "exists"]);
            return Some(DdlShape::DropTable { conditional, name_at });
        }
        if second.is_keyword(sql_text, "index") {
            let (conditional, name_at) = conditional_at(sql_text, tokens, 2, &["if", "exists"]);
            return Some(DdlShape::DropIndex { conditional, name_at });
        }
    }

    None
}

/// If the keywords at `start` spell the conditional clause, return its token
/// range and the index of the object name after it.
fn conditional_at(
    sql_text: &str,
    tokens: &[Token],
    start: usize,
    keywords: &[&str],
) -> (Option<(usize, usize)>, usize) {
    for (offset, keyword) in keywords.iter().enumerate() {
        match tokens.get(start + offset) {
            Some(token) if token.is_keyword(sql_text, keyword) => (),
            _ => return (None, start),
        }
    }
    (
        Some((start, start + keywords.len() - 1)),
        start + keywords.len(),
    )
}

async fn apply_conditional(
    backend: &mut (dyn BackendSession + '_),
    sql_text: &str,
    tokens: &[Token],
    conditional: Option<(usize, usize)>,
    name_at: usize,
    existence: Existence,
    skip_when_exists: bool,
) -> Result<Option<String>, PgError> {
    let (first, _last) = match conditional {
        Some(range) => range,
        // Unconditional statements pass through untouched.
        None => return Ok(Some(sql_text.to_string())),
    };

    // A dangling conditional with no object name after it is not ours to
    // fix; let the backend report the syntax error.
    let (name, _) = match sql::parse_object_name(sql_text, tokens, name_at) {
        Some(parsed) => parsed,
        None => return Ok(Some(sql_text.to_string())),
    };

    let exists = match existence {
        Existence::Table => backend.table_exists(&name).await?,
        Existence::Index => backend.index_exists(&name).await?,
    };

    if exists == skip_when_exists {
        return Ok(None);
    }

    // Strip the conditional clause: from its first keyword to the start of
    // the object name.
    let mut out = String::with_capacity(sql_text.len());
    out.push_str(&sql_text[..tokens[first].start]);
    out.push_str(&sql_text[tokens[name_at].start..]);
    Ok(Some(out))
}

/// Remove `CONSTRAINT pk_<table>` ahead of a `PRIMARY KEY` clause in a
/// `create table` statement, when and only when the constraint name matches
/// the table name with a `pk_` prefix (case-insensitively). Any other named
/// constraint is left alone.
pub fn maybe_remove_primary_key_constraint_name(sql_text: &str) -> String {
    let tokens = sql::tokenize(sql_text);

    if tokens.len() < 3
        || !tokens[0].is_keyword(sql_text, "create")
        || !tokens[1].is_keyword(sql_text, "table")
    {
        return sql_text.to_string();
    }
    let (table, _) = match sql::parse_object_name(sql_text, &tokens, 2) {
        Some(parsed) => parsed,
        None => return sql_text.to_string(),
    };
    let implicit_name = format!("pk_{}", table.unquoted_name());

    for window in 0..tokens.len().saturating_sub(3) {
        let constraint = &tokens[window];
        let name = &tokens[window + 1];
        let primary = &tokens[window + 2];
        let key = &tokens[window + 3];

        if constraint.is_keyword(sql_text, "constraint")
            && (name.kind == TokenKind::Ident || name.kind == TokenKind::QuotedIdent)
            && primary.is_keyword(sql_text, "primary")
            && key.is_keyword(sql_text, "key")
            && sql::unquote_identifier(name.text(sql_text)).eq_ignore_ascii_case(&implicit_name)
        {
            let mut out = String::with_capacity(sql_text.len());
            out.push_str(&sql_text[..constraint.start]);
            out.push_str(&sql_text[name.end..]);
            return out;
        }
    }

    sql_text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::Column;
    use crate::parsers::oid;

    async fn run(backend: &mut MemoryBackend, sql_text: &str) -> Option<String> {
        translate(backend, sql_text).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_table_not_exists() {
        let mut backend = MemoryBackend::new();

        for (input, expected) in [
            ("create table foo (id int)", "create table foo (id int)"),
            ("create table foo(id int)", "create table foo(id int)"),
            ("create table \"Foo\" (id int)", "create table \"Foo\" (id int)"),
            ("create table s.foo (id int)", "create table s.foo (id int)"),
            (
                "create table \"s\".\"Foo\" (id int)",
                "create table \"s\".\"Foo\" (id int)",
            ),
            ("create table", "create table"),
            ("create table ", "create table "),
            (
                "create table if not exists foo (id int)",
                "create table foo (id int)",
            ),
            (
                "create table if not exists \"Foo\" (id int)",
                "create table \"Foo\" (id int)",
            ),
            (
                "create table if not exists s.foo (id int)",
                "create table s.foo (id int)",
            ),
            ("create table if not exists", "create table if not exists"),
        ] {
            assert_eq!(run(&mut backend, input).await.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_create_table_exists() {
        let mut backend = MemoryBackend::new()
            .with_table("foo", vec![Column::new("id", oid::INT4)])
            .with_table("Foo", vec![Column::new("id", oid::INT4)]);

        assert_eq!(
            run(&mut backend, "create table foo (id int)").await.as_deref(),
            Some("create table foo (id int)")
        );
        assert_eq!(run(&mut backend, "create table if not exists foo (id int)").await, None);
        assert_eq!(
            run(&mut backend, "create table if not exists \"Foo\" (id int)").await,
            None
        );
        assert_eq!(
            run(&mut backend, "create table if not exists").await.as_deref(),
            Some("create table if not exists")
        );
    }

    #[tokio::test]
    async fn test_create_index_conditional() {
        let mut backend = MemoryBackend::new().with_index("foo");

        assert_eq!(
            run(&mut backend, "create index foo on bar(id)").await.as_deref(),
            Some("create index foo on bar(id)")
        );
        assert_eq!(
            run(&mut backend, "create index if not exists foo on bar(id)").await,
            None
        );
        assert_eq!(
            run(&mut backend, "create unique index if not exists foo on bar(id)").await,
            None
        );
        assert_eq!(
            run(&mut backend, "create index if not exists missing on bar(id)")
                .await
                .as_deref(),
            Some("create index missing on bar(id)")
        );
        assert_eq!(
            run(&mut backend, "create unique index if not exists missing on bar(id)")
                .await
                .as_deref(),
            Some("create unique index missing on bar(id)")
        );
    }

    #[tokio::test]
    async fn test_drop_table_conditional() {
        let mut backend = MemoryBackend::new().with_table("foo", vec![]);

        assert_eq!(
            run(&mut backend, "drop table foo").await.as_deref(),
            Some("drop table foo")
        );
        assert_eq!(
            run(&mut backend, "drop table if exists foo").await.as_deref(),
            Some("drop table foo")
        );
        assert_eq!(run(&mut backend, "drop table if exists missing").await, None);
        assert_eq!(
            run(&mut backend, "drop table if exists").await.as_deref(),
            Some("drop table if exists")
        );
    }

    #[tokio::test]
    async fn test_drop_index_conditional() {
        let mut backend = MemoryBackend::new().with_index("foo");

        assert_eq!(
            run(&mut backend, "drop index if exists foo").await.as_deref(),
            Some("drop index foo")
        );
        assert_eq!(run(&mut backend, "drop index if exists missing").await, None);
    }

    #[test]
    fn test_remove_primary_key_constraint_name() {
        // Plain primary keys stay as they are.
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint primary key, value text)"
            ),
            "create table foo (id bigint primary key, value text)"
        );
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint, value text, primary key (id))"
            ),
            "create table foo (id bigint, value text, primary key (id))"
        );

        // Other named constraints stay.
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint primary key, value text, constraint chk_bar check (length(value) < 100))"
            ),
            "create table foo (id bigint primary key, value text, constraint chk_bar check (length(value) < 100))"
        );
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint, value text, constraint pk_a1b2 primary key (id) )"
            ),
            "create table foo (id bigint, value text, constraint pk_a1b2 primary key (id) )"
        );

        // The implicit name is stripped.
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint, value text, constraint pk_foo primary key (id) )"
            ),
            "create table foo (id bigint, value text,  primary key (id) )"
        );
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table foo (id bigint, value text, constraint pk_foo primary key (id), constraint fk_bar foreign key (value) references bar (id))"
            ),
            "create table foo (id bigint, value text,  primary key (id), constraint fk_bar foreign key (value) references bar (id))"
        );
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "create table public.foo (id bigint, value text, constraint pk_foo primary key (id) )"
            ),
            "create table public.foo (id bigint, value text,  primary key (id) )"
        );

        // Quoted identifiers; the comparison ignores case.
        assert_eq!(
            maybe_remove_primary_key_constraint_name(
                "CREATE TABLE \"user\" (\"id\" integer NOT NULL, CONSTRAINT \"PK_user\" PRIMARY KEY (\"id\"))"
            ),
            "CREATE TABLE \"user\" (\"id\" integer NOT NULL,  PRIMARY KEY (\"id\"))"
        );
    }
}
