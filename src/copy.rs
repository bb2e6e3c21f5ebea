// COPY ... FROM STDIN: statement parsing and the streaming mutation writer.
// The writer parses rows incrementally, carrying partial lines across
// CopyData frames, converts each complete row through the value parsers and
// batches mutations up to row/byte thresholds before handing them to the
// backend.

// External crate imports
use bytes::{Buf, BytesMut};
use chrono_tz::Tz;

// Internal crate imports
use crate::backend::{BackendSession, Column, Mutation, MutationOp};
use crate::errors::{PgError, SqlState};
use crate::parsers::{self, FormatCode};
use crate::sql::{self, TableOrIndexName, TokenKind};

/// Rows buffered before they are pushed to the backend.
pub const COPY_BATCH_ROWS: usize = 1000;
/// Payload bytes buffered before the batch is pushed regardless of rows.
pub const COPY_BATCH_BYTES: usize = 1 << 20;

const BINARY_SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Csv,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyOptions {
    pub format: CopyFormat,
    pub delimiter: u8,
    pub null: String,
    pub quote: u8,
    pub escape: u8,
    pub header: bool,
}

impl CopyOptions {
    fn text() -> CopyOptions {
        CopyOptions {
            format: CopyFormat::Text,
            delimiter: b'\t',
            null: "\\N".to_string(),
            quote: b'"',
            escape: b'"',
            header: false,
        }
    }

    fn csv() -> CopyOptions {
        CopyOptions {
            format: CopyFormat::Csv,
            delimiter: b',',
            null: String::new(),
            quote: b'"',
            escape: b'"',
            header: false,
        }
    }
}

/// A parsed `COPY <table> [(columns)] FROM STDIN [WITH (...)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyStatement {
    pub table: TableOrIndexName,
    pub columns: Option<Vec<String>>,
    pub options: CopyOptions,
}

impl CopyStatement {
    pub fn parse(sql_text: &str) -> Result<CopyStatement, PgError> {
        let tokens = sql::tokenize(sql_text);
        let syntax_error = || {
            PgError::new(
                SqlState::SyntaxError,
                format!("syntax error in COPY statement: \"{sql_text}\""),
            )
        };

        if tokens.first().map(|t| t.is_keyword(sql_text, "copy")) != Some(true) {
            return Err(syntax_error());
        }

        let (table, mut index) =
            sql::parse_object_name(sql_text, &tokens, 1).ok_or_else(syntax_error)?;

        // Optional column list.
        let mut columns = None;
        if is_symbol(&tokens, index, sql_text, "(") {
            let mut names = Vec::new();
            index += 1;
            loop {
                let token = tokens.get(index).ok_or_else(syntax_error)?;
                match token.kind {
                    TokenKind::Ident | TokenKind::QuotedIdent => {
                        names.push(sql::unquote_identifier(token.text(sql_text)));
                        index += 1;
                    }
                    _ => return Err(syntax_error()),
                }
                if is_symbol(&tokens, index, sql_text, ",") {
                    index += 1;
                    continue;
                }
                if is_symbol(&tokens, index, sql_text, ")") {
                    index += 1;
                    break;
                }
                return Err(syntax_error());
            }
            columns = Some(names);
        }

        let from = tokens.get(index).ok_or_else(syntax_error)?;
        if from.is_keyword(sql_text, "to") {
            return Err(PgError::new(
                SqlState::FeatureNotSupported,
                "COPY TO is not supported",
            ));
        }
        if !from.is_keyword(sql_text, "from") {
            return Err(syntax_error());
        }
        let stdin = tokens.get(index + 1).ok_or_else(syntax_error)?;
        if !stdin.is_keyword(sql_text, "stdin") {
            return Err(PgError::new(
                SqlState::FeatureNotSupported,
                "COPY only supports FROM STDIN",
            ));
        }
        index += 2;

        let options = parse_copy_options(sql_text, &tokens, index)?;

        Ok(CopyStatement {
            table,
            columns,
            options,
        })
    }

    /// Per-column format codes for the CopyInResponse.
    pub fn column_formats(&self, column_count: usize) -> Vec<i16> {
        let format = if self.options.format == CopyFormat::Binary {
            1
        } else {
            0
        };
        vec![format; column_count]
    }
}

fn is_symbol(tokens: &[sql::Token], index: usize, sql_text: &str, symbol: &str) -> bool {
    tokens
        .get(index)
        .map(|t| t.kind == TokenKind::Symbol && t.text(sql_text) == symbol)
        .unwrap_or(false)
}

fn parse_copy_options(
    sql_text: &str,
    tokens: &[sql::Token],
    mut index: usize,
) -> Result<CopyOptions, PgError> {
    let mut options = CopyOptions::text();

    if tokens.get(index).map(|t| t.is_keyword(sql_text, "with")) == Some(true) {
        index += 1;
    }
    // Legacy bare CSV / BINARY keywords.
    if let Some(token) = tokens.get(index) {
        if token.is_keyword(sql_text, "csv") {
            return Ok(CopyOptions::csv());
        }
        if token.is_keyword(sql_text, "binary") {
            options.format = CopyFormat::Binary;
            return Ok(options);
        }
    }
    if !is_symbol(tokens, index, sql_text, "(") {
        return Ok(options);
    }
    index += 1;

    let syntax_error = || {
        PgError::new(
            SqlState::SyntaxError,
            format!("invalid COPY options: \"{sql_text}\""),
        )
    };

    while index < tokens.len() {
        let name_token = tokens.get(index).ok_or_else(syntax_error)?;
        let name = name_token.text(sql_text).to_ascii_lowercase();
        index += 1;

        match name.as_str() {
            "format" => {
                let value = tokens.get(index).ok_or_else(syntax_error)?;
                let value_text = value.text(sql_text).to_ascii_lowercase();
                index += 1;
                match value_text.as_str() {
                    "text" => {}
                    "csv" => {
                        let header = options.header;
                        options = CopyOptions::csv();
                        options.header = header;
                    }
                    "binary" => options.format = CopyFormat::Binary,
                    _ => {
                        return Err(PgError::new(
                            SqlState::SyntaxError,
                            format!("COPY format \"{value_text}\" not recognized"),
                        ))
                    }
                }
            }
            "delimiter" | "quote" | "escape" => {
                let value = tokens.get(index).ok_or_else(syntax_error)?;
                if value.kind != TokenKind::StringLiteral {
                    return Err(syntax_error());
                }
                let text = value.text(sql_text);
                let inner = text[1..text.len() - 1].replace("''", "'");
                if inner.len() != 1 {
                    return Err(PgError::new(
                        SqlState::SyntaxError,
                        format!("COPY {name} must be a single character"),
                    ));
                }
                let byte = inner.as_bytes()[0];
                match name.as_str() {
                    "delimiter" => options.delimiter = byte,
                    "quote" => options.quote = byte,
                    _ => options.escape = byte,
                }
                index += 1;
            }
            "null" => {
                let value = tokens.get(index).ok_or_else(syntax_error)?;
                if value.kind != TokenKind::StringLiteral {
                    return Err(syntax_error());
                }
                let text = value.text(sql_text);
                options.null = text[1..text.len() - 1].replace("''", "'");
                index += 1;
            }
            "header" => {
                // HEADER with no value means true.
                options.header = match tokens.get(index) {
                    Some(t)
                        if t.is_keyword(sql_text, "true")
                            || t.is_keyword(sql_text, "on") =>
                    {
                        index += 1;
                        true
                    }
                    Some(t)
                        if t.is_keyword(sql_text, "false")
                            || t.is_keyword(sql_text, "off") =>
                    {
                        index += 1;
                        false
                    }
                    _ => true,
                }
            }
            _ => {
                return Err(PgError::new(
                    SqlState::SyntaxError,
                    format!("option \"{name}\" not recognized"),
                ))
            }
        }

        if is_symbol(tokens, index, sql_text, ",") {
            index += 1;
            continue;
        }
        if is_symbol(tokens, index, sql_text, ")") {
            break;
        }
    }

    Ok(options)
}

/// Streaming converter from COPY payload bytes to backend mutations.
#[derive(Debug)]
pub struct MutationWriter {
    table: String,
    columns: Vec<Column>,
    options: CopyOptions,
    timezone: Tz,
    /// Partial data carried across CopyData frames.
    carry: BytesMut,
    /// Rows converted but not yet pushed to the backend.
    batch: Vec<Mutation>,
    batch_bytes: usize,
    /// Commit after every pushed batch instead of at CopyDone.
    partitioned: bool,
    row_count: u64,
    /// Binary COPY: signature and header still pending.
    binary_header_pending: bool,
    /// CSV: header row still pending.
    skip_header_row: bool,
    /// Saw the end-of-data marker; remaining payload is drained.
    done: bool,
    /// A mid-stream error; payloads are drained but not applied.
    pub error: Option<PgError>,
}

impl MutationWriter {
    pub fn new(
        statement: &CopyStatement,
        table_columns: Vec<Column>,
        timezone: Tz,
        partitioned: bool,
    ) -> Result<MutationWriter, PgError> {
        let columns = match &statement.columns {
            None => table_columns,
            Some(names) => {
                let mut selected = Vec::with_capacity(names.len());
                for name in names {
                    let column = table_columns
                        .iter()
                        .find(|c| c.name == *name)
                        .ok_or_else(|| {
                            PgError::new(
                                SqlState::UndefinedObject,
                                format!(
                                    "column \"{name}\" of relation \"{}\" does not exist",
                                    statement.table
                                ),
                            )
                        })?;
                    selected.push(column.clone());
                }
                selected
            }
        };

        Ok(MutationWriter {
            table: statement.table.unquoted_name(),
            columns,
            options: statement.options.clone(),
            timezone,
            carry: BytesMut::new(),
            batch: Vec::new(),
            batch_bytes: 0,
            partitioned,
            row_count: 0,
            binary_header_pending: statement.options.format == CopyFormat::Binary,
            skip_header_row: statement.options.header,
            done: false,
            error: None,
        })
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Number of columns each row must supply.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Append one CopyData payload, converting every complete row in it.
    /// After a row error the remaining stream is drained without applying.
    pub async fn add_copy_data(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
        payload: &[u8],
    ) -> Result<(), PgError> {
        if self.error.is_some() || self.done {
            return Ok(());
        }
        self.carry.extend_from_slice(payload);

        let result = match self.options.format {
            CopyFormat::Binary => self.drain_binary(backend).await,
            _ => self.drain_lines(backend).await,
        };
        if let Err(err) = result {
            self.error = Some(err);
            self.carry.clear();
        }
        Ok(())
    }

    /// CopyDone: convert any final partial row, push the remaining batch and
    /// commit. The sticky error, if any, surfaces here.
    pub async fn commit(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
    ) -> Result<u64, PgError> {
        if let Some(err) = self.error.take() {
            backend.rollback().await?;
            return Err(err);
        }

        if !self.done && !self.carry.is_empty() && self.options.format != CopyFormat::Binary {
            // Final line without a trailing newline.
            let line = self.carry.split();
            if let Some(mutation) = self.final_row(&line).transpose()? {
                self.push_row(backend, mutation).await?;
            }
        }

        self.push_batch(backend).await?;
        backend.flush_mutations().await?;
        Ok(self.row_count)
    }

    /// CopyFail: drop everything buffered.
    pub async fn rollback(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
    ) -> Result<(), PgError> {
        self.carry.clear();
        self.batch.clear();
        self.batch_bytes = 0;
        self.error = None;
        backend.rollback().await
    }

    async fn drain_lines(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
    ) -> Result<(), PgError> {
        loop {
            let newline = match find_row_end(&self.carry, &self.options) {
                Some(index) => index,
                None => return Ok(()),
            };
            let line = self.carry.split_to(newline + 1);
            let line = &line[..line.len() - 1];
            // Tolerate \r\n row terminators.
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if self.done {
                continue;
            }
            if line == b"\\." {
                self.done = true;
                continue;
            }
            if self.skip_header_row {
                self.skip_header_row = false;
                continue;
            }
            if line.is_empty() && self.options.format == CopyFormat::Csv {
                continue;
            }

            let mutation = self.row_to_mutation(line)?;
            self.push_row(backend, mutation).await?;
        }
    }

    fn final_row(&mut self, line: &[u8]) -> Option<Result<Mutation, PgError>> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line == b"\\." {
            return None;
        }
        if self.skip_header_row {
            self.skip_header_row = false;
            return None;
        }
        Some(self.row_to_mutation(line))
    }

    fn row_to_mutation(&self, line: &[u8]) -> Result<Mutation, PgError> {
        let fields = match self.options.format {
            CopyFormat::Csv => split_csv_fields(line, &self.options),
            _ => split_text_fields(line, &self.options),
        }?;

        if fields.len() != self.columns.len() {
            return Err(PgError::new(
                SqlState::ProtocolViolation,
                format!(
                    "row contains {} columns, table \"{}\" expects {}",
                    fields.len(),
                    self.table,
                    self.columns.len()
                ),
            ));
        }

        let mut values = Vec::with_capacity(fields.len());
        for (field, column) in fields.into_iter().zip(&self.columns) {
            let value = match field {
                None => parsers::Value::Null,
                Some(text) => parsers::decode(
                    text.as_bytes(),
                    FormatCode::Text,
                    column.type_oid,
                    self.timezone,
                )?,
            };
            values.push(value);
        }

        Ok(Mutation {
            table: self.table.clone(),
            op: MutationOp::Insert,
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
            values,
        })
    }

    async fn push_row(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
        mutation: Mutation,
    ) -> Result<(), PgError> {
        self.batch_bytes += mutation
            .values
            .iter()
            .map(std::mem::size_of_val)
            .sum::<usize>();
        self.batch.push(mutation);
        self.row_count += 1;

        if self.batch.len() >= COPY_BATCH_ROWS || self.batch_bytes >= COPY_BATCH_BYTES {
            self.push_batch(backend).await?;
            if self.partitioned {
                // Periodic commit keeps arbitrarily large loads possible.
                backend.flush_mutations().await?;
            }
        }
        Ok(())
    }

    async fn push_batch(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
    ) -> Result<(), PgError> {
        for mutation in self.batch.drain(..) {
            backend.buffer_mutation(mutation).await?;
        }
        self.batch_bytes = 0;
        Ok(())
    }

    async fn drain_binary(
        &mut self,
        backend: &mut (dyn BackendSession + '_),
    ) -> Result<(), PgError> {
        if self.binary_header_pending {
            // Signature + flags + header extension length.
            let header_len = BINARY_SIGNATURE.len() + 8;
            if self.carry.len() < header_len {
                return Ok(());
            }
            if &self.carry[..BINARY_SIGNATURE.len()] != BINARY_SIGNATURE {
                return Err(PgError::new(
                    SqlState::ProtocolViolation,
                    "COPY binary signature not recognized",
                ));
            }
            let ext_len = i32::from_be_bytes(
                self.carry[BINARY_SIGNATURE.len() + 4..header_len]
                    .try_into()
                    .unwrap(),
            );
            if ext_len < 0 {
                return Err(PgError::new(
                    SqlState::ProtocolViolation,
                    "invalid COPY binary header",
                ));
            }
            if self.carry.len() < header_len + ext_len as usize {
                return Ok(());
            }
            self.carry.advance(header_len + ext_len as usize);
            self.binary_header_pending = false;
        }

        loop {
            match try_take_binary_row(&mut self.carry, self.columns.len())? {
                BinaryRow::NeedMore => return Ok(()),
                BinaryRow::Trailer => {
                    self.done = true;
                    return Ok(());
                }
                BinaryRow::Row(fields) => {
                    let mut values = Vec::with_capacity(fields.len());
                    for (field, column) in fields.into_iter().zip(&self.columns) {
                        let value = match field {
                            None => parsers::Value::Null,
                            Some(data) => parsers::decode(
                                &data,
                                FormatCode::Binary,
                                column.type_oid,
                                self.timezone,
                            )?,
                        };
                        values.push(value);
                    }
                    let mutation = Mutation {
                        table: self.table.clone(),
                        op: MutationOp::Insert,
                        columns: self.columns.iter().map(|c| c.name.clone()).collect(),
                        values,
                    };
                    self.push_row(backend, mutation).await?;
                }
            }
        }
    }
}

enum BinaryRow {
    NeedMore,
    Trailer,
    Row(Vec<Option<Vec<u8>>>),
}

fn try_take_binary_row(carry: &mut BytesMut, expected: usize) -> Result<BinaryRow, PgError> {
    if carry.len() < 2 {
        return Ok(BinaryRow::NeedMore);
    }
    let field_count = i16::from_be_bytes(carry[..2].try_into().unwrap());
    if field_count == -1 {
        carry.advance(2);
        return Ok(BinaryRow::Trailer);
    }
    if field_count as usize != expected {
        return Err(PgError::new(
            SqlState::ProtocolViolation,
            format!("row field count {field_count}, expected {expected}"),
        ));
    }

    // First pass: make sure the whole tuple is buffered.
    let mut offset = 2;
    for _ in 0..field_count {
        if carry.len() < offset + 4 {
            return Ok(BinaryRow::NeedMore);
        }
        let len = i32::from_be_bytes(carry[offset..offset + 4].try_into().unwrap());
        offset += 4;
        if len > 0 {
            if carry.len() < offset + len as usize {
                return Ok(BinaryRow::NeedMore);
            }
            offset += len as usize;
        } else if len < -1 {
            return Err(PgError::new(
                SqlState::ProtocolViolation,
                "invalid field length in COPY binary row",
            ));
        }
    }

    carry.advance(2);
    let mut fields = Vec::with_capacity(expected);
    for _ in 0..field_count {
        let len = i32::from_be_bytes(carry[..4].try_into().unwrap());
        carry.advance(4);
        if len == -1 {
            fields.push(None);
        } else {
            fields.push(Some(carry.split_to(len as usize).to_vec()));
        }
    }
    Ok(BinaryRow::Row(fields))
}

/// Find the index of the row-terminating newline, honoring CSV quoting.
fn find_row_end(carry: &[u8], options: &CopyOptions) -> Option<usize> {
    match options.format {
        CopyFormat::Csv => {
            let mut quoted = false;
            let mut i = 0;
            while i < carry.len() {
                let b = carry[i];
                if quoted {
                    if b == options.escape && carry.get(i + 1) == Some(&options.quote) {
                        i += 2;
                        continue;
                    }
                    if b == options.quote {
                        quoted = false;
                    }
                } else if b == options.quote {
                    quoted = true;
                } else if b == b'\n' {
                    return Some(i);
                }
                i += 1;
            }
            None
        }
        _ => {
            let mut i = 0;
            while i < carry.len() {
                match carry[i] {
                    // An escaped newline is data, not a terminator.
                    b'\\' => i += 2,
                    b'\n' => return Some(i),
                    _ => i += 1,
                }
            }
            None
        }
    }
}

/// Split one text-format row into unescaped fields; None is the null
/// sentinel.
fn split_text_fields(
    line: &[u8],
    options: &CopyOptions,
) -> Result<Vec<Option<String>>, PgError> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut i = 0;
    while i <= line.len() {
        if i == line.len() || line[i] == options.delimiter {
            let text = String::from_utf8(std::mem::take(&mut current)).map_err(|_| {
                PgError::new(SqlState::ProtocolViolation, "invalid UTF-8 in COPY data")
            })?;
            if text == options.null {
                fields.push(None);
            } else {
                fields.push(Some(text));
            }
            i += 1;
            continue;
        }
        if line[i] == b'\\' && i + 1 < line.len() {
            let escaped = line[i + 1];
            current.push(match escaped {
                b't' => b'\t',
                b'n' => b'\n',
                b'r' => b'\r',
                b'b' => 0x08,
                b'f' => 0x0c,
                b'v' => 0x0b,
                other => other,
            });
            i += 2;
            continue;
        }
        current.push(line[i]);
        i += 1;
    }
    Ok(fields)
}

/// Split one CSV row. An unquoted field equal to the null string is null.
fn split_csv_fields(
    line: &[u8],
    options: &CopyOptions,
) -> Result<Vec<Option<String>>, PgError> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut was_quoted = false;
    let mut i = 0;

    let mut finish = |current: &mut Vec<u8>, was_quoted: bool| -> Result<(), PgError> {
        let text = String::from_utf8(std::mem::take(current)).map_err(|_| {
            PgError::new(SqlState::ProtocolViolation, "invalid UTF-8 in COPY data")
        })?;
        if !was_quoted && text == options.null {
            fields.push(None);
        } else {
            fields.push(Some(text));
        }
        Ok(())
    };

    loop {
        if i >= line.len() {
            finish(&mut current, was_quoted)?;
            break;
        }
        let b = line[i];

        if b == options.delimiter {
            finish(&mut current, was_quoted)?;
            was_quoted = false;
            i += 1;
            continue;
        }

        if b == options.quote {
            was_quoted = true;
            i += 1;
            while i < line.len() {
                if line[i] == options.escape
                    && options.escape != options.quote
                    && line.get(i + 1) == Some(&options.quote)
                {
                    current.push(options.quote);
                    i += 2;
                    continue;
                }
                if line[i] == options.quote {
                    if options.escape == options.quote && line.get(i + 1) == Some(&options.quote) {
                        current.push(options.quote);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                current.push(line[i]);
                i += 1;
            }
            continue;
        }

        current.push(b);
        i += 1;
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::parsers::{oid, Value};

    fn keyvalue_statement(sql_text: &str) -> CopyStatement {
        CopyStatement::parse(sql_text).unwrap()
    }

    fn keyvalue_columns() -> Vec<Column> {
        vec![Column::new("id", oid::INT8), Column::new("value", oid::TEXT)]
    }

    fn writer(sql_text: &str) -> MutationWriter {
        MutationWriter::new(
            &keyvalue_statement(sql_text),
            keyvalue_columns(),
            Tz::UTC,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_copy_statement() {
        let statement = keyvalue_statement("COPY keyvalue FROM STDIN");
        assert_eq!(statement.table.name, "keyvalue");
        assert_eq!(statement.columns, None);
        assert_eq!(statement.options.format, CopyFormat::Text);
        assert_eq!(statement.options.delimiter, b'\t');

        let statement = keyvalue_statement("COPY keyvalue (id, value) FROM STDIN WITH (FORMAT CSV, HEADER)");
        assert_eq!(
            statement.columns,
            Some(vec!["id".to_string(), "value".to_string()])
        );
        assert_eq!(statement.options.format, CopyFormat::Csv);
        assert!(statement.options.header);
        assert_eq!(statement.options.delimiter, b',');

        let statement = keyvalue_statement("COPY t FROM STDIN WITH (FORMAT text, DELIMITER '|', NULL 'NIL')");
        assert_eq!(statement.options.delimiter, b'|');
        assert_eq!(statement.options.null, "NIL");

        let statement = keyvalue_statement("COPY t FROM STDIN BINARY");
        assert_eq!(statement.options.format, CopyFormat::Binary);

        assert_eq!(
            CopyStatement::parse("COPY t TO STDOUT").unwrap_err().code,
            SqlState::FeatureNotSupported
        );
        assert!(CopyStatement::parse("COPY FROM STDIN").is_err());
    }

    #[tokio::test]
    async fn test_streaming_partition_independence() {
        // The same byte stream split at arbitrary CopyData boundaries must
        // produce the same mutations.
        let chunks: [&[u8]; 3] = [b"1\t'one'\n2\t", b"'two'\n3\t'th", b"ree'\n4\t'four'\n"];

        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        for chunk in chunks {
            writer.add_copy_data(&mut backend, chunk).await.unwrap();
        }
        let count = writer.commit(&mut backend).await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(backend.committed.len(), 4);
        assert_eq!(backend.committed[0].values[0], Value::Int8(1));
        assert_eq!(backend.committed[3].values[1], Value::Text("'four'".to_string()));

        // Single chunk.
        let mut single_backend = MemoryBackend::new();
        let mut single_writer = writer_for_single();
        let mut all = Vec::new();
        for chunk in chunks {
            all.extend_from_slice(chunk);
        }
        single_writer
            .add_copy_data(&mut single_backend, &all)
            .await
            .unwrap();
        single_writer.commit(&mut single_backend).await.unwrap();
        assert_eq!(single_backend.committed, backend.committed);
    }

    fn writer_for_single() -> MutationWriter {
        writer("COPY keyvalue FROM STDIN")
    }

    #[tokio::test]
    async fn test_null_and_escapes() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        writer
            .add_copy_data(&mut backend, b"1\t\\N\n2\ta\\tb\n")
            .await
            .unwrap();
        writer.commit(&mut backend).await.unwrap();
        assert_eq!(backend.committed[0].values[1], Value::Null);
        assert_eq!(backend.committed[1].values[1], Value::Text("a\tb".to_string()));
    }

    #[tokio::test]
    async fn test_end_of_data_marker() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        writer
            .add_copy_data(&mut backend, b"1\tone\n\\.\n2\tignored\n")
            .await
            .unwrap();
        let count = writer.commit(&mut backend).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_final_line_without_newline() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        writer.add_copy_data(&mut backend, b"1\tone").await.unwrap();
        let count = writer.commit(&mut backend).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(backend.committed[0].values[1], Value::Text("one".to_string()));
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        writer
            .add_copy_data(&mut backend, b"not_a_number\tx\n")
            .await
            .unwrap();
        assert!(writer.error.is_some());
        // Further payloads are drained without effect.
        writer
            .add_copy_data(&mut backend, b"2\ttwo\n")
            .await
            .unwrap();
        let err = writer.commit(&mut backend).await.unwrap_err();
        assert_eq!(err.code, SqlState::InvalidTextRepresentation);
        assert_eq!(backend.committed.len(), 0);
    }

    #[tokio::test]
    async fn test_csv_quoting() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN WITH (FORMAT CSV)");
        writer
            .add_copy_data(&mut backend, b"1,\"a,b\"\n2,\"say \"\"hi\"\"\"\n3,\n")
            .await
            .unwrap();
        writer.commit(&mut backend).await.unwrap();
        assert_eq!(backend.committed[0].values[1], Value::Text("a,b".to_string()));
        assert_eq!(
            backend.committed[1].values[1],
            Value::Text("say \"hi\"".to_string())
        );
        // Unquoted empty CSV field is null.
        assert_eq!(backend.committed[2].values[1], Value::Null);
    }

    #[tokio::test]
    async fn test_csv_header_skipped() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN WITH (FORMAT CSV, HEADER true)");
        writer
            .add_copy_data(&mut backend, b"id,value\n1,one\n")
            .await
            .unwrap();
        let count = writer.commit(&mut backend).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_csv_quoted_newline() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN WITH (FORMAT CSV)");
        writer
            .add_copy_data(&mut backend, b"1,\"line1\nline2\"\n")
            .await
            .unwrap();
        writer.commit(&mut backend).await.unwrap();
        assert_eq!(
            backend.committed[0].values[1],
            Value::Text("line1\nline2".to_string())
        );
    }

    #[tokio::test]
    async fn test_binary_copy() {
        let mut backend = MemoryBackend::new();
        let mut writer = MutationWriter::new(
            &keyvalue_statement("COPY keyvalue FROM STDIN BINARY"),
            keyvalue_columns(),
            Tz::UTC,
            false,
        )
        .unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(BINARY_SIGNATURE);
        stream.extend_from_slice(&0i32.to_be_bytes()); // flags
        stream.extend_from_slice(&0i32.to_be_bytes()); // extension length
        // Row 1: (7, "seven")
        stream.extend_from_slice(&2i16.to_be_bytes());
        stream.extend_from_slice(&8i32.to_be_bytes());
        stream.extend_from_slice(&7i64.to_be_bytes());
        stream.extend_from_slice(&5i32.to_be_bytes());
        stream.extend_from_slice(b"seven");
        // Row 2: (8, null)
        stream.extend_from_slice(&2i16.to_be_bytes());
        stream.extend_from_slice(&8i32.to_be_bytes());
        stream.extend_from_slice(&8i64.to_be_bytes());
        stream.extend_from_slice(&(-1i32).to_be_bytes());
        // Trailer.
        stream.extend_from_slice(&(-1i16).to_be_bytes());

        // Feed it byte by byte to exercise the carry buffer.
        for byte in stream {
            writer.add_copy_data(&mut backend, &[byte]).await.unwrap();
        }
        let count = writer.commit(&mut backend).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(backend.committed[0].values[0], Value::Int8(7));
        assert_eq!(backend.committed[1].values[1], Value::Null);
    }

    #[tokio::test]
    async fn test_column_count_mismatch() {
        let mut backend = MemoryBackend::new();
        let mut writer = writer("COPY keyvalue FROM STDIN");
        writer
            .add_copy_data(&mut backend, b"1\ttwo\tthree\n")
            .await
            .unwrap();
        let err = writer.commit(&mut backend).await.unwrap_err();
        assert_eq!(err.code, SqlState::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_unknown_copy_column() {
        let err = MutationWriter::new(
            &keyvalue_statement("COPY keyvalue (id, bogus) FROM STDIN"),
            keyvalue_columns(),
            Tz::UTC,
            false,
        )
        .unwrap_err();
        assert_eq!(err.code, SqlState::UndefinedObject);
    }
}
