//! Handle clients by pretending to be a PostgreSQL server.
// One Client per connection; it owns the session state, the statement and
// portal maps, the COPY writer and the backend session, and drives the
// extended-query pipeline between Sync boundaries.

// Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// External crate imports
use bytes::{BufMut, BytesMut};
use log::{debug, info};
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::Notify;

// Internal crate imports
use crate::backend::{BackendSession, ExecuteResult, ResultRows};
use crate::constants::MAX_INVALID_MESSAGE_COUNT;
use crate::copy::{CopyFormat, CopyStatement, MutationWriter};
use crate::ddl;
use crate::errors::{Error, PgError, SqlState};
use crate::extended::{PortalState, PreparedStatement, QueuedMessage, StatementStore};
use crate::messages::*;
use crate::parsers::{self, FormatCode};
use crate::server::{CancelHandle, ServerContext, SslMode};
use crate::session::{self, SessionState, SettingsStatement};
use crate::sql::{self, StatementKind};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unauthenticated,
    Authenticated,
    CopyIn,
    Terminated,
}

/// Clients we recognize from application_name; recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownClient {
    Psql,
    Jdbc,
    Pgx,
    Npgsql,
    Pgbench,
    Unspecified,
}

impl WellKnownClient {
    fn detect(application_name: &str) -> WellKnownClient {
        let name = application_name.to_ascii_lowercase();
        if name == "psql" {
            WellKnownClient::Psql
        } else if name.contains("jdbc") {
            WellKnownClient::Jdbc
        } else if name.contains("pgx") {
            WellKnownClient::Pgx
        } else if name.contains("npgsql") {
            WellKnownClient::Npgsql
        } else if name.contains("pgbench") {
            WellKnownClient::Pgbench
        } else {
            WellKnownClient::Unspecified
        }
    }
}

/// The client state. One of these is created per client connection.
pub struct Client<S, T> {
    /// The reads are buffered (8K by default).
    read: BufReader<S>,

    /// We buffer the writes ourselves; flushes happen at message
    /// boundaries only.
    write: T,

    /// Remote address, for logging.
    addr: String,

    /// For query cancellation, the client is given a random connection id
    /// and secret on startup.
    connection_id: i32,
    secret: i32,

    context: Arc<ServerContext>,

    /// Woken by a CancelRequest carrying the matching id/secret pair.
    cancel: Arc<Notify>,

    /// The one backend session owned by this connection.
    backend: Box<dyn BackendSession>,

    session: SessionState,
    store: StatementStore,

    /// Extended-protocol work buffered until the next Flush or Sync.
    pending: VecDeque<QueuedMessage>,

    /// Responses buffered until a flush boundary.
    response_buffer: BytesMut,

    status: ConnectionStatus,
    tx_status: TransactionStatus,

    /// An error occurred inside the current sync window; everything up to
    /// and including the next Sync is discarded.
    skip_until_sync: bool,

    /// Messages skipped due to protocol or mode violations.
    invalid_message_count: usize,

    /// Exists only while status is CopyIn.
    copy: Option<MutationWriter>,

    well_known_client: WellKnownClient,

    /// Used to notify clients about an impending shutdown.
    shutdown: Receiver<()>,

    /// Cleared when the shutdown channel is gone so the loop stops polling
    /// a closed receiver.
    shutdown_armed: bool,
}

/// Serve one accepted connection end to end: bootstrap, startup, then the
/// regular message loop. Cancel connections are handled here and never
/// reach the message loop.
pub async fn handle_connection<S>(
    mut stream: S,
    addr: String,
    context: Arc<ServerContext>,
    backend: Box<dyn BackendSession>,
    shutdown: Receiver<()>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut ssl_done = false;
    let parameters = loop {
        let bytes = read_bootstrap_message(&mut stream).await?;
        match BootstrapMessage::parse(bytes)? {
            BootstrapMessage::SslRequest => {
                // The SSL probe may be sent exactly once.
                if ssl_done {
                    return Err(Error::ProtocolSyncError(
                        "duplicate SSLRequest".to_string(),
                    ));
                }
                ssl_done = true;

                // The TLS transport is terminated in front of us, so the
                // probe is always declined here.
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all_flush(&mut stream, &no).await?;

                if context.options.ssl_mode == SslMode::Require {
                    let err = PgError::fatal(
                        SqlState::ProtocolViolation,
                        "server requires SSL, but no TLS transport is available",
                    );
                    write_all_flush(&mut stream, &error_response(&err)).await?;
                    return Err(Error::ClientError("SSL required but unavailable".into()));
                }
            }
            BootstrapMessage::GssEncRequest => {
                let mut no = BytesMut::new();
                no.put_u8(b'N');
                write_all_flush(&mut stream, &no).await?;
            }
            BootstrapMessage::CancelRequest {
                connection_id,
                secret,
            } => {
                // Served by this short-lived connection; no reply is ever
                // sent, matching secrets or not.
                cancel_connection(&context, connection_id, secret);
                return Ok(());
            }
            BootstrapMessage::Startup { parameters } => break parameters,
        }
    };

    let (read, write) = split(stream);
    let mut client = Client::startup(read, write, addr, parameters, context, backend, shutdown).await?;
    let result = client.handle().await;
    client.release();
    result
}

/// Route a CancelRequest to its target connection. Mismatched secrets are
/// silently ignored.
fn cancel_connection(context: &ServerContext, connection_id: i32, secret: i32) {
    let guard = context.registry.lock();
    match guard.get(&connection_id) {
        Some(handle) if handle.secret == secret => {
            info!("Cancel request for connection {connection_id}");
            handle.cancel.notify_waiters();
        }
        _ => debug!("Ignoring cancel request for connection {connection_id}"),
    }
}

/// Run one backend call under the connection's cancel token and the
/// session's statement timeout. Cancellation is best effort: the call is
/// abandoned and reported as `57014`.
async fn guarded<R>(
    cancel: &Notify,
    timeout: Option<Duration>,
    work: impl std::future::Future<Output = Result<R, PgError>>,
) -> Result<R, PgError> {
    let canceled = || {
        PgError::new(
            SqlState::QueryCanceled,
            "canceling statement due to user request",
        )
    };

    match timeout {
        Some(duration) => {
            tokio::select! {
                result = tokio::time::timeout(duration, work) => match result {
                    Ok(result) => result,
                    Err(_) => Err(PgError::new(
                        SqlState::QueryCanceled,
                        "canceling statement due to statement timeout",
                    )),
                },
                _ = cancel.notified() => Err(canceled()),
            }
        }
        None => {
            tokio::select! {
                result = work => result,
                _ = cancel.notified() => Err(canceled()),
            }
        }
    }
}

impl<S, T> Client<S, T>
where
    S: AsyncRead + std::marker::Unpin,
    T: AsyncWrite + std::marker::Unpin,
{
    /// Handle client startup: apply parameters, authenticate, and send the
    /// startup response batch.
    pub async fn startup(
        read: S,
        mut write: T,
        addr: String,
        parameters: Vec<(String, String)>,
        context: Arc<ServerContext>,
        backend: Box<dyn BackendSession>,
        shutdown: Receiver<()>,
    ) -> Result<Client<S, T>, Error> {
        let mut session = SessionState::new();
        session.lenient = context.options.lenient_settings;

        let mut username = String::new();
        let mut application_name = String::new();
        for (name, value) in &parameters {
            if name == "user" {
                username = value.clone();
            }
            if name == "application_name" {
                application_name = value.clone();
            }
            session.apply_startup_parameter(name, value);
        }
        if username.is_empty() {
            return Err(Error::ClientBadStartup);
        }

        let mut read = BufReader::new(read);

        // Without -x a cleartext password is required; it is passed through
        // as the backend credential.
        if !context.options.dev_mode {
            write_all_flush(&mut write, &cleartext_password_challenge()).await?;
            let password = read_password(&mut read).await?;
            if password.is_empty() {
                let err = PgError::fatal(
                    SqlState::ProtocolViolation,
                    format!("password authentication failed for user \"{username}\""),
                );
                write_all_flush(&mut write, &error_response(&err)).await?;
                return Err(Error::ClientError("empty password".into()));
            }
        }

        let connection_id: i32 = rand::random();
        let secret: i32 = rand::random();
        let cancel = Arc::new(Notify::new());
        context.registry.lock().insert(
            connection_id,
            CancelHandle {
                secret,
                cancel: cancel.clone(),
            },
        );

        let mut startup_response = BytesMut::new();
        startup_response.put(auth_ok());
        startup_response.put(backend_key_data(connection_id, secret));
        for (name, value) in session.startup_parameter_status() {
            startup_response.put(parameter_status(&name, &value));
        }
        startup_response.put(ready_for_query(TransactionStatus::Idle));
        write_all_flush(&mut write, &startup_response).await?;

        let well_known_client = WellKnownClient::detect(&application_name);
        debug!("Client {addr} connected as {username} ({well_known_client:?})");

        Ok(Client {
            read,
            write,
            addr,
            connection_id,
            secret,
            context,
            cancel,
            backend,
            session,
            store: StatementStore::new(),
            pending: VecDeque::new(),
            response_buffer: BytesMut::with_capacity(8192),
            status: ConnectionStatus::Authenticated,
            tx_status: TransactionStatus::Idle,
            skip_until_sync: false,
            invalid_message_count: 0,
            copy: None,
            well_known_client,
            shutdown,
            shutdown_armed: true,
        })
    }

    /// Unregister from the cancel registry.
    pub fn release(&self) {
        let mut guard = self.context.registry.lock();
        guard.remove(&self.connection_id);
    }

    /// The main frame loop of an authenticated connection.
    pub async fn handle(&mut self) -> Result<(), Error> {
        loop {
            let frame = if self.shutdown_armed {
                tokio::select! {
                    result = self.shutdown.recv() => {
                        match result {
                            Err(RecvError::Closed) => {
                                self.shutdown_armed = false;
                                continue;
                            }
                            // A lagged receiver still means shutdown fired.
                            Ok(()) | Err(RecvError::Lagged(_)) => {
                                let err = PgError::fatal(
                                    SqlState::InternalError,
                                    "terminating connection: server is shutting down",
                                );
                                write_all_flush(&mut self.write, &error_response(&err)).await?;
                                self.status = ConnectionStatus::Terminated;
                                return Ok(());
                            }
                        }
                    }
                    frame = read_message(&mut self.read) => frame,
                }
            } else {
                read_message(&mut self.read).await
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    self.status = ConnectionStatus::Terminated;
                    return match err {
                        // EOF after Terminate is a normal close.
                        Error::SocketError(_) => Ok(()),
                        other => Err(other),
                    };
                }
            };

            let message = match FrontendMessage::try_from(&frame) {
                Ok(message) => message,
                Err(err) => {
                    // Framing errors are fatal.
                    let response = error_response(&PgError::fatal(
                        SqlState::ProtocolViolation,
                        err.to_string(),
                    ));
                    write_all_flush(&mut self.write, &response).await?;
                    self.status = ConnectionStatus::Terminated;
                    return Err(err);
                }
            };

            if self.status == ConnectionStatus::CopyIn {
                if self.handle_copy_message(message).await? {
                    continue;
                }
                return Ok(());
            }

            match message {
                FrontendMessage::Terminate => {
                    debug!("Client {} sent Terminate", self.addr);
                    self.status = ConnectionStatus::Terminated;
                    return Ok(());
                }
                FrontendMessage::Query { sql } => {
                    self.handle_simple_query(&sql).await?;
                }
                FrontendMessage::Parse(parse) => {
                    if !self.skip_until_sync {
                        self.pending.push_back(QueuedMessage::Parse(parse));
                    }
                }
                FrontendMessage::Bind(bind) => {
                    if !self.skip_until_sync {
                        self.pending.push_back(QueuedMessage::Bind(bind));
                    }
                }
                FrontendMessage::Describe { target, name } => {
                    if !self.skip_until_sync {
                        self.pending
                            .push_back(QueuedMessage::Describe { target, name });
                    }
                }
                FrontendMessage::Execute { portal, max_rows } => {
                    if !self.skip_until_sync {
                        self.pending
                            .push_back(QueuedMessage::Execute { portal, max_rows });
                    }
                }
                FrontendMessage::Close { target, name } => {
                    if !self.skip_until_sync {
                        self.pending.push_back(QueuedMessage::Close { target, name });
                    }
                }
                FrontendMessage::Flush => {
                    self.process_pending().await?;
                    self.flush_response().await?;
                }
                FrontendMessage::Sync => {
                    self.process_pending().await?;
                    self.skip_until_sync = false;
                    if self.tx_status == TransactionStatus::Idle {
                        // The implicit transaction closes here.
                        self.store.close_all_portals();
                        self.session.transaction_end();
                    }
                    self.response_buffer.put(ready_for_query(self.tx_status));
                    self.flush_response().await?;
                }
                FrontendMessage::FunctionCall => {
                    let err = PgError::new(
                        SqlState::FeatureNotSupported,
                        "function call messages are not supported",
                    );
                    self.response_buffer.put(error_response(&err));
                    self.response_buffer.put(ready_for_query(self.tx_status));
                    self.flush_response().await?;
                }
                FrontendMessage::CopyData { .. }
                | FrontendMessage::CopyDone
                | FrontendMessage::CopyFail { .. } => {
                    // COPY sub-protocol messages outside COPY_IN are
                    // silently skipped, up to the throttling limit.
                    self.register_invalid_message().await?;
                }
                FrontendMessage::Unknown { code } => {
                    let err = PgError::new(
                        SqlState::ProtocolViolation,
                        format!("unknown message identifier '{}'", code as char),
                    );
                    self.response_buffer.put(error_response(&err));
                    self.flush_response().await?;
                    self.register_invalid_message().await?;
                }
            }
        }
    }

    /// Count one skipped message; past the limit the connection dies with a
    /// fatal error.
    async fn register_invalid_message(&mut self) -> Result<(), Error> {
        self.invalid_message_count += 1;
        if self.invalid_message_count > MAX_INVALID_MESSAGE_COUNT {
            let err = PgError::fatal(
                SqlState::ProtocolViolation,
                "terminating connection due to too many invalid messages",
            );
            write_all_flush(&mut self.write, &error_response(&err)).await?;
            self.status = ConnectionStatus::Terminated;
            return Err(Error::TooManyInvalidMessages);
        }
        Ok(())
    }

    async fn flush_response(&mut self) -> Result<(), Error> {
        if self.response_buffer.is_empty() {
            return Ok(());
        }
        let buffer = self.response_buffer.split();
        write_all_flush(&mut self.write, &buffer).await
    }

    /// Process the buffered extended-protocol queue. The first error puts
    /// the window into skip mode: one ErrorResponse is emitted and the rest
    /// of the queue is discarded.
    async fn process_pending(&mut self) -> Result<(), Error> {
        while let Some(item) = self.pending.pop_front() {
            if self.skip_until_sync {
                continue;
            }
            let result = self.process_queued(item).await?;
            if let Err(err) = result {
                if self.tx_status == TransactionStatus::InTransaction {
                    self.tx_status = TransactionStatus::Failed;
                }
                self.response_buffer.put(error_response(&err));
                self.skip_until_sync = true;
            }
        }
        Ok(())
    }

    /// One queued message. The outer Result is fatal transport errors; the
    /// inner is a statement error reported to the client.
    async fn process_queued(
        &mut self,
        item: QueuedMessage,
    ) -> Result<Result<(), PgError>, Error> {
        match item {
            QueuedMessage::Parse(parse) => {
                if let Some(err) = sql::check_unsupported(&parse.query) {
                    return Ok(Err(err));
                }
                let statement = PreparedStatement::from_parse(&parse);
                match self.store.register(statement) {
                    Ok(()) => {
                        self.response_buffer.put(parse_complete());
                        Ok(Ok(()))
                    }
                    Err(err) => Ok(Err(err)),
                }
            }
            QueuedMessage::Bind(bind) => {
                match self.store.bind(&bind, self.session.timezone()) {
                    Ok(()) => {
                        self.response_buffer.put(bind_complete());
                        Ok(Ok(()))
                    }
                    Err(err) => Ok(Err(err)),
                }
            }
            QueuedMessage::Describe { target, name } => Ok(self.describe(target, &name).await),
            QueuedMessage::Execute { portal, max_rows } => {
                Ok(self.execute_portal(&portal, max_rows).await)
            }
            QueuedMessage::Close { target, name } => {
                self.store.close(target, &name);
                self.response_buffer.put(close_complete());
                Ok(Ok(()))
            }
        }
    }

    async fn describe(&mut self, target: char, name: &str) -> Result<(), PgError> {
        if target == 'S' {
            let statement = self.store.statement(name)?;
            self.response_buffer
                .put(parameter_description(&statement.param_types));
            if statement.kind == StatementKind::Query {
                let columns = guarded(
                    &self.cancel,
                    self.session.statement_timeout(),
                    self.backend.describe(&statement.sql),
                )
                .await?;
                match columns {
                    Some(columns) => {
                        let fields: Vec<FieldDescription> = columns
                            .iter()
                            .map(|column| {
                                FieldDescription::new(
                                    column.name.clone(),
                                    column.type_oid,
                                    parsers::type_size(column.type_oid),
                                )
                            })
                            .collect();
                        self.response_buffer.put(row_description(&fields));
                    }
                    None => self.response_buffer.put(no_data()),
                }
            } else {
                self.response_buffer.put(no_data());
            }
            return Ok(());
        }

        // Portal describe; may force an early plan on the backend.
        let portal = self.store.portal(name)?;
        let statement = portal.statement.clone();
        let formats: Vec<i16> = portal.result_formats.clone();
        if statement.kind != StatementKind::Query {
            self.response_buffer.put(no_data());
            return Ok(());
        }
        let columns = guarded(
            &self.cancel,
            self.session.statement_timeout(),
            self.backend.describe(&statement.sql),
        )
        .await?;
        match columns {
            Some(columns) => {
                let fields: Vec<FieldDescription> = columns
                    .iter()
                    .enumerate()
                    .map(|(index, column)| {
                        let format = match formats.len() {
                            0 => 0,
                            1 => formats[0],
                            _ => formats.get(index).copied().unwrap_or(0),
                        };
                        FieldDescription {
                            name: column.name.clone(),
                            type_oid: column.type_oid,
                            type_size: parsers::type_size(column.type_oid),
                            format,
                        }
                    })
                    .collect();
                self.response_buffer.put(row_description(&fields));
                self.store.portal_mut(name)?.described = true;
            }
            None => self.response_buffer.put(no_data()),
        }
        Ok(())
    }

    /// Execute a portal, streaming DataRows then CommandComplete, or
    /// PortalSuspended when the row limit is reached.
    async fn execute_portal(&mut self, name: &str, max_rows: i32) -> Result<(), PgError> {
        let portal = self.store.portal(name)?;
        let statement = portal.statement.clone();

        if self.tx_status == TransactionStatus::Failed
            && statement.kind != StatementKind::Commit
            && statement.kind != StatementKind::Rollback
        {
            return Err(in_failed_transaction());
        }

        // Resume a suspended portal without a new backend call.
        if let PortalState::Suspended { rows, offset } = portal.state.clone() {
            return self.emit_portal_rows(name, rows, offset, max_rows, false).await;
        }

        match statement.kind {
            StatementKind::Query => {
                let params = self.store.portal(name)?.params.clone();
                let result = guarded(
                    &self.cancel,
                    self.session.statement_timeout(),
                    self.backend.execute(&statement.sql, &params),
                )
                .await?;
                match result {
                    ExecuteResult::Rows(rows) => {
                        let described = self.store.portal(name)?.described;
                        self.emit_portal_rows(name, rows, 0, max_rows, !described)
                            .await
                    }
                    ExecuteResult::Update { count } => {
                        self.response_buffer
                            .put(command_complete(&dml_tag(&statement.sql, count)));
                        Ok(())
                    }
                    ExecuteResult::DdlAck => {
                        self.response_buffer
                            .put(command_complete(&ddl_tag(&statement.sql)));
                        Ok(())
                    }
                }
            }
            StatementKind::Copy => Err(PgError::new(
                SqlState::FeatureNotSupported,
                "COPY is only supported in the simple query protocol",
            )),
            _ => {
                let params = self.store.portal(name)?.params.clone();
                let tag = self
                    .execute_non_query(&statement.sql, statement.kind, &params)
                    .await?;
                self.response_buffer.put(command_complete(&tag));
                Ok(())
            }
        }
    }

    /// Emit rows for a portal run, handling suspension bookkeeping.
    async fn emit_portal_rows(
        &mut self,
        name: &str,
        rows: ResultRows,
        offset: usize,
        max_rows: i32,
        send_description: bool,
    ) -> Result<(), PgError> {
        let timezone = self.session.timezone();
        let portal = self.store.portal(name)?;
        let formats: Vec<i16> = portal.result_formats.clone();

        if send_description {
            let fields: Vec<FieldDescription> = rows
                .columns
                .iter()
                .enumerate()
                .map(|(index, column)| {
                    let format = match formats.len() {
                        0 => 0,
                        1 => formats[0],
                        _ => formats.get(index).copied().unwrap_or(0),
                    };
                    FieldDescription {
                        name: column.name.clone(),
                        type_oid: column.type_oid,
                        type_size: parsers::type_size(column.type_oid),
                        format,
                    }
                })
                .collect();
            self.response_buffer.put(row_description(&fields));
        }

        let limit = if max_rows > 0 {
            max_rows as usize
        } else {
            usize::MAX
        };

        let mut emitted = 0usize;
        let mut index = offset;
        while index < rows.rows.len() && emitted < limit {
            let row = &rows.rows[index];
            let mut encoded = Vec::with_capacity(row.len());
            for (column_index, value) in row.iter().enumerate() {
                let format = match formats.len() {
                    0 => FormatCode::Text,
                    1 => FormatCode::from_i16(formats[0])?,
                    _ => FormatCode::from_i16(formats.get(column_index).copied().unwrap_or(0))?,
                };
                encoded.push(parsers::encode(value, format, timezone)?);
            }
            self.response_buffer.put(data_row(&encoded));
            emitted += 1;
            index += 1;
        }

        let portal = self.store.portal_mut(name)?;
        if index < rows.rows.len() {
            portal.state = PortalState::Suspended {
                rows,
                offset: index,
            };
            self.response_buffer.put(portal_suspended());
        } else {
            portal.state = PortalState::Done;
            let total = index;
            self.response_buffer
                .put(command_complete(&format!("SELECT {total}")));
        }
        Ok(())
    }

    /// Simple query: split the batch, run each statement, and finish with
    /// ReadyForQuery, unless a COPY took over the connection.
    async fn handle_simple_query(&mut self, sql_text: &str) -> Result<(), Error> {
        let statements = sql::split_statements(sql_text);

        if statements.is_empty() {
            self.response_buffer.put(empty_query_response());
            self.response_buffer.put(ready_for_query(self.tx_status));
            return self.flush_response().await;
        }

        for statement in &statements {
            match self.execute_simple_statement(statement, statements.len()).await {
                Ok(true) => {
                    // COPY_IN: the response so far ends with CopyInResponse;
                    // ReadyForQuery comes after the copy finishes.
                    return self.flush_response().await;
                }
                Ok(false) => (),
                Err(err) => {
                    if self.tx_status == TransactionStatus::InTransaction {
                        self.tx_status = TransactionStatus::Failed;
                    }
                    self.response_buffer.put(error_response(&err));
                    break;
                }
            }
        }

        if self.tx_status == TransactionStatus::Idle {
            self.store.close_all_portals();
            self.session.transaction_end();
        }
        self.response_buffer.put(ready_for_query(self.tx_status));
        self.flush_response().await
    }

    /// Returns true when the statement switched the connection to COPY_IN.
    async fn execute_simple_statement(
        &mut self,
        sql_text: &str,
        batch_len: usize,
    ) -> Result<bool, PgError> {
        let kind = sql::classify(sql_text);

        if self.tx_status == TransactionStatus::Failed
            && kind != StatementKind::Commit
            && kind != StatementKind::Rollback
        {
            return Err(in_failed_transaction());
        }
        if let Some(err) = sql::check_unsupported(sql_text) {
            return Err(err);
        }

        match kind {
            StatementKind::Query => {
                let result = guarded(
                    &self.cancel,
                    self.session.statement_timeout(),
                    self.backend.execute(sql_text, &[]),
                )
                .await?;
                match result {
                    ExecuteResult::Rows(rows) => self.emit_simple_rows(rows)?,
                    ExecuteResult::Update { count } => self
                        .response_buffer
                        .put(command_complete(&dml_tag(sql_text, count))),
                    ExecuteResult::DdlAck => self
                        .response_buffer
                        .put(command_complete(&ddl_tag(sql_text))),
                }
                Ok(false)
            }
            StatementKind::Copy => {
                if batch_len != 1 {
                    return Err(PgError::new(
                        SqlState::FeatureNotSupported,
                        "COPY must be the only statement in a query batch",
                    ));
                }
                self.start_copy(sql_text).await?;
                Ok(true)
            }
            other => {
                let tag = self.execute_non_query(sql_text, other, &[]).await?;
                self.response_buffer.put(command_complete(&tag));
                Ok(false)
            }
        }
    }

    fn emit_simple_rows(&mut self, rows: ResultRows) -> Result<(), PgError> {
        let timezone = self.session.timezone();
        let fields: Vec<FieldDescription> = rows
            .columns
            .iter()
            .map(|column| {
                FieldDescription::new(
                    column.name.clone(),
                    column.type_oid,
                    parsers::type_size(column.type_oid),
                )
            })
            .collect();
        self.response_buffer.put(row_description(&fields));

        let count = rows.rows.len();
        for row in &rows.rows {
            let mut encoded = Vec::with_capacity(row.len());
            for value in row {
                encoded.push(parsers::encode(value, FormatCode::Text, timezone)?);
            }
            self.response_buffer.put(data_row(&encoded));
        }
        self.response_buffer
            .put(command_complete(&format!("SELECT {count}")));
        Ok(())
    }

    /// DML, DDL, transaction control and client-side statements, shared by
    /// the simple and extended paths. Returns the command tag.
    async fn execute_non_query(
        &mut self,
        sql_text: &str,
        kind: StatementKind,
        params: &[parsers::Value],
    ) -> Result<String, PgError> {
        match kind {
            StatementKind::Dml => {
                let result = guarded(
                    &self.cancel,
                    self.session.statement_timeout(),
                    self.backend.execute(sql_text, params),
                )
                .await?;
                match result {
                    ExecuteResult::Update { count } => Ok(dml_tag(sql_text, count)),
                    ExecuteResult::Rows(_) => Err(PgError::new(
                        SqlState::InternalError,
                        "backend returned rows for a DML statement",
                    )),
                    ExecuteResult::DdlAck => Ok(ddl_tag(sql_text)),
                }
            }
            StatementKind::Ddl => {
                let translated = ddl::translate(self.backend.as_mut(), sql_text).await?;
                if let Some(translated) = &translated {
                    guarded(
                        &self.cancel,
                        self.session.statement_timeout(),
                        self.backend.execute_ddl(translated),
                    )
                    .await?;
                }
                Ok(ddl_tag(sql_text))
            }
            StatementKind::Begin => {
                if self.tx_status == TransactionStatus::InTransaction {
                    // BEGIN inside a transaction is a warning-level no-op.
                    self.response_buffer.put(notice_response(
                        "25001",
                        "there is already a transaction in progress",
                    ));
                } else {
                    self.backend.begin().await?;
                    self.tx_status = TransactionStatus::InTransaction;
                }
                Ok("BEGIN".to_string())
            }
            StatementKind::Commit => {
                let tag = if self.tx_status == TransactionStatus::Failed {
                    // COMMIT of a failed transaction rolls back.
                    self.backend.rollback().await?;
                    "ROLLBACK"
                } else {
                    self.backend.commit().await?;
                    "COMMIT"
                };
                self.tx_status = TransactionStatus::Idle;
                self.store.close_all_portals();
                self.session.transaction_end();
                Ok(tag.to_string())
            }
            StatementKind::Rollback => {
                self.backend.rollback().await?;
                self.tx_status = TransactionStatus::Idle;
                self.store.close_all_portals();
                self.session.transaction_end();
                Ok("ROLLBACK".to_string())
            }
            StatementKind::Set => {
                match session::parse_settings_statement(sql_text)? {
                    SettingsStatement::Set { scope, name, value } => {
                        match value {
                            Some(value) => {
                                self.session.set(scope, &name, &value)?;
                                if name.starts_with("spanner.") {
                                    self.backend.set_remote_setting(&name, &value).await?;
                                }
                            }
                            None => self.session.reset(&name)?,
                        }
                        Ok("SET".to_string())
                    }
                    _ => Err(syntax_error(sql_text)),
                }
            }
            StatementKind::Show => {
                match session::parse_settings_statement(sql_text)? {
                    SettingsStatement::Show { name } => {
                        let value = self.session.show(&name)?;
                        let display = self
                            .session
                            .get(&name)
                            .map(|s| s.name.clone())
                            .unwrap_or(name);
                        self.response_buffer.put(row_description(&[
                            FieldDescription::new(display, parsers::oid::TEXT, -1),
                        ]));
                        let mut payload = BytesMut::new();
                        payload.put_slice(value.as_bytes());
                        self.response_buffer.put(data_row(&[Some(payload)]));
                        Ok("SHOW".to_string())
                    }
                    _ => Err(syntax_error(sql_text)),
                }
            }
            StatementKind::ClientSide => {
                let tokens = sql::tokenize(sql_text);
                let first = tokens.first().ok_or_else(|| syntax_error(sql_text))?;
                if first.is_keyword(sql_text, "reset") {
                    match session::parse_settings_statement(sql_text)? {
                        SettingsStatement::Reset { name: Some(name) } => {
                            self.session.reset(&name)?
                        }
                        SettingsStatement::Reset { name: None } => self.session.reset_all(),
                        _ => return Err(syntax_error(sql_text)),
                    }
                    return Ok("RESET".to_string());
                }
                if first.is_keyword(sql_text, "deallocate") {
                    let name_token = tokens.get(1).ok_or_else(|| syntax_error(sql_text))?;
                    if name_token.is_keyword(sql_text, "all") {
                        self.store = StatementStore::new();
                    } else {
                        let name = sql::unquote_identifier(name_token.text(sql_text));
                        self.store.close('S', &name);
                    }
                    return Ok("DEALLOCATE".to_string());
                }
                if first.is_keyword(sql_text, "discard") {
                    self.store = StatementStore::new();
                    self.session.reset_all();
                    return Ok("DISCARD ALL".to_string());
                }
                Err(syntax_error(sql_text))
            }
            StatementKind::Other => Err(syntax_error(sql_text)),
            StatementKind::Query | StatementKind::Copy => Err(PgError::new(
                SqlState::InternalError,
                "statement routed to the wrong execution path",
            )),
        }
    }

    /// `COPY <table> FROM STDIN`: reply CopyInResponse and switch the
    /// connection into COPY_IN.
    async fn start_copy(&mut self, sql_text: &str) -> Result<(), PgError> {
        let statement = CopyStatement::parse(sql_text)?;
        let columns = guarded(
            &self.cancel,
            self.session.statement_timeout(),
            self.backend.table_columns(&statement.table),
        )
        .await?
        .ok_or_else(|| {
            PgError::new(
                SqlState::UndefinedTable,
                format!("relation \"{}\" does not exist", statement.table),
            )
        })?;

        let writer = MutationWriter::new(
            &statement,
            columns,
            self.session.timezone(),
            self.session.partitioned_dml(),
        )?;
        let formats = statement.column_formats(writer.column_count());
        self.response_buffer.put(copy_in_response(
            statement.options.format == CopyFormat::Binary,
            &formats,
        ));
        self.copy = Some(writer);
        self.status = ConnectionStatus::CopyIn;
        Ok(())
    }

    /// One message while in COPY_IN. Returns false to terminate the
    /// connection.
    async fn handle_copy_message(&mut self, message: FrontendMessage) -> Result<bool, Error> {
        match message {
            FrontendMessage::CopyData { payload } => {
                if let Some(writer) = self.copy.as_mut() {
                    writer
                        .add_copy_data(&mut *self.backend, &payload)
                        .await
                        .map_err(Error::Pg)?;
                }
                Ok(true)
            }
            FrontendMessage::CopyDone => {
                let result = match self.copy.as_mut() {
                    Some(writer) => {
                        guarded(
                            &self.cancel,
                            self.session.statement_timeout(),
                            writer.commit(&mut *self.backend),
                        )
                        .await
                    }
                    None => Err(PgError::new(
                        SqlState::InternalError,
                        "no COPY in progress",
                    )),
                };
                self.copy = None;
                self.status = ConnectionStatus::Authenticated;
                match result {
                    Ok(count) => {
                        self.response_buffer
                            .put(command_complete(&format!("COPY {count}")));
                    }
                    Err(err) => {
                        if self.tx_status == TransactionStatus::InTransaction {
                            self.tx_status = TransactionStatus::Failed;
                        }
                        self.response_buffer.put(error_response(&err));
                    }
                }
                self.response_buffer.put(ready_for_query(self.tx_status));
                self.flush_response().await?;
                Ok(true)
            }
            FrontendMessage::CopyFail { message } => {
                if let Some(mut writer) = self.copy.take() {
                    writer
                        .rollback(&mut *self.backend)
                        .await
                        .map_err(Error::Pg)?;
                }
                self.status = ConnectionStatus::Authenticated;
                let err = PgError::new(
                    SqlState::QueryCanceled,
                    format!("COPY from stdin failed: {message}"),
                );
                self.response_buffer.put(error_response(&err));
                self.response_buffer.put(ready_for_query(self.tx_status));
                self.flush_response().await?;
                Ok(true)
            }
            // Some clients interleave Flush and Sync into the copy stream;
            // both are skipped.
            FrontendMessage::Flush | FrontendMessage::Sync => Ok(true),
            FrontendMessage::Terminate => {
                if let Some(mut writer) = self.copy.take() {
                    let _ = writer.rollback(&mut *self.backend).await;
                }
                self.status = ConnectionStatus::Terminated;
                Ok(false)
            }
            _ => {
                self.register_invalid_message().await?;
                Ok(true)
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn well_known_client(&self) -> WellKnownClient {
        self.well_known_client
    }
}

impl<S, T> Drop for Client<S, T> {
    fn drop(&mut self) {
        let mut guard = self.context.registry.lock();
        guard.remove(&self.connection_id);
    }
}

fn in_failed_transaction() -> PgError {
    PgError::new(
        SqlState::InFailedSqlTransaction,
        "current transaction is aborted, commands ignored until end of transaction block",
    )
}

fn syntax_error(sql_text: &str) -> PgError {
    PgError::new(
        SqlState::SyntaxError,
        format!("syntax error at or near \"{}\"", sql_text.chars().take(40).collect::<String>()),
    )
}

/// The command tag for a DML statement.
fn dml_tag(sql_text: &str, count: u64) -> String {
    let tokens = sql::tokenize(sql_text);
    match tokens.first() {
        Some(token) if token.is_keyword(sql_text, "insert") => format!("INSERT 0 {count}"),
        Some(token) if token.is_keyword(sql_text, "update") => format!("UPDATE {count}"),
        Some(token) if token.is_keyword(sql_text, "delete") => format!("DELETE {count}"),
        _ => format!("OK {count}"),
    }
}

/// The command tag for a DDL statement, e.g. `CREATE TABLE`.
fn ddl_tag(sql_text: &str) -> String {
    let tokens = sql::tokenize(sql_text);
    let mut words = Vec::new();
    for token in tokens.iter().take(3) {
        if token.kind == sql::TokenKind::Ident {
            words.push(token.text(sql_text).to_ascii_uppercase());
        } else {
            break;
        }
    }

    match words.first().map(String::as_str) {
        None => "OK".to_string(),
        Some("GRANT") => "GRANT".to_string(),
        Some("REVOKE") => "REVOKE".to_string(),
        Some("TRUNCATE") => "TRUNCATE TABLE".to_string(),
        Some(first) => match words.get(1) {
            None => first.to_string(),
            // CREATE UNIQUE INDEX reports as CREATE INDEX.
            Some(second) if second == "UNIQUE" && words.len() == 3 => {
                format!("{} {}", first, words[2])
            }
            Some(second) => format!("{first} {second}"),
        },
    }
}

/// Read a password ('p') message.
async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + std::marker::Unpin,
{
    let frame = read_message(stream).await?;
    if frame.first() != Some(&b'p') {
        return Err(Error::ProtocolSyncError(format!(
            "Expected password message (p), received '{}' instead",
            frame.first().copied().unwrap_or(0) as char
        )));
    }
    // Strip header and the trailing null.
    let payload = &frame[5..];
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    Ok(payload[..end].to_vec())
}
