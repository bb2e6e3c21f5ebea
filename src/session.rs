// Session state: the table of PostgreSQL settings (GUCs) owned by one
// connection. Reads and writes are single-threaded per connection; the
// process-wide defaults table is read-only after startup.

// Standard library imports
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

// External crate imports
use chrono_tz::Tz;
use once_cell::sync::Lazy;

// Internal crate imports
use crate::constants::{DEFAULT_SERVER_VERSION, SERVER_IDENTITY};
use crate::errors::{PgError, SqlState};
use crate::sql::{self, TokenKind};

/// Where the current value of a setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    Default,
    Startup,
    Session,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingScope {
    Session,
    Local,
}

/// One GUC entry.
#[derive(Debug, Clone)]
pub struct PgSetting {
    pub name: String,
    pub value: Option<String>,
    pub default_value: Option<String>,
    pub category: &'static str,
    pub source: SettingSource,
}

impl PgSetting {
    fn new(name: &str, default_value: &str, category: &'static str) -> PgSetting {
        PgSetting {
            name: name.to_string(),
            value: Some(default_value.to_string()),
            default_value: Some(default_value.to_string()),
            category,
            source: SettingSource::Default,
        }
    }
}

/// Settings every session starts from. The vendor namespace lives under
/// `spanner.`; those values are additionally forwarded to the backend.
static DEFAULT_SETTINGS: Lazy<Vec<PgSetting>> = Lazy::new(|| {
    vec![
        PgSetting::new("server_version", DEFAULT_SERVER_VERSION, "preset"),
        PgSetting::new("server_encoding", "UTF8", "preset"),
        PgSetting::new("client_encoding", "UTF8", "client"),
        PgSetting::new("application_name", "", "client"),
        PgSetting::new("DateStyle", "ISO,YMD", "client"),
        PgSetting::new("IntervalStyle", "iso_8601", "client"),
        PgSetting::new("TimeZone", "UTC", "client"),
        PgSetting::new("integer_datetimes", "on", "preset"),
        PgSetting::new("standard_conforming_strings", "on", "compat"),
        PgSetting::new("is_superuser", "false", "preset"),
        PgSetting::new("session_authorization", SERVER_IDENTITY, "preset"),
        PgSetting::new("search_path", "public", "client"),
        PgSetting::new("extra_float_digits", "1", "client"),
        PgSetting::new("spanner.force_autocommit", "off", "vendor"),
        PgSetting::new("spanner.autocommit_dml_mode", "transactional", "vendor"),
        PgSetting::new("spanner.ddl_transaction_mode", "batch", "vendor"),
        PgSetting::new("spanner.read_only_staleness", "strong", "vendor"),
        PgSetting::new("spanner.statement_timeout", "0", "vendor"),
    ]
});

/// Keys are case-insensitive; the canonical spelling is kept for display.
fn key_of(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// The per-connection setting table.
pub struct SessionState {
    settings: HashMap<String, PgSetting>,
    /// Values saved by SET LOCAL, restored at transaction end.
    local_saves: HashMap<String, Option<String>>,
    /// Report unknown non-vendor settings as a notice instead of an error.
    pub lenient: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> SessionState {
        let mut settings = HashMap::new();
        for setting in DEFAULT_SETTINGS.iter() {
            settings.insert(key_of(&setting.name), setting.clone());
        }
        SessionState {
            settings,
            local_saves: HashMap::new(),
            lenient: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PgSetting> {
        self.settings.get(&key_of(name))
    }

    /// SHOW: the current value, or error 42704 for unknown settings.
    pub fn show(&self, name: &str) -> Result<String, PgError> {
        match self.get(name) {
            Some(setting) => Ok(setting.value.clone().unwrap_or_default()),
            None => Err(unrecognized(name)),
        }
    }

    /// SET / SET LOCAL. Unknown `spanner.*` names are created on the fly
    /// and forwarded to the backend by the caller; other unknown names are
    /// an error unless the session is lenient.
    pub fn set(
        &mut self,
        scope: SettingScope,
        name: &str,
        value: &str,
    ) -> Result<(), PgError> {
        let key = key_of(name);

        if !self.settings.contains_key(&key) {
            if key.starts_with("spanner.") {
                self.settings.insert(
                    key.clone(),
                    PgSetting {
                        name: name.to_string(),
                        value: None,
                        default_value: None,
                        category: "vendor",
                        source: SettingSource::Default,
                    },
                );
            } else if self.lenient {
                return Ok(());
            } else {
                return Err(unrecognized(name));
            }
        }

        let setting = self.settings.get_mut(&key).unwrap();
        if scope == SettingScope::Local {
            self.local_saves
                .entry(key)
                .or_insert_with(|| setting.value.clone());
        }
        setting.value = Some(value.to_string());
        setting.source = match scope {
            SettingScope::Session => SettingSource::Session,
            SettingScope::Local => SettingSource::Local,
        };
        Ok(())
    }

    /// RESET: back to the default value.
    pub fn reset(&mut self, name: &str) -> Result<(), PgError> {
        let key = key_of(name);
        match self.settings.get_mut(&key) {
            Some(setting) => {
                setting.value = setting.default_value.clone();
                setting.source = SettingSource::Default;
                Ok(())
            }
            None => Err(unrecognized(name)),
        }
    }

    pub fn reset_all(&mut self) {
        for setting in self.settings.values_mut() {
            setting.value = setting.default_value.clone();
            setting.source = SettingSource::Default;
        }
    }

    /// Apply one startup parameter. `options` is expanded into its `-c`
    /// pairs; unrecognized parameter names are ignored, as the protocol
    /// requires.
    pub fn apply_startup_parameter(&mut self, name: &str, value: &str) {
        if name == "options" {
            for (option_name, option_value) in parse_options(value) {
                let _ = self.set(SettingScope::Session, &option_name, &option_value);
                if let Some(setting) = self.settings.get_mut(&key_of(&option_name)) {
                    setting.source = SettingSource::Startup;
                }
            }
            return;
        }
        if name == "database" || name == "user" || name == "replication" {
            return;
        }
        if self.settings.contains_key(&key_of(name)) || name.contains('.') {
            let _ = self.set(SettingScope::Session, name, value);
            if let Some(setting) = self.settings.get_mut(&key_of(name)) {
                setting.source = SettingSource::Startup;
            }
        }
    }

    /// Called when a transaction ends, commit or rollback: SET LOCAL values
    /// revert.
    pub fn transaction_end(&mut self) {
        for (key, saved) in self.local_saves.drain() {
            if let Some(setting) = self.settings.get_mut(&key) {
                setting.value = saved;
                setting.source = SettingSource::Session;
            }
        }
    }

    /// The session time zone; unparseable zones fall back to UTC.
    pub fn timezone(&self) -> Tz {
        self.get("TimeZone")
            .and_then(|s| s.value.as_deref().map(str::trim).map(Tz::from_str).and_then(Result::ok))
            .unwrap_or(Tz::UTC)
    }

    /// spanner.statement_timeout in milliseconds; 0 disables it. Accepts a
    /// bare number or an `ms`/`s` suffix.
    pub fn statement_timeout(&self) -> Option<Duration> {
        let raw = self.get("spanner.statement_timeout")?.value.clone()?;
        let text = raw.trim();
        let millis = if let Some(stripped) = text.strip_suffix("ms") {
            stripped.trim().parse::<u64>().ok()?
        } else if let Some(stripped) = text.strip_suffix('s') {
            stripped.trim().parse::<u64>().ok()?.saturating_mul(1000)
        } else {
            text.parse::<u64>().ok()?
        };
        if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis))
        }
    }

    pub fn force_autocommit(&self) -> bool {
        self.get("spanner.force_autocommit")
            .and_then(|s| s.value.as_deref().map(|v| v == "on" || v == "true"))
            .unwrap_or(false)
    }

    pub fn partitioned_dml(&self) -> bool {
        self.get("spanner.autocommit_dml_mode")
            .and_then(|s| s.value.as_deref().map(|v| v == "partitioned_non_atomic"))
            .unwrap_or(false)
    }

    /// ParameterStatus messages sent right after authentication, in order.
    pub fn startup_parameter_status(&self) -> Vec<(String, String)> {
        [
            "server_version",
            "application_name",
            "is_superuser",
            "session_authorization",
            "integer_datetimes",
            "server_encoding",
            "client_encoding",
            "DateStyle",
            "IntervalStyle",
            "standard_conforming_strings",
            "TimeZone",
        ]
        .iter()
        .map(|name| {
            let value = self
                .get(name)
                .and_then(|s| s.value.clone())
                .unwrap_or_default();
            (name.to_string(), value)
        })
        .collect()
    }
}

fn unrecognized(name: &str) -> PgError {
    PgError::new(
        SqlState::UndefinedObject,
        format!("unrecognized configuration parameter \"{name}\""),
    )
}

/// Extract `-c name=value` pairs from a startup `options` string. Spaces can
/// be escaped with a backslash inside values.
pub fn parse_options(options: &str) -> Vec<(String, String)> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut chars = options.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(current.clone());
                    current.clear();
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }

    let mut pairs = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let assignment = if arg == "-c" || arg == "--" {
            i += 1;
            args.get(i).cloned()
        } else if let Some(rest) = arg.strip_prefix("-c") {
            Some(rest.to_string())
        } else if let Some(rest) = arg.strip_prefix("--") {
            Some(rest.to_string())
        } else {
            None
        };
        if let Some(assignment) = assignment {
            if let Some((name, value)) = assignment.split_once('=') {
                pairs.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        i += 1;
    }
    pairs
}

/// A parsed client-side settings statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsStatement {
    Set {
        scope: SettingScope,
        name: String,
        value: Option<String>,
    },
    Show { name: String },
    Reset { name: Option<String> },
}

/// Parse SET / SHOW / RESET statements. `SET name TO DEFAULT` maps to a set
/// with no value, which behaves as a reset.
pub fn parse_settings_statement(sql_text: &str) -> Result<SettingsStatement, PgError> {
    let tokens = sql::tokenize(sql_text);
    let syntax_error =
        || PgError::new(SqlState::SyntaxError, format!("syntax error at \"{sql_text}\""));

    let first = tokens.first().ok_or_else(syntax_error)?;

    if first.is_keyword(sql_text, "show") {
        let name_token = tokens.get(1).ok_or_else(syntax_error)?;
        let mut name = name_token.text(sql_text).to_string();
        // SHOW TIME ZONE.
        if name_token.is_keyword(sql_text, "time")
            && tokens.get(2).map(|t| t.is_keyword(sql_text, "zone")) == Some(true)
        {
            name = "TimeZone".to_string();
        }
        return Ok(SettingsStatement::Show { name });
    }

    if first.is_keyword(sql_text, "reset") {
        let name_token = tokens.get(1).ok_or_else(syntax_error)?;
        if name_token.is_keyword(sql_text, "all") {
            return Ok(SettingsStatement::Reset { name: None });
        }
        return Ok(SettingsStatement::Reset {
            name: Some(qualified_name(sql_text, &tokens, 1).ok_or_else(syntax_error)?),
        });
    }

    if !first.is_keyword(sql_text, "set") {
        return Err(syntax_error());
    }

    let mut index = 1;
    let mut scope = SettingScope::Session;
    if let Some(token) = tokens.get(index) {
        if token.is_keyword(sql_text, "local") {
            scope = SettingScope::Local;
            index += 1;
        } else if token.is_keyword(sql_text, "session") {
            index += 1;
        }
    }

    // SET [LOCAL] TIME ZONE <value>.
    if tokens.get(index).map(|t| t.is_keyword(sql_text, "time")) == Some(true)
        && tokens.get(index + 1).map(|t| t.is_keyword(sql_text, "zone")) == Some(true)
    {
        let value = setting_value(sql_text, &tokens, index + 2).ok_or_else(syntax_error)?;
        return Ok(SettingsStatement::Set {
            scope,
            name: "TimeZone".to_string(),
            value,
        });
    }

    let name = qualified_name(sql_text, &tokens, index).ok_or_else(syntax_error)?;
    // The name may span several tokens; find the = or TO separator.
    let mut separator = index;
    while separator < tokens.len() {
        let token = &tokens[separator];
        if token.is_keyword(sql_text, "to")
            || (token.kind == TokenKind::Symbol && token.text(sql_text) == "=")
        {
            break;
        }
        separator += 1;
    }
    if separator == tokens.len() {
        return Err(syntax_error());
    }

    let value = setting_value(sql_text, &tokens, separator + 1).ok_or_else(syntax_error)?;
    Ok(SettingsStatement::Set { scope, name, value })
}

/// Read `name` or `schema.name` starting at `index`.
fn qualified_name(sql_text: &str, tokens: &[sql::Token], index: usize) -> Option<String> {
    let first = tokens.get(index)?;
    if first.kind != TokenKind::Ident && first.kind != TokenKind::QuotedIdent {
        return None;
    }
    let mut name = sql::unquote_identifier(first.text(sql_text));
    if let (Some(dot), Some(second)) = (tokens.get(index + 1), tokens.get(index + 2)) {
        if dot.kind == TokenKind::Symbol && dot.text(sql_text) == "." {
            name.push('.');
            name.push_str(&sql::unquote_identifier(second.text(sql_text)));
        }
    }
    Some(name)
}

/// The value after = / TO: a literal, identifier, number or DEFAULT (which
/// yields None). List values (e.g. DateStyle) are joined with commas.
fn setting_value(
    sql_text: &str,
    tokens: &[sql::Token],
    index: usize,
) -> Option<Option<String>> {
    let mut parts = Vec::new();
    let mut i = index;
    while i < tokens.len() {
        let token = &tokens[i];
        match token.kind {
            TokenKind::StringLiteral => {
                let text = token.text(sql_text);
                parts.push(text[1..text.len() - 1].replace("''", "'"));
            }
            TokenKind::Ident | TokenKind::Number | TokenKind::QuotedIdent => {
                parts.push(token.text(sql_text).to_string());
            }
            TokenKind::Symbol if token.text(sql_text) == "," => {}
            TokenKind::Symbol if token.text(sql_text) == "-" => {
                // A negative number: merge with the next token.
                if let Some(next) = tokens.get(i + 1) {
                    parts.push(format!("-{}", next.text(sql_text)));
                    i += 1;
                }
            }
            _ => return None,
        }
        i += 1;
    }

    if parts.is_empty() {
        return None;
    }
    if parts.len() == 1 && parts[0].eq_ignore_ascii_case("default") {
        return Some(None);
    }
    Some(Some(parts.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_show() {
        let session = SessionState::new();
        assert_eq!(session.show("server_version").unwrap(), DEFAULT_SERVER_VERSION);
        assert_eq!(session.show("TIMEZONE").unwrap(), "UTC");
        assert_eq!(session.show("integer_datetimes").unwrap(), "on");
        let err = session.show("nonexistent_setting").unwrap_err();
        assert_eq!(err.code, SqlState::UndefinedObject);
    }

    #[test]
    fn test_set_and_reset() {
        let mut session = SessionState::new();
        session
            .set(SettingScope::Session, "application_name", "psql")
            .unwrap();
        assert_eq!(session.show("application_name").unwrap(), "psql");

        session.reset("application_name").unwrap();
        assert_eq!(session.show("application_name").unwrap(), "");

        let err = session
            .set(SettingScope::Session, "bogus_setting", "x")
            .unwrap_err();
        assert_eq!(err.code, SqlState::UndefinedObject);
    }

    #[test]
    fn test_lenient_ignores_unknown() {
        let mut session = SessionState::new();
        session.lenient = true;
        session.set(SettingScope::Session, "bogus_setting", "x").unwrap();
        assert!(session.get("bogus_setting").is_none());
    }

    #[test]
    fn test_vendor_namespace_created_on_the_fly() {
        let mut session = SessionState::new();
        session
            .set(SettingScope::Session, "spanner.copy_batch_size", "100")
            .unwrap();
        assert_eq!(session.show("spanner.copy_batch_size").unwrap(), "100");
    }

    #[test]
    fn test_set_local_reverts_at_transaction_end() {
        let mut session = SessionState::new();
        session
            .set(SettingScope::Session, "application_name", "outer")
            .unwrap();
        session
            .set(SettingScope::Local, "application_name", "inner")
            .unwrap();
        assert_eq!(session.show("application_name").unwrap(), "inner");

        session.transaction_end();
        assert_eq!(session.show("application_name").unwrap(), "outer");
    }

    #[test]
    fn test_timezone_parsing() {
        let mut session = SessionState::new();
        assert_eq!(session.timezone(), Tz::UTC);
        session
            .set(SettingScope::Session, "TimeZone", "Europe/Amsterdam")
            .unwrap();
        assert_eq!(session.timezone(), Tz::Europe__Amsterdam);
        session.set(SettingScope::Session, "TimeZone", "Not/AZone").unwrap();
        assert_eq!(session.timezone(), Tz::UTC);
    }

    #[test]
    fn test_statement_timeout() {
        let mut session = SessionState::new();
        assert_eq!(session.statement_timeout(), None);
        session
            .set(SettingScope::Session, "spanner.statement_timeout", "250")
            .unwrap();
        assert_eq!(session.statement_timeout(), Some(Duration::from_millis(250)));
        session
            .set(SettingScope::Session, "spanner.statement_timeout", "2s")
            .unwrap();
        assert_eq!(session.statement_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_options() {
        assert_eq!(
            parse_options("-c search_path=public"),
            vec![("search_path".to_string(), "public".to_string())]
        );
        assert_eq!(
            parse_options("-c a=1 -c b=two"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string())
            ]
        );
        assert_eq!(
            parse_options("-c name=hello\\ world"),
            vec![("name".to_string(), "hello world".to_string())]
        );
        assert_eq!(
            parse_options("--application_name=myapp"),
            vec![("application_name".to_string(), "myapp".to_string())]
        );
        assert_eq!(parse_options("-v -x"), vec![]);
    }

    #[test]
    fn test_apply_startup_options() {
        let mut session = SessionState::new();
        session.apply_startup_parameter("options", "-c spanner.statement_timeout=5s");
        assert_eq!(session.show("spanner.statement_timeout").unwrap(), "5s");
    }

    #[test]
    fn test_parse_settings_statement() {
        assert_eq!(
            parse_settings_statement("SET application_name = 'psql'").unwrap(),
            SettingsStatement::Set {
                scope: SettingScope::Session,
                name: "application_name".to_string(),
                value: Some("psql".to_string()),
            }
        );
        assert_eq!(
            parse_settings_statement("set local search_path to myschema").unwrap(),
            SettingsStatement::Set {
                scope: SettingScope::Local,
                name: "search_path".to_string(),
                value: Some("myschema".to_string()),
            }
        );
        assert_eq!(
            parse_settings_statement("SET TIME ZONE 'Europe/Amsterdam'").unwrap(),
            SettingsStatement::Set {
                scope: SettingScope::Session,
                name: "TimeZone".to_string(),
                value: Some("Europe/Amsterdam".to_string()),
            }
        );
        assert_eq!(
            parse_settings_statement("SET spanner.autocommit_dml_mode = 'partitioned_non_atomic'")
                .unwrap(),
            SettingsStatement::Set {
                scope: SettingScope::Session,
                name: "spanner.autocommit_dml_mode".to_string(),
                value: Some("partitioned_non_atomic".to_string()),
            }
        );
        assert_eq!(
            parse_settings_statement("SET application_name TO DEFAULT").unwrap(),
            SettingsStatement::Set {
                scope: SettingScope::Session,
                name: "application_name".to_string(),
                value: None,
            }
        );
        assert_eq!(
            parse_settings_statement("SHOW TIME ZONE").unwrap(),
            SettingsStatement::Show {
                name: "TimeZone".to_string()
            }
        );
        assert_eq!(
            parse_settings_statement("RESET all").unwrap(),
            SettingsStatement::Reset { name: None }
        );
        assert_eq!(
            parse_settings_statement("RESET application_name").unwrap(),
            SettingsStatement::Reset {
                name: Some("application_name".to_string())
            }
        );
        assert!(parse_settings_statement("SET").is_err());
    }

    #[test]
    fn test_startup_parameter_status_order() {
        let session = SessionState::new();
        let names: Vec<String> = session
            .startup_parameter_status()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec![
                "server_version",
                "application_name",
                "is_superuser",
                "session_authorization",
                "integer_datetimes",
                "server_encoding",
                "client_encoding",
                "DateStyle",
                "IntervalStyle",
                "standard_conforming_strings",
                "TimeZone",
            ]
        );
    }
}
