//! Connection string parsing.
//!
//! Options arrive as an ODBC style `key=value;` string. Recognised keys are parsed into a typed
//! [`ConnectOptions`]; unknown keys are ignored with a debug log so that DSN entries aimed at
//! other driver versions do not fail the connect.

use std::fmt;

use bitflags::bitflags;
use log::debug;

use crate::error::Error;
use crate::types::Int8Presentation;

/// SSL negotiation policy passed through to the wire client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value {
            "disable" => SslMode::Disable,
            "allow" => SslMode::Allow,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            "verify-ca" => SslMode::VerifyCa,
            "verify-full" => SslMode::VerifyFull,
            other => return Err(Error::InvalidOption(format!("sslmode={other}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

/// Recovery behaviour when a statement fails inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackOnError {
    /// Leave the transaction in error, the application must roll back.
    None,
    /// Roll back the whole transaction.
    #[default]
    Transaction,
    /// Wrap every statement in a savepoint and roll back to it on error.
    Statement,
}

bitflags! {
    /// Which driver side updatable cursor flavours are enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdatableCursors: u8 {
        const STATIC         = 0x01;
        const KEYSET_DRIVEN  = 0x02;
        const BULK_OPS       = 0x04;
        const SENSE_SELF_OPS = 0x08;
    }
}

/// Typed view of the recognised connection string keys.
#[derive(Clone)]
pub struct ConnectOptions {
    pub dsn: String,
    pub server: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub sslmode: SslMode,
    pub connect_timeout: Option<u32>,
    pub disallow_premature: bool,
    pub allow_keyset: bool,
    pub updatable_cursors: UpdatableCursors,
    pub lf_conversion: bool,
    pub true_is_minus1: bool,
    pub int8_as: Int8Presentation,
    pub bytea_as_longvarbinary: bool,
    pub use_server_side_prepare: bool,
    pub lower_case_identifier: bool,
    pub rollback_on_error: RollbackOnError,
    pub keepalive_idle: Option<u32>,
    pub keepalive_interval: Option<u32>,
    pub fake_oid_index: bool,
    pub row_versioning: bool,
    pub show_oid_column: bool,
    pub show_system_tables: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            dsn: String::new(),
            server: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            sslmode: SslMode::default(),
            connect_timeout: None,
            disallow_premature: false,
            allow_keyset: true,
            updatable_cursors: UpdatableCursors::STATIC | UpdatableCursors::KEYSET_DRIVEN,
            lf_conversion: false,
            true_is_minus1: false,
            int8_as: Int8Presentation::Default,
            bytea_as_longvarbinary: false,
            use_server_side_prepare: false,
            lower_case_identifier: true,
            rollback_on_error: RollbackOnError::default(),
            keepalive_idle: None,
            keepalive_interval: None,
            fake_oid_index: false,
            row_versioning: false,
            show_oid_column: false,
            show_system_tables: false,
        }
    }
}

impl ConnectOptions {
    /// Parses a `key=value;` connection string. Later occurrences of a key win.
    pub fn parse(connection_string: &str) -> Result<Self, Error> {
        let mut options = ConnectOptions::default();
        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidOption(pair.to_string()))?;
            options.apply(key.trim(), value.trim())?;
        }
        Ok(options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let invalid = || Error::InvalidOption(format!("{key}={value}"));
        match key.to_ascii_lowercase().as_str() {
            "dsn" => self.dsn = value.to_string(),
            "server" | "servername" | "host" => self.server = value.to_string(),
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "database" | "dbname" => self.database = value.to_string(),
            "username" | "uid" | "user" => self.username = value.to_string(),
            "password" | "pwd" => self.password = value.to_string(),
            "sslmode" => self.sslmode = SslMode::parse(value)?,
            "connect_timeout" => {
                self.connect_timeout = Some(value.parse().map_err(|_| invalid())?)
            }
            "disallow_premature" => self.disallow_premature = parse_bool(value)?,
            "allow_keyset" => self.allow_keyset = parse_bool(value)?,
            "updatable_cursors" => {
                let bits: u8 = value.parse().map_err(|_| invalid())?;
                self.updatable_cursors =
                    UpdatableCursors::from_bits(bits).ok_or_else(invalid)?;
            }
            "lf_conversion" => self.lf_conversion = parse_bool(value)?,
            "true_is_minus1" => self.true_is_minus1 = parse_bool(value)?,
            "int8_as" => {
                self.int8_as = match value.to_ascii_lowercase().as_str() {
                    "default" => Int8Presentation::Default,
                    "bigint" => Int8Presentation::BigInt,
                    "numeric" => Int8Presentation::Numeric,
                    "varchar" => Int8Presentation::Varchar,
                    "double" => Int8Presentation::Double,
                    "integer" => Int8Presentation::Integer,
                    _ => return Err(invalid()),
                }
            }
            "bytea_as_longvarbinary" => self.bytea_as_longvarbinary = parse_bool(value)?,
            "use_server_side_prepare" => self.use_server_side_prepare = parse_bool(value)?,
            "lower_case_identifier" => self.lower_case_identifier = parse_bool(value)?,
            "rollback_on_error" => {
                self.rollback_on_error = match value {
                    "0" => RollbackOnError::None,
                    "1" => RollbackOnError::Transaction,
                    "2" => RollbackOnError::Statement,
                    _ => return Err(invalid()),
                }
            }
            "keepalive_idle" => self.keepalive_idle = Some(value.parse().map_err(|_| invalid())?),
            "keepalive_interval" => {
                self.keepalive_interval = Some(value.parse().map_err(|_| invalid())?)
            }
            "fake_oid_index" => self.fake_oid_index = parse_bool(value)?,
            "row_versioning" => self.row_versioning = parse_bool(value)?,
            "show_oid_column" => self.show_oid_column = parse_bool(value)?,
            "show_system_tables" => self.show_system_tables = parse_bool(value)?,
            other => debug!("ignoring unrecognized connection option '{other}'"),
        }
        Ok(())
    }

    /// Session parameters handed to the wire client's connect.
    pub fn wire_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("host".to_string(), self.server.clone()),
            ("port".to_string(), self.port.to_string()),
        ];
        if !self.database.is_empty() {
            params.push(("dbname".to_string(), self.database.clone()));
        }
        if !self.username.is_empty() {
            params.push(("user".to_string(), self.username.clone()));
        }
        if !self.password.is_empty() {
            params.push(("password".to_string(), self.password.clone()));
        }
        params.push(("sslmode".to_string(), self.sslmode.as_str().to_string()));
        if let Some(timeout) = self.connect_timeout {
            params.push(("connect_timeout".to_string(), timeout.to_string()));
        }
        if let Some(idle) = self.keepalive_idle {
            params.push(("keepalives_idle".to_string(), idle.to_string()));
        }
        if let Some(interval) = self.keepalive_interval {
            params.push(("keepalives_interval".to_string(), interval.to_string()));
        }
        params
    }
}

/// The auth secret must never reach the log sink.
impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("dsn", &self.dsn)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"********")
            .field("sslmode", &self.sslmode)
            .field("updatable_cursors", &self.updatable_cursors)
            .field("rollback_on_error", &self.rollback_on_error)
            .finish_non_exhaustive()
    }
}

fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidOption(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_typical_connection_string() {
        let options = ConnectOptions::parse(
            "server=db.example.com;port=5433;database=app;username=bob;password=sec;ret\
             was-not-a-key",
        );
        // The password contains no separator here, the malformed tail errors out.
        assert!(options.is_err());

        let options = ConnectOptions::parse(
            "server=db.example.com;port=5433;database=app;username=bob;password=secret;\
             sslmode=require;rollback_on_error=2;lf_conversion=1",
        )
        .unwrap();
        assert_eq!("db.example.com", options.server);
        assert_eq!(5433, options.port);
        assert_eq!(SslMode::Require, options.sslmode);
        assert_eq!(RollbackOnError::Statement, options.rollback_on_error);
        assert!(options.lf_conversion);
    }

    #[test]
    fn defaults() {
        let options = ConnectOptions::parse("").unwrap();
        assert_eq!(5432, options.port);
        assert_eq!(RollbackOnError::Transaction, options.rollback_on_error);
        assert!(options.updatable_cursors.contains(UpdatableCursors::KEYSET_DRIVEN));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let options = ConnectOptions::parse("server=x;some_future_option=7").unwrap();
        assert_eq!("x", options.server);
    }

    #[test]
    fn updatable_cursors_bitmask() {
        let options = ConnectOptions::parse("updatable_cursors=7").unwrap();
        assert!(options.updatable_cursors.contains(UpdatableCursors::BULK_OPS));
        assert!(!options
            .updatable_cursors
            .contains(UpdatableCursors::SENSE_SELF_OPS));
    }

    #[test]
    fn password_is_not_in_debug_output() {
        let options = ConnectOptions::parse("password=topsecret").unwrap();
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("topsecret"));
    }

    #[test]
    fn wire_params_carry_identity() {
        let options =
            ConnectOptions::parse("server=h;database=d;username=u;password=p").unwrap();
        let params = options.wire_params();
        assert!(params.contains(&("dbname".to_string(), "d".to_string())));
        assert!(params.contains(&("user".to_string(), "u".to_string())));
    }
}
