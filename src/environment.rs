//! Process wide environment.
//!
//! The environment carries global configuration (declared ODBC version, pooling hints) and a
//! registry of the connections allocated through it. It is the only place in the crate with a
//! process wide lock; all other state lives in the connection and is protected by ownership.

use std::sync::{Arc, Mutex, Weak};

use crate::client::WireClient;
use crate::connection::Connection;
use crate::error::Error;
use crate::options::ConnectOptions;

/// ODBC behaviour declared by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OdbcVersion {
    V2,
    V3,
    #[default]
    V3_80,
}

/// Connection pooling hint. The driver core does not pool itself, but records the mode for the
/// outer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolingMode {
    #[default]
    Off,
    PerEnvironment,
}

#[derive(Default)]
struct EnvState {
    odbc_version: OdbcVersion,
    pooling: PoolingMode,
    /// Liveness tokens of connections opened through this environment.
    connections: Vec<Weak<()>>,
}

/// See the module documentation.
#[derive(Default)]
pub struct Environment {
    state: Mutex<EnvState>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Declares the ODBC version the application was written against.
    pub fn declare_version(&self, version: OdbcVersion) {
        self.lock().odbc_version = version;
    }

    pub fn odbc_version(&self) -> OdbcVersion {
        self.lock().odbc_version
    }

    pub fn set_pooling(&self, pooling: PoolingMode) {
        self.lock().pooling = pooling;
    }

    pub fn pooling(&self) -> PoolingMode {
        self.lock().pooling
    }

    /// Opens a connection from an ODBC style connection string and registers it.
    pub fn connect<C: WireClient>(
        &self,
        connection_string: &str,
    ) -> Result<Connection<C>, Error> {
        let options = ConnectOptions::parse(connection_string)?;
        let mut connection = Connection::establish(options)?;
        let token = Arc::new(());
        self.lock().connections.push(Arc::downgrade(&token));
        connection.register(token);
        Ok(connection)
    }

    /// Number of connections opened through this environment which are still alive.
    pub fn num_connections(&self) -> usize {
        let mut state = self.lock();
        state
            .connections
            .retain(|token| token.upgrade().is_some());
        state.connections.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnvState> {
        // A poisoned environment lock means another thread panicked mid-update of plain
        // bookkeeping data; continuing with it is sound.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_and_pooling_are_recorded() {
        let env = Environment::new();
        assert_eq!(OdbcVersion::V3_80, env.odbc_version());
        env.declare_version(OdbcVersion::V3);
        env.set_pooling(PoolingMode::PerEnvironment);
        assert_eq!(OdbcVersion::V3, env.odbc_version());
        assert_eq!(PoolingMode::PerEnvironment, env.pooling());
    }
}
