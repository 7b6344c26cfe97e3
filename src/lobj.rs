//! Large object transfer.
//!
//! Values of the connect time resolved `lo` type and oversized binary parameters are moved
//! through the server's large object functions rather than inline literals. Large object
//! operations are only valid inside a transaction; with autocommit on, each operation set is
//! wrapped in its own short transaction.

use log::debug;

use crate::client::{Oid, WireClient};
use crate::connection::ConnCore;
use crate::error::Error;

/// Open mode bits of the server's large object protocol.
pub const INV_WRITE: i32 = 0x00020000;
pub const INV_READ: i32 = 0x00040000;

/// `lo_lseek` whence values.
pub const SEEK_SET: i32 = 0;
pub const SEEK_END: i32 = 2;

const LO_CHUNK: usize = 8192;

impl<C: WireClient> ConnCore<C> {
    /// Runs `body` inside a transaction: the open one when present, a private one otherwise.
    fn with_lo_transaction<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let private_txn = self.autocommit && !self.transact.in_transaction();
        if private_txn {
            self.exec_checked("BEGIN", "large_object")?;
        }
        let outcome = body(self);
        if private_txn {
            let end = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
            if let Err(err) = self.exec_checked(end, "large_object") {
                debug!("closing the large object transaction failed: {err}");
            }
        }
        outcome
    }

    /// Creates a large object holding `data` and returns its oid.
    pub fn create_large_object(&mut self, data: &[u8]) -> Result<Oid, Error> {
        self.with_lo_transaction(|core| {
            let client = core.client_mut()?;
            let oid = client.lo_creat()?;
            let fd = client.lo_open(oid, INV_WRITE)?;
            for chunk in data.chunks(LO_CHUNK) {
                let mut written = 0;
                while written < chunk.len() {
                    written += client.lo_write(fd, &chunk[written..])?;
                }
            }
            client.lo_close(fd)?;
            Ok(oid)
        })
    }

    /// Reads the complete content of a large object.
    pub fn read_large_object(&mut self, oid: Oid) -> Result<Vec<u8>, Error> {
        self.with_lo_transaction(|core| {
            let client = core.client_mut()?;
            let fd = client.lo_open(oid, INV_READ)?;
            let mut content = Vec::new();
            loop {
                let chunk = client.lo_read(fd, LO_CHUNK)?;
                if chunk.is_empty() {
                    break;
                }
                content.extend_from_slice(&chunk);
            }
            client.lo_close(fd)?;
            Ok(content)
        })
    }

    /// Overwrites a large object with `data`.
    pub fn write_large_object(&mut self, oid: Oid, data: &[u8]) -> Result<(), Error> {
        self.with_lo_transaction(|core| {
            let client = core.client_mut()?;
            let fd = client.lo_open(oid, INV_WRITE)?;
            client.lo_lseek(fd, 0, SEEK_SET)?;
            for chunk in data.chunks(LO_CHUNK) {
                let mut written = 0;
                while written < chunk.len() {
                    written += client.lo_write(fd, &chunk[written..])?;
                }
            }
            client.lo_close(fd)?;
            Ok(())
        })
    }

    /// Removes a large object.
    pub fn unlink_large_object(&mut self, oid: Oid) -> Result<(), Error> {
        self.with_lo_transaction(|core| {
            let client = core.client_mut()?;
            client.lo_unlink(oid)?;
            Ok(())
        })
    }
}
