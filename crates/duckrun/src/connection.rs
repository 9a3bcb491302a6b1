//! Connections: opaque session ids inside the module, bound to the engine
//! that created them.

use std::sync::Weak;

use serde::Serialize;
use tracing::debug;

use crate::engine::Engine;
use crate::engine::Error;
use crate::engine::Inner;
use crate::engine::Result;
use crate::module::Arg;

/// Id of a connection inside the module.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<ConnectionId> for Arg {
    fn from(id: ConnectionId) -> Self {
        Arg::Number(id.0 as f64)
    }
}

/// A connection handle. Does not keep the engine alive.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    engine: Weak<Inner>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, engine: Weak<Inner>) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn engine(&self) -> Result<Engine> {
        self.engine
            .upgrade()
            .map(Engine::from_inner)
            .ok_or(Error::EngineDropped)
    }

    pub async fn run_query(&self, text: &str) -> Result<Vec<u8>> {
        self.engine()?.run_query(self.id, text).await
    }

    pub async fn send_query(&self, text: &str) -> Result<Vec<u8>> {
        self.engine()?.send_query(self.id, text).await
    }

    pub async fn fetch_query_results(&self) -> Result<Vec<u8>> {
        self.engine()?.fetch_query_results(self.id).await
    }

    /// Sends `text` and wraps the remaining fetch cycle.
    ///
    /// Dropping the stream before it is done abandons the rest of the
    /// results and frees the connection for its next query, which replaces
    /// the abandoned one inside the module.
    pub async fn stream(&self, text: &str) -> Result<QueryStream<'_>> {
        let header = self.send_query(text).await?;
        Ok(QueryStream {
            conn: self,
            header,
            done: false,
        })
    }

    pub async fn import_csv_from_path(
        &self,
        path: &str,
        options: &(impl Serialize + Sync),
    ) -> Result<()> {
        self.engine()?.import_csv_from_path(self.id, path, options).await
    }

    pub async fn import_json_from_path(
        &self,
        path: &str,
        options: &(impl Serialize + Sync),
    ) -> Result<()> {
        self.engine()?.import_json_from_path(self.id, path, options).await
    }

    /// Closes the connection. The id is dead afterwards.
    pub async fn disconnect(self) -> Result<()> {
        self.engine()?.disconnect(self.id).await
    }
}

/// The fetch side of a streamed query.
pub struct QueryStream<'c> {
    conn: &'c Connection,
    header: Vec<u8>,
    done: bool,
}

impl QueryStream<'_> {
    /// Bytes returned by the send call, e.g. the result schema.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Next result chunk, or `None` once the module sent the empty chunk.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let chunk = self.conn.fetch_query_results().await;
        match chunk {
            Ok(chunk) if chunk.is_empty() => {
                self.done = true;
                Ok(None)
            }
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for QueryStream<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(engine) = self.conn.engine.upgrade() {
            debug!(connection = %self.conn.id, "query stream abandoned");
            engine.set_streaming(self.conn.id, false);
        }
    }
}
