//! A concrete implementation of the `scidbtile::ArrayStore` interface for SciDB's shim.
//!
//! The shim is SciDB's HTTP front end. Each query runs in a session, one query at a time, so the
//! store keeps a small pool of sessions and hands one to each operation in flight.
//!
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

use scidbtile::{
    encode_cells, Array, ArrayStore, ArrayTile, Attribute, AttributeStats, ConnectionParameters,
    Error, Result, SingleAttributeChunk,
};

mod query;
mod session;
mod transport;

#[cfg(test)]
mod fake;

pub use session::ShimVersion;
pub use transport::{HttpTransport, Request, Response, Transport};

use session::{Connection, Session, State};

/// Connect to the shim described by `parameters`.
///
/// Fails with `Error::ProtocolVersion` if the shim's version isn't supported, or
/// `Error::Connection` if it can't be reached or refuses the credentials.
///
pub async fn open(parameters: &ConnectionParameters) -> Result<ShimStore> {
    let transport = Arc::new(HttpTransport::new(parameters)?);
    ShimStore::open_with(transport, parameters).await
}

/// An `ArrayStore` backed by a SciDB shim.
pub struct ShimStore {
    connection: Arc<Connection>,
    idle: Mutex<Vec<Session>>,
    permits: Semaphore,
}

impl ShimStore {
    /// Connect over a given transport.
    pub async fn open_with(
        transport: Arc<dyn Transport>,
        parameters: &ConnectionParameters,
    ) -> Result<Self> {
        let connection = Arc::new(Connection::handshake(transport, parameters).await?);

        // Open the first session now so bad credentials surface here
        let session = match connection.new_session().await {
            Ok(session) => session,
            Err(err) => {
                if let Err(logout) = connection.logout().await {
                    warn!(%logout, "failed to log out");
                }
                return Err(err);
            }
        };

        Ok(Self {
            connection,
            idle: Mutex::new(vec![session]),
            permits: Semaphore::new(parameters.max_sessions.max(1)),
        })
    }

    pub fn version(&self) -> ShimVersion {
        self.connection.version()
    }

    /// Release every idle session and log out. Sessions in use are released when their
    /// operations finish.
    pub async fn close(&self) -> Result<()> {
        self.permits.close();
        let sessions: Vec<Session> = self.idle.lock().drain(..).collect();
        for session in sessions {
            session.close().await?;
        }

        self.connection.logout().await
    }

    /// Borrow a session, waiting for one if `max_sessions` are in use.
    async fn session(&self) -> Result<PooledSession<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Transport(String::from("shim store is closed")))?;
        let idle = self.idle.lock().pop();
        let session = match idle {
            Some(session) => session,
            None => self.connection.new_session().await?,
        };

        Ok(PooledSession {
            session: Some(session),
            store: self,
            _permit: permit,
        })
    }

    /// Run a query whose output isn't needed.
    pub async fn execute(&self, query: &str) -> Result<()> {
        self.session().await?.execute(query, None).await
    }

    /// Run a query and return its output, as CSV text with a header line when `format` is `None`
    /// or else in the given binary format, e.g. `(float null,int64)`.
    ///
    pub async fn query(&self, query: &str, format: Option<&str>) -> Result<Bytes> {
        let mut session = self.session().await?;
        match format {
            None => Ok(Bytes::from(session.query_text(query).await?)),
            Some(format) => session.query_bytes(query, format).await,
        }
    }

    async fn query_text(&self, query: &str) -> Result<String> {
        self.session().await?.query_text(query).await
    }

    /// Values of `attribute` over `tile` as the store holds them now. A tile with no data reads as
    /// zeros, or nulls where the attribute is nullable.
    async fn current_values(
        &self,
        session: &mut Session,
        array: &Array,
        tile: &ArrayTile,
        attribute: &Attribute,
    ) -> Result<SingleAttributeChunk> {
        let query = query::between(array.name(), tile, &attribute.name);
        let bytes = session.query_bytes(&query, &attribute.format()).await?;
        match SingleAttributeChunk::decode(
            tile.clone(),
            attribute.clone(),
            self.wire_layout(attribute),
            &bytes,
        ) {
            Err(Error::NotFound(_)) => Ok(SingleAttributeChunk::empty(tile.clone(), attribute.clone())),
            result => result,
        }
    }
}

/// A session on loan from the pool. Goes back to the pool when dropped, unless a call on it was
/// interrupted, in which case it is released instead.
struct PooledSession<'a> {
    session: Option<Session>,
    store: &'a ShimStore,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if session.state() == State::Idle && !self.store.permits.is_closed() {
                self.store.idle.lock().push(session);
            } else {
                debug!(session = session.id(), "discarding session");
            }
        }
    }
}

#[async_trait]
impl ArrayStore for ShimStore {
    async fn list_arrays(&self) -> Result<Vec<String>> {
        let text = self.query_text(&query::list_arrays()).await?;
        Ok(query::parse_names(&text))
    }

    #[instrument(skip(self))]
    async fn describe_array(&self, name: &str) -> Result<Array> {
        let mut session = self.session().await?;
        let dimensions = query::parse_dimensions(&session.query_text(&query::dimensions(name)).await?)?;
        let attributes = query::parse_attributes(&session.query_text(&query::attributes(name)).await?)?;
        let srs = query::parse_srs(&session.query_text(&query::get_srs(name)).await?)?;
        let trs = query::parse_trs(&session.query_text(&query::get_trs(name)).await?)?;

        let mut array = Array::new(name, dimensions, attributes)?;
        if let Some(srs) = srs {
            array = array.with_spatial(srs)?;
        }
        if let Some(trs) = trs {
            array = array.with_temporal(trs)?;
        }

        Ok(array)
    }

    #[instrument(skip_all, fields(array = array.name()))]
    async fn create_array(&self, array: &Array) -> Result<()> {
        let mut session = self.session().await?;
        session.execute(&query::create(array), None).await?;

        let mut references = vec![];
        if let Ok(srs) = array.spatial_reference() {
            references.push(query::set_srs(array.name(), srs));
        }
        if let Ok(trs) = array.temporal_reference() {
            references.push(query::set_trs(array.name(), trs));
        }
        for reference in references {
            if let Err(err) = session.execute(&reference, None).await {
                // Don't leave a half-made array behind
                drop(session);
                if let Err(cleanup) = self.drop_array(array.name()).await {
                    warn!(%cleanup, "failed to remove partially created array");
                }
                return Err(err);
            }
        }

        Ok(())
    }

    async fn drop_array(&self, name: &str) -> Result<()> {
        self.session()
            .await?
            .execute(&query::remove(name), None)
            .await
    }

    #[instrument(skip(self, array), fields(array = array.name()))]
    async fn fetch_tile(&self, array: &Array, tile: &ArrayTile, attribute: &str) -> Result<Bytes> {
        let format = array.attribute(attribute)?.format();
        let query = query::between(array.name(), tile, attribute);

        self.session().await?.query_bytes(&query, &format).await
    }

    #[instrument(skip(self, array, data), fields(array = array.name()))]
    async fn store_tile(
        &self,
        array: &Array,
        tile: &ArrayTile,
        attribute: &str,
        data: Bytes,
    ) -> Result<()> {
        let attribute = array.attribute(attribute)?;
        let mut session = self.session().await?;

        // An insert writes every attribute, so the others go along with their current values
        let data = if array.attributes().len() > 1 {
            let written = SingleAttributeChunk::decode(
                tile.clone(),
                attribute.clone(),
                self.wire_layout(attribute),
                &data,
            )?;
            let mut chunks = Vec::with_capacity(array.attributes().len());
            for other in array.attributes() {
                if other.name == attribute.name {
                    chunks.push(written.clone());
                } else {
                    chunks.push(self.current_values(&mut session, array, tile, other).await?);
                }
            }
            let cells: Vec<_> = chunks
                .iter()
                .map(|chunk| (chunk, self.wire_layout(chunk.attribute())))
                .collect();

            Bytes::from(encode_cells(&cells)?)
        } else {
            data
        };

        let path = session.upload(data).await?;
        session
            .execute(&query::insert_tile(array, tile, &path), None)
            .await
    }

    async fn attribute_stats(&self, array: &Array, attribute: &str) -> Result<AttributeStats> {
        array.attribute(attribute)?;
        let text = self
            .query_text(&query::aggregate(array.name(), attribute))
            .await?;

        query::parse_stats(&text, array.name(), attribute)
    }
}
