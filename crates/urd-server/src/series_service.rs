use std::io;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use urd_cluster::MetaNode;
use urd_db::{ChunkWriter, Database, Engine, PointsWriter, ShardTransport};
use urd_proto::v1::{
    series_service_server::SeriesService, OutputMode, QueryChunk, QueryRequest, UserCredentials,
    WriteSeriesRequest, WriteSeriesResponse,
};
use urd_types::{TimePrecision, UrdError, User};

use crate::convert::{query_from_proto, urd_to_status};

type ChunkTx = mpsc::UnboundedSender<Result<QueryChunk, Status>>;

/// `io::Write` end of a response stream: bytes written between two flushes
/// become one `QueryChunk`.
struct ChunkSink {
    buf: Vec<u8>,
    tx: ChunkTx,
}

impl io::Write for ChunkSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let json = std::mem::take(&mut self.buf);
        self.tx
            .send(Ok(QueryChunk { json }))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

pub struct SeriesServiceImpl<M, T> {
    engine: Engine<M, T>,
}

impl<M, T> SeriesServiceImpl<M, T> {
    pub fn new(engine: Engine<M, T>) -> Self {
        SeriesServiceImpl { engine }
    }
}

impl<M: MetaNode, T: ShardTransport> SeriesServiceImpl<M, T> {
    /// Resolves request credentials. `None` runs unrestricted: either no
    /// credentials were sent or they belong to a cluster admin.
    async fn authorize(
        &self,
        db: &Database<M, T>,
        creds: Option<UserCredentials>,
    ) -> Result<Option<User>, Status> {
        let Some(creds) = creds else {
            return Ok(None);
        };
        match db.authenticate(&creds.user, &creds.password).await {
            Ok(user) => Ok(Some(user)),
            Err(UrdError::UserNotFound) => {
                self.engine
                    .authenticate_cluster_admin(&creds.user, &creds.password)
                    .await
                    .map_err(|_| Status::unauthenticated(format!("invalid credentials for '{}'", creds.user)))?;
                Ok(None)
            }
            Err(UrdError::PermissionDenied(msg)) => Err(Status::unauthenticated(msg)),
            Err(e) => Err(urd_to_status(e)),
        }
    }
}

#[tonic::async_trait]
impl<M: MetaNode, T: ShardTransport> SeriesService for SeriesServiceImpl<M, T> {
    async fn write_series(
        &self,
        request: Request<WriteSeriesRequest>,
    ) -> Result<Response<WriteSeriesResponse>, Status> {
        let req = request.into_inner();
        let db = self.engine.database(&req.database).map_err(urd_to_status)?;
        let user = self.authorize(&db, req.credentials).await?;
        let precision = TimePrecision::parse(&req.time_precision).map_err(urd_to_status)?;
        db.write_payload(user.as_ref(), &req.payload, precision)
            .await
            .map_err(urd_to_status)?;
        Ok(Response::new(WriteSeriesResponse {}))
    }

    type QueryStream = UnboundedReceiverStream<Result<QueryChunk, Status>>;

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        let req = request.into_inner();
        let db = self.engine.database(&req.database).map_err(urd_to_status)?;
        let user = self.authorize(&db, req.credentials).await?;
        let spec = req.query.ok_or_else(|| Status::invalid_argument("query required"))?;
        let query = query_from_proto(spec).map_err(urd_to_status)?;
        let precision = TimePrecision::parse(&req.time_precision).map_err(urd_to_status)?;
        let mode = OutputMode::try_from(req.mode).unwrap_or(OutputMode::Buffered);
        let pretty = req.pretty;

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChunkSink { buf: Vec::new(), tx: tx.clone() };
        tokio::spawn(async move {
            let result = match mode {
                OutputMode::Buffered => {
                    let mut writer = PointsWriter::new(sink, precision, pretty);
                    db.execute_query(user.as_ref(), &query, &mut writer).await
                }
                OutputMode::Chunked => {
                    let mut writer = ChunkWriter::new(sink, precision, pretty);
                    db.execute_query(user.as_ref(), &query, &mut writer).await
                }
            };
            match result {
                Ok(()) => debug!(database = db.name(), "query finished"),
                Err(e) => {
                    warn!(database = db.name(), error = %e, "query failed");
                    let _ = tx.send(Err(urd_to_status(e)));
                }
            }
        });
        Ok(Response::new(UnboundedReceiverStream::new(rx)))
    }
}
