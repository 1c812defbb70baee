//! Pipelined update-protocol client: one TCP connection, a bounded number
//! of in-flight `requestFile` calls, and a background task that
//! reassembles framed responses and routes them back to their caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};

use revcache_core::wire::{
    ArchiveRequest, FrameHeader, HandshakeRequest, HandshakeResponse, RequestKey, RequestPriority, SessionPrelude,
    WireError, FRAME_HEADER_LEN, FRAME_SIZE, MASTER_INDEX, MAX_REQUESTS,
};

use crate::error::SyncError;

/// The client's position in the protocol's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Connected,
    Closed,
}

type PendingMap = Arc<Mutex<HashMap<RequestKey, oneshot::Sender<Bytes>>>>;

/// The result of a handshake attempt. Rejection is a normal outcome — not
/// an error — matching the upstream protocol's "out of date" semantics: a
/// rejected handshake ends the run with no downloads attempted and no
/// non-zero exit status.
pub enum HandshakeOutcome {
    Connected(Client),
    Rejected(u8),
}

/// A connected, handshaken client. `Client::handshake` is the only way to
/// obtain one — there is no way to issue a `requestFile` against a
/// connection that hasn't completed the handshake.
pub struct Client {
    write: Mutex<BufWriter<OwnedWriteHalf>>,
    pending: PendingMap,
    semaphore: Arc<Semaphore>,
    state: Arc<StdMutex<ClientState>>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
}

/// A `requestFile` call that has been written (and possibly flushed) but
/// not yet awaited. Holding one reserves its pipeline slot; dropping it
/// without calling [`PendingFile::wait`] releases the slot without ever
/// yielding a result.
pub struct PendingFile {
    rx: oneshot::Receiver<Bytes>,
    _permit: OwnedSemaphorePermit,
}

impl PendingFile {
    pub async fn wait(self) -> Result<Bytes, SyncError> {
        self.rx.await.map_err(|_| {
            SyncError::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection closed while awaiting archive response",
            ))
        })
    }
}

impl Client {
    /// Connect to `addr` and perform the handshake. `revision` is the
    /// client's current build revision; `keys` are the four session keys
    /// the upstream server expects to echo back in its own handshake
    /// machinery (opaque to this client).
    ///
    /// A rejected handshake is `Ok(HandshakeOutcome::Rejected(code))`, not
    /// an error: the caller ends the run with no downloads attempted, and
    /// no failure status.
    pub async fn handshake(addr: &str, revision: i32, keys: [i32; 4]) -> Result<HandshakeOutcome, SyncError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(addr, revision, "sending handshake");

        let req = HandshakeRequest::new(revision, keys);
        stream.write_all(&req.to_bytes()).await?;

        let mut response_byte = [0u8; 1];
        stream.read_exact(&mut response_byte).await?;
        let response = HandshakeResponse(response_byte[0]);
        if !response.is_ok() {
            let reason = WireError::HandshakeRejected(response.0);
            tracing::warn!(code = response.0, %reason, "handshake rejected");
            return Ok(HandshakeOutcome::Rejected(response.0));
        }

        let prelude = SessionPrelude { revision, key: keys };
        stream.write_all(&prelude.encryption_key_command()).await?;
        stream.write_all(&prelude.client_info_command()).await?;

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(StdMutex::new(ClientState::Connected));
        let reader_handle = tokio::spawn(read_loop(read_half, pending.clone(), state.clone()));

        tracing::info!(addr, "handshake accepted");
        Ok(HandshakeOutcome::Connected(Self {
            write: Mutex::new(BufWriter::new(write_half)),
            pending,
            semaphore: Arc::new(Semaphore::new(MAX_REQUESTS)),
            state,
            reader_handle: Some(reader_handle),
        }))
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// Enqueue one archive request without necessarily sending it yet.
    /// Blocks until a pipeline slot is free — at most [`MAX_REQUESTS`]
    /// calls are ever in flight across this client at once. The write is
    /// batched into the connection's write buffer; pass `flush = true` to
    /// force it onto the wire immediately, or `false` to let it ride
    /// along with a later flush (see [`Client::flush`]).
    pub async fn enqueue_file(
        &self,
        priority: RequestPriority,
        index: u8,
        archive: u16,
        flush: bool,
    ) -> Result<PendingFile, SyncError> {
        if self.state() != ClientState::Connected {
            return Err(SyncError::Protocol("enqueue_file called outside CONNECTED state".into()));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Protocol("request pipeline semaphore closed".into()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert((index, archive), tx);
        }

        let request = ArchiveRequest::new(priority, index, archive);
        {
            let mut write = self.write.lock().await;
            write.write_all(&request.to_bytes()).await?;
            if flush {
                write.flush().await?;
            }
        }

        Ok(PendingFile { rx, _permit: permit })
    }

    /// Force every batched write since the last flush onto the wire.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let mut write = self.write.lock().await;
        write.flush().await?;
        Ok(())
    }

    /// Request one archive's compressed bytes and wait for it. A
    /// convenience over `enqueue_file(...).wait()` for the common case of
    /// a single round-trip request.
    pub async fn request_file(&self, priority: RequestPriority, index: u8, archive: u16, flush: bool) -> Result<Bytes, SyncError> {
        self.enqueue_file(priority, index, archive, flush).await?.wait().await
    }

    /// Fetch the master index itself: `(255, 255)`. Always flushed —
    /// this is a lone urgent round-trip, not part of a batch.
    pub async fn request_master_index(&self) -> Result<Bytes, SyncError> {
        self.request_file(RequestPriority::Urgent, MASTER_INDEX, MASTER_INDEX as u16, true).await
    }

    /// Fetch the master entry for index `index`: `(255, index)`. Always
    /// flushed, same reasoning as [`Client::request_master_index`].
    pub async fn request_master_entry(&self, index: u8) -> Result<Bytes, SyncError> {
        self.request_file(RequestPriority::Urgent, MASTER_INDEX, index as u16, true).await
    }

    /// Close the connection. Any `requestFile` calls still waiting on a
    /// response fail with a network error.
    pub async fn close(&mut self) -> Result<(), SyncError> {
        *self.state.lock().unwrap() = ClientState::Closed;
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        let mut write = self.write.lock().await;
        write.shutdown().await?;
        tracing::info!("connection closed");
        Ok(())
    }
}

async fn read_loop(mut read: OwnedReadHalf, pending: PendingMap, state: Arc<StdMutex<ClientState>>) {
    loop {
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        if read.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let header = FrameHeader::parse(&header_buf);
        let total = header.payload_len();

        let mut payload = Vec::with_capacity(total);
        let mut first = true;
        let mut failed = false;
        while payload.len() < total {
            let remaining = total - payload.len();
            let frame_capacity = if first { FRAME_SIZE } else { FRAME_SIZE - 1 };
            let to_read = remaining.min(frame_capacity) + usize::from(!first);
            let mut frame = vec![0u8; to_read];
            if read.read_exact(&mut frame).await.is_err() {
                failed = true;
                break;
            }
            let data = if first { &frame[..] } else { &frame[1..] };
            payload.extend_from_slice(data);
            first = false;
        }
        if failed {
            break;
        }

        let key = header.key();
        let sender = {
            let mut map = pending.lock().await;
            map.remove(&key)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(Bytes::from(payload));
            }
            None => tracing::warn!(?key, "response for no pending request, dropping"),
        }
    }

    *state.lock().unwrap() = ClientState::Closed;
    let mut map = pending.lock().await;
    map.clear();
}
