//! Fake upstream update server: serves a scriptable master index, master
//! entries, and leaf archives over the real wire framing so the driver
//! and client can be exercised end to end without a real game server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use revcache_core::codec::{ContainerCodec, IdentityContainerCodec};
use revcache_core::wire::{FRAME_HEADER_LEN, FRAME_SIZE, HandshakeRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Everything the fake server knows how to answer. `master_index` is the
/// raw (uncontainered) bytes of the master index table; `master_entries`
/// and `archives` are likewise raw, pre-container bytes, keyed by index
/// and `(index, archive)` respectively. The server containers everything
/// itself with [`IdentityContainerCodec`] before sending it.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub handshake_ok: bool,
    pub master_index: Vec<u8>,
    pub master_entries: HashMap<u8, Vec<u8>>,
    pub archives: HashMap<(u8, u16), Vec<u8>>,
    /// When set, the bytes actually sent for this archive differ from
    /// what its descriptor's CRC would predict — used to test the
    /// integrity-failure path.
    pub corrupt_archives: HashMap<(u8, u16), Vec<u8>>,
}

impl World {
    pub fn new() -> Self {
        Self {
            handshake_ok: true,
            ..Default::default()
        }
    }
}

pub struct FakeServer {
    pub addr: String,
    world: Arc<Mutex<World>>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn(world: World) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let world = Arc::new(Mutex::new(world));
        let accept_world = world.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let world = accept_world.clone();
                tokio::spawn(serve_connection(stream, world));
            }
        });

        Self { addr, world, handle }
    }

    /// Mutate the served world in place; the next accepted connection
    /// (and any still-open one, since each request reads fresh state)
    /// observes the change.
    pub fn update(&self, f: impl FnOnce(&mut World)) {
        let mut guard = self.world.lock().unwrap();
        f(&mut guard);
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn serve_connection(mut stream: tokio::net::TcpStream, world: Arc<Mutex<World>>) {
    let mut handshake_buf = [0u8; HandshakeRequest::WIRE_LEN];
    if stream.read_exact(&mut handshake_buf).await.is_err() {
        return;
    }
    let ok = world.lock().unwrap().handshake_ok;
    if stream.write_all(&[if ok { 0 } else { 6 }]).await.is_err() || !ok {
        return;
    }

    // Session prelude: encryption-key command (17 bytes) + client-info
    // command (5 bytes), sent unconditionally right after a successful
    // handshake. Opaque to this fake server — just drained.
    let mut prelude_buf = [0u8; 22];
    if stream.read_exact(&mut prelude_buf).await.is_err() {
        return;
    }

    loop {
        let mut req_buf = [0u8; 4];
        if stream.read_exact(&mut req_buf).await.is_err() {
            return;
        }
        let index = req_buf[1];
        let archive = u16::from_be_bytes([req_buf[2], req_buf[3]]);

        let payload = {
            let guard = world.lock().unwrap();
            resolve(&guard, index, archive)
        };
        let Some(payload) = payload else {
            continue;
        };
        if write_framed_response(&mut stream, index, archive, &payload).await.is_err() {
            return;
        }
    }
}

fn resolve(world: &World, index: u8, archive: u16) -> Option<Vec<u8>> {
    let codec = IdentityContainerCodec;
    if index == 255 && archive == 255 {
        return Some(codec.encode(&world.master_index, 0, -1).unwrap().bytes);
    }
    if index == 255 {
        let raw = world.master_entries.get(&(archive as u8))?;
        return Some(codec.encode(raw, 0, -1).unwrap().bytes);
    }
    if let Some(corrupt) = world.corrupt_archives.get(&(index, archive)) {
        return Some(codec.encode(corrupt, 0, -1).unwrap().bytes);
    }
    let raw = world.archives.get(&(index, archive))?;
    Some(codec.encode(raw, 0, -1).unwrap().bytes)
}

async fn write_framed_response(
    stream: &mut tokio::net::TcpStream,
    index: u8,
    archive: u16,
    payload: &[u8],
) -> std::io::Result<()> {
    let compression_type = payload[0];
    let compressed_size = u32::from_be_bytes(payload[1..5].try_into().unwrap());

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = index;
    header[1..3].copy_from_slice(&archive.to_be_bytes());
    header[3] = compression_type;
    header[4..8].copy_from_slice(&compressed_size.to_be_bytes());
    stream.write_all(&header).await?;

    let mut offset = 0;
    let mut first = true;
    while offset < payload.len() {
        let capacity = if first { FRAME_SIZE } else { FRAME_SIZE - 1 };
        let take = capacity.min(payload.len() - offset);
        if !first {
            stream.write_all(&[0xFF]).await?;
        }
        stream.write_all(&payload[offset..offset + take]).await?;
        offset += take;
        first = false;
    }
    Ok(())
}
