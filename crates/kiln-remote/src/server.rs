use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::{
    command::{CommandRegistry, RequestContext, ServerOutcome},
    frame::{read_frame, write_frame, Frame},
    FourCC, RemoteError,
};

/// A response frame plus the extra bodies stitched after its payload.
struct OutMessage {
    frame: Frame,
    bodies: Vec<Vec<u8>>,
}

struct DeferredRequest {
    conn: u64,
    cookie: u64,
}

struct ServerState {
    connections: HashMap<u64, mpsc::UnboundedSender<OutMessage>>,
    deferred: HashMap<FourCC, VecDeque<DeferredRequest>>,
    next_conn: u64,
}

struct ServerInner {
    registry: Arc<CommandRegistry>,
    state: Mutex<ServerState>,
}

/// Listening half of the command bus. Accepts connections and dispatches
/// incoming requests to registered server handlers.
pub struct RemoteServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl RemoteServer {
    /// Binds to `addr` and starts accepting connections.
    pub async fn bind(addr: &str, registry: Arc<CommandRegistry>) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            registry,
            state: Mutex::new(ServerState {
                connections: HashMap::new(),
                deferred: HashMap::new(),
                next_conn: 1,
            }),
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("connection accepted from {}", peer);
                        serve_connection(Arc::clone(&accept_inner), stream);
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                        break;
                    }
                }
            }
        });

        info!("command server listening on {}", local_addr);
        Ok(Self {
            inner,
            local_addr,
            accept_task,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Completes the oldest deferred request for `command`.
    pub fn send_response(
        &self,
        command: FourCC,
        payload: Vec<u8>,
        error: bool,
        error_desc: &str,
    ) -> Result<(), RemoteError> {
        self.respond(command, payload, Vec::new(), error, error_desc)
    }

    /// Completes the oldest deferred request for `command`, stitching
    /// `bodies` after `payload` into a single response frame without an
    /// intermediate copy.
    pub fn send_response_merge(
        &self,
        command: FourCC,
        payload: Vec<u8>,
        bodies: Vec<Vec<u8>>,
        error: bool,
        error_desc: &str,
    ) -> Result<(), RemoteError> {
        self.respond(command, payload, bodies, error, error_desc)
    }

    fn respond(
        &self,
        command: FourCC,
        payload: Vec<u8>,
        bodies: Vec<Vec<u8>>,
        error: bool,
        error_desc: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.inner.state.lock().unwrap();
        let pending = state
            .deferred
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
            .ok_or(RemoteError::NoPendingRequest(command))?;

        if let Some(tx) = state.connections.get(&pending.conn) {
            let frame = Frame::response(command, pending.cookie, payload, error, error_desc);
            // A send failure means the connection died; the request was
            // already dropped with it.
            let _ = tx.send(OutMessage { frame, bodies });
        }
        Ok(())
    }
}

fn serve_connection(inner: Arc<ServerInner>, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutMessage>();

    let conn = {
        let mut state = inner.state.lock().unwrap();
        let conn = state.next_conn;
        state.next_conn += 1;
        state.connections.insert(conn, tx);
        conn
    };

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let bodies: Vec<&[u8]> = msg.bodies.iter().map(Vec::as_slice).collect();
            if let Err(err) = write_frame(&mut writer, &msg.frame, &bodies).await {
                warn!("response write failed: {}", err);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("connection {} closed: {}", conn, err);
                    break;
                }
            };
            if frame.is_response {
                warn!("dropping unexpected response frame on server side");
                continue;
            }
            handle_request(&inner, conn, frame).await;
        }

        let mut state = inner.state.lock().unwrap();
        state.connections.remove(&conn);
        for queue in state.deferred.values_mut() {
            queue.retain(|pending| pending.conn != conn);
        }
    });
}

async fn handle_request(inner: &Arc<ServerInner>, conn: u64, frame: Frame) {
    let command = frame.command;
    let cookie = frame.cookie;

    let Some(desc) = inner.registry.find(command) else {
        reply(inner, conn, command, cookie, Vec::new(), true, "unknown command");
        return;
    };
    let Some(handler) = desc.server_fn else {
        reply(inner, conn, command, cookie, Vec::new(), true, "command has no server handler");
        return;
    };

    // Async commands are parked before the handler runs so a handler that
    // completes synchronously still finds its request queued.
    if desc.is_async {
        let mut state = inner.state.lock().unwrap();
        state
            .deferred
            .entry(command)
            .or_default()
            .push_back(DeferredRequest { conn, cookie });
    }

    let context = RequestContext { command, cookie };
    let payload = frame.payload;
    // Handlers may block on disk; keep them off the reactor threads but
    // await the result so frames on one connection stay ordered.
    let outcome = tokio::task::spawn_blocking(move || handler(&context, &payload)).await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => ServerOutcome::Error(format!("handler panicked: {}", err)),
    };

    match outcome {
        ServerOutcome::Deferred => {}
        ServerOutcome::Response(payload) => {
            unpark(inner, command, conn, cookie);
            reply(inner, conn, command, cookie, payload, false, "");
        }
        ServerOutcome::Error(desc) => {
            unpark(inner, command, conn, cookie);
            reply(inner, conn, command, cookie, Vec::new(), true, &desc);
        }
    }
}

/// Removes the deferred entry parked for (`command`, `conn`, `cookie`), if
/// any; used when an async-capable handler answered immediately.
fn unpark(inner: &Arc<ServerInner>, command: FourCC, conn: u64, cookie: u64) {
    let mut state = inner.state.lock().unwrap();
    if let Some(queue) = state.deferred.get_mut(&command) {
        queue.retain(|pending| !(pending.conn == conn && pending.cookie == cookie));
    }
}

fn reply(
    inner: &Arc<ServerInner>,
    conn: u64,
    command: FourCC,
    cookie: u64,
    payload: Vec<u8>,
    error: bool,
    error_desc: &str,
) {
    let state = inner.state.lock().unwrap();
    if let Some(tx) = state.connections.get(&conn) {
        let frame = Frame::response(command, cookie, payload, error, error_desc);
        let _ = tx.send(OutMessage {
            frame,
            bodies: Vec::new(),
        });
    }
}
