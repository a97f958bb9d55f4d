use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc, sync::Notify};
use tracing::{debug, info, warn};

use crate::{
    command::CommandRegistry,
    frame::{read_frame, write_frame, Frame},
    FourCC, RemoteError,
};

/// Invoked once when the connection goes down, with
/// `(url, deliberate, reason)`.
pub type DisconnectCallback = Arc<dyn Fn(&str, bool, &str) + Send + Sync>;

struct PendingRequest {
    command: FourCC,
    user: u64,
}

struct ClientState {
    write_tx: Option<mpsc::UnboundedSender<Frame>>,
    pending: HashMap<u64, PendingRequest>,
    deliberate: bool,
}

struct ClientInner {
    registry: Arc<CommandRegistry>,
    url: String,
    on_disconnect: DisconnectCallback,
    state: Mutex<ClientState>,
    next_cookie: AtomicU64,
    connected: AtomicBool,
    shutdown: Notify,
}

/// Connecting half of the command bus. Issues commands and routes responses
/// to the registered client completions.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<ClientInner>,
}

impl RemoteClient {
    /// Connects to a server at `url` (`host:port`).
    pub async fn connect(
        url: &str,
        registry: Arc<CommandRegistry>,
        on_disconnect: DisconnectCallback,
    ) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect(url).await?;
        let (mut reader, mut writer) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Frame>();

        let inner = Arc::new(ClientInner {
            registry,
            url: url.to_owned(),
            on_disconnect,
            state: Mutex::new(ClientState {
                write_tx: Some(write_tx),
                pending: HashMap::new(),
                deliberate: false,
            }),
            next_cookie: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &frame, &[]).await {
                    warn!("request write failed: {}", err);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let read_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = read_inner.shutdown.notified() => break "disconnect requested".to_owned(),
                    frame = read_frame(&mut reader) => match frame {
                        Ok(frame) => dispatch_response(&read_inner, frame),
                        Err(err) => break err.to_string(),
                    },
                }
            };
            finish_connection(&read_inner, &reason);
        });

        info!("connected to {}", url);
        Ok(Self { inner })
    }

    /// True while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Sends `command` with `payload`; the registered client completion is
    /// invoked with `user` when the response arrives.
    pub fn execute_command(
        &self,
        command: FourCC,
        payload: Vec<u8>,
        user: u64,
    ) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        let cookie = self.inner.next_cookie.fetch_add(1, Ordering::Relaxed);

        let mut state = self.inner.state.lock().unwrap();
        let Some(tx) = state.write_tx.as_ref().cloned() else {
            return Err(RemoteError::NotConnected);
        };
        state.pending.insert(cookie, PendingRequest { command, user });
        drop(state);

        if tx.send(Frame::request(command, cookie, payload)).is_err() {
            self.inner.state.lock().unwrap().pending.remove(&cookie);
            return Err(RemoteError::NotConnected);
        }
        Ok(())
    }

    /// Closes the connection on purpose. Pending requests are dropped and
    /// reported through their completions.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.deliberate = true;
            state.write_tx = None;
        }
        self.inner.shutdown.notify_one();
    }
}

fn dispatch_response(inner: &Arc<ClientInner>, frame: Frame) {
    if !frame.is_response {
        warn!("dropping unexpected request frame on client side");
        return;
    }

    let pending = inner.state.lock().unwrap().pending.remove(&frame.cookie);
    let Some(pending) = pending else {
        warn!(
            "response with unknown cookie {} for command {:#010x}",
            frame.cookie, frame.command
        );
        return;
    };
    if pending.command != frame.command {
        warn!("response command mismatch for cookie {}", frame.cookie);
        return;
    }

    if let Some(client_fn) = inner.registry.find(frame.command).and_then(|d| d.client_fn) {
        let error_desc = frame.error.then_some(frame.error_desc.as_str());
        client_fn(frame.command, &frame.payload, pending.user, error_desc);
    }
}

/// Tears the connection state down once: drops pending requests through
/// their completions, then fires the user disconnect callback.
fn finish_connection(inner: &Arc<ClientInner>, reason: &str) {
    if !inner.connected.swap(false, Ordering::AcqRel) {
        return;
    }

    let (pending, deliberate) = {
        let mut state = inner.state.lock().unwrap();
        state.write_tx = None;
        (
            std::mem::take(&mut state.pending),
            state.deliberate,
        )
    };

    debug!(
        "connection to {} closed ({}), dropping {} pending request(s)",
        inner.url,
        reason,
        pending.len()
    );
    for (_, request) in pending {
        if let Some(client_fn) = inner
            .registry
            .find(request.command)
            .and_then(|d| d.client_fn)
        {
            client_fn(request.command, &[], request.user, Some(reason));
        }
    }

    (inner.on_disconnect)(&inner.url, deliberate, reason);
}
