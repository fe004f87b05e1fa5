//! One multiplexed RPC connection over an encrypted stream.

use crate::{
    handler::{Body, Envelope, RequestHandler, RequestKind, SourceValues},
    header::{BodyType, Header, HEADER_LEN},
    source::{Event, SourceStream},
    Error,
};
use bytes::Bytes;
use futures::StreamExt as _;
use mangrove_stream::{
    transport::{Sink, Stream},
    Closed, PublicKey, Receiver, Sender,
};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    time::{interval, Instant},
};
use tracing::{debug, info, warn};

/// Configuration for an RPC connection.
#[derive(Clone)]
pub struct Config {
    /// Maximum time since the most recent response frame before the
    /// connection is considered dead. Guards against a peer that keeps the
    /// socket open but stops answering outstanding requests.
    pub answer_timeout: Duration,

    /// Maximum time since any frame was read. Guards against a fully idle
    /// or vanished peer.
    pub activity_timeout: Duration,

    /// How often the watchdog checks the two timeouts.
    pub check_interval: Duration,

    /// Upper bound accepted for a single body. The header field is a full
    /// unsigned 32-bit length; this bound keeps a hostile peer from forcing
    /// a giant allocation.
    pub max_body_length: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(300),
            activity_timeout: Duration::from_secs(60),
            check_interval: Duration::from_millis(500),
            max_body_length: 16 * 1024 * 1024,
        }
    }
}

/// Why a connection was torn down; determines the error pending listeners
/// settle with.
#[derive(Clone, Copy, Debug)]
enum Shutdown {
    Closed,
    AnswerTimeout,
    ActivityTimeout,
}

impl Shutdown {
    fn to_error(self) -> Error {
        match self {
            Self::Closed => Error::ConnectionClosed,
            Self::AnswerTimeout => Error::AnswerTimeout,
            Self::ActivityTimeout => Error::ActivityTimeout,
        }
    }
}

/// A registered consumer for response frames of one request id.
///
/// Exists for at most one outstanding exchange: async listeners are removed
/// when their single response arrives, source listeners when a terminal
/// frame lands or the connection dies.
enum Listener {
    Async(oneshot::Sender<Event>),
    Source(mpsc::UnboundedSender<Event>),
}

impl Listener {
    fn fail(self, error: Error) {
        match self {
            Self::Async(sender) => {
                let _ = sender.send(Event::Failed(error));
            }
            Self::Source(sender) => {
                let _ = sender.send(Event::Failed(error));
            }
        }
    }
}

/// Mutable per-connection state, owned by this connection alone and touched
/// only under its lock.
struct State {
    /// Last allocated outbound request id; ids count up from 1 and never
    /// wrap (exhaustion is an error).
    next_request: i32,
    /// Consumers awaiting response frames, keyed by outbound request id.
    listeners: HashMap<i32, Listener>,
    /// Inbound source request ids currently being served.
    inbound: HashSet<i32>,
}

struct Liveness {
    last_answer: Instant,
    last_activity: Instant,
}

pub(crate) struct Shared<Si: Sink> {
    peer: PublicKey,
    config: Config,
    closed: Closed,
    writer: AsyncMutex<Sender<Si>>,
    state: Mutex<State>,
    liveness: Mutex<Liveness>,
}

impl<Si: Sink> Shared<Si> {
    fn touch_activity(&self) {
        self.liveness.lock().unwrap().last_activity = Instant::now();
    }

    fn touch_answer(&self) {
        self.liveness.lock().unwrap().last_answer = Instant::now();
    }
}

/// A multiplexed RPC connection to an authenticated peer.
///
/// Cheap to clone; all clones share the connection. The connection stays
/// alive until closed by either peer, a watchdog, or a transport failure;
/// whichever comes first, every pending call settles.
pub struct Connection<Si: Sink> {
    shared: Arc<Shared<Si>>,
}

impl<Si: Sink> Clone for Connection<Si> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Si: Sink> Connection<Si> {
    /// Take ownership of an established encrypted connection and start its
    /// two background loops: the sequential frame dispatcher and the
    /// timeout watchdog.
    ///
    /// `handler` serves inbound source requests; passing `None` makes this
    /// a pure client that logs and ignores peer requests.
    pub fn start<St: Stream>(
        connection: mangrove_stream::Connection<Si, St>,
        handler: Option<Arc<dyn RequestHandler>>,
        config: Config,
    ) -> Self {
        let peer = connection.peer();
        let closed = connection.closed();
        let (sender, receiver) = connection.split();
        let now = Instant::now();
        let shared = Arc::new(Shared {
            peer,
            config,
            closed,
            writer: AsyncMutex::new(sender),
            state: Mutex::new(State {
                next_request: 0,
                listeners: HashMap::new(),
                inbound: HashSet::new(),
            }),
            liveness: Mutex::new(Liveness {
                last_answer: now,
                last_activity: now,
            }),
        });
        tokio::spawn(read_loop(shared.clone(), receiver, handler));
        tokio::spawn(watchdog(shared.clone()));
        Self { shared }
    }

    /// The authenticated identity of the peer.
    pub fn peer(&self) -> PublicKey {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_closed()
    }

    /// Resolves once the connection has closed, for any reason.
    pub async fn wait_closed(&self) {
        self.shared.closed.wait().await;
    }

    /// Send a single-shot request and await its one response.
    pub async fn call_async(&self, name: &[&str], args: Value) -> Result<Body, Error> {
        let (sender, response) = oneshot::channel();
        let id = self.register(Listener::Async(sender))?;
        if let Err(error) = self.send_request(id, name, args, RequestKind::Async).await {
            self.shared.state.lock().unwrap().listeners.remove(&id);
            return Err(error);
        }
        match response.await {
            Ok(Event::Frame(header, body)) => {
                if header.end_or_error {
                    Err(Error::Application(
                        String::from_utf8_lossy(&body).into_owned(),
                    ))
                } else {
                    Body::decode(header.body_type, body)
                }
            }
            Ok(Event::Failed(error)) => Err(error),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send a streaming request; the result is the lazy sequence of
    /// response values.
    pub async fn call_source(&self, name: &[&str], args: Value) -> Result<SourceStream, Error> {
        let (sender, frames) = mpsc::unbounded_channel();
        let id = self.register(Listener::Source(sender))?;
        if let Err(error) = self.send_request(id, name, args, RequestKind::Source).await {
            self.shared.state.lock().unwrap().listeners.remove(&id);
            return Err(error);
        }
        Ok(SourceStream::new(frames))
    }

    /// Close the connection, sending the goodbye header if the peer can
    /// still hear it. Idempotent; pending calls settle with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        if !self.shared.closed.is_closed() {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.send(&[0u8; HEADER_LEN]).await;
        }
        shutdown(&self.shared, Shutdown::Closed).await;
    }

    fn register(&self, listener: Listener) -> Result<i32, Error> {
        let mut state = self.shared.state.lock().unwrap();
        if self.shared.closed.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if state.next_request == i32::MAX {
            return Err(Error::IdsExhausted);
        }
        state.next_request += 1;
        let id = state.next_request;
        state.listeners.insert(id, listener);
        Ok(id)
    }

    async fn send_request(
        &self,
        id: i32,
        name: &[&str],
        args: Value,
        kind: RequestKind,
    ) -> Result<(), Error> {
        let body = serde_json::to_vec(&json!({
            "name": name,
            "args": args,
            "type": kind.label(),
        }))
        .map_err(Error::EncodeJson)?;
        let header = Header {
            part_of_stream: kind == RequestKind::Source,
            end_or_error: false,
            body_type: BodyType::Json,
            body_length: body.len() as u32,
            request_id: id,
        };
        write_frame(&self.shared, header, &body).await
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared<Si>> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared<Si>>) -> Self {
        Self { shared }
    }
}

/// Assemble and send one header+body frame as a single transport write, so
/// concurrently composed messages can never interleave.
async fn write_frame<Si: Sink>(
    shared: &Shared<Si>,
    header: Header,
    body: &[u8],
) -> Result<(), Error> {
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(body);
    let mut writer = shared.writer.lock().await;
    writer.send(&frame).await?;
    Ok(())
}

/// The sequential frame dispatcher: headers and bodies are parsed strictly
/// in arrival order, never concurrently, and routed by request id.
async fn read_loop<Si: Sink, St: Stream>(
    shared: Arc<Shared<Si>>,
    mut receiver: Receiver<St>,
    handler: Option<Arc<dyn RequestHandler>>,
) {
    let peer = shared.peer;
    let reason = loop {
        // Read a header, tolerating a clean end only at a frame boundary.
        let mut header_bytes = [0u8; HEADER_LEN];
        let mut filled = 0;
        let ended = loop {
            match receiver.read(&mut header_bytes[filled..]).await {
                Ok(0) if filled == 0 => break Ok(true),
                Ok(0) => break Err(Error::Stream(mangrove_stream::Error::StreamClosed)),
                Ok(n) => {
                    filled += n;
                    if filled == HEADER_LEN {
                        break Ok(false);
                    }
                }
                Err(error) => break Err(Error::Stream(error)),
            }
        };
        match ended {
            Ok(false) => {}
            Ok(true) => {
                debug!(%peer, "transport ended");
                break Shutdown::Closed;
            }
            Err(error) => {
                debug!(%peer, %error, "read loop failed");
                break Shutdown::Closed;
            }
        }
        shared.touch_activity();

        if Header::is_goodbye(&header_bytes) {
            debug!(%peer, "peer said goodbye");
            break Shutdown::Closed;
        }
        let header = match Header::decode(&header_bytes) {
            Ok(header) => header,
            Err(error) => {
                // Without a parseable length the stream position is lost.
                warn!(%peer, %error, "unparseable header, closing");
                break Shutdown::Closed;
            }
        };
        if header.body_length == 0 {
            warn!(%peer, id = header.request_id, "data frame with zero-length body, closing");
            break Shutdown::Closed;
        }
        if header.body_length > shared.config.max_body_length {
            warn!(%peer, length = header.body_length, "body exceeds limit, closing");
            break Shutdown::Closed;
        }

        let mut body = vec![0u8; header.body_length as usize];
        if let Err(error) = receiver.read_exact(&mut body).await {
            debug!(%peer, %error, "read loop failed mid-body");
            break Shutdown::Closed;
        }
        shared.touch_activity();
        let body = Bytes::from(body);

        if header.request_id < 0 {
            dispatch_response(&shared, header, body);
        } else if header.request_id == 0 {
            warn!(%peer, "frame with reserved request id 0 dropped");
        } else {
            dispatch_request(&shared, &handler, header, body);
        }
    };
    shutdown(&shared, reason).await;
}

/// Route a response frame to the listener that requested it.
fn dispatch_response<Si: Sink>(shared: &Arc<Shared<Si>>, header: Header, body: Bytes) {
    shared.touch_answer();
    let Some(id) = header.request_id.checked_neg() else {
        warn!(peer = %shared.peer, "response with out-of-range request id dropped");
        return;
    };
    let mut state = shared.state.lock().unwrap();
    match state.listeners.remove(&id) {
        None => {
            warn!(peer = %shared.peer, id, "response for unknown request dropped");
        }
        Some(Listener::Async(sender)) => {
            let _ = sender.send(Event::Frame(header, body));
        }
        Some(Listener::Source(sender)) => {
            let terminal = header.end_or_error;
            let _ = sender.send(Event::Frame(header, body));
            if !terminal {
                state.listeners.insert(id, Listener::Source(sender));
            }
        }
    }
}

/// Dispatch a frame bearing a fresh positive request id from the peer.
fn dispatch_request<Si: Sink>(
    shared: &Arc<Shared<Si>>,
    handler: &Option<Arc<dyn RequestHandler>>,
    header: Header,
    body: Bytes,
) {
    let peer = shared.peer;
    let id = header.request_id;

    if header.end_or_error {
        // The peer acknowledging the end of one of our response streams.
        if body.as_ref() == b"true" {
            debug!(%peer, id, "peer confirmed end of response stream");
        } else {
            debug!(%peer, id, "terminal request frame dropped");
        }
        return;
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(error) => {
            // Local decode problem with one frame; the loop carries on.
            warn!(%peer, id, %error, "dropping request with malformed body");
            return;
        }
    };
    match RequestKind::parse(&envelope.kind) {
        RequestKind::Source => {
            let Some(handler) = handler else {
                info!(%peer, id, name = ?envelope.name, "no handler registered, ignoring request");
                return;
            };
            {
                let mut state = shared.state.lock().unwrap();
                if !state.inbound.insert(id) {
                    warn!(%peer, id, "request id already in flight, ignoring");
                    return;
                }
            }
            let values = handler.handle_source(&envelope.name, &envelope.args);
            tokio::spawn(respond_source(shared.clone(), id, values));
        }
        kind => {
            info!(
                %peer,
                id,
                kind = kind.label(),
                name = ?envelope.name,
                "request type not supported, ignoring"
            );
        }
    }
}

/// Stream a handler's values back as response frames for request `id`,
/// closing with the end marker or the failure's text.
async fn respond_source<Si: Sink>(shared: Arc<Shared<Si>>, id: i32, mut values: SourceValues) {
    let peer = shared.peer;
    let mut failure = None;
    while let Some(item) = values.next().await {
        if shared.closed.is_closed() {
            break;
        }
        match item {
            Ok(body) => {
                if let Err(error) = send_response(&shared, id, body, false).await {
                    debug!(%peer, id, %error, "failed sending stream value");
                    break;
                }
            }
            Err(error) => {
                failure = Some(error.to_string());
                break;
            }
        }
    }
    if !shared.closed.is_closed() {
        let terminal = match &failure {
            None => Body::Json(Value::Bool(true)),
            Some(text) => Body::Utf8(text.clone()),
        };
        if let Err(error) = send_response(&shared, id, terminal, true).await {
            debug!(%peer, id, %error, "failed sending terminal frame");
        }
    }
    shared.state.lock().unwrap().inbound.remove(&id);
}

async fn send_response<Si: Sink>(
    shared: &Shared<Si>,
    id: i32,
    body: Body,
    terminal: bool,
) -> Result<(), Error> {
    let (body_type, bytes) = body.encode()?;
    let header = Header {
        part_of_stream: true,
        end_or_error: terminal,
        body_type,
        body_length: bytes.len() as u32,
        request_id: -id,
    };
    write_frame(shared, header, &bytes).await
}

/// Close the connection on either timeout.
async fn watchdog<Si: Sink>(shared: Arc<Shared<Si>>) {
    let mut ticker = interval(shared.config.check_interval);
    loop {
        let closed = shared.closed.clone();
        tokio::select! {
            _ = closed.wait() => return,
            _ = ticker.tick() => {}
        }
        let (last_answer, last_activity) = {
            let liveness = shared.liveness.lock().unwrap();
            (liveness.last_answer, liveness.last_activity)
        };
        let now = Instant::now();
        if now.duration_since(last_answer) > shared.config.answer_timeout {
            info!(peer = %shared.peer, "answer timeout exceeded, closing connection");
            shutdown(&shared, Shutdown::AnswerTimeout).await;
            return;
        }
        if now.duration_since(last_activity) > shared.config.activity_timeout {
            info!(peer = %shared.peer, "activity timeout exceeded, closing connection");
            shutdown(&shared, Shutdown::ActivityTimeout).await;
            return;
        }
    }
}

/// Tear the connection down and settle every pending listener; safe to call
/// from multiple paths.
async fn shutdown<Si: Sink>(shared: &Arc<Shared<Si>>, reason: Shutdown) {
    let first = shared.closed.close();
    let drained: Vec<Listener> = {
        let mut state = shared.state.lock().unwrap();
        state.listeners.drain().map(|(_, listener)| listener).collect()
    };
    for listener in drained {
        listener.fail(reason.to_error());
    }
    if first {
        // Release the transport from a fresh task: a writer blocked
        // mid-send holds the lock this needs.
        let shared = shared.clone();
        tokio::spawn(async move {
            shared.writer.lock().await.close().await;
        });
    }
}
