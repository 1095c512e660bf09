use crate::error::ProxyError;
use crate::rtsp::auth::Authenticator;
use crate::rtsp::client::ClientHandle;
use crate::rtsp::message::{Method, Request, Response, DEFAULT_RTSP_PORT};
use crate::rtsp::parser::{Frame, StreamParser};
use crate::rtsp::stream::{
    next_channel_pair, Interlayer, Stream, Subscriber, Transport, DEFAULT_SESSION_TIMEOUT_SECS,
};
use crate::server::{RemoteKey, Server};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_GRACE_SECS: u64 = 5;
// A session is torn down after this many consecutive keepalive ticks with
// no subscribers.
const MAX_IDLE_TICKS: u32 = 5;

const TCP_TRANSPORT: &str = "RTP/AVP/TCP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Unauthorized,
}

/// What the reader needs to know about a request once its response arrives.
#[derive(Debug, Clone)]
enum RequestContext {
    Options {
        stream: String,
    },
    Describe {
        stream: String,
    },
    Setup {
        stream: String,
        substream: String,
        protocol: String,
        com_type: String,
        channels: (u8, u8),
    },
    Play {
        stream: String,
        session: String,
    },
    Teardown {
        stream: String,
        session: String,
    },
    KeepAlive,
}

struct Inflight {
    request: Request,
    context: RequestContext,
    cseq: u32,
    attempts: u32,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

struct RemoteInner {
    writer: OwnedWriteHalf,
    cseq: u32,
    inflight: VecDeque<Inflight>,
    streams: HashMap<String, Stream>,
    interlayers: BTreeMap<u8, Interlayer>,
    authenticator: Authenticator,
    destroyed: bool,
}

/// One pooled connection to an upstream camera. Requests from every viewer
/// funnel through here; responses correlate FIFO against the in-flight
/// queue, and interleaved frames fan out to the channel subscribers.
pub struct Remote {
    key: RemoteKey,
    host: String,
    port: u16,
    server: Weak<Server>,
    self_ref: Weak<Remote>,
    inner: Mutex<RemoteInner>,
}

impl Remote {
    pub(crate) async fn connect(
        server: &Arc<Server>,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Arc<Self>, ProxyError> {
        let endpoint = format!("{host}:{port}");
        let socket = timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::Dial(format!("connect to {endpoint} timed out")))?
            .map_err(|error| ProxyError::Dial(format!("connect to {endpoint} failed: {error}")))?;
        let (read_half, write_half) = socket.into_split();

        let remote = Arc::new_cyclic(|weak| Self {
            key: (endpoint, username.to_string()),
            host: host.to_string(),
            port,
            server: Arc::downgrade(server),
            self_ref: weak.clone(),
            inner: Mutex::new(RemoteInner {
                writer: write_half,
                cseq: 0,
                inflight: VecDeque::new(),
                streams: HashMap::new(),
                interlayers: BTreeMap::new(),
                authenticator: Authenticator::new(username, password),
                destroyed: false,
            }),
        });
        info!(endpoint = %remote.key.0, "connected to upstream");

        let reader_remote = Arc::clone(&remote);
        tokio::spawn(async move {
            if let Err(error) = reader_loop(&reader_remote, read_half).await {
                warn!(endpoint = %reader_remote.key.0, %error, "upstream reader ended");
            }
            reader_remote.destroy().await;
        });

        Ok(remote)
    }

    pub(crate) async fn is_destroyed(&self) -> bool {
        self.inner.lock().await.destroyed
    }

    fn stream_url(&self, path: &str) -> String {
        if self.port == DEFAULT_RTSP_PORT {
            format!("rtsp://{}{}", self.host, path)
        } else {
            format!("rtsp://{}:{}{}", self.host, self.port, path)
        }
    }

    /// Cached `Public` header for a stream, fetching OPTIONS once.
    pub async fn get_options(&self, path: &str) -> Result<String, ProxyError> {
        {
            let mut inner = self.inner.lock().await;
            let stream = inner.streams.entry(path.to_string()).or_default();
            if let Some(options) = &stream.options {
                return Ok(options.clone());
            }
        }

        let request = Request::build(Method::Options, &self.stream_url(path))?;
        self.send_request_sync(
            request,
            RequestContext::Options {
                stream: path.to_string(),
            },
        )
        .await?;

        let inner = self.inner.lock().await;
        inner
            .streams
            .get(path)
            .and_then(|stream| stream.options.clone())
            .ok_or(ProxyError::RequestFailed)
    }

    /// Cached SDP body for a stream, fetching DESCRIBE once.
    pub async fn get_sdp(&self, path: &str) -> Result<Vec<u8>, ProxyError> {
        {
            let mut inner = self.inner.lock().await;
            let stream = inner.streams.entry(path.to_string()).or_default();
            if let Some(sdp) = &stream.sdp {
                return Ok(sdp.clone());
            }
        }

        let mut request = Request::build(Method::Describe, &self.stream_url(path))?;
        request.headers.set("Accept", "application/sdp");
        self.send_request_sync(
            request,
            RequestContext::Describe {
                stream: path.to_string(),
            },
        )
        .await?;

        let inner = self.inner.lock().await;
        inner
            .streams
            .get(path)
            .and_then(|stream| stream.sdp.clone())
            .ok_or(ProxyError::RequestFailed)
    }

    pub async fn server_header(&self, path: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.streams.get(path).and_then(|stream| stream.server.clone())
    }

    /// Joins a viewer to a track. Reuses the already negotiated upstream
    /// transport when one matches; otherwise reserves the next free channel
    /// pair and performs the upstream SETUP. Returns `(ssrc, session_id)`
    /// for the viewer's SETUP response.
    pub async fn get_ssrc_session(
        &self,
        client: Arc<ClientHandle>,
        stream: &str,
        substream: &str,
        transport_header: &str,
        session_hint: Option<&str>,
    ) -> Result<(String, String), ProxyError> {
        let params = TransportParams::parse(transport_header);
        let protocol = params
            .protocol
            .clone()
            .ok_or_else(|| ProxyError::UnsupportedTransport(transport_header.to_string()))?;
        if protocol != TCP_TRANSPORT {
            return Err(ProxyError::UnsupportedTransport(protocol));
        }
        let com_type = params
            .com_type
            .clone()
            .unwrap_or_else(|| "unicast".to_string());

        let negotiated = {
            let mut inner = self.inner.lock().await;
            let stream_entry = inner.streams.entry(stream.to_string()).or_default();
            stream_entry
                .find_transport(substream, &protocol, &com_type)
                .is_some()
        };

        if !negotiated {
            let allocated = {
                let mut inner = self.inner.lock().await;
                let Some(pair) = next_channel_pair(&inner.interlayers) else {
                    return Err(ProxyError::RequestFailed);
                };
                inner
                    .interlayers
                    .insert(pair.0, Interlayer::new(pair.0, stream, substream));
                inner
                    .interlayers
                    .insert(pair.1, Interlayer::new(pair.1, stream, substream));
                pair
            };

            let url = format!("{}/{}", self.stream_url(stream), substream);
            let mut request = Request::build(Method::Setup, &url)?;
            request.headers.set(
                "Transport",
                format!(
                    "{TCP_TRANSPORT};{};interleaved={}-{}",
                    com_type, allocated.0, allocated.1
                ),
            );
            if let Some(session) = session_hint {
                request.headers.set("Session", session.to_string());
            }
            let result = self
                .send_request_sync(
                    request,
                    RequestContext::Setup {
                        stream: stream.to_string(),
                        substream: substream.to_string(),
                        protocol: protocol.clone(),
                        com_type: com_type.clone(),
                        channels: allocated,
                    },
                )
                .await;
            if let Err(error) = result {
                let mut inner = self.inner.lock().await;
                release_reserved_pair(&mut inner.interlayers, allocated);
                return Err(error);
            }
        }

        let mut inner = self.inner.lock().await;
        let (session_id, ssrc, data_channel) = {
            let stream_entry = inner.streams.get(stream).ok_or(ProxyError::RequestFailed)?;
            let (session_id, transport) = stream_entry
                .find_transport(substream, &protocol, &com_type)
                .ok_or(ProxyError::RequestFailed)?;
            (
                session_id.to_string(),
                transport.ssrc.clone().unwrap_or_default(),
                // The upstream occasionally names the control channel; pin
                // to the even member of the pair.
                transport.data_channel() & !1,
            )
        };

        let client_pair = params
            .interleaved
            .unwrap_or((data_channel, data_channel + 1));
        let targets = [
            (data_channel, client_pair.0),
            (data_channel + 1, client_pair.1),
        ];
        for (upstream_channel, client_channel) in targets {
            if let Some(interlayer) = inner.interlayers.get_mut(&upstream_channel) {
                interlayer.subscribers.push(Subscriber {
                    client: Arc::clone(&client),
                    channel: client_channel,
                });
            }
        }

        Ok((ssrc, session_id))
    }

    /// `RTP-Info` for a viewer's PLAY response, performing the upstream
    /// PLAY first if the session has not started yet.
    pub async fn get_rtp_info(&self, stream: &str, session_id: &str) -> Result<String, ProxyError> {
        let needs_play = {
            let inner = self.inner.lock().await;
            let session = inner
                .streams
                .get(stream)
                .and_then(|entry| entry.sessions.get(session_id))
                .ok_or(ProxyError::RequestFailed)?;
            session.transports.iter().any(|t| t.data().seq == 0)
        };

        if needs_play {
            let mut request = Request::build(Method::Play, &self.stream_url(stream))?;
            request.headers.set("Session", session_id.to_string());
            request.headers.set("Range", "npt=0.000-");
            self.send_request_sync(
                request,
                RequestContext::Play {
                    stream: stream.to_string(),
                    session: session_id.to_string(),
                },
            )
            .await?;
        }

        let inner = self.inner.lock().await;
        let session = inner
            .streams
            .get(stream)
            .and_then(|entry| entry.sessions.get(session_id))
            .ok_or(ProxyError::RequestFailed)?;
        let parts: Vec<String> = session
            .transports
            .iter()
            .map(|transport| {
                let data = transport.data();
                format!(
                    "url={}/{};seq={};rtptime={}",
                    self.stream_url(stream),
                    transport.substream_name,
                    data.seq,
                    data.rtptime
                )
            })
            .collect();
        Ok(parts.join(","))
    }

    /// Drops every subscription held by a disconnected viewer.
    pub async fn unsubscribe(&self, client_id: u64) {
        let mut inner = self.inner.lock().await;
        for interlayer in inner.interlayers.values_mut() {
            interlayer
                .subscribers
                .retain(|subscriber| subscriber.client.id != client_id);
        }
    }

    async fn send_request(
        &self,
        request: Request,
        context: RequestContext,
    ) -> Result<(), ProxyError> {
        self.enqueue(request, context, None).await.map(|_| ())
    }

    async fn send_request_sync(
        &self,
        request: Request,
        context: RequestContext,
    ) -> Result<(), ProxyError> {
        let (tx, rx) = oneshot::channel();
        let cseq = self.enqueue(request, context, Some(tx)).await?;
        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Outcome::Ok)) => Ok(()),
            Ok(Ok(Outcome::Unauthorized)) => Err(ProxyError::Unauthorized),
            Ok(Err(_)) => Err(ProxyError::ConnectionClosed),
            Err(_) => {
                // Evict the entry so a late reply cannot be matched against
                // the wrong request; the reader discards it as orphaned.
                let mut inner = self.inner.lock().await;
                inner.inflight.retain(|entry| entry.cseq != cseq);
                Err(ProxyError::Timeout)
            }
        }
    }

    /// Appends to the in-flight queue and writes, under one lock, so FIFO
    /// order always equals wire order.
    async fn enqueue(
        &self,
        mut request: Request,
        context: RequestContext,
        waiter: Option<oneshot::Sender<Outcome>>,
    ) -> Result<u32, ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return Err(ProxyError::ConnectionClosed);
        }
        inner.cseq += 1;
        let cseq = inner.cseq;
        request.headers.set("CSeq", cseq.to_string());
        // The upstream servers accept unauthenticated keepalives.
        if !matches!(context, RequestContext::KeepAlive) {
            inner.authenticator.apply(&mut request);
        }
        let bytes = request.serialize();
        debug!(endpoint = %self.key.0, method = %request.method, cseq, "sending upstream request");
        inner.inflight.push_back(Inflight {
            request,
            context,
            cseq,
            attempts: 0,
            waiters: waiter.into_iter().collect(),
        });
        if let Err(error) = write_all_flush(&mut inner.writer, &bytes).await {
            inner.inflight.pop_back();
            warn!(endpoint = %self.key.0, %error, "upstream write failed");
            return Err(ProxyError::ConnectionClosed);
        }
        Ok(cseq)
    }

    /// Correlates a response with the FIFO front and applies its side
    /// effects. Returns true when the remote should be destroyed.
    async fn handle_response(&self, response: Response) -> Result<bool, ProxyError> {
        let mut inner = self.inner.lock().await;
        let response_cseq = response
            .header("CSeq")
            .and_then(|value| value.trim().parse::<u32>().ok());
        let Some(front_cseq) = inner.inflight.front().map(|entry| entry.cseq) else {
            debug!(endpoint = %self.key.0, code = response.code, "response with nothing in flight");
            return Ok(false);
        };
        if let Some(cseq) = response_cseq {
            if cseq < front_cseq {
                debug!(endpoint = %self.key.0, cseq, "discarding orphaned response");
                return Ok(false);
            }
        }
        let Some(mut entry) = inner.inflight.pop_front() else {
            return Ok(false);
        };
        debug!(
            endpoint = %self.key.0,
            method = %entry.request.method,
            cseq = entry.cseq,
            code = response.code,
            "upstream response"
        );

        if response.code == 401 {
            if entry.attempts == 0 {
                let challenge = response
                    .header("WWW-Authenticate")
                    .unwrap_or_default()
                    .to_string();
                if inner.authenticator.consume_challenge(&challenge).is_ok() {
                    inner.cseq += 1;
                    entry.cseq = inner.cseq;
                    entry.attempts += 1;
                    entry.request.headers.set("CSeq", entry.cseq.to_string());
                    inner.authenticator.apply(&mut entry.request);
                    let bytes = entry.request.serialize();
                    debug!(
                        endpoint = %self.key.0,
                        method = %entry.request.method,
                        cseq = entry.cseq,
                        "retrying with credentials"
                    );
                    inner.inflight.push_back(entry);
                    if let Err(error) = write_all_flush(&mut inner.writer, &bytes).await {
                        inner.inflight.pop_back();
                        warn!(endpoint = %self.key.0, %error, "upstream write failed");
                        return Err(ProxyError::ConnectionClosed);
                    }
                    return Ok(false);
                }
            }
            warn!(endpoint = %self.key.0, method = %entry.request.method, "upstream rejected credentials");
            notify(&mut entry.waiters, Outcome::Unauthorized);
            return Ok(false);
        }

        let mut destroy = false;
        if (200..300).contains(&response.code) {
            destroy = self.dispatch(&mut inner, &entry.context, &response);
        } else if let RequestContext::Setup { channels, .. } = &entry.context {
            // A failed SETUP frees the channel pair it had reserved.
            release_reserved_pair(&mut inner.interlayers, *channels);
        }
        notify(&mut entry.waiters, Outcome::Ok);
        Ok(destroy)
    }

    fn dispatch(
        &self,
        inner: &mut RemoteInner,
        context: &RequestContext,
        response: &Response,
    ) -> bool {
        match context {
            RequestContext::Options { stream } => {
                let entry = inner.streams.entry(stream.clone()).or_default();
                if let Some(public) = response.header("Public") {
                    entry.options = Some(public.to_string());
                }
                if let Some(server) = response.header("Server") {
                    entry.server = Some(server.to_string());
                }
                false
            }
            RequestContext::Describe { stream } => {
                let entry = inner.streams.entry(stream.clone()).or_default();
                entry.sdp = Some(response.body.clone());
                if let Some(server) = response.header("Server") {
                    entry.server = Some(server.to_string());
                }
                false
            }
            RequestContext::Setup {
                stream,
                substream,
                protocol,
                com_type,
                channels,
            } => {
                let params = TransportParams::parse(response.header("Transport").unwrap_or_default());
                let (session_id, timeout_secs) =
                    parse_session_header(response.header("Session").unwrap_or_default());
                if session_id.is_empty() {
                    warn!(endpoint = %self.key.0, %stream, "setup response without session");
                    release_reserved_pair(&mut inner.interlayers, *channels);
                    return false;
                }

                // Honor the pair the upstream actually assigned; it normally
                // echoes the one we reserved.
                let pair = params.interleaved.unwrap_or(*channels);
                if pair != *channels {
                    release_reserved_pair(&mut inner.interlayers, *channels);
                }

                {
                    let stream_entry = inner.streams.entry(stream.clone()).or_default();
                    if let Some(server) = response.header("Server") {
                        stream_entry.server = Some(server.to_string());
                    }
                    let session = stream_entry.lookup_session(&session_id, timeout_secs);
                    session.timeout_secs = timeout_secs;
                    if session.find_transport(substream, protocol, com_type).is_none() {
                        session
                            .transports
                            .push(Transport::new(substream, protocol, com_type, pair));
                    }
                    if let Some(transport) =
                        session.find_transport_mut(substream, protocol, com_type)
                    {
                        transport.ssrc = params.ssrc.clone();
                    }
                }

                for channel in [pair.0, pair.1] {
                    let interlayer = inner
                        .interlayers
                        .entry(channel)
                        .or_insert_with(|| Interlayer::new(channel, stream, substream));
                    interlayer.session = Some(session_id.clone());
                }
                false
            }
            RequestContext::Play { stream, session } => {
                if let Some(rtp_info) = response.header("RTP-Info") {
                    if let Some(session_entry) = inner
                        .streams
                        .get_mut(stream)
                        .and_then(|entry| entry.sessions.get_mut(session))
                    {
                        for (tail, seq, rtptime) in parse_rtp_info(rtp_info) {
                            if let Some(transport) = session_entry
                                .transports
                                .iter_mut()
                                .find(|t| t.substream_name == tail)
                            {
                                let data = transport.data_mut();
                                data.seq = seq;
                                data.rtptime = rtptime;
                            }
                        }
                    }
                }
                self.spawn_keepalive(inner, stream, session);
                false
            }
            RequestContext::Teardown { stream, session } => {
                if let Some(stream_entry) = inner.streams.get_mut(stream) {
                    if let Some(mut session_entry) = stream_entry.sessions.remove(session) {
                        session_entry.stop();
                    }
                }
                inner.interlayers.retain(|_, interlayer| {
                    !(interlayer.stream == *stream
                        && interlayer.session.as_deref() == Some(session.as_str()))
                });
                inner.interlayers.is_empty()
            }
            RequestContext::KeepAlive => false,
        }
    }

    fn spawn_keepalive(&self, inner: &mut RemoteInner, stream: &str, session_id: &str) {
        let Some(session) = inner
            .streams
            .get_mut(stream)
            .and_then(|entry| entry.sessions.get_mut(session_id))
        else {
            return;
        };
        if session.started {
            return;
        }
        session.started = true;

        let period = Duration::from_secs(
            session
                .timeout_secs
                .saturating_sub(KEEPALIVE_GRACE_SECS)
                .max(1),
        );
        let remote = self.self_ref.clone();
        let stream = stream.to_string();
        let session_id = session_id.to_string();
        let handle = tokio::spawn(async move {
            keepalive_loop(remote, stream, session_id, period).await;
        });
        session.keepalive = Some(handle.abort_handle());
    }

    async fn session_subscriber_count(&self, stream: &str, session_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .interlayers
            .values()
            .filter(|interlayer| {
                interlayer.stream == stream
                    && interlayer.session.as_deref() == Some(session_id)
            })
            .map(|interlayer| interlayer.subscribers.len())
            .sum()
    }

    /// Fires the upstream TEARDOWN once the idle policy trips. The session
    /// is marked stopped here; the response dispatch drops its channels.
    async fn teardown_session(&self, stream: &str, session_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner
                .streams
                .get_mut(stream)
                .and_then(|entry| entry.sessions.get_mut(session_id))
            {
                session.started = false;
                session.keepalive = None;
            }
        }
        let Ok(mut request) = Request::build(Method::Teardown, &self.stream_url(stream)) else {
            return;
        };
        request.headers.set("Session", session_id.to_string());
        let context = RequestContext::Teardown {
            stream: stream.to_string(),
            session: session_id.to_string(),
        };
        if let Err(error) = self.send_request(request, context).await {
            debug!(endpoint = %self.key.0, %error, "idle teardown failed");
        }
    }

    /// Relays one upstream frame to every subscriber of its channel, with
    /// the channel byte rewritten per viewer. Writes are best effort; a
    /// broken viewer socket is reaped by its own reader task.
    async fn relay_frame(&self, channel: u8, payload: &[u8]) {
        let subscribers: Vec<Subscriber> = {
            let inner = self.inner.lock().await;
            match inner.interlayers.get(&channel) {
                Some(interlayer) => interlayer.subscribers.clone(),
                None => return,
            }
        };
        for subscriber in subscribers {
            if let Err(error) = subscriber
                .client
                .write_frame(subscriber.channel, payload)
                .await
            {
                debug!(
                    client = subscriber.client.id,
                    %error,
                    "frame write to client failed"
                );
            }
        }
    }

    pub(crate) async fn destroy(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            // Dropping the waiters cancels every pending synchronous call.
            inner.inflight.clear();
            for stream in inner.streams.values_mut() {
                for session in stream.sessions.values_mut() {
                    session.stop();
                }
            }
            inner.interlayers.clear();
            let _ = inner.writer.shutdown().await;
        }
        if let Some(server) = self.server.upgrade() {
            server.remove_remote(&self.key).await;
        }
        info!(endpoint = %self.key.0, "upstream connection destroyed");
    }
}

async fn reader_loop(remote: &Arc<Remote>, mut reader: OwnedReadHalf) -> Result<(), ProxyError> {
    let mut parser = StreamParser::new();
    let mut buffer = [0u8; 16 * 1024];

    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|_| ProxyError::ConnectionClosed)?;
        if read == 0 {
            return Ok(());
        }
        for frame in parser.append(&buffer[..read])? {
            match frame {
                Frame::Interleaved { channel, payload } => {
                    remote.relay_frame(channel, &payload).await;
                }
                Frame::Message(bytes) => {
                    let response = Response::parse(&bytes)?;
                    if remote.handle_response(response).await? {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn keepalive_loop(remote: Weak<Remote>, stream: String, session_id: String, period: Duration) {
    let mut idle_ticks = 0u32;
    loop {
        sleep(period).await;
        let Some(remote) = remote.upgrade() else {
            return;
        };
        let request = match Request::build(Method::GetParameter, &remote.stream_url(&stream)) {
            Ok(mut request) => {
                request.headers.set("Session", session_id.clone());
                request
            }
            Err(_) => return,
        };
        if let Err(error) = remote
            .send_request_sync(request, RequestContext::KeepAlive)
            .await
        {
            debug!(endpoint = %remote.key.0, session = %session_id, %error, "session keepalive failed");
            return;
        }

        if remote.session_subscriber_count(&stream, &session_id).await == 0 {
            idle_ticks += 1;
        } else {
            idle_ticks = 0;
        }
        if idle_ticks > MAX_IDLE_TICKS {
            info!(endpoint = %remote.key.0, session = %session_id, "session idle, tearing down");
            remote.teardown_session(&stream, &session_id).await;
            return;
        }
    }
}

fn notify(waiters: &mut Vec<oneshot::Sender<Outcome>>, outcome: Outcome) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(outcome);
    }
}

fn release_reserved_pair(interlayers: &mut BTreeMap<u8, Interlayer>, pair: (u8, u8)) {
    for channel in [pair.0, pair.1] {
        let unclaimed = interlayers
            .get(&channel)
            .map(|interlayer| interlayer.session.is_none())
            .unwrap_or(false);
        if unclaimed {
            interlayers.remove(&channel);
        }
    }
}

async fn write_all_flush(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Pieces of a `Transport` header either side cares about.
#[derive(Debug, Default, PartialEq, Eq)]
struct TransportParams {
    protocol: Option<String>,
    com_type: Option<String>,
    interleaved: Option<(u8, u8)>,
    ssrc: Option<String>,
}

impl TransportParams {
    fn parse(header: &str) -> Self {
        let mut params = Self::default();
        for (index, part) in header.split(';').map(str::trim).enumerate() {
            if index == 0 {
                if !part.is_empty() {
                    params.protocol = Some(part.to_string());
                }
                continue;
            }
            if part == "unicast" || part == "multicast" {
                params.com_type = Some(part.to_string());
            } else if let Some(value) = part.strip_prefix("interleaved=") {
                params.interleaved = parse_channel_pair(value);
            } else if let Some(value) = part.strip_prefix("ssrc=") {
                params.ssrc = Some(value.to_string());
            }
        }
        params
    }
}

fn parse_channel_pair(value: &str) -> Option<(u8, u8)> {
    let (first, second) = value.split_once('-')?;
    Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
}

/// `Session: id;timeout=N` → (id, timeout), defaulting the timeout to 60.
fn parse_session_header(value: &str) -> (String, u64) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or("").trim().to_string();
    let mut timeout_secs = DEFAULT_SESSION_TIMEOUT_SECS;
    for part in parts {
        if let Some(value) = part.trim().strip_prefix("timeout=") {
            if let Ok(secs) = value.trim().parse() {
                timeout_secs = secs;
            }
        }
    }
    (id, timeout_secs)
}

/// `RTP-Info: url=...;seq=S;rtptime=T, ...` → (track tail, seq, rtptime).
fn parse_rtp_info(value: &str) -> Vec<(String, u32, u32)> {
    let mut entries = Vec::new();
    for item in value.split(',') {
        let mut tail = None;
        let mut seq = 0u32;
        let mut rtptime = 0u32;
        for part in item.split(';').map(str::trim) {
            if let Some(url) = part.strip_prefix("url=") {
                tail = url
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .map(str::to_string);
            } else if let Some(value) = part.strip_prefix("seq=") {
                seq = value.parse().unwrap_or(0);
            } else if let Some(value) = part.strip_prefix("rtptime=") {
                rtptime = value.parse().unwrap_or(0);
            }
        }
        if let Some(tail) = tail {
            entries.push((tail, seq, rtptime));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_params_from_camera_response() {
        let params = TransportParams::parse(
            "RTP/AVP/TCP;unicast;destination=::ffff:192.168.88.254;source=192.168.20.2;interleaved=0-1;ssrc=401caf81",
        );
        assert_eq!(params.protocol.as_deref(), Some("RTP/AVP/TCP"));
        assert_eq!(params.com_type.as_deref(), Some("unicast"));
        assert_eq!(params.interleaved, Some((0, 1)));
        assert_eq!(params.ssrc.as_deref(), Some("401caf81"));
    }

    #[test]
    fn transport_params_without_interleaved() {
        let params = TransportParams::parse("RTP/AVP/TCP;unicast");
        assert_eq!(params.protocol.as_deref(), Some("RTP/AVP/TCP"));
        assert_eq!(params.interleaved, None);
        assert_eq!(params.ssrc, None);
    }

    #[test]
    fn udp_transport_is_recognized_as_such() {
        let params = TransportParams::parse("RTP/AVP;unicast;client_port=8000-8001");
        assert_eq!(params.protocol.as_deref(), Some("RTP/AVP"));
    }

    #[test]
    fn session_header_parses_id_and_timeout() {
        assert_eq!(
            parse_session_header("410523494695999;timeout=60"),
            ("410523494695999".to_string(), 60)
        );
        assert_eq!(
            parse_session_header("410523494695999"),
            ("410523494695999".to_string(), DEFAULT_SESSION_TIMEOUT_SECS)
        );
        assert_eq!(parse_session_header(""), (String::new(), DEFAULT_SESSION_TIMEOUT_SECS));
    }

    #[test]
    fn rtp_info_resolves_track_tails() {
        let entries = parse_rtp_info(
            "url=rtsp://192.168.20.2/profile1/track1;seq=52326;rtptime=1781120107,\
             url=rtsp://192.168.20.2/profile1/track2;seq=44529;rtptime=572932177",
        );
        assert_eq!(
            entries,
            vec![
                ("track1".to_string(), 52326, 1781120107),
                ("track2".to_string(), 44529, 572932177),
            ]
        );
    }

    #[test]
    fn channel_pair_parses_dashed_values() {
        assert_eq!(parse_channel_pair("0-1"), Some((0, 1)));
        assert_eq!(parse_channel_pair("2-3"), Some((2, 3)));
        assert_eq!(parse_channel_pair("x-1"), None);
        assert_eq!(parse_channel_pair("4"), None);
    }
}
