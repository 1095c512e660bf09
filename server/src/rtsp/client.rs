use crate::error::ProxyError;
use crate::rtsp::message::{
    clean_path, split_track, Method, Request, Response, DEFAULT_RTSP_PORT,
};
use crate::rtsp::parser::{Frame, StreamParser};
use crate::rtsp::remote::Remote;
use crate::server::{RemoteKey, Server};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of a viewer connection. Responses from the client's own
/// handler and relayed frames from remote reader tasks both land here, so
/// all writes go through one lock.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub peer_ip: String,
    pub local_ip: String,
    writer: Mutex<OwnedWriteHalf>,
}

impl ClientHandle {
    fn new(peer_ip: String, local_ip: String, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            peer_ip,
            local_ip,
            writer: Mutex::new(writer),
        })
    }

    pub async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Relays one interleaved payload, rewritten to the subscriber's own
    /// channel index.
    pub async fn write_frame(&self, channel: u8, payload: &[u8]) -> std::io::Result<()> {
        let header = encode_frame_header(channel, payload.len() as u16);
        let mut writer = self.writer.lock().await;
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    }
}

pub fn encode_frame_header(channel: u8, length: u16) -> [u8; 4] {
    let len = length.to_be_bytes();
    [b'$', channel, len[0], len[1]]
}

/// Upstream identity latched from the first request's URL. Later requests
/// from the same viewer reuse it even when their URLs omit userinfo.
struct UpstreamTarget {
    key: RemoteKey,
    host: String,
    port: u16,
    username: String,
    password: String,
}

fn latch_target(request: &Request) -> Result<UpstreamTarget, ProxyError> {
    let host = request
        .url
        .host_str()
        .ok_or_else(|| ProxyError::Parse(format!("url without host: {}", request.raw_url)))?
        .to_string();
    let port = request.url.port().unwrap_or(DEFAULT_RTSP_PORT);
    let username = request.url.username().to_string();
    let password = request.url.password().unwrap_or_default().to_string();
    Ok(UpstreamTarget {
        key: (format!("{host}:{port}"), username.clone()),
        host,
        port,
        username,
        password,
    })
}

/// Handles one accepted viewer socket until it closes.
pub async fn run(server: Arc<Server>, socket: TcpStream) {
    let (peer, local) = match (socket.peer_addr(), socket.local_addr()) {
        (Ok(peer), Ok(local)) => (peer, local),
        _ => return,
    };
    let (mut reader, writer) = socket.into_split();
    let handle = ClientHandle::new(peer.ip().to_string(), local.ip().to_string(), writer);
    debug!(client = handle.id, %peer, "client connected");

    let mut target: Option<UpstreamTarget> = None;
    let mut parser = StreamParser::new();
    let mut buffer = [0u8; 16 * 1024];

    'outer: loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        let frames = match parser.append(&buffer[..read]) {
            Ok(frames) => frames,
            Err(error) => {
                debug!(client = handle.id, %error, "closing client on framing error");
                break;
            }
        };
        for frame in frames {
            match frame {
                // RTCP coming back from the viewer is consumed and dropped.
                Frame::Interleaved { channel, payload } => {
                    debug!(
                        client = handle.id,
                        channel,
                        bytes = payload.len(),
                        "discarding client interleaved frame"
                    );
                }
                Frame::Message(bytes) => {
                    let request = match Request::parse(&bytes) {
                        Ok(request) => request,
                        Err(error) => {
                            debug!(client = handle.id, %error, "closing client on bad request");
                            break 'outer;
                        }
                    };
                    if handle_request(&server, &handle, &mut target, request)
                        .await
                        .is_err()
                    {
                        break 'outer;
                    }
                }
            }
        }
    }

    debug!(client = handle.id, %peer, "client disconnected");
    if let Some(target) = target {
        if let Some(remote) = server.get_remote(&target.key).await {
            remote.unsubscribe(handle.id).await;
        }
    }
}

async fn handle_request(
    server: &Arc<Server>,
    handle: &Arc<ClientHandle>,
    target_slot: &mut Option<UpstreamTarget>,
    request: Request,
) -> Result<(), ProxyError> {
    if target_slot.is_none() {
        *target_slot = Some(latch_target(&request)?);
    }
    let Some(target) = target_slot.as_ref() else {
        return Err(ProxyError::ConnectionClosed);
    };

    let remote = match server
        .lookup_remote(&target.host, target.port, &target.username, &target.password)
        .await
    {
        Ok(remote) => remote,
        Err(error) => {
            warn!(endpoint = %target.key.0, %error, "upstream lookup failed");
            let mut response = Response::build(404, "Stream Not Found");
            finish_response(&mut response, &request);
            let _ = handle.write(&response.serialize()).await;
            return Err(error);
        }
    };

    let mut response = match Method::from_token(&request.method) {
        Some(Method::Options) => handle_options(&remote, &request).await,
        Some(Method::Describe) => handle_describe(&remote, &request).await,
        Some(Method::Setup) => handle_setup(&remote, handle, &request).await,
        Some(Method::Play) => handle_play(&remote, &request).await,
        Some(Method::Teardown) | Some(Method::GetParameter) => {
            handle_session_echo(&remote, &request).await
        }
        None => bad_request(),
    };

    finish_response(&mut response, &request);
    handle
        .write(&response.serialize())
        .await
        .map_err(|_| ProxyError::ConnectionClosed)
}

fn finish_response(response: &mut Response, request: &Request) {
    response.headers.set("Via", "RTSP-Proxy");
    if let Some(cseq) = request.header("CSeq") {
        response.headers.set("CSeq", cseq.to_string());
    }
}

fn bad_request() -> Response {
    Response::build(400, "Bad Request")
}

async fn handle_options(remote: &Arc<Remote>, request: &Request) -> Response {
    let path = clean_path(request.url.path());
    match remote.get_options(&path).await {
        Ok(options) => {
            let mut response = Response::build(200, "OK");
            response.headers.set("Public", options);
            set_server_header(&mut response, remote, &path).await;
            response
        }
        Err(error) => {
            debug!(%path, %error, "options against upstream failed");
            bad_request()
        }
    }
}

async fn handle_describe(remote: &Arc<Remote>, request: &Request) -> Response {
    let path = clean_path(request.url.path());
    match remote.get_sdp(&path).await {
        Ok(sdp) => {
            let mut response = Response::build(200, "OK");
            response.headers.set("Content-Type", "application/sdp");
            set_server_header(&mut response, remote, &path).await;
            response.headers.set("Content-Length", sdp.len().to_string());
            response.body = sdp;
            response
        }
        Err(error) => {
            debug!(%path, %error, "describe against upstream failed");
            bad_request()
        }
    }
}

async fn handle_setup(
    remote: &Arc<Remote>,
    handle: &Arc<ClientHandle>,
    request: &Request,
) -> Response {
    let path = clean_path(request.url.path());
    let Some((stream, substream)) = split_track(&path) else {
        return bad_request();
    };
    let Some(transport) = request.header("Transport").map(str::to_string) else {
        return bad_request();
    };

    let result = remote
        .get_ssrc_session(
            Arc::clone(handle),
            &stream,
            &substream,
            &transport,
            request.header("Session"),
        )
        .await;
    match result {
        Ok((ssrc, session)) => {
            let mut response = Response::build(200, "OK");
            response.headers.set(
                "Transport",
                format!(
                    "{};ssrc={};destination={};source={}",
                    transport, ssrc, handle.peer_ip, handle.local_ip
                ),
            );
            response.headers.set("Cache-Control", "must-revalidate");
            response.headers.set("Session", format!("{session};timeout=60"));
            set_server_header(&mut response, remote, &stream).await;
            response
        }
        Err(error) => {
            debug!(%stream, %substream, %error, "setup against upstream failed");
            bad_request()
        }
    }
}

async fn handle_play(remote: &Arc<Remote>, request: &Request) -> Response {
    let path = clean_path(request.url.path());
    let session = request.header("Session").unwrap_or_default().to_string();
    match remote.get_rtp_info(&path, &session).await {
        Ok(rtp_info) => {
            let mut response = Response::build(200, "OK");
            if let Some(range) = request.header("Range") {
                response.headers.set("Range", range.to_string());
            }
            response.headers.set("Session", session);
            set_server_header(&mut response, remote, &path).await;
            response.headers.set("RTP-Info", rtp_info);
            response
        }
        Err(error) => {
            debug!(%path, %error, "play against upstream failed");
            bad_request()
        }
    }
}

// TEARDOWN and GET_PARAMETER answer locally; the upstream session is torn
// down by the keepalive idle policy once all subscribers are gone.
async fn handle_session_echo(remote: &Arc<Remote>, request: &Request) -> Response {
    let path = clean_path(request.url.path());
    let mut response = Response::build(200, "OK");
    if let Some(session) = request.header("Session") {
        response.headers.set("Session", session.to_string());
    }
    set_server_header(&mut response, remote, &path).await;
    response
}

async fn set_server_header(response: &mut Response, remote: &Arc<Remote>, path: &str) {
    if let Some(server) = remote.server_header(path).await {
        response.headers.set("Server", server);
    }
}
