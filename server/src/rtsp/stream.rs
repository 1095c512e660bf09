use crate::rtsp::client::ClientHandle;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::AbortHandle;

pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// One upstream media path and everything cached about it.
#[derive(Debug, Default)]
pub struct Stream {
    pub options: Option<String>,
    pub server: Option<String>,
    pub sdp: Option<Vec<u8>>,
    pub sessions: HashMap<String, Session>,
}

impl Stream {
    pub fn lookup_session(&mut self, id: &str, timeout_secs: u64) -> &mut Session {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, timeout_secs))
    }

    /// Finds a matching transport in any of this stream's sessions, the way
    /// a second viewer joins an already negotiated track.
    pub fn find_transport(&self, substream: &str, protocol: &str, com_type: &str) -> Option<(&str, &Transport)> {
        for (id, session) in &self.sessions {
            if let Some(transport) = session.find_transport(substream, protocol, com_type) {
                return Some((id.as_str(), transport));
            }
        }
        None
    }
}

/// One upstream RTSP session. The keepalive task handle lives here so stop
/// is idempotent and teardown can cancel it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub timeout_secs: u64,
    pub transports: Vec<Transport>,
    pub started: bool,
    pub keepalive: Option<AbortHandle>,
}

impl Session {
    pub fn new(id: &str, timeout_secs: u64) -> Self {
        Self {
            id: id.to_string(),
            timeout_secs,
            transports: Vec::new(),
            started: false,
            keepalive: None,
        }
    }

    pub fn find_transport(&self, substream: &str, protocol: &str, com_type: &str) -> Option<&Transport> {
        self.transports
            .iter()
            .find(|t| t.substream_name == substream && t.protocol == protocol && t.com_type == com_type)
    }

    pub fn find_transport_mut(
        &mut self,
        substream: &str,
        protocol: &str,
        com_type: &str,
    ) -> Option<&mut Transport> {
        self.transports
            .iter_mut()
            .find(|t| t.substream_name == substream && t.protocol == protocol && t.com_type == com_type)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        self.started = false;
    }
}

/// One negotiated track: a data substream on an even channel and its RTCP
/// control substream on the following odd channel.
#[derive(Debug)]
pub struct Transport {
    pub substream_name: String,
    pub protocol: String,
    pub com_type: String,
    pub ssrc: Option<String>,
    pub substreams: [Substream; 2],
}

impl Transport {
    pub fn new(substream_name: &str, protocol: &str, com_type: &str, channels: (u8, u8)) -> Self {
        Self {
            substream_name: substream_name.to_string(),
            protocol: protocol.to_string(),
            com_type: com_type.to_string(),
            ssrc: None,
            substreams: [
                Substream::new(substream_name, channels.0),
                Substream::new(substream_name, channels.1),
            ],
        }
    }

    pub fn data(&self) -> &Substream {
        &self.substreams[0]
    }

    pub fn data_mut(&mut self) -> &mut Substream {
        &mut self.substreams[0]
    }

    pub fn data_channel(&self) -> u8 {
        self.substreams[0].channel
    }
}

#[derive(Debug)]
pub struct Substream {
    pub name: String,
    pub channel: u8,
    // seq 0 means the substream has not seen a PLAY yet.
    pub seq: u32,
    pub rtptime: u32,
}

impl Substream {
    fn new(name: &str, channel: u8) -> Self {
        Self {
            name: name.to_string(),
            channel,
            seq: 0,
            rtptime: 0,
        }
    }
}

/// Per-channel fan-out record. The session stays `None` while the upstream
/// SETUP that reserved the channel pair is still in flight.
#[derive(Debug)]
pub struct Interlayer {
    pub channel: u8,
    pub stream: String,
    pub substream: String,
    pub session: Option<String>,
    pub subscribers: Vec<Subscriber>,
}

impl Interlayer {
    pub fn new(channel: u8, stream: &str, substream: &str) -> Self {
        Self {
            channel,
            stream: stream.to_string(),
            substream: substream.to_string(),
            session: None,
            subscribers: Vec::new(),
        }
    }
}

/// A viewer attached to an interlayer, plus the client-side channel its
/// frames are rewritten to.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub client: Arc<ClientHandle>,
    pub channel: u8,
}

/// Next unused consecutive even/odd channel pair on a remote.
pub fn next_channel_pair(interlayers: &BTreeMap<u8, Interlayer>) -> Option<(u8, u8)> {
    for data in (0u8..=254).step_by(2) {
        if !interlayers.contains_key(&data) && !interlayers.contains_key(&(data + 1)) {
            return Some((data, data + 1));
        }
    }
    None
}
