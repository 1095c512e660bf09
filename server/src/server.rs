use crate::error::ProxyError;
use crate::rtsp::client;
use crate::rtsp::remote::Remote;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Upstream endpoint plus the username it was dialed with. Keying on the
/// user keeps two viewers with different credentials on separate remotes.
pub type RemoteKey = (String, String);

/// Process-wide state: the pool of upstream connections, created lazily on
/// the first viewer request for an endpoint.
pub struct Server {
    self_ref: Weak<Server>,
    remotes: Mutex<HashMap<RemoteKey, Arc<Remote>>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            remotes: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts viewer connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!(%addr, "accepted client connection");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        client::run(server, socket).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "failed to accept client");
                }
            }
        }
    }

    /// Existing remote for the key, or a freshly dialed one. Dial failures
    /// are returned, never cached; the next request simply retries.
    pub async fn lookup_remote(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Arc<Remote>, ProxyError> {
        let key: RemoteKey = (format!("{host}:{port}"), username.to_string());
        let mut remotes = self.remotes.lock().await;
        if let Some(remote) = remotes.get(&key) {
            if !remote.is_destroyed().await {
                return Ok(Arc::clone(remote));
            }
            remotes.remove(&key);
        }
        let Some(server) = self.self_ref.upgrade() else {
            return Err(ProxyError::ConnectionClosed);
        };
        let remote = Remote::connect(&server, host, port, username, password).await?;
        remotes.insert(key, Arc::clone(&remote));
        Ok(remote)
    }

    /// Pool lookup without dialing, for teardown paths.
    pub async fn get_remote(&self, key: &RemoteKey) -> Option<Arc<Remote>> {
        self.remotes.lock().await.get(key).cloned()
    }

    pub(crate) async fn remove_remote(&self, key: &RemoteKey) {
        self.remotes.lock().await.remove(key);
    }
}
