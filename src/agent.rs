use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use derive_builder::Builder;
use eyre::{eyre, Result, WrapErr};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use russh_keys::{key::KeyPair, PublicKeyBase64};
use tokio::{net::TcpStream, task::JoinSet, time::Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

use crate::{
    api,
    revdial::proto::{Frame, Mux, Signal},
};

// Wait between reconnection attempts after the tunnel drops.
const RETRY_DELAY: Duration = Duration::from_secs(10);

// The device re-authorizes its identity against the API while the tunnel
// is up.
const API_PING_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Builder, Clone, Debug)]
pub struct Options {
    pub server_address: String,
    pub tenant_id: String,
    pub private_key: PathBuf,
    pub keepalive_interval: Duration,
    // Upper bound of the per-interval ping jitter, in seconds.
    pub max_retry_timeout: u64,
    #[builder(default)]
    pub preferred_hostname: Option<String>,
    #[builder(default)]
    pub preferred_identity: Option<String>,
    pub sshd_address: String,
}

// What a stream opener asks for.
#[derive(Debug, PartialEq, Eq)]
enum Opener {
    Session(String),
    Close(String),
}

fn parse_opener(header: &str) -> Option<Opener> {
    let header = header.trim();

    if let Some(session) = header.strip_prefix("GET /ssh/") {
        return Some(Opener::Session(session.to_string()));
    }

    if let Some(session) = header.strip_prefix("DELETE /ssh/close/") {
        return Some(Opener::Close(session.to_string()));
    }

    None
}

// A stable identity for devices that do not configure one: hostname-derived,
// MAC-shaped, unchanged across restarts.
fn derived_identity(hostname: &str) -> String {
    let digest = md5::compute(hostname.as_bytes());

    digest[..6]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn jitter(max_retry_timeout: u64) -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(10..=max_retry_timeout.max(10)))
}

fn control_url(server_address: &str) -> String {
    let base = server_address.trim_end_matches('/');

    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };

    format!("{base}/ssh/connection")
}

/// The device-side reverse client: keeps one control connection open to the
/// gateway and bridges gateway-opened streams to the local SSH daemon.
pub struct Agent {
    api: api::Client,
    options: Options,
    key: KeyPair,
}

impl Agent {
    pub fn new(options: Options) -> Result<Self> {
        let api = api::Client::new(options.server_address.clone());
        let key = identity_key(&options.private_key)?;

        Ok(Self { api, options, key })
    }

    fn hostname(&self) -> String {
        self.options.preferred_hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|name| name.to_string_lossy().to_lowercase())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    fn auth_request(&self) -> Result<api::AuthRequest> {
        let hostname = self.hostname();

        let public_key = self
            .key
            .clone_public_key()
            .wrap_err("failed to derive the agent public key")?;

        Ok(api::AuthRequest {
            tenant_id: self.options.tenant_id.clone(),
            identity: api::Identity {
                mac: self
                    .options
                    .preferred_identity
                    .clone()
                    .unwrap_or_else(|| derived_identity(&hostname)),
            },
            hostname,
            public_key: format!("{} {}", public_key.name(), public_key.public_key_base64()),
        })
    }

    /// Connect, serve, reconnect, forever.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.session().await {
                Ok(()) => info!("tunnel closed, reconnecting"),
                Err(error) => warn!(?error, "tunnel failed"),
            }

            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn session(&self) -> Result<()> {
        let request = self.auth_request()?;
        let auth = self.api.auth_device(&request).await?;

        let mut upgrade = control_url(&self.options.server_address).into_client_request()?;
        let headers = upgrade.headers_mut();
        headers.insert("X-Device-UID", HeaderValue::from_str(&auth.uid)?);
        headers.insert("X-Tenant-ID", HeaderValue::from_str(&self.options.tenant_id)?);
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", auth.token))?,
        );

        let (socket, _) = connect_async(upgrade).await?;

        info!(
            device = auth.uid,
            namespace = auth.namespace,
            name = auth.name,
            "tunnel established"
        );

        let (mux, mut outbound) = Mux::new();
        let (mut sink, mut inbound) = socket.split();

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let missed = Arc::new(AtomicU32::new(0));

        tasks.spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let raw = frame.encode()?;

                sink.send(Message::Binary(raw.into()))
                    .await
                    .map_err(|error| eyre!("control connection write failed: {error}"))?;
            }

            Ok(())
        });

        // Ping loop. The first ping goes out after one plain interval;
        // every following interval is stretched by a random jitter so a
        // fleet sharing a boot moment drifts apart.
        {
            let mux = mux.clone();
            let missed = missed.clone();
            let interval = self.options.keepalive_interval;
            let max_retry = self.options.max_retry_timeout;

            tasks.spawn(async move {
                let mut first = true;

                loop {
                    let delay = if first {
                        interval
                    } else {
                        interval + jitter(max_retry)
                    };
                    first = false;

                    tokio::time::sleep(delay).await;

                    if missed.load(Ordering::Relaxed) >= 2 {
                        return Err(eyre!("gateway stopped answering pings"));
                    }

                    missed.fetch_add(1, Ordering::Relaxed);

                    if !mux.ping() {
                        return Ok(());
                    }
                }
            });
        }

        // Identity re-authorization, alive only while the tunnel is.
        {
            let api = self.api.clone();
            let token = auth.token.clone();

            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(API_PING_INTERVAL);
                ticker.tick().await;

                loop {
                    ticker.tick().await;

                    if let Err(error) = api.auth_device_with_token(&request, &token).await {
                        warn!(?error, "failed to re-authorize the device");
                    }
                }
            });
        }

        let result = loop {
            let message = tokio::select! {
                message = inbound.next() => message,
                // A pump died (socket write failure, ping starvation):
                // tear the session down and reconnect.
                Some(finished) = tasks.join_next() => break finished?.map(|()| ()),
            };

            let message = match message {
                None => break Ok(()),
                Some(Err(error)) => break Err(eyre!("control connection failed: {error}")),
                Some(Ok(message)) => message,
            };

            if message.is_close() {
                break Ok(());
            }

            if !message.is_binary() {
                continue;
            }

            let frame = match Frame::decode(&message.into_data()) {
                Ok(frame) => frame,
                Err(error) => {
                    debug!(?error, "undecodable control frame");

                    continue;
                }
            };

            match mux.handle(frame).await {
                Some(Signal::Open { stream, header }) => {
                    self.serve_open(&mux, &mut tasks, stream, &header).await;
                }
                Some(Signal::Ping) => {
                    mux.pong();
                }
                Some(Signal::Pong) => {
                    missed.store(0, Ordering::Relaxed);
                }
                None => {}
            }
        };

        tasks.abort_all();
        mux.shutdown().await;

        result
    }

    async fn serve_open(&self, mux: &Mux, tasks: &mut JoinSet<Result<()>>, id: u32, header: &str) {
        match parse_opener(header) {
            Some(Opener::Session(session)) => {
                debug!(session, "session stream");

                let sshd = match TcpStream::connect(&self.options.sshd_address).await {
                    Ok(socket) => socket,
                    Err(error) => {
                        warn!(?error, sshd = self.options.sshd_address, "sshd unreachable");
                        mux.reject(id);

                        return;
                    }
                };

                let stream = match mux.accept(id).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!(?error, "could not accept the stream");

                        return;
                    }
                };

                tasks.spawn(async move {
                    let mut stream = stream;
                    let mut sshd = sshd;

                    let _unused = tokio::io::copy_bidirectional(&mut stream, &mut sshd).await;

                    Ok(())
                });
            }
            Some(Opener::Close(session)) => {
                debug!(session, "session closed by the gateway");

                // Ack so the gateway's dial completes; the stream dies right
                // after. The session's own stream ends on its own close.
                if let Ok(stream) = mux.accept(id).await {
                    drop(stream);
                }
            }
            None => {
                warn!(header, "unrecognized opener");
                mux.reject(id);
            }
        }
    }
}

// Load the device identity key, minting one on first boot.
fn identity_key(path: &std::path::Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None)
            .wrap_err_with(|| format!("failed to load the agent key at {}", path.display()));
    }

    let key = crate::keys::generate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(path)
        .wrap_err_with(|| format!("failed to create the agent key at {}", path.display()))?;
    russh_keys::encode_pkcs8_pem(&key, file)?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openers_parse() {
        assert_eq!(
            parse_opener("GET /ssh/8c3f5e42"),
            Some(Opener::Session("8c3f5e42".to_string()))
        );
        assert_eq!(
            parse_opener("DELETE /ssh/close/8c3f5e42\r\n\r\n"),
            Some(Opener::Close("8c3f5e42".to_string()))
        );
        assert_eq!(parse_opener("POST /ssh/8c3f5e42"), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let delay = jitter(60).as_secs();
            assert!((10..=60).contains(&delay));
        }

        // A misconfigured bound below the floor degrades to the floor.
        assert_eq!(jitter(5).as_secs(), 10);
    }

    #[test]
    fn derived_identities_are_stable_and_mac_shaped() {
        let first = derived_identity("dev-01");

        assert_eq!(first, derived_identity("dev-01"));
        assert_ne!(first, derived_identity("dev-02"));
        assert_eq!(first.split(':').count(), 6);
    }

    #[test]
    fn control_urls_swap_schemes() {
        assert_eq!(control_url("http://gw:8080"), "ws://gw:8080/ssh/connection");
        assert_eq!(
            control_url("https://gw.example.com/"),
            "wss://gw.example.com/ssh/connection"
        );
        assert_eq!(control_url("gw:8080"), "ws://gw:8080/ssh/connection");
    }
}
