pub mod connector;
pub mod session;

use std::{net::SocketAddr, sync::Arc};

use derive_builder::Builder;
use eyre::{Result, WrapErr};
use russh::{server, MethodSet};
use russh_keys::key::KeyPair;
use session::Session;
use tokio::{net::TcpListener, time::Duration};
use tracing::{error, info};

use crate::{api, keys, proxyproto, recorder::Recorder, revdial::Registry};

/// Gateway behavior toggles, resolved from the command line and environment
/// at startup and injected here; nothing below this reads the environment.
#[derive(Builder, Clone, Debug)]
pub struct Settings {
    pub cloud: bool,
    pub enterprise: bool,
    pub billing: bool,
    pub connect_timeout: Duration,
    pub allow_agent_forwarding: bool,
    pub allow_public_key_below_0_6_0: bool,
    pub proxy_protocol: bool,
}

/// Everything a session needs, shared across all of them: the management
/// API, the tunnel registry, the recorder, and the magic key the gateway
/// presents to devices on behalf of public-key users.
pub struct Gateway {
    pub settings: Settings,
    pub api: api::Client,
    pub registry: Registry,
    pub recorder: Option<Recorder>,
    pub magic: Arc<KeyPair>,
    pub magic_fingerprint: String,
}

impl Gateway {
    pub async fn new(
        settings: Settings,
        api: api::Client,
        registry: Registry,
        recorder: Option<Recorder>,
    ) -> Result<Self> {
        let magic = keys::magic_key(&api).await?;
        let magic_fingerprint = keys::fingerprint(
            &magic
                .clone_public_key()
                .wrap_err("failed to derive the magic public key")?,
        );

        Ok(Self {
            settings,
            api,
            registry,
            recorder,
            magic: Arc::new(magic),
            magic_fingerprint,
        })
    }

    pub fn ssh_config(host_key: KeyPair) -> server::Config {
        server::Config {
            methods: MethodSet::PUBLICKEY | MethodSet::PASSWORD,
            keys: vec![host_key],
            ..Default::default()
        }
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr, config: Arc<server::Config>) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind the SSH listener on {addr}"))?;

        info!(%addr, "listening for SSH");

        loop {
            let (socket, peer) = listener.accept().await?;

            let gateway = self.clone();
            let config = config.clone();

            tokio::spawn(async move {
                if let Err(error) = serve_connection(gateway, config, socket, peer).await {
                    // Clients going away mid-handshake is routine.
                    if let Some(russh::Error::IO(_)) = error.downcast_ref::<russh::Error>() {
                        return;
                    }

                    error!(?error, "unhandled session error");
                }
            });
        }
    }
}

async fn serve_connection(
    gateway: Arc<Gateway>,
    config: Arc<server::Config>,
    mut socket: tokio::net::TcpStream,
    mut peer: SocketAddr,
) -> Result<()> {
    // With the proxy in front, the preamble carries the true client; the
    // TCP peer is just the proxy.
    if gateway.settings.proxy_protocol {
        if let Some(source) = proxyproto::accept(&mut socket).await? {
            peer = source;
        }
    }

    let handler = Session::new(gateway, Some(peer));

    let session = server::run_stream(config, socket, handler).await?;
    session.await?;

    Ok(())
}
