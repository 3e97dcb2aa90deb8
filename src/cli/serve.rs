use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use cata::{Command, Container};
use clap::Parser;
use eyre::Result;
use tracing::info;
use warp::Filter;

use crate::{
    api, health, keys,
    recorder::Recorder,
    revdial::{self, Registry},
    ssh::{Gateway, SettingsBuilder},
};

#[derive(Parser, Container)]
pub struct Serve {
    /// SSH listen address
    #[arg(long, default_value = "0.0.0.0:2222", env = "SSH_LISTEN")]
    ssh: SocketAddr,

    /// HTTP listen address: reverse-dial upgrades, metrics, health
    #[arg(long, default_value = "0.0.0.0:8080", env = "HTTP_LISTEN")]
    http: SocketAddr,

    /// Host key file; the gateway will not start without one
    #[arg(long, env = "PRIVATE_KEY")]
    private_key: PathBuf,

    /// Management API base URL
    #[arg(long, default_value = "http://api:8080", env = "API_URL")]
    api: String,

    /// Handshake deadline for the device leg
    #[arg(long, default_value = "30s", env = "CONNECT_TIMEOUT")]
    connect_timeout: humantime::Duration,

    /// Heartbeat window; a device silent for twice this is evicted. Must
    /// cover the agents' keepalive interval plus their maximum jitter.
    #[arg(long, default_value = "90s", env = "HEARTBEAT_INTERVAL")]
    heartbeat_interval: humantime::Duration,

    /// Session recording endpoint; interactive sessions on cloud and
    /// enterprise tiers are mirrored there
    #[arg(long, env = "RECORD_URL")]
    record_url: Option<String>,

    #[arg(long, env = "SHELLHUB_CLOUD")]
    cloud: bool,

    #[arg(long, env = "SHELLHUB_ENTERPRISE")]
    enterprise: bool,

    #[arg(long, env = "SHELLHUB_BILLING")]
    billing: bool,

    /// Let agents older than 0.6.0 accept public-key sessions anyway
    #[arg(long, env = "ALLOW_PUBLIC_KEY_ACCESS_BELLOW_0_6_0")]
    allow_public_key_access_bellow_0_6_0: bool,

    /// Bridge auth-agent channels from devices back to clients
    #[arg(long)]
    allow_agent_forwarding: bool,

    /// Expect a PROXY protocol v1/v2 preamble on every SSH connection
    #[arg(long, env = "PROXY_PROTOCOL")]
    proxy_protocol: bool,
}

#[async_trait::async_trait]
impl Command for Serve {
    async fn run(&self) -> Result<()> {
        let host_key = keys::host_key(&self.private_key)?;

        let api = api::Client::new(self.api.clone());
        let registry = Registry::new(
            api.clone(),
            *self.connect_timeout,
            *self.heartbeat_interval,
        );
        let recorder = self.record_url.clone().map(Recorder::new);

        let settings = SettingsBuilder::default()
            .cloud(self.cloud)
            .enterprise(self.enterprise)
            .billing(self.billing)
            .connect_timeout(*self.connect_timeout)
            .allow_agent_forwarding(self.allow_agent_forwarding)
            .allow_public_key_below_0_6_0(self.allow_public_key_access_bellow_0_6_0)
            .proxy_protocol(self.proxy_protocol)
            .build()?;

        let gateway = Arc::new(Gateway::new(settings, api, registry.clone(), recorder).await?);
        let config = Arc::new(Gateway::ssh_config(host_key));

        let routes = revdial::routes(registry).or(health::routes());
        let http = warp::serve(routes).run(self.http);

        info!(http = %self.http, "listening for HTTP");

        tokio::select! {
            result = gateway.run(self.ssh, config) => result,
            () = http => Ok(()),
        }
    }
}
