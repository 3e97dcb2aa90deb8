use std::path::PathBuf;

use cata::{Command, Container};
use clap::Parser;
use eyre::Result;
use tokio::time::Duration;

use crate::agent::{self, OptionsBuilder};

#[derive(Parser, Container)]
pub struct Agent {
    /// Gateway address, e.g. https://gatehouse.example.com
    #[arg(long, env = "SHELLHUB_SERVER_ADDRESS")]
    server_address: String,

    #[arg(long, env = "SHELLHUB_TENANT_ID")]
    tenant_id: String,

    /// Device identity key; minted on first start when absent
    #[arg(
        long,
        env = "SHELLHUB_PRIVATE_KEY",
        default_value = "/var/lib/gatehouse/agent_key"
    )]
    private_key: PathBuf,

    /// Seconds between tunnel keepalive pings
    #[arg(long, env = "SHELLHUB_KEEPALIVE_INTERVAL", default_value_t = 30)]
    keepalive_interval: u64,

    #[arg(long, env = "SHELLHUB_PREFERRED_HOSTNAME")]
    preferred_hostname: Option<String>,

    /// Device identity (MAC-shaped); derived from the hostname when unset
    #[arg(long, env = "SHELLHUB_PREFERRED_IDENTITY")]
    preferred_identity: Option<String>,

    /// Upper bound of the ping jitter in seconds, clamped to 10..=120
    #[arg(
        long,
        env = "SHELLHUB_MAX_RETRY_CONNECTION_TIMEOUT",
        default_value_t = 60
    )]
    max_retry_connection_timeout: u64,

    /// The local SSH daemon sessions are bridged to
    #[arg(long, default_value = "127.0.0.1:22")]
    sshd: String,
}

#[async_trait::async_trait]
impl Command for Agent {
    async fn run(&self) -> Result<()> {
        let options = OptionsBuilder::default()
            .server_address(self.server_address.clone())
            .tenant_id(self.tenant_id.clone())
            .private_key(self.private_key.clone())
            .keepalive_interval(Duration::from_secs(self.keepalive_interval))
            .max_retry_timeout(self.max_retry_connection_timeout.clamp(10, 120))
            .preferred_hostname(self.preferred_hostname.clone())
            .preferred_identity(self.preferred_identity.clone())
            .sshd_address(self.sshd.clone())
            .build()?;

        agent::Agent::new(options)?.run().await
    }
}
