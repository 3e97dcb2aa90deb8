use std::sync::Arc;

use eyre::Result;
use russh::client::{self, Handle, Msg};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::Duration,
};
use tracing::debug;

use crate::{revdial::proto, ssh::session::state::Credential};

/// Why the backend leg could not be brought up. The distinction matters to
/// the user: refused credentials are theirs to fix, a failed handshake is
/// not.
#[derive(Debug)]
pub enum ConnectError {
    AuthFailed,
    Handshake(eyre::Report),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::AuthFailed => write!(f, "credentials were refused by the device"),
            ConnectError::Handshake(_) => {
                write!(f, "could not establish a session with the device")
            }
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<russh::Error> for ConnectError {
    fn from(error: russh::Error) -> Self {
        ConnectError::Handshake(error.into())
    }
}

/// Client handler for the SSH transport riding a reverse-dial stream.
pub struct ClientHandler {
    device_uid: String,
    agent_channels: UnboundedSender<russh::Channel<Msg>>,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = eyre::Error;

    async fn check_server_key(&mut self, _: &PublicKey) -> Result<bool> {
        // The transport rides inside the device's authenticated reverse
        // tunnel; the registration is the trust anchor, not the host key.
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: russh::Channel<Msg>,
        _: &mut client::Session,
    ) -> Result<()> {
        debug!(device = self.device_uid, "agent forward channel");

        // Receiver gone means forwarding is disabled for this session; the
        // channel drops and the device sees it close.
        let _unused = self.agent_channels.send(channel);

        Ok(())
    }
}

/// Run the SSH handshake over a dialed reverse stream and authenticate as
/// the device-side user. Password sessions replay the user's password;
/// public-key sessions substitute the gateway's magic key.
pub async fn connect(
    stream: proto::Stream,
    device_uid: &str,
    username: &str,
    credential: &Credential,
    magic: Arc<KeyPair>,
    timeout: Duration,
) -> Result<(Handle<ClientHandler>, UnboundedReceiver<russh::Channel<Msg>>), ConnectError> {
    let config = Arc::new(client::Config::default());

    let (agent_tx, agent_rx) = unbounded_channel();
    let handler = ClientHandler {
        device_uid: device_uid.to_string(),
        agent_channels: agent_tx,
    };

    // The timeout bounds the handshake only; an established session has no
    // deadline.
    let mut handle = tokio::time::timeout(timeout, client::connect_stream(config, stream, handler))
        .await
        .map_err(|_| ConnectError::Handshake(eyre::eyre!("handshake timed out")))?
        .map_err(ConnectError::Handshake)?;

    let authenticated = match credential {
        Credential::Password(password) => handle.authenticate_password(username, password).await?,
        Credential::PublicKey => handle.authenticate_publickey(username, magic).await?,
    };

    if !authenticated {
        let _unused = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;

        return Err(ConnectError::AuthFailed);
    }

    debug!(device = device_uid, username, "connected to the device");

    Ok((handle, agent_rx))
}
