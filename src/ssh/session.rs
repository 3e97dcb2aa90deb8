pub mod kind;
mod metrics;
pub mod state;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use eyre::{eyre, Result};
use kind::{Kind, Request};
use metrics::{
    ACTIVE_SESSIONS, AUTH_ATTEMPTS, AUTH_RESULTS, CHANNELS, KEEPALIVES, PREFLIGHTS, REJECTIONS,
    REQUESTS, SESSION_DURATION, SESSION_KINDS, TOTAL_BYTES, UNEXPECTED_STATE,
};
use russh::{
    client,
    keys::key::PublicKey,
    server::{self, Auth},
    ChannelId, ChannelMsg, CryptoVec, Disconnect, MethodSet, Pty, Sig,
};
use state::{Credential, State};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc, Semaphore},
    task::JoinSet,
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    api::{self, FirewallError, Version},
    keys,
    recorder::Tap,
    revdial::DialError,
    ssh::{
        connector::{self, ConnectError},
        Gateway,
    },
    target::Target,
};

// Per-session cap on device-opened agent-forwarding channels.
const AGENT_CHANNEL_LIMIT: usize = 8;

// How long an exec/scp channel on an old agent may linger after the
// client's input reached EOF before the agent side is closed for it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// Agents below this never close exec channels on their own.
const CLOSES_OWN_CHANNELS: Version = Version::new(0, 9, 3);

// Agents below this predate the gateway-key handshake.
const SPEAKS_PUBLIC_KEY: Version = Version::new(0, 6, 0);

// What the client asked to run on a channel, request-shaped.
enum Program<'a> {
    Shell,
    Exec(&'a str),
    Subsystem(&'a str),
}

// Control messages relayed from the handler into a channel's pump.
enum Upstream {
    Data(Vec<u8>),
    Eof,
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Close,
}

// A channel's place in its lifecycle. `Pending` pairs the client channel
// with its backend twin until a program starts; `Active` means the pumps
// own both and the handler only relays control messages; `Piped` means the
// bytes are being copied elsewhere (direct-tcpip, rejections).
enum Gate {
    Pending {
        client: russh::Channel<server::Msg>,
        backend: russh::Channel<client::Msg>,
    },
    Active {
        upstream: mpsc::UnboundedSender<Upstream>,
    },
    Piped,
}

// A session rejection surfaced to the user as a single line.
struct Rejection {
    reason: &'static str,
    message: String,
}

impl Rejection {
    fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

// Deferred teardown: the in-tunnel close signal, then the finish API call.
// Constructed once per session, consumed exactly once on drop.
struct Finisher {
    api: api::Client,
    registry: crate::revdial::Registry,
    device_uid: String,
    session: Uuid,
}

impl Finisher {
    async fn finish(self) {
        if let Err(error) = self.registry.close_session(&self.device_uid, self.session).await {
            debug!(?error, session = %self.session, "could not signal the session close in-tunnel");
        }

        if let Err(error) = self.api.finish_session(self.session).await {
            warn!(?error, session = %self.session, "failed to finish the session");
        }
    }
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Session {
    gateway: Arc<Gateway>,
    #[builder(default)]
    peer: Option<SocketAddr>,

    #[builder(default = "Uuid::new_v4()")]
    id: Uuid,
    #[builder(default)]
    start: DateTime<Utc>,
    #[builder(default)]
    state: State,
    #[builder(default)]
    tasks: JoinSet<Result<()>>,

    #[builder(default)]
    channels: HashMap<ChannelId, Gate>,

    #[builder(default)]
    envs: HashMap<String, String>,
    // The requested TERM; presence is what matters for classification.
    #[builder(default)]
    pty: Option<String>,
    // Shared with the recorder tap so resizes show up in recorded frames.
    #[builder(default = "Arc::new(StdMutex::new((80, 24)))")]
    geometry: Arc<StdMutex<(u32, u32)>>,

    // Set once by the first program request; later requests keep it.
    #[builder(default)]
    kind: Option<Kind>,
    // Fingerprint already validated against the key registry. Public-key
    // auth runs twice (probe, then signed); the registry is asked once.
    #[builder(default)]
    validated: Option<String>,
    // Device heartbeats, fanned out to every active channel pump so each
    // one can touch the client in the same interval.
    #[builder(default = "broadcast::channel(8).0")]
    heartbeats: broadcast::Sender<()>,
    #[builder(default)]
    announcement: Option<String>,
    #[builder(default)]
    announced: bool,
    #[builder(default)]
    finisher: Option<Finisher>,
}

impl Session {
    pub fn new(gateway: Arc<Gateway>, peer: Option<SocketAddr>) -> Self {
        metrics::TOTAL_SESSIONS.inc();
        ACTIVE_SESSIONS.inc();

        SessionBuilder::default()
            .gateway(gateway)
            .peer(peer)
            .start(Utc::now())
            .build()
            .expect("all other fields have defaults")
    }

    fn client_ip(&self) -> String {
        self.peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    // Parse the login user and resolve it to a device. Runs during
    // authentication for both methods, so every later step has the device
    // at hand.
    async fn resolve(&self, user: &str) -> Result<(Target, api::Device)> {
        let target: Target = user.parse()?;

        let device = target
            .resolve(&self.gateway.api, &self.client_ip())
            .await?;

        Ok((target, device))
    }

    #[tracing::instrument(skip(self))]
    async fn preflight(&self, target: &Target, device: &api::Device) -> Result<(), Rejection> {
        let settings = &self.gateway.settings;

        if settings.enterprise || settings.cloud {
            match self
                .gateway
                .api
                .firewall_evaluate(&target.lookup(device, &self.client_ip()))
                .await
            {
                Ok(()) => PREFLIGHTS.firewall.pass.inc(),
                Err(FirewallError::Blocked) => {
                    PREFLIGHTS.firewall.block.inc();

                    return Err(Rejection::new("firewall_blocked", "blocked by rule"));
                }
                Err(FirewallError::Unreachable) => {
                    PREFLIGHTS.firewall.error.inc();

                    return Err(Rejection::new("firewall_unreachable", "firewall unreachable"));
                }
                Err(FirewallError::Unknown) => {
                    PREFLIGHTS.firewall.error.inc();

                    return Err(Rejection::new("firewall_unknown", "unknown firewall failure"));
                }
            }
        }

        if settings.cloud && settings.billing {
            match self.gateway.api.billing_evaluate(&device.tenant_id).await {
                Ok(true) => PREFLIGHTS.billing.pass.inc(),
                Ok(false) => {
                    PREFLIGHTS.billing.block.inc();

                    return Err(Rejection::new("billing_blocked", "blocked by billing"));
                }
                Err(error) => {
                    PREFLIGHTS.billing.error.inc();
                    warn!(?error, "billing evaluation failed");

                    return Err(Rejection::new("billing_unknown", "unknown billing failure"));
                }
            }
        }

        Ok(())
    }

    // Bring up the device leg once per session: preflights, reverse dial,
    // SSH handshake, registration. Later channels on the same connection
    // reuse it.
    async fn connect_backend(&mut self, handle: &server::Handle) -> Result<(), Rejection> {
        if self.state.backend().is_some() {
            return Ok(());
        }

        let (target, device, credential) = self.state.take_authenticated().map_err(|_| {
            UNEXPECTED_STATE
                .with_label_values(&["Authenticated", self.state.as_ref()])
                .inc();

            Rejection::new("state", "session is not authenticated")
        })?;

        self.preflight(&target, &device).await?;

        let gateway = self.gateway.clone();

        let stream = gateway
            .registry
            .dial(&device.uid, &format!("GET /ssh/{}", self.id))
            .await
            .map_err(|error| match error {
                DialError::NotRegistered => Rejection::new(
                    "no_tunnel",
                    "failed to connect to the device: not connected",
                ),
                DialError::Timeout => Rejection::new(
                    "dial_timeout",
                    "failed to connect to the device: timed out",
                ),
            })?;

        let (backend, agent_channels) = connector::connect(
            stream,
            &device.uid,
            target.username(),
            &credential,
            gateway.magic.clone(),
            gateway.settings.connect_timeout,
        )
        .await
        .map_err(|error| match error {
            ConnectError::AuthFailed => {
                Rejection::new("auth_failed", "credentials were refused by the device")
            }
            ConnectError::Handshake(report) => {
                warn!(?report, device = device.uid, "device handshake failed");

                Rejection::new(
                    "handshake",
                    "could not establish a session with the device",
                )
            }
        })?;

        let record = api::SessionRecord {
            uid: self.id,
            device_uid: device.uid.clone(),
            username: target.username().to_string(),
            ip_address: self.client_ip(),
            // Classification happens on the first program request; the
            // record is created before that.
            kind: Kind::Unknown.to_string(),
        };

        if let Err(error) = gateway.api.register_session(&record).await {
            warn!(?error, "failed to register the session");

            return Err(Rejection::new("register", "failed to register the session"));
        }

        if let Err(error) = gateway.api.session_authenticated(self.id).await {
            warn!(?error, "failed to mark the session authenticated");
        }

        // Every device heartbeat refreshes the session while it lives: the
        // channel pumps relay it to the client, the API call keeps the
        // session record fresh.
        if let Some(mut heartbeat) = gateway.registry.heartbeat(&device.uid).await {
            let api = gateway.api.clone();
            let session = self.id;
            let beats = self.heartbeats.clone();

            self.tasks.spawn(async move {
                let mut failures: u32 = 0;

                while heartbeat.changed().await.is_ok() {
                    KEEPALIVES.inc();

                    let _unused = beats.send(());

                    match api.keepalive_session(session).await {
                        Ok(()) => failures = 0,
                        Err(error) => {
                            failures += 1;
                            warn!(?error, failures, "failed to relay a keepalive");
                        }
                    }
                }

                Ok(())
            });
        }

        if gateway.settings.allow_agent_forwarding {
            let handle = handle.clone();

            self.tasks
                .spawn(bridge_agent_channels(agent_channels, handle));
        }

        self.announcement = gateway
            .api
            .namespace(&device.tenant_id)
            .await
            .ok()
            .and_then(|namespace| namespace.announcement);

        self.finisher = Some(Finisher {
            api: gateway.api.clone(),
            registry: gateway.registry.clone(),
            device_uid: device.uid.clone(),
            session: self.id,
        });

        self.state.connected(target, device, backend);

        Ok(())
    }

    // Write the single error line, then drop the connection.
    fn reject_session(&mut self, handle: &server::Handle, id: ChannelId, rejection: Rejection) {
        REJECTIONS.with_label_values(&[rejection.reason]).inc();
        debug!(reason = rejection.reason, "rejecting the session");

        let handle = handle.clone();

        self.channels.insert(id, Gate::Piped);
        self.tasks.spawn(async move {
            let line = format!("{}\r\n", rejection.message);

            let _unused = handle
                .data(id, CryptoVec::from_slice(line.as_bytes()))
                .await;
            let _unused = handle.close(id).await;
            let _unused = handle
                .disconnect(Disconnect::ByApplication, rejection.message, String::new())
                .await;

            Ok(())
        });
    }

    fn reject_unsupported(&mut self, session: &mut server::Session, id: ChannelId) {
        REJECTIONS.with_label_values(&["unsupported"]).inc();

        self.channels.remove(&id);
        session.channel_failure(id);

        let handle = session.handle();
        self.tasks.spawn(async move {
            let _unused = handle
                .data(id, CryptoVec::from_slice(b"unsupported request\r\n"))
                .await;
            let _unused = handle.exit_status_request(id, 255).await;
            let _unused = handle.close(id).await;

            Ok(())
        });
    }

    fn classify(&self, request: Request<'_>) -> Kind {
        self.kind
            .unwrap_or_else(|| Kind::classify(request, self.pty.is_some(), &self.envs))
    }

    // Start the requested program on the backend twin and hand both ends to
    // the pumps.
    async fn start_program(
        &mut self,
        session: &mut server::Session,
        id: ChannelId,
        kind: Kind,
        program: Program<'_>,
    ) -> Result<()> {
        if kind == Kind::Unknown {
            self.reject_unsupported(session, id);

            return Ok(());
        }

        // Either the channel never opened, or a program already runs on it
        // (a second `shell` on a channel is refused).
        if !matches!(self.channels.get(&id), Some(Gate::Pending { .. })) {
            session.channel_failure(id);

            return Ok(());
        }

        let Some(Gate::Pending { client, mut backend }) = self.channels.remove(&id) else {
            unreachable!("checked above");
        };

        if self.kind.is_none() {
            self.kind = Some(kind);
            SESSION_KINDS.with_label_values(&[kind.as_ref()]).inc();
        }

        let handle = session.handle();

        if kind.interactive() && self.gateway.settings.allow_agent_forwarding {
            let _unused = backend.agent_forward(false).await;
        }

        // A namespace with an announcement gets it written, under a welcome
        // line, before any session data.
        if kind.interactive() && !self.announced {
            self.announced = true;

            if let Some(announcement) = &self.announcement {
                let mut banner = match self.state.target() {
                    Some(target) => format!("Connected to {target}\r\n"),
                    None => String::new(),
                };

                banner.push_str(&announcement.replace('\n', "\r\n"));
                if !banner.ends_with("\r\n") {
                    banner.push_str("\r\n");
                }

                let _unused = handle
                    .data(id, CryptoVec::from_slice(banner.as_bytes()))
                    .await;
            }
        }

        let accepted = match &program {
            Program::Shell => {
                backend.request_shell(true).await?;
                await_reply(&mut backend).await?
            }
            Program::Exec(command) => {
                backend.exec(true, *command).await?;
                await_reply(&mut backend).await?
            }
            Program::Subsystem(name) => {
                backend.request_subsystem(true, *name).await?;
                await_reply(&mut backend).await?
            }
        };

        if !accepted {
            self.channels.insert(id, Gate::Pending { client, backend });
            session.channel_failure(id);

            return Ok(());
        }

        session.channel_success(id);

        let close_on_eof = kind.watches_stdin_eof()
            && self
                .state
                .device()
                .and_then(api::Device::version)
                .is_some_and(|version| version < CLOSES_OWN_CHANNELS);

        let tap = self.tap(kind);
        let upstream = self.spawn_pipes(id, client, backend, handle, close_on_eof, tap);
        self.channels.insert(id, Gate::Active { upstream });

        Ok(())
    }

    // Interactive output is mirrored to the recording endpoint on paid
    // tiers; everything else is never recorded.
    fn tap(&self, kind: Kind) -> Option<Tap> {
        if !kind.interactive() {
            return None;
        }

        let settings = &self.gateway.settings;
        if !(settings.cloud || settings.enterprise) {
            return None;
        }

        let recorder = self.gateway.recorder.clone()?;
        let namespace = self.state.device().map(|device| device.namespace.clone())?;

        Some(Tap::new(
            recorder,
            self.id,
            namespace,
            self.geometry.clone(),
        ))
    }

    fn spawn_pipes(
        &mut self,
        id: ChannelId,
        client: russh::Channel<server::Msg>,
        backend: russh::Channel<client::Msg>,
        handle: server::Handle,
        close_on_eof: bool,
        tap: Option<Tap>,
    ) -> mpsc::UnboundedSender<Upstream> {
        let (upstream_tx, upstream) = mpsc::unbounded_channel();

        let (mut client_read, client_write) = tokio::io::split(client.into_stream());

        let reader_tx = upstream_tx.clone();
        self.tasks.spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];

            loop {
                match client_read.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _unused = reader_tx.send(Upstream::Eof);

                        break;
                    }
                    Ok(n) => {
                        if reader_tx.send(Upstream::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }

            Ok(())
        });

        self.tasks.spawn(pump(
            backend,
            upstream,
            handle,
            id,
            client_write,
            close_on_eof,
            tap,
            self.heartbeats.subscribe(),
        ));

        upstream_tx
    }
}

// Wait out the reply to a channel request we just sent. Nothing
// user-visible arrives on the channel before the reply.
async fn await_reply(backend: &mut russh::Channel<client::Msg>) -> Result<bool> {
    loop {
        match backend.wait().await {
            Some(ChannelMsg::Success) => return Ok(true),
            Some(ChannelMsg::Failure) => return Ok(false),
            Some(_) => continue,
            None => return Err(eyre!("device channel closed during a request")),
        }
    }
}

// A device heartbeat, once the sender side is gone, never again.
async fn next_beat(beats: &mut broadcast::Receiver<()>) {
    loop {
        match beats.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        }
    }
}

// The per-channel pump: device messages go down to the client, relayed
// control messages go up to the device. First EOF starts the teardown; the
// owner drains, relays the exit status, then closes.
#[allow(clippy::too_many_arguments)]
async fn pump(
    mut backend: russh::Channel<client::Msg>,
    mut upstream: mpsc::UnboundedReceiver<Upstream>,
    handle: server::Handle,
    id: ChannelId,
    mut client: impl tokio::io::AsyncWrite + Unpin + Send,
    close_on_eof: bool,
    mut tap: Option<Tap>,
    mut beats: broadcast::Receiver<()>,
) -> Result<()> {
    let mut exit_status = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let grace = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            msg = backend.wait() => match msg {
                None | Some(ChannelMsg::Close) => break,
                Some(ChannelMsg::Data { data }) => {
                    if let Some(tap) = tap.as_mut() {
                        tap.push(&data);
                    }

                    if client.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    let _unused = handle
                        .extended_data(id, ext, CryptoVec::from_slice(&data))
                        .await;
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    exit_status = Some(code);
                }
                Some(ChannelMsg::Eof) => {
                    let _unused = client.shutdown().await;
                }
                Some(_) => {}
            },

            relayed = upstream.recv() => match relayed {
                // The handler is gone: the client connection ended.
                None => {
                    let _unused = backend.close().await;

                    break;
                }
                Some(Upstream::Data(data)) => {
                    if backend.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(Upstream::Eof) => {
                    let _unused = backend.eof().await;

                    // Old agents never close exec channels themselves;
                    // give the tail output a moment, then close for them.
                    if close_on_eof && deadline.is_none() {
                        deadline = Some(Instant::now() + CLOSE_GRACE);
                    }
                }
                Some(Upstream::WindowChange { cols, rows, pix_width, pix_height }) => {
                    let _unused = backend.window_change(cols, rows, pix_width, pix_height).await;
                }
                Some(Upstream::Signal(signal)) => {
                    let _unused = backend.signal(signal).await;
                }
                Some(Upstream::Close) => {
                    let _unused = backend.close().await;

                    break;
                }
            },

            // The device heartbeat, relayed to the client as an empty data
            // message on the channel.
            () = next_beat(&mut beats) => {
                let _unused = handle.data(id, CryptoVec::new()).await;
            }

            () = grace => {
                let _unused = backend.close().await;

                break;
            }
        }
    }

    let _unused = handle
        .exit_status_request(id, exit_status.unwrap_or(0))
        .await;
    let _unused = client.shutdown().await;
    let _unused = handle.close(id).await;

    Ok(())
}

// Device-opened `auth-agent@openssh.com` channels, bridged back to the
// client under a per-session cap.
async fn bridge_agent_channels(
    mut incoming: mpsc::UnboundedReceiver<russh::Channel<client::Msg>>,
    handle: server::Handle,
) -> Result<()> {
    let permits = Arc::new(Semaphore::new(AGENT_CHANNEL_LIMIT));
    let mut bridges: JoinSet<()> = JoinSet::new();

    while let Some(device_channel) = incoming.recv().await {
        CHANNELS.agent_forward.inc();

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("agent channel cap reached, refusing");

            continue;
        };

        let client_channel = match handle.channel_open_agent().await {
            Ok(channel) => channel,
            Err(error) => {
                debug!(?error, "client refused the agent channel");

                continue;
            }
        };

        bridges.spawn(async move {
            let _permit = permit;

            let mut device_side = device_channel.into_stream();
            let mut client_side = client_channel.into_stream();

            let _unused =
                tokio::io::copy_bidirectional(&mut device_side, &mut client_side).await;
        });
    }

    while bridges.join_next().await.is_some() {}

    Ok(())
}

#[async_trait::async_trait]
impl server::Handler for Session {
    type Error = eyre::Error;

    #[tracing::instrument(skip(self, password), fields(session = %self.id))]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        AUTH_ATTEMPTS.password.inc();

        // The password is never checked here; the device's own SSH daemon is
        // the authority. Resolution failures still fail closed.
        match self.resolve(user).await {
            Ok((target, device)) => {
                AUTH_RESULTS.password.accept.inc();

                self.state
                    .authenticated(target, device, Credential::Password(password.to_string()));

                Ok(Auth::Accept)
            }
            Err(error) => {
                AUTH_RESULTS.password.reject.inc();
                debug!(?error, "could not resolve the target");

                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    #[tracing::instrument(skip(self, key), fields(session = %self.id))]
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        AUTH_ATTEMPTS.publickey.inc();

        let reject = Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        });

        let Ok((target, device)) = self.resolve(user).await else {
            AUTH_RESULTS.publickey.reject.inc();

            return reject;
        };

        let fingerprint = keys::fingerprint(key);

        // The gateway's own key: the internal-substitution path. No record
        // lookup happens for it.
        if fingerprint == self.gateway.magic_fingerprint
            || self.validated.as_deref() == Some(fingerprint.as_str())
        {
            AUTH_RESULTS.publickey.accept.inc();

            self.state
                .authenticated(target, device, Credential::PublicKey);

            return Ok(Auth::Accept);
        }

        if !self.gateway.settings.allow_public_key_below_0_6_0
            && device
                .version()
                .is_some_and(|version| version < SPEAKS_PUBLIC_KEY)
        {
            AUTH_RESULTS.publickey.reject.inc();
            debug!(device = device.uid, "agent is too old for public keys");

            return reject;
        }

        let record = match self
            .gateway
            .api
            .public_key(&fingerprint, &device.tenant_id)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                AUTH_RESULTS.publickey.reject.inc();
                debug!(fingerprint, "unregistered public key");

                return reject;
            }
            Err(error) => {
                AUTH_RESULTS.publickey.reject.inc();
                warn!(?error, "public key lookup failed");

                return reject;
            }
        };

        match self
            .gateway
            .api
            .evaluate_key(&record.fingerprint, &device, target.username())
            .await
        {
            Ok(true) => {
                AUTH_RESULTS.publickey.accept.inc();

                self.validated = Some(fingerprint);
                self.state
                    .authenticated(target, device, Credential::PublicKey);

                Ok(Auth::Accept)
            }
            Ok(false) => {
                AUTH_RESULTS.publickey.reject.inc();

                reject
            }
            Err(error) => {
                AUTH_RESULTS.publickey.reject.inc();
                warn!(?error, "public key evaluation failed");

                reject
            }
        }
    }

    #[tracing::instrument(skip(self, _session), fields(session = %self.id))]
    async fn auth_succeeded(&mut self, _session: &mut server::Session) -> Result<()> {
        let State::Authenticated { credential, .. } = &self.state else {
            UNEXPECTED_STATE
                .with_label_values(&["Authenticated", self.state.as_ref()])
                .inc();

            return Err(eyre!("unexpected state: {:?}", self.state.as_ref()));
        };

        debug!(method = credential.method(), "authenticated");

        Ok(())
    }

    #[tracing::instrument(skip(self, channel, session), fields(session = %self.id))]
    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<server::Msg>,
        session: &mut server::Session,
    ) -> Result<bool> {
        CHANNELS.open_session.inc();

        let handle = session.handle();
        let id = channel.id();

        if let Err(rejection) = self.connect_backend(&handle).await {
            self.reject_session(&handle, id, rejection);

            return Ok(true);
        }

        let backend = self
            .state
            .backend()
            .ok_or_else(|| eyre!("backend missing after connect"))?
            .channel_open_session()
            .await?;

        self.channels.insert(
            id,
            Gate::Pending {
                client: channel,
                backend,
            },
        );

        Ok(true)
    }

    #[tracing::instrument(skip(self, channel, session), fields(session = %self.id))]
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: russh::Channel<server::Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut server::Session,
    ) -> Result<bool> {
        CHANNELS.direct_tcpip.inc();
        debug!(host = host_to_connect, port = port_to_connect, "local forward");

        let handle = session.handle();

        if let Err(rejection) = self.connect_backend(&handle).await {
            REJECTIONS.with_label_values(&[rejection.reason]).inc();

            return Ok(false);
        }

        let backend = self
            .state
            .backend()
            .ok_or_else(|| eyre!("backend missing after connect"))?
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await?;

        self.channels.insert(channel.id(), Gate::Piped);
        self.tasks.spawn(async move {
            let mut client_side = channel.into_stream();
            let mut device_side = backend.into_stream();

            let _unused =
                tokio::io::copy_bidirectional(&mut client_side, &mut device_side).await;

            Ok(())
        });

        Ok(true)
    }

    #[tracing::instrument(skip(self, data, _session))]
    async fn data(
        &mut self,
        _: ChannelId,
        data: &[u8],
        _session: &mut server::Session,
    ) -> Result<()> {
        // Bytes flow through the channel streams; this only counts them.
        TOTAL_BYTES.inc_by(data.len() as u64);

        Ok(())
    }

    #[tracing::instrument(skip(self, _session), fields(session = %self.id))]
    async fn env_request(
        &mut self,
        id: ChannelId,
        name: &str,
        value: &str,
        _session: &mut server::Session,
    ) -> Result<()> {
        REQUESTS.env.inc();

        self.envs.insert(name.to_string(), value.to_string());

        if let Some(Gate::Pending { backend, .. }) = self.channels.get_mut(&id) {
            let _unused = backend.set_env(false, name, value).await;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, modes, session), fields(session = %self.id))]
    async fn pty_request(
        &mut self,
        id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut server::Session,
    ) -> Result<()> {
        REQUESTS.pty.inc();

        self.pty = Some(term.to_string());
        *self.geometry.lock().expect("geometry lock") = (col_width, row_height);

        match self.channels.get_mut(&id) {
            Some(Gate::Pending { backend, .. }) => {
                backend
                    .request_pty(true, term, col_width, row_height, pix_width, pix_height, modes)
                    .await?;

                if await_reply(backend).await? {
                    session.channel_success(id);
                } else {
                    session.channel_failure(id);
                }
            }
            _ => session.channel_failure(id),
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(session = %self.id))]
    async fn window_change_request(
        &mut self,
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut server::Session,
    ) -> Result<()> {
        REQUESTS.window_resize.inc();

        *self.geometry.lock().expect("geometry lock") = (col_width, row_height);

        match self.channels.get_mut(&id) {
            Some(Gate::Active { upstream }) => {
                let _unused = upstream.send(Upstream::WindowChange {
                    cols: col_width,
                    rows: row_height,
                    pix_width,
                    pix_height,
                });
            }
            Some(Gate::Pending { backend, .. }) => {
                let _unused = backend
                    .window_change(col_width, row_height, pix_width, pix_height)
                    .await;
            }
            _ => {}
        }

        session.channel_success(id);

        Ok(())
    }

    #[tracing::instrument(skip(self, session), fields(session = %self.id))]
    async fn shell_request(&mut self, id: ChannelId, session: &mut server::Session) -> Result<()> {
        REQUESTS.shell.inc();

        let kind = self.classify(Request::Shell);

        self.start_program(session, id, kind, Program::Shell).await
    }

    #[tracing::instrument(skip(self, data, session), fields(session = %self.id))]
    async fn exec_request(
        &mut self,
        id: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<()> {
        REQUESTS.exec.inc();

        let command = String::from_utf8_lossy(data).to_string();
        let kind = self.classify(Request::Exec(&command));

        self.start_program(session, id, kind, Program::Exec(&command))
            .await
    }

    #[tracing::instrument(skip(self, session), fields(session = %self.id))]
    async fn subsystem_request(
        &mut self,
        id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<()> {
        if name == "sftp" {
            REQUESTS.sftp.inc();
        }

        let kind = self.classify(Request::Subsystem(name));

        self.start_program(session, id, kind, Program::Subsystem(name))
            .await
    }

    #[tracing::instrument(skip(self, _session), fields(session = %self.id))]
    async fn signal(
        &mut self,
        id: ChannelId,
        signal: Sig,
        _session: &mut server::Session,
    ) -> Result<()> {
        match self.channels.get_mut(&id) {
            Some(Gate::Active { upstream }) => {
                let _unused = upstream.send(Upstream::Signal(signal));
            }
            Some(Gate::Pending { backend, .. }) => {
                let _unused = backend.signal(signal).await;
            }
            _ => {}
        }

        Ok(())
    }

    // Reverse port forwarding stays closed; the reverse tunnel belongs to
    // the gateway.
    #[tracing::instrument(skip(self, _session))]
    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut server::Session,
    ) -> Result<bool> {
        debug!("reverse port forwarding denied");

        Ok(false)
    }

    #[tracing::instrument(skip(self, _session), fields(session = %self.id))]
    async fn channel_eof(&mut self, id: ChannelId, _session: &mut server::Session) -> Result<()> {
        CHANNELS.eof.inc();

        // The channel stream delivers the EOF to the reader pump; nothing to
        // do at the request layer.
        Ok(())
    }

    #[tracing::instrument(skip(self, _session), fields(session = %self.id))]
    async fn channel_close(&mut self, id: ChannelId, _session: &mut server::Session) -> Result<()> {
        CHANNELS.close.inc();

        if let Some(Gate::Active { upstream }) = self.channels.remove(&id) {
            let _unused = upstream.send(Upstream::Close);
        }

        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.dec();

        SESSION_DURATION.observe(
            (Utc::now() - self.start)
                .to_std()
                .expect("duration in range")
                .as_secs_f64()
                / 60.0,
        );

        self.tasks.abort_all();

        // Finish runs exactly once, after the whole client connection went
        // away; concurrent channels on the connection share the backend, so
        // finishing any earlier would abort their peers.
        if let Some(finisher) = self.finisher.take() {
            tokio::spawn(finisher.finish());
        }
    }
}
