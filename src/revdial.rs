pub mod proto;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;
use tokio::{
    sync::{watch, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use warp::{ws::Message, Filter};

use crate::api;
use proto::{Frame, Mux, OpenError, Signal};

make_static_metric! {
    pub struct DialVec: IntCounter {
        "result" => {
            ok,
            not_registered,
            timeout,
        }
    }
    pub struct EvictionVec: IntCounter {
        "reason" => {
            superseded,
            heartbeat,
            closed,
        }
    }
}

lazy_static! {
    static ref DEVICES_ONLINE: IntGauge =
        register_int_gauge!("devices_online", "Number of registered reverse tunnels").unwrap();
    static ref REGISTRATIONS: IntCounter = register_int_counter!(
        "tunnel_registrations_total",
        "Total number of tunnel registrations"
    )
    .unwrap();
    static ref DIALS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!("tunnel_dials_total", "Reverse dials by result"),
        &["result"]
    )
    .unwrap();
    static ref DIALS: DialVec = DialVec::from(&DIALS_VEC);
    static ref EVICTIONS_VEC: IntCounterVec = register_int_counter_vec!(
        opts!("tunnel_evictions_total", "Tunnel evictions by reason"),
        &["reason"]
    )
    .unwrap();
    static ref EVICTIONS: EvictionVec = EvictionVec::from(&EVICTIONS_VEC);
}

#[derive(Clone, Debug)]
pub struct Params {
    pub device_uid: String,
    pub tenant_id: String,
}

#[derive(Debug)]
pub enum DialError {
    NotRegistered,
    Timeout,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::NotRegistered => write!(f, "device is not connected"),
            DialError::Timeout => write!(f, "timed out waiting for the device"),
        }
    }
}

impl std::error::Error for DialError {}

struct Entry {
    mux: Mux,
    heartbeat: watch::Sender<DateTime<Utc>>,
    cancel: CancellationToken,
    generation: u64,
}

/// In-memory map of device uid to its live reverse-dial connection. At most
/// one entry exists per device; a device reconnecting supersedes (and
/// cancels) its prior registration.
#[derive(Clone)]
pub struct Registry {
    devices: Arc<Mutex<HashMap<String, Entry>>>,
    api: api::Client,
    dial_timeout: Duration,
    heartbeat_interval: Duration,
    generation: Arc<AtomicU64>,
}

impl Registry {
    pub fn new(api: api::Client, dial_timeout: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            devices: Arc::default(),
            api,
            dial_timeout,
            heartbeat_interval,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    // Two missed heartbeats evict.
    fn silence_limit(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    #[tracing::instrument(skip(self, mux, cancel))]
    pub async fn register(&self, params: &Params, mux: Mux, cancel: CancellationToken) -> u64 {
        REGISTRATIONS.inc();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (heartbeat, _) = watch::channel(Utc::now());

        let prior = {
            let mut devices = self.devices.lock().await;

            devices.insert(
                params.device_uid.clone(),
                Entry {
                    mux,
                    heartbeat,
                    cancel,
                    generation,
                },
            )
        };

        if let Some(prior) = prior {
            EVICTIONS.superseded.inc();
            debug!("superseding a prior registration");

            prior.cancel.cancel();
            prior.mux.shutdown().await;
        } else {
            DEVICES_ONLINE.inc();
        }

        if let Err(error) = self.api.device_connected(&params.device_uid).await {
            warn!(?error, "failed to report device connect");
        }

        generation
    }

    /// Remove a registration on connection teardown. The generation guards
    /// against a stale connection's cleanup removing the registration that
    /// superseded it.
    #[tracing::instrument(skip(self))]
    pub async fn unregister(&self, device_uid: &str, generation: u64) {
        let removed = {
            let mut devices = self.devices.lock().await;

            match devices.get(device_uid) {
                Some(entry) if entry.generation == generation => devices.remove(device_uid),
                _ => None,
            }
        };

        let Some(entry) = removed else { return };

        DEVICES_ONLINE.dec();

        entry.cancel.cancel();
        entry.mux.shutdown().await;

        if let Err(error) = self.api.device_disconnected(device_uid).await {
            warn!(?error, "failed to report device disconnect");
        }
    }

    /// Open a logical stream to the device, writing `header` as the opener.
    pub async fn dial(&self, device_uid: &str, header: &str) -> Result<proto::Stream, DialError> {
        let mux = {
            let devices = self.devices.lock().await;

            devices.get(device_uid).map(|entry| entry.mux.clone())
        };

        let Some(mux) = mux else {
            DIALS.not_registered.inc();

            return Err(DialError::NotRegistered);
        };

        match mux.open(header, self.dial_timeout).await {
            Ok(stream) => {
                DIALS.ok.inc();
                debug!(device = device_uid, stream = stream.id(), "dialed");

                Ok(stream)
            }
            Err(OpenError::Timeout) => {
                DIALS.timeout.inc();

                Err(DialError::Timeout)
            }
            // The control connection died under us; registration cleanup is
            // already under way.
            Err(OpenError::Closed) => {
                DIALS.not_registered.inc();

                Err(DialError::NotRegistered)
            }
        }
    }

    /// Tell the device a session is over. This is the in-tunnel signal; the
    /// session `finish` API call is a separate concern and stays one.
    pub async fn close_session(&self, device_uid: &str, session: Uuid) -> Result<(), DialError> {
        let stream = self
            .dial(device_uid, &format!("DELETE /ssh/close/{session}"))
            .await?;

        drop(stream);

        Ok(())
    }

    /// Refresh the device's liveness and wake its keepalive observers.
    pub async fn keepalive(&self, device_uid: &str) -> bool {
        let devices = self.devices.lock().await;

        let Some(entry) = devices.get(device_uid) else {
            return false;
        };

        entry.heartbeat.send_replace(Utc::now());

        true
    }

    pub async fn heartbeat(&self, device_uid: &str) -> Option<watch::Receiver<DateTime<Utc>>> {
        let devices = self.devices.lock().await;

        devices
            .get(device_uid)
            .map(|entry| entry.heartbeat.subscribe())
    }

    pub async fn connected(&self, device_uid: &str) -> bool {
        self.devices.lock().await.contains_key(device_uid)
    }

    pub async fn online(&self) -> usize {
        self.devices.lock().await.len()
    }
}

/// Drive one upgraded reverse-dial connection until it dies, is superseded,
/// or goes silent past the heartbeat budget.
#[tracing::instrument(
    skip(registry, socket),
    fields(device = %params.device_uid, tenant = %params.tenant_id)
)]
pub async fn serve(registry: Registry, params: Params, socket: warp::ws::WebSocket) {
    let (mux, mut outbound) = Mux::new();
    let cancel = CancellationToken::new();

    let generation = registry.register(&params, mux.clone(), cancel.clone()).await;

    let (mut sink, mut inbound) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let Ok(raw) = frame.encode() else { continue };

            if sink.send(Message::binary(raw)).await.is_err() {
                break;
            }
        }

        let _unused = sink.send(Message::close()).await;
    });

    let silence = registry.silence_limit();
    let mut evicted = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            next = tokio::time::timeout(silence, inbound.next()) => {
                let msg = match next {
                    Err(_) => {
                        EVICTIONS.heartbeat.inc();
                        evicted = true;
                        warn!("evicting a silent tunnel");

                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(error))) => {
                        debug!(?error, "control connection error");

                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };

                if msg.is_close() {
                    break;
                }

                if !msg.is_binary() {
                    continue;
                }

                let frame = match Frame::decode(msg.as_bytes()) {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!(?error, "undecodable control frame");

                        continue;
                    }
                };

                match mux.handle(frame).await {
                    Some(Signal::Ping) => {
                        mux.pong();
                        registry.keepalive(&params.device_uid).await;
                    }
                    // Devices never dial the gateway.
                    Some(Signal::Open { stream, .. }) => mux.reject(stream),
                    Some(Signal::Pong) | None => {}
                }
            }
        }
    }

    if !evicted && !cancel.is_cancelled() {
        EVICTIONS.closed.inc();
    }

    writer.abort();
    mux.shutdown().await;
    registry.unregister(&params.device_uid, generation).await;
}

/// The agent-facing HTTP surface: `GET /ssh/connection` (and the older
/// `/ssh/revdial` path) upgraded into a control connection.
pub fn routes(
    registry: Registry,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let registry = warp::any().map(move || registry.clone());

    warp::get()
        .and(warp::path("ssh"))
        .and(
            warp::path("connection")
                .or(warp::path("revdial"))
                .unify(),
        )
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::header::<String>("x-device-uid"))
        .and(warp::header::<String>("x-tenant-id"))
        .and(registry)
        .map(
            |ws: warp::ws::Ws, device_uid: String, tenant_id: String, registry: Registry| {
                ws.on_upgrade(move |socket| {
                    serve(
                        registry,
                        Params {
                            device_uid,
                            tenant_id,
                        },
                        socket,
                    )
                })
            },
        )
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn registry() -> Registry {
        Registry::new(
            api::Client::new("http://127.0.0.1:9".to_string()),
            Duration::from_millis(100),
            Duration::from_secs(30),
        )
    }

    // A mux whose peer end immediately acks stream opens, as a live agent
    // would.
    fn acking_mux() -> Mux {
        let (mux, mut outbound) = Mux::new();

        let peer = mux.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Frame::Open { stream, .. } = frame {
                    let _unused = peer.handle(Frame::OpenAck { stream }).await;
                }
            }
        });

        mux
    }

    fn params(uid: &str) -> Params {
        Params {
            device_uid: uid.to_string(),
            tenant_id: "t1".to_string(),
        }
    }

    #[tokio::test]
    async fn dial_without_a_registration_fails() {
        let registry = registry();

        assert!(matches!(
            registry.dial("nope", "GET /ssh/s1").await,
            Err(DialError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn a_second_registration_supersedes_the_first() {
        let registry = registry();

        let first_cancel = CancellationToken::new();
        let first = registry
            .register(&params("d1"), acking_mux(), first_cancel.clone())
            .await;

        let second = registry
            .register(&params("d1"), acking_mux(), CancellationToken::new())
            .await;

        assert!(first_cancel.is_cancelled());
        assert_eq!(registry.online().await, 1);

        // The first connection's teardown must not remove the second
        // registration.
        registry.unregister("d1", first).await;
        assert!(registry.connected("d1").await);

        registry.unregister("d1", second).await;
        assert!(!registry.connected("d1").await);
    }

    #[tokio::test]
    async fn dial_leaves_the_registration_in_place() {
        let registry = registry();

        registry
            .register(&params("d1"), acking_mux(), CancellationToken::new())
            .await;

        let stream = registry.dial("d1", "GET /ssh/s1").await.unwrap();
        drop(stream);

        assert!(registry.connected("d1").await);
    }

    #[tokio::test]
    async fn dial_times_out_when_the_device_never_acks(){
        let registry = registry();

        // No peer task: opens are never acknowledged.
        let (mux, _outbound) = Mux::new();
        registry
            .register(&params("d1"), mux, CancellationToken::new())
            .await;

        assert!(matches!(
            registry.dial("d1", "GET /ssh/s1").await,
            Err(DialError::Timeout)
        ));
        assert!(registry.connected("d1").await);
    }

    #[tokio::test]
    async fn keepalive_wakes_observers() {
        let registry = registry();

        registry
            .register(&params("d1"), acking_mux(), CancellationToken::new())
            .await;

        let mut heartbeat = registry.heartbeat("d1").await.unwrap();
        let before = *heartbeat.borrow_and_update();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            heartbeat.changed().await.unwrap();
            let _unused = tx.send(*heartbeat.borrow());
        });

        tokio::task::yield_now().await;
        assert!(registry.keepalive("d1").await);

        let after = rx.recv().await.unwrap();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn keepalive_for_an_unknown_device_reports_false() {
        let registry = registry();

        assert!(!registry.keepalive("ghost").await);
    }

    // A device-shaped peer: connects through the real upgrade endpoint,
    // answers stream opens, echoes bytes back.
    async fn fake_device(
        addr: std::net::SocketAddr,
        uid: &str,
    ) -> (Mux, tokio::task::JoinHandle<()>) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

        let mut request = format!("ws://{addr}/ssh/connection")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("X-Device-UID", uid.parse().unwrap());
        request
            .headers_mut()
            .insert("X-Tenant-ID", "t1".parse().unwrap());

        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let (mux, mut outbound) = Mux::new();
        let (mut sink, mut inbound) = socket.split();

        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let raw = frame.encode().unwrap();

                if sink.send(Message::Binary(raw.into())).await.is_err() {
                    break;
                }
            }
        });

        let peer = mux.clone();
        let driver = tokio::spawn(async move {
            while let Some(Ok(message)) = inbound.next().await {
                if !message.is_binary() {
                    continue;
                }

                let frame = Frame::decode(&message.into_data()).unwrap();

                if let Some(Signal::Open { stream, .. }) = peer.handle(frame).await {
                    let mut accepted = peer.accept(stream).await.unwrap();

                    tokio::spawn(async move {
                        use tokio::io::{AsyncReadExt, AsyncWriteExt};

                        let mut buf = [0u8; 1024];
                        while let Ok(n) = accepted.read(&mut buf).await {
                            if n == 0 || accepted.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        });

        (mux, driver)
    }

    #[tokio::test]
    async fn registration_ping_and_dial_over_the_upgrade_endpoint() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = Registry::new(
            api::Client::new("http://127.0.0.1:9".to_string()),
            Duration::from_millis(500),
            Duration::from_secs(30),
        );

        let (addr, server) =
            warp::serve(routes(registry.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let (mux, _driver) = fake_device(addr, "d1").await;

        while !registry.connected("d1").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A ping refreshes liveness observers.
        let mut heartbeat = registry.heartbeat("d1").await.unwrap();
        heartbeat.borrow_and_update();
        assert!(mux.ping());
        tokio::time::timeout(Duration::from_secs(1), heartbeat.changed())
            .await
            .expect("a heartbeat follows a ping")
            .unwrap();

        // Dial, pipe, close: the registration stays.
        let mut stream = registry.dial("d1", "GET /ssh/s1").await.unwrap();
        stream.write_all(b"echo me").await.unwrap();

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");

        drop(stream);
        assert!(registry.connected("d1").await);
    }

    #[tokio::test]
    async fn silent_devices_are_evicted() {
        let registry = Registry::new(
            api::Client::new("http://127.0.0.1:9".to_string()),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        let (addr, server) =
            warp::serve(routes(registry.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let (_mux, _driver) = fake_device(addr, "d1").await;

        while !registry.connected("d1").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // No pings: two silent windows and the registration is gone.
        let mut waited = Duration::default();
        while registry.connected("d1").await {
            tokio::time::sleep(Duration::from_millis(50)).await;

            waited += Duration::from_millis(50);
            assert!(waited < Duration::from_secs(5), "device was never evicted");
        }
    }
}
