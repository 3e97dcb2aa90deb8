use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot, Mutex},
    time::Duration,
};

// Upper bound for a single data frame. Anything larger is split across
// frames by the write path.
pub const MAX_PAYLOAD: usize = 32 * 1024;

/// Control messages carried on a device's reverse-dial connection. One
/// WebSocket binary message holds exactly one encoded frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    Open { stream: u32, header: String },
    OpenAck { stream: u32 },
    Data { stream: u32, payload: Vec<u8> },
    Close { stream: u32 },
    Ping,
    Pong,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// Frames the mux does not consume itself; the connection owner decides
/// what to do with them (answer pings, accept or reject stream opens).
#[derive(Debug)]
pub enum Signal {
    Ping,
    Pong,
    Open { stream: u32, header: String },
}

#[derive(Debug)]
pub enum OpenError {
    Timeout,
    Closed,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Timeout => write!(f, "stream open timed out"),
            OpenError::Closed => write!(f, "control connection closed"),
        }
    }
}

impl std::error::Error for OpenError {}

#[derive(Default)]
struct Shared {
    streams: HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>,
    pending: HashMap<u32, oneshot::Sender<Stream>>,
}

/// Stream multiplexer over a single reverse-dial connection. Both ends run
/// one: the gateway opens streams toward the device, the device accepts
/// them. Outbound frames are queued on an unbounded channel so concurrent
/// dialers on the same device never block each other; the connection task
/// drains the queue into the socket.
#[derive(Clone)]
pub struct Mux {
    outbound: mpsc::UnboundedSender<Frame>,
    shared: Arc<Mutex<Shared>>,
    next: Arc<AtomicU32>,
}

impl Mux {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();

        (
            Self {
                outbound,
                shared: Arc::default(),
                next: Arc::new(AtomicU32::new(0)),
            },
            rx,
        )
    }

    /// Open a logical stream, carrying `header` as the opener line. Resolves
    /// once the peer acknowledges; on timeout the half-open stream is torn
    /// down on both sides and the connection is left alone.
    pub async fn open(&self, header: &str, timeout: Duration) -> Result<Stream, OpenError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.lock().await.pending.insert(id, tx);

        if self
            .outbound
            .send(Frame::Open {
                stream: id,
                header: header.to_string(),
            })
            .is_err()
        {
            self.shared.lock().await.pending.remove(&id);

            return Err(OpenError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => Err(OpenError::Closed),
            Err(_) => {
                let mut shared = self.shared.lock().await;
                shared.pending.remove(&id);
                shared.streams.remove(&id);
                let _unused = self.outbound.send(Frame::Close { stream: id });

                Err(OpenError::Timeout)
            }
        }
    }

    /// Accept a peer-opened stream by id, completing the handshake.
    pub async fn accept(&self, id: u32) -> Result<Stream, OpenError> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.shared.lock().await.streams.insert(id, data_tx);

        if self.outbound.send(Frame::OpenAck { stream: id }).is_err() {
            self.shared.lock().await.streams.remove(&id);

            return Err(OpenError::Closed);
        }

        Ok(Stream::new(id, self.outbound.clone(), data_rx))
    }

    pub fn reject(&self, id: u32) {
        let _unused = self.outbound.send(Frame::Close { stream: id });
    }

    pub fn ping(&self) -> bool {
        self.outbound.send(Frame::Ping).is_ok()
    }

    pub fn pong(&self) -> bool {
        self.outbound.send(Frame::Pong).is_ok()
    }

    pub async fn streams(&self) -> usize {
        self.shared.lock().await.streams.len()
    }

    /// Route one inbound frame. Data/close/ack frames are consumed; anything
    /// the connection owner must act on comes back as a [`Signal`].
    pub async fn handle(&self, frame: Frame) -> Option<Signal> {
        match frame {
            Frame::Ping => Some(Signal::Ping),
            Frame::Pong => Some(Signal::Pong),
            Frame::Open { stream, header } => Some(Signal::Open { stream, header }),
            Frame::OpenAck { stream } => {
                let mut shared = self.shared.lock().await;

                let Some(waiter) = shared.pending.remove(&stream) else {
                    // Ack for a dial we already gave up on.
                    let _unused = self.outbound.send(Frame::Close { stream });

                    return None;
                };

                let (data_tx, data_rx) = mpsc::unbounded_channel();
                shared.streams.insert(stream, data_tx);

                if let Err(unclaimed) =
                    waiter.send(Stream::new(stream, self.outbound.clone(), data_rx))
                {
                    drop(unclaimed);
                    shared.streams.remove(&stream);
                    let _unused = self.outbound.send(Frame::Close { stream });
                }

                None
            }
            Frame::Data { stream, payload } => {
                let mut shared = self.shared.lock().await;

                let delivered = shared
                    .streams
                    .get(&stream)
                    .is_some_and(|tx| tx.send(payload).is_ok());

                if !delivered {
                    shared.streams.remove(&stream);
                    let _unused = self.outbound.send(Frame::Close { stream });
                }

                None
            }
            Frame::Close { stream } => {
                let mut shared = self.shared.lock().await;
                shared.streams.remove(&stream);
                shared.pending.remove(&stream);

                None
            }
        }
    }

    /// Tear down every stream and pending dial. Readers see EOF, dialers see
    /// `Closed`. Called when the control connection goes away.
    pub async fn shutdown(&self) {
        let mut shared = self.shared.lock().await;
        shared.streams.clear();
        shared.pending.clear();
    }
}

/// One logical byte pipe on a reverse-dial connection. Reads come from the
/// mux dispatcher, writes are chunked into data frames. Dropping the stream
/// tells the peer; the dispatcher lazily reaps the mux entry when the next
/// inbound frame finds the receiver gone.
pub struct Stream {
    id: u32,
    outbound: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    carry: Vec<u8>,
    closed: bool,
}

impl Stream {
    fn new(
        id: u32,
        outbound: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            outbound,
            rx,
            carry: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.carry.is_empty() {
            let n = buf.remaining().min(self.carry.len());
            buf.put_slice(&self.carry[..n]);
            self.carry.drain(..n);

            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk[..n]);
                self.carry.extend_from_slice(&chunk[n..]);

                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = buf.len().min(MAX_PAYLOAD);

        if self
            .outbound
            .send(Frame::Data {
                stream: self.id,
                payload: buf[..n].to_vec(),
            })
            .is_err()
        {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.closed {
            self.closed = true;
            let _unused = self.outbound.send(Frame::Close { stream: self.id });
        }

        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.closed {
            let _unused = self.outbound.send(Frame::Close { stream: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    // Wire two muxes back to back, as if each end held one side of the
    // control connection.
    fn link() -> (Mux, Mux, tokio::sync::mpsc::UnboundedReceiver<Signal>) {
        let (gateway, mut gw_out) = Mux::new();
        let (device, mut dev_out) = Mux::new();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let dev = device.clone();
        tokio::spawn(async move {
            while let Some(frame) = gw_out.recv().await {
                if let Some(signal) = dev.handle(frame).await {
                    let _unused = signal_tx.send(signal);
                }
            }
        });

        let gw = gateway.clone();
        tokio::spawn(async move {
            while let Some(frame) = dev_out.recv().await {
                let _unused = gw.handle(frame).await;
            }
        });

        (gateway, device, signal_rx)
    }

    async fn open_pair(
        gateway: &Mux,
        device: &Mux,
        signals: &mut mpsc::UnboundedReceiver<Signal>,
        header: &str,
    ) -> (Stream, Stream) {
        let dial = gateway.open(header, Duration::from_secs(1));

        let accept = async {
            let Some(Signal::Open { stream, header: got }) = signals.recv().await else {
                panic!("expected an open signal");
            };
            assert_eq!(got, header);

            device.accept(stream).await.unwrap()
        };

        let (dialed, accepted) = tokio::join!(dial, accept);

        (dialed.unwrap(), accepted)
    }

    #[tokio::test]
    async fn frames_survive_encoding() {
        let frame = Frame::Open {
            stream: 7,
            header: "GET /ssh/abc".to_string(),
        };

        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[tokio::test]
    async fn open_and_pipe_bytes() {
        let (gateway, device, mut signals) = link();

        let (mut dialed, mut accepted) =
            open_pair(&gateway, &device, &mut signals, "GET /ssh/s1").await;

        dialed.write_all(b"ls\n").await.unwrap();

        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        accepted.write_all(b"a\nb\n\n").await.unwrap();

        let mut buf = [0u8; 5];
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a\nb\n\n");
    }

    #[tokio::test]
    async fn closing_one_stream_leaves_siblings_alone() {
        let (gateway, device, mut signals) = link();

        let (first, _first_peer) = open_pair(&gateway, &device, &mut signals, "GET /ssh/s1").await;
        let (mut second, mut second_peer) =
            open_pair(&gateway, &device, &mut signals, "GET /ssh/s2").await;

        drop(first);

        second.write_all(b"still here").await.unwrap();

        let mut buf = [0u8; 10];
        second_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn dropped_stream_signals_eof_to_peer() {
        let (gateway, device, mut signals) = link();

        let (dialed, mut accepted) =
            open_pair(&gateway, &device, &mut signals, "GET /ssh/s1").await;

        drop(dialed);

        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn open_times_out_without_an_ack() {
        let (gateway, _outbound) = Mux::new();

        let result = gateway.open("GET /ssh/s1", Duration::from_millis(20)).await;

        assert!(matches!(result, Err(OpenError::Timeout)));
        assert_eq!(gateway.streams().await, 0);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_dials() {
        let (gateway, _outbound) = Mux::new();

        let dialer = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.open("GET /ssh/s1", Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        gateway.shutdown().await;

        assert!(matches!(dialer.await.unwrap(), Err(OpenError::Closed)));
    }

    #[tokio::test]
    async fn data_for_an_unknown_stream_is_answered_with_close() {
        let (mux, mut outbound) = Mux::new();

        let signal = mux
            .handle(Frame::Data {
                stream: 99,
                payload: b"stray".to_vec(),
            })
            .await;
        assert!(signal.is_none());

        assert_eq!(outbound.recv().await, Some(Frame::Close { stream: 99 }));
    }
}
