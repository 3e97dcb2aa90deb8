use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter_vec, IntCounterVec};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

// Frames at most this large; carried bytes above it are flushed lossily
// rather than grow without bound.
const FRAME_LIMIT: usize = 32 * 1024;

// Frames queued towards the recording endpoint. When the endpoint is slower
// than the session, frames are dropped, never the session's bytes.
const QUEUE_LIMIT: usize = 256;

lazy_static! {
    static ref FRAMES: IntCounterVec = register_int_counter_vec!(
        opts!("recorded_frames_total", "Recorded frames by result"),
        &["result"]
    )
    .unwrap();
}

#[derive(Serialize)]
struct Frame {
    session_id: Uuid,
    namespace: String,
    message: String,
    width: u32,
    height: u32,
}

/// Client for the external session-recording endpoint.
#[derive(Clone, Debug)]
pub struct Recorder {
    url: String,
    http: reqwest::Client,
}

impl Recorder {
    pub fn new(url: String) -> Self {
        Self {
            url: format!("{}/internal/record", url.trim_end_matches('/')),
            http: reqwest::Client::new(),
        }
    }

    async fn record(&self, frame: &Frame) -> eyre::Result<()> {
        self.http
            .post(&self.url)
            .json(frame)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Mirror of the agent→client stdout pipe. `push` never waits on the
/// network: frames go into a bounded queue drained by a background task,
/// and anything that cannot be queued or posted is dropped with a warning.
pub struct Tap {
    tx: mpsc::Sender<String>,
    session_id: Uuid,
    carry: Vec<u8>,
}

impl Tap {
    pub fn new(
        recorder: Recorder,
        session_id: Uuid,
        namespace: String,
        geometry: Arc<Mutex<(u32, u32)>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_LIMIT);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let (width, height) = *geometry.lock().expect("geometry lock");

                let frame = Frame {
                    session_id,
                    namespace: namespace.clone(),
                    message,
                    width,
                    height,
                };

                match recorder.record(&frame).await {
                    Ok(()) => FRAMES.with_label_values(&["ok"]).inc(),
                    Err(error) => {
                        FRAMES.with_label_values(&["error"]).inc();
                        warn!(?error, session = %session_id, "failed to record a frame");
                    }
                }
            }
        });

        Self {
            tx,
            session_id,
            carry: Vec::new(),
        }
    }

    /// Queue bytes for recording, holding back a trailing partial UTF-8
    /// sequence so multi-byte characters are never split across frames.
    pub fn push(&mut self, bytes: &[u8]) {
        self.carry.extend_from_slice(bytes);

        let message = match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = text.to_string();
                self.carry.clear();

                text
            }
            Err(error) => {
                let valid = error.valid_up_to();

                // More than three trailing bytes cannot be an incomplete
                // sequence; the stream is not UTF-8, so stop pretending.
                if self.carry.len() - valid > 3 || self.carry.len() > FRAME_LIMIT {
                    let text = String::from_utf8_lossy(&self.carry).into_owned();
                    self.carry.clear();

                    text
                } else {
                    let text = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                    self.carry.drain(..valid);

                    text
                }
            }
        };

        if message.is_empty() {
            return;
        }

        if self.tx.try_send(message).is_err() {
            FRAMES.with_label_values(&["dropped"]).inc();
            warn!(session = %self.session_id, "recording fell behind, dropping a frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap() -> (Tap, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(QUEUE_LIMIT);

        (
            Tap {
                tx,
                session_id: Uuid::new_v4(),
                carry: Vec::new(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn plain_text_passes_through() {
        let (mut tap, mut rx) = tap();

        tap.push(b"a\nb\n\n");

        assert_eq!(rx.recv().await.unwrap(), "a\nb\n\n");
    }

    #[tokio::test]
    async fn split_runes_wait_for_their_tail() {
        let (mut tap, mut rx) = tap();

        // "héllo" with the é split across two pushes.
        let bytes = "héllo".as_bytes();
        tap.push(&bytes[..2]);
        tap.push(&bytes[2..]);

        assert_eq!(rx.recv().await.unwrap(), "h");
        assert_eq!(rx.recv().await.unwrap(), "éllo");
    }

    #[tokio::test]
    async fn binary_garbage_is_flushed_lossily() {
        let (mut tap, mut rx) = tap();

        tap.push(&[b'o', b'k', 0xff, 0xff, 0xff, 0xff, b'!']);

        let message = rx.recv().await.unwrap();
        assert!(message.starts_with("ok"));
        assert!(message.ends_with('!'));
    }

    #[tokio::test]
    async fn a_full_queue_drops_frames_without_blocking() {
        let (mut tap, _rx) = tap();

        for _ in 0..=QUEUE_LIMIT {
            tap.push(b"frame");
        }
        // No await between pushes: reaching here at all is the assertion.
    }
}
