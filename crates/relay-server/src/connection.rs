//! Message-framed, bidirectional transport abstraction.
//!
//! Handlers only ever see a [`Connection`], split into a read half and a
//! write half so that one task can block on reads while another writes. The
//! axum implementation lives in [`crate::transport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{Frame, RelayError, Result};

/// Set by a read half whenever the peer shows signs of life (a pong or any
/// frame), cleared by the heartbeat check that consumes it.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    /// A fresh flag, starting out alive.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Record that the peer was heard from.
    pub fn mark_alive(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the peer was heard from since the previous call. Resets the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next application frame.
    ///
    /// `None` is an orderly remote close. Control frames are consumed by the
    /// transport and never surface here, but pongs still mark [`Liveness`].
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// The flag this reader marks on every pong or frame from the peer.
    fn liveness(&self) -> Liveness;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one application frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Transport-level ping. The peer's pong marks the reader's [`Liveness`].
    async fn ping(&mut self) -> Result<()>;

    /// Send a protocol close frame and shut the sink.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// A message-framed, bidirectional connection that can be split in two.
pub trait Connection: Send + 'static {
    /// Read half.
    type Reader: FrameSource + 'static;
    /// Write half.
    type Writer: FrameSink + 'static;

    /// Separate the read and write halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Ping `sink`, failing with [`RelayError::WriteTimeout`] after `limit`.
pub async fn ping_within<W: FrameSink + ?Sized>(sink: &mut W, limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, sink.ping())
        .await
        .unwrap_or(Err(RelayError::WriteTimeout(limit)))
}

/// Close `sink`, giving the peer at most `grace` to take the close frame.
pub async fn close_within<W: FrameSink + ?Sized>(
    sink: &mut W,
    code: u16,
    reason: &str,
    grace: Duration,
) -> Result<()> {
    match tokio::time::timeout(grace, sink.close(code, reason)).await {
        Ok(res) => res,
        Err(_) => Err(RelayError::WriteTimeout(grace)),
    }
}

/// In-process connection pair for handler tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    /// What the server side wrote, as observed by the peer.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        Frame(Frame),
        Ping,
        Close(u16, String),
    }

    pub struct MemoryConnection {
        reader: MemoryReader,
        writer: MemoryWriter,
    }

    pub struct MemoryReader {
        inbound: mpsc::UnboundedReceiver<Result<Frame>>,
        liveness: Liveness,
    }

    pub struct MemoryWriter {
        outbound: mpsc::UnboundedSender<Event>,
        stalled: Arc<AtomicBool>,
        silent: Arc<AtomicBool>,
        liveness: Liveness,
    }

    /// The remote end of a [`MemoryConnection`].
    ///
    /// Answers every ping with a pong, like a real WebSocket stack, until
    /// [`MemoryPeer::go_silent`] is called.
    pub struct MemoryPeer {
        tx: Option<mpsc::UnboundedSender<Result<Frame>>>,
        pub rx: mpsc::UnboundedReceiver<Event>,
        stalled: Arc<AtomicBool>,
        silent: Arc<AtomicBool>,
    }

    pub fn pair() -> (MemoryConnection, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stalled = Arc::new(AtomicBool::new(false));
        let silent = Arc::new(AtomicBool::new(false));
        let liveness = Liveness::new();
        let conn = MemoryConnection {
            reader: MemoryReader {
                inbound: in_rx,
                liveness: liveness.clone(),
            },
            writer: MemoryWriter {
                outbound: out_tx,
                stalled: Arc::clone(&stalled),
                silent: Arc::clone(&silent),
                liveness,
            },
        };
        let peer = MemoryPeer {
            tx: Some(in_tx),
            rx: out_rx,
            stalled,
            silent,
        };
        (conn, peer)
    }

    impl MemoryPeer {
        pub fn send(&self, frame: Frame) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Ok(frame));
            }
        }

        pub fn fail(&self, reason: &str) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Err(RelayError::Transport(reason.into())));
            }
        }

        /// Orderly close from the peer side.
        pub fn hang_up(&mut self) {
            self.tx = None;
        }

        /// Make every subsequent server write block forever.
        pub fn stall_writes(&self) {
            self.stalled.store(true, Ordering::SeqCst);
        }

        /// Stop answering pings, as a half-open transport would.
        pub fn go_silent(&self) {
            self.silent.store(true, Ordering::SeqCst);
        }

        /// Next non-ping event, or `None` once the server dropped its writer.
        pub async fn next_event(&mut self) -> Option<Event> {
            loop {
                match self.rx.recv().await? {
                    Event::Ping => continue,
                    other => return Some(other),
                }
            }
        }
    }

    impl Connection for MemoryConnection {
        type Reader = MemoryReader;
        type Writer = MemoryWriter;

        fn split(self) -> (MemoryReader, MemoryWriter) {
            (self.reader, self.writer)
        }
    }

    #[async_trait]
    impl FrameSource for MemoryReader {
        async fn recv(&mut self) -> Option<Result<Frame>> {
            let next = self.inbound.recv().await;
            if matches!(next, Some(Ok(_))) {
                self.liveness.mark_alive();
            }
            next
        }

        fn liveness(&self) -> Liveness {
            self.liveness.clone()
        }
    }

    impl MemoryWriter {
        async fn emit(&mut self, event: Event) -> Result<()> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.outbound
                .send(event)
                .map_err(|_| RelayError::Transport("peer gone".into()))
        }
    }

    #[async_trait]
    impl FrameSink for MemoryWriter {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.emit(Event::Frame(frame)).await
        }

        async fn ping(&mut self) -> Result<()> {
            self.emit(Event::Ping).await?;
            if !self.silent.load(Ordering::SeqCst) {
                self.liveness.mark_alive();
            }
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
            self.emit(Event::Close(code, reason.to_owned())).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{pair, Event};
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (conn, mut peer) = pair();
        let (mut reader, mut writer) = conn.split();

        peer.send(Frame::text("up"));
        assert_eq!(reader.recv().await.unwrap().unwrap(), Frame::text("up"));

        writer.send(Frame::binary(vec![1u8, 2])).await.unwrap();
        assert_eq!(
            peer.next_event().await,
            Some(Event::Frame(Frame::binary(vec![1u8, 2])))
        );
    }

    #[tokio::test]
    async fn hang_up_ends_reads() {
        let (conn, mut peer) = pair();
        let (mut reader, _writer) = conn.split();
        peer.hang_up();
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_within_reports_close_frame() {
        let (conn, mut peer) = pair();
        let (_reader, mut writer) = conn.split();
        close_within(&mut writer, 1001, "bye", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(peer.next_event().await, Some(Event::Close(1001, "bye".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn close_within_times_out_on_stalled_sink() {
        let (conn, peer) = pair();
        let (_reader, mut writer) = conn.split();
        peer.stall_writes();
        let err = close_within(&mut writer, 1000, "", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout(_)));
    }

    #[test]
    fn liveness_take_resets() {
        let flag = Liveness::new();
        assert!(flag.take());
        assert!(!flag.take());
        flag.clone().mark_alive();
        assert!(flag.take());
    }

    #[tokio::test]
    async fn answered_ping_marks_reader_alive() {
        let (conn, peer) = pair();
        let (reader, mut writer) = conn.split();
        let liveness = reader.liveness();
        assert!(liveness.take());

        ping_within(&mut writer, Duration::from_secs(1)).await.unwrap();
        assert!(liveness.take());

        peer.go_silent();
        ping_within(&mut writer, Duration::from_secs(1)).await.unwrap();
        assert!(!liveness.take());
    }

    #[tokio::test]
    async fn inbound_frames_mark_reader_alive() {
        let (conn, peer) = pair();
        let (mut reader, _writer) = conn.split();
        let liveness = reader.liveness();
        let _ = liveness.take();
        peer.send(Frame::text("hi"));
        let _ = reader.recv().await;
        assert!(liveness.take());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_within_times_out_on_stalled_sink() {
        let (conn, peer) = pair();
        let (_reader, mut writer) = conn.split();
        peer.stall_writes();
        let err = ping_within(&mut writer, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout(_)));
    }

    #[tokio::test]
    async fn writes_fail_once_peer_is_dropped() {
        let (conn, peer) = pair();
        let (_reader, mut writer) = conn.split();
        drop(peer);
        assert!(writer.send(Frame::text("x")).await.is_err());
    }
}
