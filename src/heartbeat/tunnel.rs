//! Keepalive for long-lived upgraded connections
//!
//! Once a connection is upgraded the data plane only shuttles bytes, so there
//! are no requests left to count as activity. The tunnel pump recovers a
//! liveness signal from the byte stream itself: recent backend→client traffic
//! counts as a heartbeat, and an idle WebSocket is probed with a Ping frame
//! whose Pong reply counts as one.

use super::frame::{FrameScanner, PING_FRAME};
use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};
use uuid::Uuid;

/// Callback fired for every liveness signal observed on a tunnel
pub type BeatFn = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a tunnel in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Attached,
    Closed,
}

struct TunnelEntry {
    proxy_id: String,
    session_id: Option<String>,
    close: watch::Sender<bool>,
}

/// Every open tunnel on this node
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelEntry>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a tunnel and get the handle that drives its keepalive
    pub fn attach(
        self: &Arc<Self>,
        proxy_id: &str,
        session_id: Option<&str>,
        websocket: bool,
        interval: Duration,
        on_beat: BeatFn,
    ) -> TunnelHandle {
        let tunnel_id = Uuid::new_v4().to_string();
        let (close, closed) = watch::channel(false);
        self.tunnels.insert(
            tunnel_id.clone(),
            TunnelEntry {
                proxy_id: proxy_id.to_string(),
                session_id: session_id.map(str::to_string),
                close,
            },
        );
        debug!(proxy_id, tunnel_id, websocket, "Tunnel attached");

        TunnelHandle {
            tunnel_id,
            proxy_id: proxy_id.to_string(),
            websocket,
            interval,
            on_beat,
            closed,
            registry: Arc::clone(self),
        }
    }

    pub fn state(&self, tunnel_id: &str) -> TunnelState {
        if self.tunnels.contains_key(tunnel_id) {
            TunnelState::Attached
        } else {
            TunnelState::Closed
        }
    }

    /// Close one tunnel. Returns false if it was already closed.
    pub fn close(&self, tunnel_id: &str) -> bool {
        match self.tunnels.remove(tunnel_id) {
            Some((_, entry)) => {
                entry.close.send_replace(true);
                debug!(proxy_id = %entry.proxy_id, tunnel_id, "Tunnel closed");
                true
            }
            None => false,
        }
    }

    /// Close every tunnel of a proxy, returning how many were open
    pub fn close_proxy(&self, proxy_id: &str) -> usize {
        self.close_where(|entry| entry.proxy_id == proxy_id)
    }

    /// Close every tunnel opened by a session, returning how many were open
    pub fn close_session(&self, session_id: &str) -> usize {
        self.close_where(|entry| entry.session_id.as_deref() == Some(session_id))
    }

    fn close_where(&self, matches: impl Fn(&TunnelEntry) -> bool) -> usize {
        let mut closed = 0;
        self.tunnels.retain(|_, entry| {
            if matches(entry) {
                entry.close.send_replace(true);
                closed += 1;
                false
            } else {
                true
            }
        });
        closed
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Keepalive state of one tunnel. Dropping it deregisters the tunnel.
pub struct TunnelHandle {
    tunnel_id: String,
    proxy_id: String,
    websocket: bool,
    interval: Duration,
    on_beat: BeatFn,
    closed: watch::Receiver<bool>,
    registry: Arc<TunnelRegistry>,
}

impl TunnelHandle {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.registry.state(&self.tunnel_id) == TunnelState::Closed
    }

    /// One keepalive round: recent writes stand in for a heartbeat, otherwise
    /// an idle WebSocket gets a probe. A failed probe write means the client
    /// side is gone.
    async fn on_tick<W: AsyncWrite + Unpin>(&self, writer: &mut ProbeWriter<W>) -> io::Result<()> {
        if writer.wrote_within(self.interval) {
            trace!(proxy_id = %self.proxy_id, "Tunnel active, recording heartbeat");
            (self.on_beat)();
            return Ok(());
        }
        if !self.websocket {
            return Ok(());
        }

        match writer.send_probe().await {
            Ok(true) => trace!(proxy_id = %self.proxy_id, "Sent keepalive probe"),
            Ok(false) => trace!(proxy_id = %self.proxy_id, "Mid-frame, probe deferred"),
            Err(e) => {
                debug!(proxy_id = %self.proxy_id, error = %e, "Keepalive probe failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.registry.close(&self.tunnel_id);
    }
}

/// Client→backend reader that reports Pong frames and passes every byte through
pub struct ReplyDetectingReader<R> {
    inner: R,
    scanner: FrameScanner,
    on_reply: Option<BeatFn>,
}

impl<R> ReplyDetectingReader<R> {
    pub fn new(inner: R, on_reply: BeatFn) -> Self {
        Self {
            inner,
            scanner: FrameScanner::new(),
            on_reply: Some(on_reply),
        }
    }

    /// Plain pass-through for tunnels that do not speak WebSocket
    pub fn passthrough(inner: R) -> Self {
        Self {
            inner,
            scanner: FrameScanner::new(),
            on_reply: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplyDetectingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        if let Some(on_reply) = &this.on_reply {
            let mut replied = false;
            this.scanner.feed(&buf.filled()[before..], |header| {
                if header.is_pong() {
                    replied = true;
                }
            });
            if replied {
                on_reply();
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Backend→client writer that can slip a Ping in between frames
pub struct ProbeWriter<W> {
    inner: W,
    scanner: FrameScanner,
    last_write: Option<Instant>,
}

impl<W> ProbeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scanner: FrameScanner::new(),
            last_write: None,
        }
    }

    pub fn wrote_within(&self, window: Duration) -> bool {
        self.last_write
            .is_some_and(|at| at.elapsed() <= window)
    }

    pub fn at_frame_boundary(&self) -> bool {
        self.scanner.at_boundary()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> ProbeWriter<W> {
    /// Write a Ping frame if the stream sits on a frame boundary.
    /// Returns false when a frame is half written.
    pub async fn send_probe(&mut self) -> io::Result<bool> {
        if !self.scanner.at_boundary() {
            return Ok(false);
        }
        self.inner.write_all(&PING_FRAME).await?;
        self.inner.flush().await?;
        Ok(true)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProbeWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if written > 0 {
            this.scanner.feed(&buf[..written], |_| {});
            this.last_write = Some(Instant::now());
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bytes moved by a finished tunnel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Pump bytes between an upgraded client connection and the backend until
/// either side closes or the tunnel is closed through the registry.
pub async fn forward_tunnel<C, B>(
    client: C,
    backend: B,
    handle: TunnelHandle,
) -> io::Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut client_reader = if handle.websocket {
        ReplyDetectingReader::new(client_read, Arc::clone(&handle.on_beat))
    } else {
        ReplyDetectingReader::passthrough(client_read)
    };
    let mut upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_reader, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    });
    let mut upstream_done = false;

    let mut downstream = ProbeWriter::new(client_write);
    let mut ticker = tokio::time::interval_at(Instant::now() + handle.interval, handle.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = handle.closed.clone();
    let mut buf = vec![0u8; 16 * 1024];
    let mut stats = TunnelStats::default();

    let result = loop {
        if *closed.borrow() {
            break Ok(());
        }
        tokio::select! {
            joined = &mut upstream, if !upstream_done => {
                upstream_done = true;
                match joined {
                    Ok(Ok(n)) => stats.client_to_backend = n,
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(io::Error::other(e)),
                }
            }
            read = backend_read.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = downstream.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                    stats.backend_to_client += n as u64;
                }
                Err(e) => break Err(e),
            },
            _ = ticker.tick() => {
                if let Err(e) = handle.on_tick(&mut downstream).await {
                    // client already sent EOF, so an unwritable client is a normal end
                    break if upstream_done { Ok(()) } else { Err(e) };
                }
            }
            changed = closed.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
        }
    };

    if !upstream_done {
        upstream.abort();
    }
    let _ = downstream.shutdown().await;

    debug!(
        proxy_id = %handle.proxy_id,
        tunnel_id = %handle.tunnel_id,
        client_to_backend = stats.client_to_backend,
        backend_to_client = stats.backend_to_client,
        "Tunnel finished"
    );
    result.map(|()| stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::frame::OPCODE_PONG;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, BeatFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_reader_passes_bytes_and_detects_pong() {
        let (count, beat) = counter();
        let mut input = vec![0x81, 0x02, b'h', b'i'];
        // masked empty pong
        input.extend_from_slice(&[0x80 | OPCODE_PONG, 0x80, 9, 9, 9, 9]);
        input.extend_from_slice(&[0x81, 0x01, b'!']);

        let mut reader = ReplyDetectingReader::new(&input[..], beat);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, input);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_passthrough_reader_ignores_frames() {
        let input = [0x8A, 0x00];
        let mut reader = ReplyDetectingReader::passthrough(&input[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_probe_waits_for_frame_boundary() {
        let mut writer = ProbeWriter::new(Vec::new());
        writer.write_all(&[0x81, 0x03, b'a']).await.unwrap();
        assert!(!writer.send_probe().await.unwrap());

        writer.write_all(b"bc").await.unwrap();
        assert!(writer.at_frame_boundary());
        assert!(writer.send_probe().await.unwrap());

        let written = writer.into_inner();
        assert_eq!(written, vec![0x81, 0x03, b'a', b'b', b'c', 0x89, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_activity_window() {
        let mut writer = ProbeWriter::new(Vec::new());
        assert!(!writer.wrote_within(Duration::from_secs(1)));
        writer.write_all(b"x").await.unwrap();
        assert!(writer.wrote_within(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!writer.wrote_within(Duration::from_secs(1)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let handle = registry.attach("p1", Some("s1"), true, Duration::from_secs(1), beat);
        let id = handle.tunnel_id().to_string();

        assert_eq!(registry.state(&id), TunnelState::Attached);
        assert!(registry.close(&id));
        assert!(!registry.close(&id));
        assert_eq!(registry.state(&id), TunnelState::Closed);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_close_by_session_and_proxy() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let interval = Duration::from_secs(1);
        let _a = registry.attach("p1", Some("s1"), true, interval, Arc::clone(&beat));
        let _b = registry.attach("p1", Some("s2"), true, interval, Arc::clone(&beat));
        let _c = registry.attach("p2", Some("s1"), false, interval, Arc::clone(&beat));

        assert_eq!(registry.close_session("s1"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.close_proxy("p1"), 1);
        assert_eq!(registry.close_proxy("p1"), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropping_handle_deregisters() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let handle = registry.attach("p1", None, false, Duration::from_secs(1), beat);
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_forward_preserves_bytes_both_ways() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let handle = registry.attach("p1", None, false, Duration::from_secs(60), beat);

        let (mut client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, mut backend) = tokio::io::duplex(1024);
        let pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        client.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        backend.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(backend);
        let stats = pump.await.unwrap().unwrap();
        assert_eq!(stats.backend_to_client, 5);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_websocket_is_probed_and_pong_counts() {
        let registry = TunnelRegistry::new();
        let (count, beat) = counter();
        let handle = registry.attach("p1", None, true, Duration::from_secs(5), beat);

        let (mut client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, _backend) = tokio::io::duplex(1024);
        let _pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        let mut probe = [0u8; 2];
        client.read_exact(&mut probe).await.unwrap();
        assert_eq!(probe, PING_FRAME);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        client
            .write_all(&[0x80 | OPCODE_PONG, 0x80, 1, 2, 3, 4])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_tunnel_beats_without_probing() {
        let registry = TunnelRegistry::new();
        let (count, beat) = counter();
        let handle = registry.attach("p1", None, true, Duration::from_secs(5), beat);

        let (mut client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, mut backend) = tokio::io::duplex(1024);
        let _pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        backend.write_all(&[0x81, 0x01, b'a']).await.unwrap();
        let mut frame = [0u8; 3];
        client.read_exact(&mut frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // the tick used the write as a heartbeat instead of probing
        let mut next = [0u8; 2];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut next)).await;
        assert!(read.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probe_mid_frame() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let handle = registry.attach("p1", None, true, Duration::from_secs(1), beat);

        let (mut client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, mut backend) = tokio::io::duplex(1024);
        let _pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        // header announces 5 bytes, only 1 arrives
        backend.write_all(&[0x81, 0x05, b'a']).await.unwrap();
        let mut partial = [0u8; 3];
        client.read_exact(&mut partial).await.unwrap();

        let mut next = [0u8; 2];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut next)).await;
        assert!(read.is_err(), "probe must not split a frame");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_ends_when_client_leaves_idle_websocket() {
        let registry = TunnelRegistry::new();
        let (count, beat) = counter();
        let handle = registry.attach("p1", None, true, Duration::from_secs(5), beat);

        let (client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, _backend) = tokio::io::duplex(1024);
        let pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        // client goes away while the backend stays open and silent
        drop(client);
        let stats = tokio::time::timeout(Duration::from_secs(30), pump)
            .await
            .expect("pump must end once the client cannot be written to")
            .unwrap()
            .unwrap();
        assert_eq!(stats, TunnelStats::default());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_close_stops_pump() {
        let registry = TunnelRegistry::new();
        let (_, beat) = counter();
        let handle = registry.attach("p1", Some("s1"), true, Duration::from_secs(60), beat);

        let (_client, client_proxy_side) = tokio::io::duplex(1024);
        let (backend_proxy_side, _backend) = tokio::io::duplex(1024);
        let pump = tokio::spawn(forward_tunnel(client_proxy_side, backend_proxy_side, handle));

        tokio::task::yield_now().await;
        assert_eq!(registry.close_session("s1"), 1);
        let stats = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats, TunnelStats::default());
    }
}
