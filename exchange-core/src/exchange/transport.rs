// exchange/transport.rs
// ====
// Resilient WebSocket transport
// ====
// Self-reconnecting duplex channel with exponential backoff and a
// connection-attempt timeout. Every public and private exchange stream is
// built on exactly one instance of this wrapper.
// ====

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::errors::ExchangeError;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Message(String),
    Closed,
}

/// A self-reconnecting WebSocket wrapper.
///
/// Listeners subscribe once and survive reconnects. `close()` permanently
/// disables reconnection and is idempotent. Outbound messages sent while
/// disconnected are buffered and flushed on the next open socket.
pub struct ReconnectingSocket {
    outbound: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingSocket {
    pub fn connect(config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(1024);
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run(config, outbound_rx, events_tx.clone(), closed.clone()));

        Self {
            outbound: outbound_tx,
            events: events_tx,
            closed,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), ExchangeError> {
        if self.is_closed() {
            return Err(ExchangeError::WebSocket("socket is closed".to_string()));
        }
        self.outbound
            .send(text.into())
            .map_err(|_| ExchangeError::WebSocket("socket task is gone".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Permanently closes the socket. No reconnect will be scheduled after
    /// this returns; observable state is closed synchronously.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().expect("transport task lock").take() {
            task.abort();
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Drop for ReconnectingSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn backoff_delay(config: &TransportConfig, retry: u32) -> Duration {
    let scaled = config.base_delay.mul_f64(config.factor.powi(retry as i32));
    scaled.min(config.max_delay)
}

async fn run(
    config: TransportConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut retry: u32 = 0;
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match timeout(config.connect_timeout, connect_async(config.url.clone())).await {
            Ok(Ok((stream, _))) => {
                retry = 0;
                let _ = events.send(TransportEvent::Open);
                let (mut write, mut read) = stream.split();

                loop {
                    tokio::select! {
                        out = outbound_rx.recv() => match out {
                            Some(text) => {
                                if write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            // Wrapper dropped; nothing left to serve.
                            None => return,
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let _ = events.send(TransportEvent::Message(text));
                            }
                            Some(Ok(Message::Binary(bin))) => {
                                if let Ok(text) = String::from_utf8(bin) {
                                    let _ = events.send(TransportEvent::Message(text));
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            _ => {}
                        },
                    }
                }
                let _ = events.send(TransportEvent::Closed);
            }
            Ok(Err(e)) => {
                debug!(url = %config.url, error = %e, "websocket connect failed");
            }
            Err(_) => {
                debug!(url = %config.url, "websocket connect attempt timed out");
            }
        }

        if closed.load(Ordering::SeqCst) {
            return;
        }
        let delay = backoff_delay(&config, retry);
        retry = retry.saturating_add(1);
        debug!(url = %config.url, retry, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    // Local acceptor that tracks how many websocket handshakes completed,
    // optionally sends one message, then drops the connection.
    async fn spawn_server(greeting: Option<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(text) = greeting {
                    let _ = ws.send(Message::Text(text.to_string())).await;
                }
                let _ = ws.close(None).await;
            }
        });
        (format!("ws://{}", addr), accepted)
    }

    fn fast_config(url: String) -> TransportConfig {
        TransportConfig {
            url,
            base_delay: Duration::from_millis(50),
            factor: 2.0,
            max_delay: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let (url, accepted) = spawn_server(None).await;
        let socket = ReconnectingSocket::connect(fast_config(url));
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Server drops every connection; the wrapper must keep coming back.
        assert!(accepted.load(Ordering::SeqCst) >= 2);
        socket.close();
    }

    #[tokio::test]
    async fn test_force_close_schedules_no_reconnect() {
        let (url, accepted) = spawn_server(None).await;
        let socket = ReconnectingSocket::connect(fast_config(url));
        tokio::time::sleep(Duration::from_millis(100)).await;
        socket.close();
        assert!(socket.is_closed());
        let after_close = accepted.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), after_close);
        // Idempotent.
        socket.close();
    }

    #[tokio::test]
    async fn test_listeners_survive_reconnect() {
        let (url, _) = spawn_server(Some("hello")).await;
        let socket = ReconnectingSocket::connect(fast_config(url));
        let mut events = socket.subscribe();

        let mut opens = 0;
        let mut messages = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
        while tokio::time::Instant::now() < deadline && (opens < 2 || messages < 2) {
            match timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Ok(TransportEvent::Open)) => opens += 1,
                Ok(Ok(TransportEvent::Message(_))) => messages += 1,
                _ => {}
            }
        }
        // The same subscription observed more than one connection cycle.
        assert!(opens >= 2, "saw {} opens", opens);
        assert!(messages >= 2, "saw {} messages", messages);
        socket.close();
    }

    #[tokio::test]
    async fn test_connect_timeout_triggers_retry() {
        // Raw TCP listener that never answers the websocket handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                // Hold the connection open without handshaking.
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let mut config = fast_config(format!("ws://{}", addr));
        config.connect_timeout = Duration::from_millis(100);
        let socket = ReconnectingSocket::connect(config);
        tokio::time::sleep(Duration::from_millis(500)).await;
        // Each timed-out attempt is aborted and retried after backoff.
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        socket.close();
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast_config("ws://localhost".to_string());
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(200));
    }
}
