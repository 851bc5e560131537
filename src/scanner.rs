use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::DEFAULT_SCANNER_PORT;
use crate::protocol::{FrameBody, MessageCodec};

const DATAGRAM_BUFFER_SIZE: usize = 4096;

/// Receiver for decoded announcement payloads.
pub trait AnnouncementSink: Send + Sync {
    fn notify(&self, announcement: &Value);
}

/// Listens for the periodic UDP broadcasts Tuya devices emit on port 6666
/// and forwards every decoded announcement to its sink. Announcement frames
/// are cleartext JSON, so the scanner runs a cipherless codec and keeps no
/// device state of its own.
pub struct DeviceScanner {
    bind_addr: String,
    port: u16,
    sink: Arc<dyn AnnouncementSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceScanner {
    pub fn new(sink: Arc<dyn AnnouncementSink>) -> Self {
        Self {
            bind_addr: "0.0.0.0".to_owned(),
            port: DEFAULT_SCANNER_PORT,
            sink,
            task: Mutex::new(None),
        }
    }

    pub fn with_bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_owned();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind the UDP socket and spawn the receive loop. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&self) -> std::io::Result<std::net::SocketAddr> {
        let socket = UdpSocket::bind((self.bind_addr.as_str(), self.port)).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "scanner listening");

        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            let codec = MessageCodec::plaintext();
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "scanner receive failed");
                        break;
                    }
                };
                for (_code, body) in codec.parse(&buf[..len]) {
                    match body {
                        FrameBody::Json(announcement) => {
                            tracing::debug!(%addr, ?announcement, "broadcast received");
                            sink.notify(&announcement);
                        }
                        FrameBody::Empty => {}
                        FrameBody::Undecodable(e) => {
                            tracing::debug!(%addr, error = %e, "dropping malformed datagram");
                        }
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        Ok(local_addr)
    }

    pub fn close(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{Duration, sleep};

    struct Collector {
        seen: StdMutex<Vec<Value>>,
    }

    impl AnnouncementSink for Collector {
        fn notify(&self, announcement: &Value) {
            self.seen.lock().unwrap().push(announcement.clone());
        }
    }

    #[tokio::test]
    async fn forwards_announcements_and_drops_garbage() {
        let collector = Arc::new(Collector {
            seen: StdMutex::new(Vec::new()),
        });
        // port 0 lets the OS pick a free loopback port
        let scanner = DeviceScanner::new(collector.clone())
            .with_bind_addr("127.0.0.1")
            .with_port(0);
        let port = scanner.start().await.unwrap().port();

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let codec = MessageCodec::plaintext();
        let ann = json!({"gwId": "abcdef", "ip": "10.0.0.5", "version": "3.1"});
        let frame = codec.encode_get(&ann).unwrap();

        sender.send_to(&frame, ("127.0.0.1", port)).await.unwrap();
        sender.send_to(b"not a frame", ("127.0.0.1", port)).await.unwrap();
        sender.send_to(&frame, ("127.0.0.1", port)).await.unwrap();

        sleep(Duration::from_millis(200)).await;
        scanner.close();

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["gwId"], "abcdef");
    }
}
