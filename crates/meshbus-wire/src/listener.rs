//! Inbound side of the wire protocol.
//!
//! An [`EnvelopeListener`] binds the local command port, accepts connections
//! from peers, and reads frames off each one. Decoded envelopes go to an
//! [`EnvelopeHandler`]; frames that fail to decode are dropped without
//! closing the connection. A truncated frame ends the connection.

use crate::codec::decode_envelope;
use crate::error::WireError;
use crate::frame::read_frame;
use async_trait::async_trait;
use meshbus_types::Envelope;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives envelopes decoded off the wire.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle_envelope(&self, envelope: Envelope, from: SocketAddr);
}

/// Decode one frame body and hand it to the handler.
///
/// Decode failures are local to the frame.
pub(crate) async fn dispatch_frame(body: &[u8], from: SocketAddr, handler: &dyn EnvelopeHandler) {
    match decode_envelope(body) {
        Ok(envelope) => handler.handle_envelope(envelope, from).await,
        Err(e) => {
            warn!(peer = %from, len = body.len(), "Dropping undecodable frame: {}", e);
        }
    }
}

/// Resolve once the flag behind `rx` becomes true or its sender is dropped.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Accepts peer connections and feeds their frames to a handler.
pub struct EnvelopeListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl EnvelopeListener {
    /// Bind `addr` and start accepting in a background task.
    pub async fn start(
        addr: SocketAddr,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Arc<Self>, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("meshbus: listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(Self::accept_loop(listener, handler, shutdown_rx));

        Ok(Arc::new(Self {
            local_addr,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        }))
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every inbound connection. Idempotent.
    pub fn shutdown(&self) {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            debug!("meshbus: closing listener on {}", self.local_addr);
            let _ = self.shutdown_tx.send(true);
            task.abort();
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let connection_rx = shutdown_rx.clone();
            tokio::select! {
                _ = stopped(&mut shutdown_rx) => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("meshbus: accepted connection from {}", addr);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_inbound(stream, addr, &*handler, connection_rx).await {
                                debug!("meshbus: inbound connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("meshbus: accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    async fn handle_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        handler: &dyn EnvelopeHandler,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), WireError> {
        let (mut reader, _writer) = stream.into_split();
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown_rx) => return Ok(()),
                frame = read_frame(&mut reader) => match frame {
                    Ok(body) => dispatch_frame(&body, addr, handler).await,
                    Err(WireError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

impl Drop for EnvelopeListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_envelope;
    use crate::frame::write_frame;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Collector {
        tx: mpsc::UnboundedSender<Envelope>,
    }

    #[async_trait]
    impl EnvelopeHandler for Collector {
        async fn handle_envelope(&self, envelope: Envelope, _from: SocketAddr) {
            let _ = self.tx.send(envelope);
        }
    }

    fn envelope(topic: &str) -> Envelope {
        Envelope::new(
            "127.0.0.1:7000:7001".parse().unwrap(),
            topic,
            "Msg",
            b"payload".to_vec(),
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_receives_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = EnvelopeListener::start("127.0.0.1:0".parse().unwrap(), Arc::new(Collector { tx }))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        write_frame(&mut stream, &encode_envelope(&envelope("a")).unwrap())
            .await
            .unwrap();
        write_frame(&mut stream, &encode_envelope(&envelope("b")).unwrap())
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.topic, "a");
        assert_eq!(recv(&mut rx).await.topic, "b");
        listener.shutdown();
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_close_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = EnvelopeListener::start("127.0.0.1:0".parse().unwrap(), Arc::new(Collector { tx }))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        // Well-framed garbage: 3-byte body holding a string where an octet belongs.
        write_frame(&mut stream, &[0x00, 0x03, 0xa2, b'h', b'i'])
            .await
            .unwrap();
        write_frame(&mut stream, &encode_envelope(&envelope("after")).unwrap())
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await.topic, "after");
    }
}
