//! Internal utilities to support testing.

use std::io;
use std::net::SocketAddr;

use tokio::sync::{mpsc, Mutex};

use crate::transport::Transport;

/// Builds a [`Transport`] whose wire is a pair of in-memory channels, and
/// the [`ScriptedServer`] handle a test drives the far end with.
pub(crate) fn scripted() -> (ScriptedTransport, ScriptedServer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    (
        ScriptedTransport {
            requests: request_tx,
            responses: Mutex::new(response_rx),
        },
        ScriptedServer {
            requests: request_rx,
            responses: response_tx,
        },
    )
}

/// A [`Transport`] that hands every sent datagram to the test and yields
/// whatever the test injects.
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    requests: mpsc::UnboundedSender<Vec<u8>>,
    responses: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl Transport for ScriptedTransport {
    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.requests
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "script finished"))
    }

    async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut responses = self.responses.lock().await;
        match responses.recv().await {
            Some(datagram) => Ok(datagram),
            // script finished: behave like an idle socket
            None => std::future::pending().await,
        }
    }
}

/// The far end of a [`ScriptedTransport`].
#[derive(Debug)]
pub(crate) struct ScriptedServer {
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
    responses: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl ScriptedServer {
    /// Next request the client put on the wire.
    pub(crate) async fn request(&mut self) -> Vec<u8> {
        self.requests.recv().await.expect("client stopped sending")
    }

    /// Inject a datagram as if it arrived from `from`.
    pub(crate) fn reply(&self, from: SocketAddr, bytes: Vec<u8>) {
        let _ = self.responses.send((bytes, from));
    }
}

/// Route `tracing` output of a test to stderr when `RUST_LOG` asks for it.
#[allow(dead_code)]
pub(crate) fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
