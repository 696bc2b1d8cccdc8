//! Client transaction intake.
//!
//! A plain TCP listener: each connection carries a stream of
//! length-prefixed transaction payloads which are forwarded to the
//! arbiter as client events. The bounded event channel pushes back on
//! clients that submit faster than the node can absorb.

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use totem_core::Event;
use totem_types::Transaction;
use tracing::{debug, info, warn};

/// Cap on a single submitted transaction.
const MAX_TX_BYTES: usize = 1 << 20;

/// Accept client connections on a bound listener until shutdown.
pub async fn run_intake(
    listener: TcpListener,
    event_tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "transaction intake listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "intake connection accepted");
                let events = event_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_client(stream, events, shutdown).await {
                        debug!(%peer, %error, "intake connection closed");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("transaction intake stopping");
                return Ok(());
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        let mut length_bytes = [0u8; 4];
        tokio::select! {
            read = stream.read_exact(&mut length_bytes) => {
                if read.is_err() {
                    // Client hung up.
                    return Ok(());
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length > MAX_TX_BYTES {
            warn!(length, "oversized transaction rejected, dropping client");
            return Ok(());
        }
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;
        let event = Event::TransactionSubmitted {
            tx: Transaction::new(payload),
        };
        if events.send(event).await.is_err() {
            // Arbiter is gone; nothing left to do.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn forwards_length_prefixed_transactions() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_intake(listener, event_tx, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let payload = b"transfer 10 from a to b";
        client
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(payload).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), event_rx.recv())
            .await
            .expect("no event")
            .expect("channel closed");
        match event {
            Event::TransactionSubmitted { tx } => assert_eq!(tx.as_bytes(), payload),
            other => panic!("unexpected event {}", other.type_name()),
        }
    }
}
