use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use splittun_diag::DropCounter;

const WRITE_QUEUE_DEPTH: usize = 1024;

/// Write half of the TUN adapter. `WouldBlock` signals a full ring.
#[async_trait]
pub trait TunSink: Send {
    async fn write_packet(&mut self, pkt: &[u8]) -> io::Result<()>;
}

/// Cheap cloneable handle used by the router hot path and the inbound
/// callback. A full queue drops the packet and bumps the counter.
#[derive(Clone)]
pub struct TunWriterHandle {
    tx: mpsc::Sender<Vec<u8>>,
    drops: Arc<DropCounter>,
}

impl TunWriterHandle {
    pub fn send(&self, pkt: Vec<u8>) {
        if self.tx.try_send(pkt).is_err() {
            self.drops.increment("tun write dropped");
        }
    }

    pub fn drops(&self) -> &Arc<DropCounter> {
        &self.drops
    }
}

pub struct TunWriter {
    rx: mpsc::Receiver<Vec<u8>>,
    sink: Box<dyn TunSink>,
    drops: Arc<DropCounter>,
}

pub fn tun_writer(sink: Box<dyn TunSink>, drops: Arc<DropCounter>) -> (TunWriterHandle, TunWriter) {
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    (
        TunWriterHandle {
            tx,
            drops: Arc::clone(&drops),
        },
        TunWriter { rx, sink, drops },
    )
}

impl TunWriter {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                pkt = self.rx.recv() => {
                    let Some(pkt) = pkt else {
                        return;
                    };
                    match self.sink.write_packet(&pkt).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            // One retry after yielding; then the packet is
                            // sacrificed rather than stalling the queue.
                            tokio::task::yield_now().await;
                            if self.sink.write_packet(&pkt).await.is_err() {
                                self.drops.increment("tun write dropped");
                            }
                        }
                        Err(_) => self.drops.increment("tun write dropped"),
                    }
                }
            }
        }
    }
}
