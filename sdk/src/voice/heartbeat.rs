use async_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Output of the heartbeat task, tagged with the timer generation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    /// Send a HEARTBEAT with this nonce now.
    Beat { generation: u64, nonce: u64 },
    /// The previous beat was never acknowledged.
    Missed { generation: u64 },
}

impl HeartbeatSignal {
    pub fn generation(&self) -> u64 {
        match self {
            HeartbeatSignal::Beat { generation, .. } | HeartbeatSignal::Missed { generation } => {
                *generation
            }
        }
    }
}

/// Keepalive timer for one voice socket.
///
/// At most one tick task exists at a time: `start` aborts the running task before
/// spawning its replacement, and bumps the generation so the socket loop can drop
/// signals already queued by the old one.
pub struct HeartbeatTimer {
    interval: Option<Duration>,
    ack_received: Arc<AtomicBool>,
    nonce: Arc<AtomicU64>,
    acks: u64,
    generation: u64,
    task: Option<JoinHandle<()>>,
    signal_tx: Sender<HeartbeatSignal>,
}

impl HeartbeatTimer {
    pub fn new(signal_tx: Sender<HeartbeatSignal>) -> Self {
        Self {
            interval: None,
            ack_received: Arc::new(AtomicBool::new(true)),
            nonce: Arc::new(AtomicU64::new(0)),
            acks: 0,
            generation: 0,
            task: None,
            signal_tx,
        }
    }

    /// Start beating at `interval`, replacing any running timer. Returns the new generation.
    pub fn start(&mut self, interval: Duration) -> u64 {
        self.stop();

        self.generation += 1;
        self.interval = Some(interval);
        // The first beat goes out immediately and has nothing to wait on
        self.ack_received.store(true, Ordering::Release);

        let generation = self.generation;
        let ack_received = self.ack_received.clone();
        let nonce = self.nonce.clone();
        let signal_tx = self.signal_tx.clone();

        debug!("Heartbeat started: interval={:?}, generation={}", interval, generation);

        self.task = Some(tokio::spawn(async move {
            loop {
                if ack_received.swap(false, Ordering::AcqRel) {
                    let nonce = nonce.fetch_add(1, Ordering::Relaxed) + 1;
                    if signal_tx
                        .send(HeartbeatSignal::Beat { generation, nonce })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                } else {
                    let _ = signal_tx.send(HeartbeatSignal::Missed { generation }).await;
                    break;
                }
            }
        }));

        generation
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            trace!("Heartbeat stopped: generation={}", self.generation);
        }
    }

    /// Record a HEARTBEAT_ACK.
    pub fn acknowledge(&mut self, nonce: Option<u64>) {
        self.ack_received.store(true, Ordering::Release);
        self.acks += 1;
        trace!("Heartbeat acknowledged: nonce={:?}, acks={}", nonce, self.acks);
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ack_count(&self) -> u64 {
        self.acks
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
