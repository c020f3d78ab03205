//! Refcounted per-agent log tails.
//!
//! A journal-follow subprocess exists for an agent only while at least one
//! WebSocket client is subscribed to its `logs:<agentID>` channel. The last
//! unsubscribe cancels the stream's token, which terminates the subprocess
//! and removes the record. Tokens are never shared between streams.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::driver::VmDriver;
use crate::pool::PoolManager;

/// `(agent_id, line)` pairs forwarded to the hub for fan-out.
pub type LogLine = (String, String);

struct LogStream {
    cancel: CancellationToken,
    clients: HashSet<u64>,
}

pub struct LogStreamManager {
    pool: Arc<PoolManager>,
    driver: Arc<dyn VmDriver>,
    line_tx: mpsc::Sender<LogLine>,
    streams: Mutex<HashMap<String, LogStream>>,
}

impl LogStreamManager {
    pub fn new(
        pool: Arc<PoolManager>,
        driver: Arc<dyn VmDriver>,
        line_tx: mpsc::Sender<LogLine>,
    ) -> Self {
        Self {
            pool,
            driver,
            line_tx,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Add a client to an agent's stream, spawning the tail subprocess on
    /// the first subscriber. Unknown agents are ignored silently.
    pub fn subscribe(&self, agent_id: &str, client_id: u64) {
        let mut streams = self.streams.lock();
        match streams.entry(agent_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().clients.insert(client_id);
            }
            Entry::Vacant(entry) => {
                let Some(slot) = self.pool.get_slot(agent_id) else {
                    tracing::warn!(agent = %agent_id, "log subscribe for unknown agent");
                    return;
                };

                let cancel = CancellationToken::new();
                let cmd = self.driver.log_tail_command(&slot.name);
                tokio::spawn(run_stream(
                    agent_id.to_string(),
                    slot.name,
                    cmd,
                    cancel.clone(),
                    self.line_tx.clone(),
                ));

                let stream = entry.insert(LogStream {
                    cancel,
                    clients: HashSet::new(),
                });
                stream.clients.insert(client_id);
            }
        }
    }

    /// Remove a client; the stream stops once no subscribers remain.
    pub fn unsubscribe(&self, agent_id: &str, client_id: u64) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(agent_id) {
            stream.clients.remove(&client_id);
            if stream.clients.is_empty() {
                stream.cancel.cancel();
                streams.remove(agent_id);
                tracing::info!(agent = %agent_id, "log stream stopped (no subscribers)");
            }
        }
    }

    /// Called on client disconnect: drop the client from every stream.
    pub fn unsubscribe_all(&self, client_id: u64) {
        let mut streams = self.streams.lock();
        streams.retain(|agent_id, stream| {
            stream.clients.remove(&client_id);
            if stream.clients.is_empty() {
                stream.cancel.cancel();
                tracing::info!(agent = %agent_id, "log stream stopped (no subscribers)");
                false
            } else {
                true
            }
        });
    }

    pub fn stop_all(&self) {
        let mut streams = self.streams.lock();
        for stream in streams.values() {
            stream.cancel.cancel();
        }
        streams.clear();
    }

    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

async fn run_stream(
    agent_id: String,
    vm_name: String,
    mut cmd: tokio::process::Command,
    cancel: CancellationToken,
    line_tx: mpsc::Sender<LogLine>,
) {
    tracing::info!(agent = %agent_id, vm = %vm_name, "starting log stream");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            tracing::warn!(agent = %agent_id, %error, "failed to spawn log tail");
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        tracing::warn!(agent = %agent_id, "log tail has no stdout");
        let _ = terminate_child(&mut child, Duration::from_millis(200)).await;
        return;
    };

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    if line_tx.send((agent_id.clone(), line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }

    let _ = terminate_child(&mut child, Duration::from_millis(500)).await;
    tracing::info!(agent = %agent_id, "log stream ended");
}

/// SIGTERM first, escalate to SIGKILL after the grace period.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    Ok(())
}
