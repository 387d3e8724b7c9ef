//! Sharded stanza worker pool.
//!
//! Every session hashes to one worker, so stanzas of a session are routed
//! in the order they were read while different sessions proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ServerContext;
use crate::error::RouterError;
use crate::session::ClientSession;
use crate::stanza::Stanza;

struct Job {
    session: Arc<ClientSession>,
    stanza: Stanza,
}

/// Routes inbound stanzas on a fixed set of worker tasks.
pub struct StanzaWorkers {
    shards: Vec<mpsc::Sender<Job>>,
}

impl StanzaWorkers {
    /// Spawn `threads` workers, each with a queue of `queue_size` stanzas.
    pub fn spawn(
        ctx: Weak<ServerContext>,
        threads: usize,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        let shards = (0..threads.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::channel(queue_size.max(1));
                tokio::spawn(run_worker(index, ctx.clone(), rx, cancel.clone()));
                tx
            })
            .collect();
        Self { shards }
    }

    /// Workers sized from `xmpp.processing.threads` and `xmpp.processing.queue`.
    pub fn from_context(ctx: &Arc<ServerContext>) -> Self {
        let properties = ctx.properties();
        Self::spawn(
            Arc::downgrade(ctx),
            properties.processing_threads(),
            properties.get_usize(
                crate::config::PROCESSING_QUEUE,
                crate::config::DEFAULT_PROCESSING_QUEUE,
            ),
            ctx.shutdown_token(),
        )
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    fn shard_for(&self, stream_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        stream_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a stanza read from `session`. Waits while the worker's queue
    /// is full, which pushes back on the reading connection.
    pub async fn dispatch(
        &self,
        session: &Arc<ClientSession>,
        stanza: Stanza,
    ) -> Result<(), RouterError> {
        let shard = self.shard_for(session.stream_id());
        self.shards[shard]
            .send(Job {
                session: Arc::clone(session),
                stanza,
            })
            .await
            .map_err(|_| RouterError::internal("stanza workers stopped"))
    }
}

async fn run_worker(
    index: usize,
    ctx: Weak<ServerContext>,
    mut rx: mpsc::Receiver<Job>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "Stanza worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(ctx) = ctx.upgrade() else {
            warn!(worker = index, "Server context dropped, stopping worker");
            break;
        };
        ctx.packet_router().route_from_session(&job.session, job.stanza);
    }
    debug!(worker = index, "Stanza worker stopped");
}
