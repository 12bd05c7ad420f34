//! Deferred replicated writer.
//!
//! The primary store is written inline so reads against it are always
//! consistent; replication to secondaries goes through two in-memory queues
//! drained by a single background loop. Queue contents are lost on restart;
//! the orchestrator re-derives what it needs from the primary at startup.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::{BoxFuture, join_all};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, error, warn};

use crate::{
    config::WriterSettings,
    dao::{
        gateway::{PersistenceGateway, SharedGateway},
        storage::{StorageError, StorageResult},
    },
};

/// Replayable store operation, run once against the primary and then once per secondary.
pub type Operation =
    Arc<dyn Fn(&dyn PersistenceGateway) -> BoxFuture<'static, StorageResult<()>> + Send + Sync>;

/// Wrap a closure into an [`Operation`].
pub fn operation<F>(f: F) -> Operation
where
    F: Fn(&dyn PersistenceGateway) -> BoxFuture<'static, StorageResult<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Replication queue a task goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingClass {
    /// Strict FIFO, one at a time. Used for every session-scoped write.
    Ordered,
    /// Concurrent fan-out with no relative ordering.
    Unordered,
}

/// One pending replication to a single secondary.
pub struct DeferredTask {
    label: &'static str,
    destination: SharedGateway,
    op: Operation,
    class: OrderingClass,
    attempts_left: u32,
}

impl DeferredTask {
    /// Task that will be attempted at most `max_attempts` times.
    pub fn new(
        label: &'static str,
        destination: SharedGateway,
        op: Operation,
        class: OrderingClass,
        max_attempts: u32,
    ) -> Self {
        Self {
            label,
            destination,
            op,
            class,
            attempts_left: max_attempts.max(1),
        }
    }

    /// Queue the task belongs to.
    pub fn class(&self) -> OrderingClass {
        self.class
    }

    fn run(&self) -> BoxFuture<'static, StorageResult<()>> {
        (self.op)(self.destination.as_ref())
    }
}

/// Snapshot of the replication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Ordered tasks submitted and not yet replicated or dropped.
    pub ordered_pending: usize,
    /// Unordered tasks submitted and not yet replicated or dropped.
    pub unordered_pending: usize,
    /// Tasks that reached their secondary.
    pub replicated: u64,
    /// Failed attempts that were re-queued.
    pub retried: u64,
    /// Tasks dropped after exhausting their attempts.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    ordered_pending: AtomicUsize,
    unordered_pending: AtomicUsize,
    replicated: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn pending(&self, class: OrderingClass) -> &AtomicUsize {
        match class {
            OrderingClass::Ordered => &self.ordered_pending,
            OrderingClass::Unordered => &self.unordered_pending,
        }
    }

    fn settle(&self, class: OrderingClass) {
        let _ = self
            .pending(class)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn snapshot(&self) -> WriterStats {
        WriterStats {
            ordered_pending: self.ordered_pending.load(Ordering::SeqCst),
            unordered_pending: self.unordered_pending.load(Ordering::SeqCst),
            replicated: self.replicated.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

struct WriterInner {
    primary: SharedGateway,
    secondaries: Vec<SharedGateway>,
    settings: WriterSettings,
    sender: UnboundedSender<DeferredTask>,
    driver: Mutex<Option<Driver>>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

/// Primary-inline, secondaries-deferred writer. Cheap to clone.
#[derive(Clone)]
pub struct DeferredWriter {
    inner: Arc<WriterInner>,
}

impl DeferredWriter {
    /// Writer targeting `primary` and replicating to every entry of `secondaries`.
    pub fn new(
        primary: SharedGateway,
        secondaries: Vec<SharedGateway>,
        settings: WriterSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let driver = Driver {
            receiver,
            ordered: VecDeque::new(),
            unordered: Vec::new(),
            unordered_retries: Vec::new(),
            retry_due: None,
            idle_interval: settings.idle_interval,
            counters: counters.clone(),
        };
        Self {
            inner: Arc::new(WriterInner {
                primary,
                secondaries,
                settings,
                sender,
                driver: Mutex::new(Some(driver)),
                task: Mutex::new(None),
                counters,
            }),
        }
    }

    /// The source of truth, for reads.
    pub fn primary(&self) -> &SharedGateway {
        &self.inner.primary
    }

    /// Run `op` against the primary, then queue one replication per secondary.
    ///
    /// Primary errors propagate and nothing is queued.
    pub async fn write(
        &self,
        label: &'static str,
        op: Operation,
        class: OrderingClass,
    ) -> StorageResult<()> {
        (op)(self.inner.primary.as_ref()).await?;
        for secondary in &self.inner.secondaries {
            self.submit(DeferredTask::new(
                label,
                secondary.clone(),
                op.clone(),
                class,
                self.inner.settings.max_attempts,
            ));
        }
        Ok(())
    }

    /// Enqueue a replication without blocking. Attaches the drain loop to the
    /// current runtime on first use; without a runtime the task stays buffered.
    pub fn submit(&self, task: DeferredTask) {
        let class = task.class;
        let label = task.label;
        self.inner.counters.pending(class).fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(task).is_err() {
            self.inner.counters.settle(class);
            warn!(label, "replication loop is gone; task discarded");
            return;
        }
        self.start();
    }

    /// Spawn the drain loop on the current runtime if it is not running yet.
    pub fn start(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let Some(driver) = self.take_driver() else {
            return;
        };
        let join = handle.spawn(driver.run());
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
    }

    /// Drive the queues on the calling task. Returns immediately when the loop
    /// already runs elsewhere.
    pub async fn run_forever(&self) {
        match self.take_driver() {
            Some(driver) => driver.run().await,
            None => debug!("replication loop already attached"),
        }
    }

    /// Current queue depths and counters.
    pub fn stats(&self) -> WriterStats {
        self.inner.counters.snapshot()
    }

    /// Abort the spawned drain loop. Pending replications are lost.
    pub fn shutdown(&self) {
        if let Some(join) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            join.abort();
        }
    }

    fn take_driver(&self) -> Option<Driver> {
        self.inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

struct Driver {
    receiver: UnboundedReceiver<DeferredTask>,
    ordered: VecDeque<DeferredTask>,
    unordered: Vec<DeferredTask>,
    /// Failed unordered items, released back into `unordered` at `retry_due`.
    unordered_retries: Vec<DeferredTask>,
    retry_due: Option<Instant>,
    idle_interval: Duration,
    counters: Arc<Counters>,
}

impl Driver {
    async fn run(mut self) {
        debug!("replication loop started");
        loop {
            let open = self.absorb();
            self.release_due_retries();
            self.drain_unordered().await;
            self.ordered_pass().await;

            if !open {
                if self.ordered.is_empty() && self.unordered_retries.is_empty() {
                    break;
                }
                sleep(self.idle_interval).await;
                continue;
            }
            self.idle().await;
        }
        debug!("replication loop stopped");
    }

    /// Move every buffered submission into its queue. Returns `false` once all senders are gone.
    fn absorb(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(task) => self.enqueue(task),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn enqueue(&mut self, task: DeferredTask) {
        match task.class {
            OrderingClass::Ordered => self.ordered.push_back(task),
            OrderingClass::Unordered => self.unordered.push(task),
        }
    }

    fn release_due_retries(&mut self) {
        if self.retry_due.is_some_and(|due| Instant::now() >= due) {
            self.unordered.append(&mut self.unordered_retries);
            self.retry_due = None;
        }
    }

    /// Sleep between ordered passes, at most until pending unordered retries
    /// are due. A fresh unordered arrival cuts the sleep short.
    async fn idle(&mut self) {
        let mut deadline = Instant::now() + self.idle_interval;
        if let Some(due) = self.retry_due {
            deadline = deadline.min(due);
        }
        let pause = sleep_until(deadline);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => return,
                received = self.receiver.recv() => match received {
                    Some(task) => {
                        let wake = task.class == OrderingClass::Unordered;
                        self.enqueue(task);
                        if wake {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    async fn drain_unordered(&mut self) {
        if self.unordered.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.unordered);
        let results = join_all(batch.iter().map(DeferredTask::run)).await;
        for (task, result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => self.replicated(&task),
                Err(err) => {
                    if let Some(task) = self.retry_or_drop(task, err) {
                        self.unordered_retries.push(task);
                    }
                }
            }
        }
        if !self.unordered_retries.is_empty() && self.retry_due.is_none() {
            self.retry_due = Some(Instant::now() + self.idle_interval);
        }
    }

    /// One pass over the items queued when the pass began; failures go to the tail.
    async fn ordered_pass(&mut self) {
        let pass_len = self.ordered.len();
        for _ in 0..pass_len {
            let Some(task) = self.ordered.pop_front() else {
                break;
            };
            match task.run().await {
                Ok(()) => self.replicated(&task),
                Err(err) => {
                    if let Some(task) = self.retry_or_drop(task, err) {
                        self.ordered.push_back(task);
                    }
                }
            }
        }
    }

    fn replicated(&self, task: &DeferredTask) {
        self.counters.replicated.fetch_add(1, Ordering::SeqCst);
        self.counters.settle(task.class);
    }

    fn retry_or_drop(&self, mut task: DeferredTask, err: StorageError) -> Option<DeferredTask> {
        task.attempts_left = task.attempts_left.saturating_sub(1);
        if task.attempts_left == 0 {
            error!(
                label = task.label,
                destination = task.destination.name(),
                error = %err,
                "replication attempts exhausted; dropping task"
            );
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            self.counters.settle(task.class);
            return None;
        }
        warn!(
            label = task.label,
            destination = task.destination.name(),
            attempts_left = task.attempts_left,
            error = %err,
            "replication failed; re-queued"
        );
        self.counters.retried.fetch_add(1, Ordering::SeqCst);
        Some(task)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::FutureExt;

    use super::*;
    use crate::{
        dao::{gateway::memory::MemoryGateway, models::MemberEntity},
        platform::MemberId,
    };

    fn settings() -> WriterSettings {
        WriterSettings {
            idle_interval: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    fn upsert(id: u64) -> Operation {
        operation(move |store| {
            store.upsert_member(MemberEntity {
                id: MemberId(id),
                display_name: format!("member-{id}"),
                default_session_name: None,
            })
        })
    }

    fn writer_with_secondary() -> (DeferredWriter, MemoryGateway, MemoryGateway) {
        let primary = MemoryGateway::new("primary");
        let secondary = MemoryGateway::new("replica");
        let writer = DeferredWriter::new(
            Arc::new(primary.clone()),
            vec![Arc::new(secondary.clone())],
            settings(),
        );
        (writer, primary, secondary)
    }

    async fn settle(writer: &DeferredWriter) {
        for _ in 0..50 {
            let stats = writer.stats();
            if stats.ordered_pending == 0 && stats.unordered_pending == 0 {
                return;
            }
            sleep(Duration::from_secs(30)).await;
        }
        panic!("writer did not settle: {:?}", writer.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn primary_is_written_inline_and_secondary_eventually() {
        let (writer, primary, secondary) = writer_with_secondary();
        writer
            .write("upsert_member", upsert(1), OrderingClass::Ordered)
            .await
            .unwrap();

        assert!(primary.member(MemberId(1)).await.is_some());
        settle(&writer).await;
        assert!(secondary.member(MemberId(1)).await.is_some());
        assert_eq!(writer.stats().replicated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_failure_propagates_and_queues_nothing() {
        let (writer, primary, secondary) = writer_with_secondary();
        primary.fail_next(1);

        let err = writer
            .write("upsert_member", upsert(1), OrderingClass::Ordered)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));
        assert_eq!(writer.stats(), WriterStats::default());
        assert_eq!(secondary.write_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_item_succeeds_on_last_attempt() {
        let (writer, _, secondary) = writer_with_secondary();
        secondary.fail_next(4);

        writer
            .write("upsert_member", upsert(1), OrderingClass::Ordered)
            .await
            .unwrap();
        settle(&writer).await;

        assert_eq!(secondary.write_attempts(), 5);
        assert!(secondary.member(MemberId(1)).await.is_some());
        let stats = writer.stats();
        assert_eq!((stats.retried, stats.dropped, stats.replicated), (4, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_dropped_without_blocking_followers() {
        let (writer, _, secondary) = writer_with_secondary();
        let calls = Arc::new(AtomicU32::new(0));
        let failing = {
            let calls = calls.clone();
            operation(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StorageError::Rejected {
                        message: "always".into(),
                    })
                }
                .boxed()
            })
        };

        let replica: SharedGateway = Arc::new(secondary.clone());
        writer.submit(DeferredTask::new(
            "failing",
            replica.clone(),
            failing,
            OrderingClass::Ordered,
            5,
        ));
        writer.submit(DeferredTask::new(
            "upsert_member",
            replica,
            upsert(2),
            OrderingClass::Ordered,
            5,
        ));
        settle(&writer).await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(secondary.member(MemberId(2)).await.is_some());
        let stats = writer.stats();
        assert_eq!((stats.dropped, stats.replicated), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_failures_are_resubmitted() {
        let (writer, _, secondary) = writer_with_secondary();
        secondary.fail_next(2);

        writer
            .write("upsert_member", upsert(3), OrderingClass::Unordered)
            .await
            .unwrap();
        settle(&writer).await;

        assert_eq!(secondary.write_attempts(), 3);
        assert!(secondary.member(MemberId(3)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_retries_wait_out_a_short_outage() {
        let (writer, _, secondary) = writer_with_secondary();
        secondary.set_offline(true);

        writer
            .write("upsert_member", upsert(6), OrderingClass::Unordered)
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(secondary.write_attempts(), 1);
        let stats = writer.stats();
        assert_eq!((stats.retried, stats.dropped), (1, 0));

        secondary.set_offline(false);
        settle(&writer).await;
        assert!(secondary.member(MemberId(6)).await.is_some());
        let stats = writer.stats();
        assert_eq!((stats.retried, stats.dropped, stats.replicated), (1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_arrival_wakes_idle_loop() {
        let (writer, _, secondary) = writer_with_secondary();
        writer.start();
        tokio::task::yield_now().await;

        writer
            .write("upsert_member", upsert(4), OrderingClass::Unordered)
            .await
            .unwrap();
        // Well under the idle interval.
        sleep(Duration::from_millis(10)).await;
        assert!(secondary.member(MemberId(4)).await.is_some());
    }

    #[test]
    fn tasks_submitted_before_a_runtime_are_buffered() {
        let (writer, _, secondary) = writer_with_secondary();
        let replica: SharedGateway = Arc::new(secondary.clone());
        writer.submit(DeferredTask::new(
            "upsert_member",
            replica,
            upsert(5),
            OrderingClass::Ordered,
            5,
        ));
        assert_eq!(writer.stats().ordered_pending, 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            writer.start();
            settle(&writer).await;
            assert!(secondary.member(MemberId(5)).await.is_some());
        });
    }
}
