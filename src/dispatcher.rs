use min_max_heap::MinMaxHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Identifies a scheduled task.
pub(crate) type TaskId = u64;

/// Relative urgency of a task; lower runs first among tasks due at the
/// same time.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Priority {
    BgFetch = 0,
    VKeyFetch = 1,
    Flusher = 2,
    PartitionDeletion = 3,
    PartitionPersist = 4,
    StateNotify = 5,
}

/// A unit of background work.
///
/// `run` may return a delay to have the task re-inserted; the dispatcher
/// honors it only if the task was scheduled with `may_reschedule`.
pub(crate) trait DispatcherCallback: Send {
    fn run(&mut self, dispatcher: &Dispatcher, id: TaskId) -> Option<Duration>;

    fn describe(&self) -> String;
}

struct ScheduledTask {
    run_at: Instant,
    priority: Priority,
    seq: u64,
    id: TaskId,
    may_reschedule: bool,
    callback: Box<dyn DispatcherCallback>,
}

impl ScheduledTask {
    fn sort_key(&self) -> (Instant, Priority, u64) {
        (self.run_at, self.priority, self.seq)
    }
}

impl Eq for ScheduledTask {}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct SchedulerState {
    heap: MinMaxHeap<ScheduledTask>,
    shutdown: bool,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            heap: MinMaxHeap::new(),
            shutdown: false,
        }
    }
}

struct DispatcherInner {
    name: &'static str,
    state: Mutex<SchedulerState>,
    condvar: Condvar,
    seq: AtomicU64,
    next_id: AtomicU64,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Single-worker priority scheduler with absolute-time wake-ups.
///
/// Tasks are ordered by `(run_at, priority, submission order)`. The worker
/// sleeps until the earliest due time, runs the task outside the queue
/// lock, and re-inserts it if the callback asks for another round.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                name,
                state: Mutex::new(SchedulerState::default()),
                condvar: Condvar::new(),
                seq: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawns the worker thread. Call once.
    pub(crate) fn start(&self) {
        let this = self.clone();
        let handle = std::thread::spawn(move || this.run_worker());

        *self.inner.worker.lock().expect("lock is poisoned") = Some(handle);
    }

    /// Enqueues `callback` to run after `delay`.
    pub(crate) fn schedule(
        &self,
        callback: Box<dyn DispatcherCallback>,
        priority: Priority,
        delay: Duration,
        may_reschedule: bool,
    ) -> TaskId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        log::trace!(
            "{}: scheduling task {id} ({}) in {delay:?}",
            self.inner.name,
            callback.describe()
        );

        let task = ScheduledTask {
            run_at: Instant::now() + delay,
            priority,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            id,
            may_reschedule,
            callback,
        };

        let mut state = self.inner.state.lock().expect("lock is poisoned");
        state.heap.push(task);
        drop(state);

        self.inner.condvar.notify_all();
        id
    }

    /// Signals shutdown and joins the worker.
    ///
    /// The currently-running task finishes; everything still queued is
    /// dropped, including delayed tasks that have not come due.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.inner.state.lock().expect("lock is poisoned");
            state.shutdown = true;
        }
        self.inner.condvar.notify_all();

        let handle = self.inner.worker.lock().expect("lock is poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}: worker panicked", self.inner.name);
            }
        }

        // Dropping leftover tasks releases whatever they hold on to
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        let dropped = std::mem::replace(&mut state.heap, MinMaxHeap::new()).len();
        if dropped > 0 {
            log::debug!("{}: dropped {dropped} unfinished tasks", self.inner.name);
        }
    }

    fn run_worker(&self) {
        log::trace!("{}: worker started", self.inner.name);

        loop {
            let mut state = self.inner.state.lock().expect("lock is poisoned");

            let task = loop {
                if state.shutdown {
                    log::trace!("{}: worker exiting", self.inner.name);
                    return;
                }

                match state.heap.peek_min().map(|t| t.run_at) {
                    None => {
                        state = self
                            .inner
                            .condvar
                            .wait(state)
                            .expect("lock is poisoned");
                    }
                    Some(run_at) => {
                        let now = Instant::now();
                        if run_at <= now {
                            break state.heap.pop_min().expect("heap is non-empty");
                        }

                        let (next, _) = self
                            .inner
                            .condvar
                            .wait_timeout(state, run_at - now)
                            .expect("lock is poisoned");
                        state = next;
                    }
                }
            };
            drop(state);

            let ScheduledTask {
                priority,
                seq: _,
                id,
                may_reschedule,
                mut callback,
                ..
            } = task;

            log::trace!("{}: running task {id} ({})", self.inner.name, callback.describe());
            let again = callback.run(self, id);

            if let Some(delay) = again {
                if may_reschedule {
                    let task = ScheduledTask {
                        run_at: Instant::now() + delay,
                        priority,
                        seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                        id,
                        may_reschedule,
                        callback,
                    };

                    let mut state = self.inner.state.lock().expect("lock is poisoned");
                    if !state.shutdown {
                        state.heap.push(task);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use test_log::test;

    struct Counting {
        hits: Arc<AtomicUsize>,
        reschedule: Option<Duration>,
    }

    impl DispatcherCallback for Counting {
        fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.reschedule.take()
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    struct Labelled {
        label: &'static str,
        tx: mpsc::Sender<&'static str>,
    }

    impl DispatcherCallback for Labelled {
        fn run(&mut self, _: &Dispatcher, _: TaskId) -> Option<Duration> {
            self.tx.send(self.label).expect("channel open");
            None
        }

        fn describe(&self) -> String {
            self.label.into()
        }
    }

    fn wait_for(hits: &AtomicUsize, expected: usize) {
        for _ in 0..500 {
            if hits.load(Ordering::SeqCst) >= expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {expected} callbacks, got {}", hits.load(Ordering::SeqCst));
    }

    #[test]
    fn runs_scheduled_tasks() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            dispatcher.schedule(
                Box::new(Counting {
                    hits: hits.clone(),
                    reschedule: None,
                }),
                Priority::Flusher,
                Duration::ZERO,
                false,
            );
        }

        wait_for(&hits, 3);
        dispatcher.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_drops_delayed_tasks() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.start();

        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.schedule(
            Box::new(Counting {
                hits: hits.clone(),
                reschedule: None,
            }),
            Priority::Flusher,
            Duration::ZERO,
            false,
        );
        wait_for(&hits, 1);

        dispatcher.schedule(
            Box::new(Counting {
                hits: hits.clone(),
                reschedule: None,
            }),
            Priority::Flusher,
            Duration::from_secs(30),
            false,
        );
        dispatcher.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_run_in_due_time_order() {
        let dispatcher = Dispatcher::new("test");
        let (tx, rx) = mpsc::channel();

        for (label, delay_ms) in [("late", 90u64), ("early", 10), ("middle", 50)] {
            dispatcher.schedule(
                Box::new(Labelled {
                    label,
                    tx: tx.clone(),
                }),
                Priority::Flusher,
                Duration::from_millis(delay_ms),
                false,
            );
        }
        dispatcher.start();

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("task ran"))
            .collect();
        dispatcher.stop();

        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn equal_due_times_break_ties_by_priority_then_submission() {
        fn task(run_at: Instant, priority: Priority, seq: u64) -> ScheduledTask {
            ScheduledTask {
                run_at,
                priority,
                seq,
                id: seq,
                may_reschedule: false,
                callback: Box::new(Counting {
                    hits: Arc::new(AtomicUsize::new(0)),
                    reschedule: None,
                }),
            }
        }

        let due = Instant::now();
        let mut heap = MinMaxHeap::new();
        heap.push(task(due, Priority::StateNotify, 0));
        heap.push(task(due, Priority::BgFetch, 1));
        heap.push(task(due, Priority::Flusher, 2));
        heap.push(task(due, Priority::BgFetch, 3));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop_min())
            .map(|t| (t.priority, t.seq))
            .collect();

        assert_eq!(
            order,
            vec![
                (Priority::BgFetch, 1),
                (Priority::BgFetch, 3),
                (Priority::Flusher, 2),
                (Priority::StateNotify, 0),
            ]
        );
    }

    #[test]
    fn delays_are_honored() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let scheduled_at = Instant::now();
        let delay = Duration::from_millis(80);

        dispatcher.schedule(
            Box::new(Counting {
                hits: hits.clone(),
                reschedule: None,
            }),
            Priority::Flusher,
            delay,
            false,
        );

        wait_for(&hits, 1);
        assert!(scheduled_at.elapsed() >= delay, "task ran before its delay");
        dispatcher.stop();
    }

    #[test]
    fn tasks_can_reschedule_themselves() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.start();

        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.schedule(
            Box::new(Counting {
                hits: hits.clone(),
                reschedule: Some(Duration::ZERO),
            }),
            Priority::Flusher,
            Duration::ZERO,
            true,
        );

        wait_for(&hits, 2);
        dispatcher.stop();
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn reschedule_is_refused_without_permission() {
        let dispatcher = Dispatcher::new("test");
        dispatcher.start();

        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.schedule(
            Box::new(Counting {
                hits: hits.clone(),
                reschedule: Some(Duration::ZERO),
            }),
            Priority::Flusher,
            Duration::ZERO,
            false,
        );

        wait_for(&hits, 1);
        std::thread::sleep(Duration::from_millis(30));
        dispatcher.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
