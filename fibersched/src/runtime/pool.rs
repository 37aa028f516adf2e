use crate::error::SchedulerError;
use crate::runtime::Runnable;
use crate::runtime::context::{self, init_worker_context};
use crate::runtime::scheduler::Shared;
use crate::runtime::worker::Worker;
use crate::sync::{Event, ResetMode};
use crate::utils::ScopeGuard;
use anyhow::{Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread;

/// Worker threads of a scheduler.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns one thread per local queue. Workers only enter their loop once
    /// every thread was spawned. If a spawn fails, the threads already
    /// started are stopped and joined.
    pub(super) fn spawn(
        shared: &Arc<Shared>,
        local_queues: Vec<CbWorker<Runnable>>,
    ) -> Result<Self, SchedulerError> {
        let start = Arc::new(Event::new(ResetMode::Manual));
        let mut handles = Vec::with_capacity(local_queues.len());

        for (index, local_queue) in local_queues.into_iter().enumerate() {
            match spawn_worker_thread(index, Arc::clone(shared), local_queue, Arc::clone(&start)) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    shared.stop();
                    start.signal();

                    let pool = Self {
                        handles: Mutex::new(handles),
                    };
                    if let Err(e) = pool.join_all() {
                        tracing::error!(error = ?e, "failed to join workers after spawn failure");
                    }

                    return Err(SchedulerError::SpawnWorker { index, source });
                }
            }
        }

        shared.listen(|l| l.on_threads_created(handles.len()));

        // Spawning threads is async, release them together.
        start.signal();

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter_map(|handle| {
                let name = handle.thread().name().map(str::to_owned);
                handle.join().err().map(|_| name)
            })
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked: {:?}", errors.len(), errors))
        }
    }
}

fn spawn_worker_thread(
    index: usize,
    shared: Arc<Shared>,
    local_queue: CbWorker<Runnable>,
    start: Arc<Event>,
) -> io::Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new();

    if let Some(stack_size) = shared.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .name(shared.cfg.thread_name.0())
        .spawn(move || {
            // A panic escaping the scheduling loop leaves suspended fibers
            // and group counters in an unknown state.
            let _abort = ScopeGuard::new(move || {
                if thread::panicking() {
                    tracing::error!(worker = index, "worker thread panicked, aborting");
                    std::process::abort();
                }
            });

            if shared.cfg.pin_workers {
                pin_current_thread(index);
            }

            init_worker_context(Worker::new(index, shared, local_queue));
            start.wait();

            context::expect_worker(|worker| worker.run());
        })
}

fn pin_current_thread(index: usize) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        tracing::warn!(worker = index, "no core ids available, worker not pinned");
        return;
    };

    let core = cores[index % cores.len()];
    if core_affinity::set_for_current(core) {
        tracing::debug!(worker = index, core = core.id, "worker pinned");
    } else {
        tracing::warn!(worker = index, core = core.id, "failed to pin worker");
    }
}
