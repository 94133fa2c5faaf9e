//! Integration tests for the tasklet scheduler: fairness, priority bands,
//! timed and signalled suspension, removal, and failure isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use offload::tasklet::{NewTasklet, Signal, Step, TaskletScheduler, Tick, from_fn};
use offload::{Error, SchedulerConfig, TaskletState, Work, WorkQueue, WorkQueueConfig};

fn scheduler() -> TaskletScheduler {
    TaskletScheduler::new(SchedulerConfig::default())
}

/// A tasklet that yields forever, counting its resumptions.
fn counting_yielder(counter: Arc<AtomicUsize>) -> NewTasklet {
    NewTasklet::new(from_fn(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(Step::Yield)
    }))
}

// ---------------------------------------------------------------------------
// Fairness and priority
// ---------------------------------------------------------------------------

#[test]
fn equal_priority_tasklets_round_robin() {
    let sched = scheduler();
    let counters: Vec<Arc<AtomicUsize>> = (0..3)
        .map(|_| Arc::new(AtomicUsize::new(0)))
        .collect();

    for counter in &counters {
        sched.register(counting_yielder(Arc::clone(counter))).unwrap();
    }

    // One full round: every tasklet resumed exactly once.
    for _ in 0..counters.len() {
        assert!(matches!(sched.run_once(None), Ok(Tick::Stepped(_))));
    }
    for counter in &counters {
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    // Two more rounds stay fair.
    for _ in 0..counters.len() * 2 {
        sched.run_once(None).unwrap();
    }
    for counter in &counters {
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}

#[test]
fn higher_band_resumes_first() {
    let sched = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (band, tag) in [(0u8, "low"), (3, "high"), (1, "mid")] {
        let order = Arc::clone(&order);
        sched
            .register(
                NewTasklet::new(from_fn(move || {
                    order.lock().unwrap().push(tag);
                    Ok(Step::Done)
                }))
                .priority(band),
            )
            .unwrap();
    }

    for _ in 0..3 {
        sched.run_once(None).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    assert_eq!(sched.tasklet_count(), 0);
}

#[test]
fn out_of_range_band_is_rejected_synchronously() {
    let sched = TaskletScheduler::new(SchedulerConfig {
        priority_levels: 2,
        ..SchedulerConfig::default()
    });
    let result = sched.register(NewTasklet::new(from_fn(|| Ok(Step::Done))).priority(2));
    assert!(matches!(
        result,
        Err(Error::InvalidPriority { band: 2, levels: 2 })
    ));
}

// ---------------------------------------------------------------------------
// Suspension: timers and signals
// ---------------------------------------------------------------------------

#[test]
fn sleeping_tasklet_resumes_after_its_deadline() {
    let sched = scheduler();
    let phase = Arc::new(AtomicUsize::new(0));

    let state = Arc::clone(&phase);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            match state.fetch_add(1, Ordering::Relaxed) {
                0 => Ok(Step::Sleep(Duration::from_millis(40))),
                _ => Ok(Step::Done),
            }
        })))
        .unwrap();

    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert_eq!(sched.status(id), Some(TaskletState::Suspended));

    let start = Instant::now();
    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(sched.status(id), None);
}

#[test]
fn signalled_tasklet_wakes_on_notify() {
    let sched = scheduler();
    let signal = Signal::new();
    let resumed = Arc::new(AtomicUsize::new(0));

    let waiter_signal = signal.clone();
    let count = Arc::clone(&resumed);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            match count.fetch_add(1, Ordering::Relaxed) {
                0 => Ok(Step::Wait(waiter_signal.clone())),
                _ => Ok(Step::Done),
            }
        })))
        .unwrap();

    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert_eq!(sched.status(id), Some(TaskletState::Suspended));

    // Nothing ready: a bounded turn reports idle, normally, and no
    // earlier than its timeout.
    let idle_wait = Duration::from_millis(10);
    let start = Instant::now();
    assert_eq!(sched.run_once(Some(idle_wait)).unwrap(), Tick::Idle);
    assert!(start.elapsed() >= idle_wait);
    // Bounded slack: generous to absorb scheduler jitter.
    assert!(start.elapsed() < idle_wait + Duration::from_secs(2));

    let notifier = {
        let signal = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal.notify();
        })
    };
    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    notifier.join().unwrap();
    assert_eq!(resumed.load(Ordering::Relaxed), 2);
}

#[test]
fn banked_permit_skips_suspension() {
    let sched = scheduler();
    let signal = Signal::new();
    signal.notify(); // permit banked before anyone waits

    let waiter_signal = signal.clone();
    let steps = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&steps);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            match count.fetch_add(1, Ordering::Relaxed) {
                0 => Ok(Step::Wait(waiter_signal.clone())),
                _ => Ok(Step::Done),
            }
        })))
        .unwrap();

    sched.run_once(None).unwrap();
    // Permit consumed: still ready, no suspension.
    assert_eq!(sched.status(id), Some(TaskletState::Ready));
    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert_eq!(sched.status(id), None);
}

#[test]
fn wait_with_timeout_resumes_without_notify() {
    let sched = scheduler();
    let signal = Signal::new();

    let waiter_signal = signal.clone();
    let steps = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&steps);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            match count.fetch_add(1, Ordering::Relaxed) {
                0 => Ok(Step::WaitTimeout(
                    waiter_signal.clone(),
                    Duration::from_millis(30),
                )),
                _ => Ok(Step::Done),
            }
        })))
        .unwrap();

    sched.run_once(None).unwrap();
    let start = Instant::now();
    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert!(start.elapsed() >= Duration::from_millis(30));

    // The timed-out registration is gone: a later notify banks a permit
    // instead of waking anything.
    signal.notify();
    assert_eq!(sched.status(id), None);
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

#[test]
fn remove_ready_tasklet_is_immediate() {
    let sched = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    let id = sched.register(counting_yielder(Arc::clone(&counter))).unwrap();

    sched.remove(id).unwrap();
    assert_eq!(sched.tasklet_count(), 0);
    assert!(matches!(sched.remove(id), Err(Error::UnknownTasklet(_))));

    // Nothing left to run.
    assert_eq!(
        sched.run_once(Some(Duration::from_millis(5))).unwrap(),
        Tick::Idle
    );
    assert_eq!(counter.load(Ordering::Relaxed), 0);
}

#[test]
fn remove_while_running_is_deferred_to_the_yield_point() {
    let sched = scheduler();
    let own_id = Arc::new(Mutex::new(None));
    let steps = Arc::new(AtomicUsize::new(0));

    let remover = sched.clone();
    let id_cell = Arc::clone(&own_id);
    let count = Arc::clone(&steps);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            count.fetch_add(1, Ordering::Relaxed);
            // Mid-segment self-removal: must be deferred, not applied here.
            let id = id_cell.lock().unwrap().unwrap();
            remover.remove(id).unwrap();
            Ok(Step::Yield)
        })))
        .unwrap();
    *own_id.lock().unwrap() = Some(id);

    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert_eq!(sched.tasklet_count(), 0);
    assert_eq!(steps.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[test]
fn failing_segment_reports_to_sink_and_spares_the_rest() {
    let sched = scheduler();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let survivor = Arc::new(AtomicUsize::new(0));

    let sink_errors = Arc::clone(&errors);
    let failing = sched
        .register(
            NewTasklet::new(from_fn(|| Err("segment failure".into())))
                .on_error(move |id, err| {
                    sink_errors.lock().unwrap().push((id, err.to_string()));
                }),
        )
        .unwrap();
    sched.register(counting_yielder(Arc::clone(&survivor))).unwrap();

    sched.run_once(None).unwrap();
    sched.run_once(None).unwrap();

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, failing);
    assert!(errors[0].1.contains("segment failure"));
    assert_eq!(sched.status(failing), None);
    assert_eq!(survivor.load(Ordering::Relaxed), 1);
}

#[test]
fn panicking_segment_does_not_kill_the_host() {
    let sched = scheduler();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let survivor = Arc::new(AtomicUsize::new(0));

    let sink_errors = Arc::clone(&errors);
    sched
        .register(
            NewTasklet::new(from_fn(|| -> Result<Step, offload::BoxError> {
                panic!("segment panic")
            }))
            .on_error(move |_, err| {
                sink_errors.lock().unwrap().push(err.to_string());
            }),
        )
        .unwrap();
    sched.register(counting_yielder(Arc::clone(&survivor))).unwrap();

    sched.run_once(None).unwrap();
    sched.run_once(None).unwrap();

    assert!(errors.lock().unwrap()[0].contains("segment panic"));
    assert_eq!(survivor.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Hosting
// ---------------------------------------------------------------------------

#[test]
fn run_forever_hosts_until_shutdown() {
    let sched = scheduler();
    let ticks = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&ticks);
    sched
        .register(NewTasklet::new(from_fn(move || {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(Step::Sleep(Duration::from_millis(2)))
        })))
        .unwrap();

    let host = {
        let sched = sched.clone();
        std::thread::spawn(move || sched.run_forever())
    };

    while ticks.load(Ordering::Relaxed) < 3 {
        std::thread::sleep(Duration::from_millis(5));
    }
    // A second host is refused while the first is live.
    assert!(matches!(sched.run_forever(), Err(Error::AlreadyStarted)));

    sched.shutdown();
    host.join().unwrap().unwrap();
    assert!(ticks.load(Ordering::Relaxed) >= 3);

    // Registrations after shutdown are rejected.
    assert!(matches!(
        sched.register(NewTasklet::new(from_fn(|| Ok(Step::Done)))),
        Err(Error::QueueClosed)
    ));
}

#[test]
fn concurrent_turn_is_refused_and_removal_stays_deferred() {
    let sched = scheduler();
    let gate = Arc::new(Barrier::new(2));
    let steps = Arc::new(AtomicUsize::new(0));

    let entered = Arc::clone(&gate);
    let count = Arc::clone(&steps);
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            count.fetch_add(1, Ordering::Relaxed);
            entered.wait();
            std::thread::sleep(Duration::from_millis(100));
            Ok(Step::Yield)
        })))
        .unwrap();

    let host = {
        let sched = sched.clone();
        std::thread::spawn(move || sched.run_once(None))
    };
    gate.wait();

    // Mid-segment on another thread: the host slot is taken.
    assert!(matches!(
        sched.run_once(Some(Duration::from_millis(5))),
        Err(Error::AlreadyStarted)
    ));

    // Removal lands at the yield point, not here; the tasklet stays
    // visibly running until its segment ends.
    sched.remove(id).unwrap();
    assert_eq!(sched.status(id), Some(TaskletState::Running));

    assert_eq!(host.join().unwrap().unwrap(), Tick::Stepped(id));
    assert_eq!(sched.status(id), None);
    assert_eq!(sched.tasklet_count(), 0);
    assert_eq!(steps.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------------------
// Peer composition with the work queue
// ---------------------------------------------------------------------------

#[test]
fn tasklet_offloads_to_work_queue_and_wakes_on_completion() {
    let queue = Arc::new(WorkQueue::new(WorkQueueConfig::single_worker()));
    queue.start().unwrap();

    let sched = scheduler();
    let signal = Signal::new();
    let result = Arc::new(AtomicUsize::new(0));

    let offload_queue = Arc::clone(&queue);
    let wake = signal.clone();
    let wait = signal.clone();
    let output = Arc::clone(&result);
    let phase = Arc::new(AtomicUsize::new(0));
    let id = sched
        .register(NewTasklet::new(from_fn(move || {
            match phase.fetch_add(1, Ordering::Relaxed) {
                0 => {
                    // Offload a slow computation; its completion sink
                    // fires the signal that resumes this tasklet.
                    let output = Arc::clone(&output);
                    let wake = wake.clone();
                    offload_queue.submit(
                        Work::from_fn(move || {
                            output.store(42, Ordering::Relaxed);
                        })
                        .on_complete(move |_, _| wake.notify()),
                    )?;
                    Ok(Step::Wait(wait.clone()))
                }
                _ => Ok(Step::Done),
            }
        })))
        .unwrap();

    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    // Blocks until the worker's completion sink notifies the signal.
    assert_eq!(sched.run_once(None).unwrap(), Tick::Stepped(id));
    assert_eq!(result.load(Ordering::Relaxed), 42);

    queue.stop(true);
}
