//! Timer and mainloop scheduler (§4.6): periodic callbacks with idempotent, blocking-safe
//! cancellation, plus a worker pool for one-off background work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Whether a recurring callback should keep running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerControl {
    Continue,
    Stop,
}

type TimerId = u64;
type Runner = Box<dyn FnMut() -> TimerControl + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    CancelRequested,
}

struct TimerEntry {
    key: u64,
    interval: Option<Duration>,
    next_fire: Instant,
    state: Arc<(Mutex<RunState>, Condvar)>,
}

/// Drives periodic callbacks. Each timer guarantees at most one in-flight callback at a time;
/// clearing a timer that is mid-callback blocks until the callback returns (§4.6).
///
/// The firing closures live in a table (`runners`) separate from the scheduling metadata
/// (`entries`): a firing timer is removed from `runners` and invoked without holding `entries`'
/// lock, so a callback that itself calls `set_timer` cannot deadlock against the driver thread.
pub struct TimerService {
    entries: Mutex<HashMap<TimerId, TimerEntry>>,
    runners: Mutex<HashMap<TimerId, Runner>>,
    next_id: AtomicU64,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        let service = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            driver: Mutex::new(None),
        });

        let weak = Arc::downgrade(&service);
        let shutdown = Arc::clone(&service.shutdown);
        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match weak.upgrade() {
                    Some(service) => service.drive_once(),
                    None => break,
                }
                thread::sleep(Duration::from_millis(10));
            }
        });
        *service.driver.lock().unwrap() = Some(handle);

        service
    }

    /// Schedules `cb(arg)` after `initial_delay`, then every `interval` while it returns
    /// `Continue`. `interval = 0` means one-shot. `key` allows selective cancellation via
    /// [`clear_timer`](Self::clear_timer).
    pub fn set_timer<T, F>(&self, mut cb: F, initial_delay: Duration, interval: Duration, arg: T, key: u64) -> u64
    where
        T: Send + 'static,
        F: FnMut(&mut T) -> TimerControl + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new((Mutex::new(RunState::Idle), Condvar::new()));
        let mut arg = arg;
        let state_for_cb = Arc::clone(&state);

        let runner: Runner = Box::new(move || {
            {
                let (lock, _cv) = &*state_for_cb;
                *lock.lock().unwrap() = RunState::Running;
            }

            let control = cb(&mut arg);

            let (lock, cv) = &*state_for_cb;
            let mut guard = lock.lock().unwrap();
            let cancel_requested = *guard == RunState::CancelRequested;
            *guard = RunState::Idle;
            drop(guard);
            cv.notify_all();

            if cancel_requested { TimerControl::Stop } else { control }
        });

        let interval_opt = if interval.is_zero() { None } else { Some(interval) };

        self.entries.lock().unwrap().insert(
            id,
            TimerEntry {
                key,
                interval: interval_opt,
                next_fire: Instant::now() + initial_delay,
                state,
            },
        );
        self.runners.lock().unwrap().insert(id, runner);

        id
    }

    /// Stops and removes every timer matching `key`. If a match is currently mid-callback, this
    /// blocks until it finishes; `cleanup` is then invoked once per removed timer.
    pub fn clear_timer(&self, key: u64, mut cleanup: impl FnMut()) {
        let ids: Vec<TimerId> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().filter(|(_, e)| e.key == key).map(|(id, _)| *id).collect()
        };

        for id in ids {
            self.cancel_one(id);
            cleanup();
        }
    }

    fn cancel_one(&self, id: TimerId) {
        let state = self.entries.lock().unwrap().remove(&id).map(|e| e.state);
        self.runners.lock().unwrap().remove(&id);

        if let Some(state) = state {
            let (lock, cv) = &*state;
            let mut guard = lock.lock().unwrap();
            if *guard == RunState::Running {
                *guard = RunState::CancelRequested;
                let _guard = cv.wait_while(guard, |s| *s != RunState::Idle).unwrap();
            }
        }
    }

    fn drive_once(&self) {
        let now = Instant::now();
        let due: Vec<TimerId> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().filter(|(_, e)| e.next_fire <= now).map(|(id, _)| *id).collect()
        };

        for id in due {
            let runner = self.runners.lock().unwrap().remove(&id);
            let Some(mut runner) = runner else { continue };

            let control = runner();

            match control {
                TimerControl::Continue => {
                    let mut entries = self.entries.lock().unwrap();
                    if let Some(entry) = entries.get_mut(&id) {
                        match entry.interval {
                            Some(interval) => {
                                entry.next_fire = Instant::now() + interval;
                                drop(entries);
                                self.runners.lock().unwrap().insert(id, runner);
                            }
                            None => {
                                entries.remove(&id);
                            }
                        }
                    }
                }
                TimerControl::Stop => {
                    self.entries.lock().unwrap().remove(&id);
                }
            }
        }
    }

    /// Enqueues work on the worker pool; each call spawns (or reuses) a worker thread.
    pub fn run_in_thread<F: FnOnce() + Send + 'static>(&self, cb: F) {
        let handle = thread::spawn(cb);
        self.workers.lock().unwrap().retain(|h| !h.is_finished());
        self.workers.lock().unwrap().push(handle);
    }

    /// Stops the driver thread. Does not wait for in-flight `run_in_thread` work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn one_shot_timer_fires_once() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_cb = Arc::clone(&count);

        svc.set_timer(
            move |_: &mut ()| {
                count_cb.fetch_add(1, Ordering::SeqCst);
                TimerControl::Stop
            },
            Duration::from_millis(5),
            Duration::from_millis(0),
            (),
            1,
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        svc.shutdown();
    }

    #[test]
    fn recurring_timer_fires_multiple_times_until_stopped() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_cb = Arc::clone(&count);

        svc.set_timer(
            move |_: &mut ()| {
                let n = count_cb.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 { TimerControl::Stop } else { TimerControl::Continue }
            },
            Duration::from_millis(5),
            Duration::from_millis(5),
            (),
            2,
        );

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        svc.shutdown();
    }

    #[test]
    fn clear_timer_by_key_prevents_further_firing() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_cb = Arc::clone(&count);

        svc.set_timer(
            move |_: &mut ()| {
                count_cb.fetch_add(1, Ordering::SeqCst);
                TimerControl::Continue
            },
            Duration::from_millis(200),
            Duration::from_millis(50),
            (),
            42,
        );

        svc.clear_timer(42, || {});
        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        svc.shutdown();
    }
}
