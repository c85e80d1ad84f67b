//! Thread affinity
//!
//! Phases that need single-threaded-apartment semantics are marshalled onto
//! one long-lived thread per owning fixture. The thread runs a message pump
//! and exits once every handle to it is dropped.
//!
//! A pump stuck in an abandoned phase is retired: a replacement thread takes
//! over the same queue, and the stuck one exits once its job returns.

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;
type Queue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

thread_local! {
    static ON_APARTMENT: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is an apartment pump
pub fn on_apartment_thread() -> bool {
    ON_APARTMENT.with(Cell::get)
}

struct Pump {
    thread_id: ThreadId,
    retired: Arc<AtomicBool>,
}

impl Pump {
    fn start(name: &str, queue: Queue) -> std::io::Result<Self> {
        let retired = Arc::new(AtomicBool::new(false));
        let flag = retired.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            ON_APARTMENT.with(|on| on.set(true));
            while !flag.load(Ordering::Acquire) {
                // The queue lock is only held while waiting, never while a
                // job runs, so a replacement pump can take over.
                let next = queue.lock().blocking_recv();
                match next {
                    Some(job) => job(),
                    None => break,
                }
            }
            debug!("Apartment thread {} exiting", thread_name);
        })?;

        Ok(Self {
            thread_id: handle.thread().id(),
            retired,
        })
    }
}

/// A dedicated thread with a message pump
pub struct ApartmentThread {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    queue: Queue,
    pump: Mutex<Pump>,
}

impl ApartmentThread {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let queue: Queue = Arc::new(Mutex::new(receiver));
        let pump = Pump::start(&name, queue.clone())?;

        debug!("Started apartment thread {}", name);
        Ok(Self {
            name,
            sender,
            queue,
            pump: Mutex::new(pump),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread currently pumping this apartment
    pub fn thread_id(&self) -> ThreadId {
        self.pump.lock().thread_id
    }

    /// Hand the queue to a fresh thread. The current pump finishes the job
    /// it is running, if any, and then exits.
    pub fn retire(&self) -> std::io::Result<()> {
        let mut pump = self.pump.lock();
        let replacement = Pump::start(&self.name, self.queue.clone())?;
        pump.retired.store(true, Ordering::Release);
        warn!(
            "Apartment thread {} retired after an abandoned phase",
            self.name
        );
        *pump = replacement;
        Ok(())
    }

    /// Queue `job` on the pump; the receiver yields its result
    pub fn submit<F, T>(&self, job: F) -> Option<oneshot::Receiver<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let _ = tx.send(job());
        });
        self.sender.send(wrapped).ok().map(|_| rx)
    }
}

/// Lazily creates one apartment thread per owner
#[derive(Default)]
pub struct ApartmentController {
    threads: Mutex<HashMap<String, Arc<ApartmentThread>>>,
}

impl ApartmentController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apartment thread for `owner`, started on first use
    pub fn get_or_spawn(&self, owner: &str) -> std::io::Result<Arc<ApartmentThread>> {
        let mut threads = self.threads.lock();
        if let Some(thread) = threads.get(owner) {
            return Ok(thread.clone());
        }
        let thread = Arc::new(ApartmentThread::spawn(format!("unitrun-sta-{owner}"))?);
        threads.insert(owner.to_string(), thread.clone());
        Ok(thread)
    }

    /// Drop the controller's handle. The pump is not joined: it drains the
    /// jobs already queued and exits when the last handle goes away.
    pub fn release(&self, owner: &str) {
        if self.threads.lock().remove(owner).is_some() {
            debug!("Released apartment for {}", owner);
        }
    }

    pub fn active(&self) -> usize {
        self.threads.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_run_on_the_same_dedicated_thread() {
        let apartment = ApartmentThread::spawn("unitrun-sta-test").unwrap();

        let first = apartment
            .submit(|| (thread::current().id(), on_apartment_thread()))
            .unwrap()
            .await
            .unwrap();
        let second = apartment
            .submit(|| thread::current().name().map(str::to_string))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(first.0, apartment.thread_id());
        assert!(first.1);
        assert_eq!(second.as_deref(), Some("unitrun-sta-test"));
        assert!(!on_apartment_thread());
    }

    #[tokio::test]
    async fn test_controller_reuses_thread_per_owner() {
        let controller = ApartmentController::new();
        let a1 = controller.get_or_spawn("A").unwrap();
        let a2 = controller.get_or_spawn("A").unwrap();
        let b = controller.get_or_spawn("B").unwrap();

        assert_eq!(a1.thread_id(), a2.thread_id());
        assert_ne!(a1.thread_id(), b.thread_id());
        assert_eq!(controller.active(), 2);

        controller.release("A");
        assert_eq!(controller.active(), 1);

        // Outstanding handles keep the pump alive.
        let value = a1.submit(|| 7).unwrap().await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_retired_pump_does_not_block_queued_jobs() {
        let apartment = ApartmentThread::spawn("unitrun-sta-stuck").unwrap();
        let stuck_on = apartment.thread_id();

        let (started, running) = oneshot::channel::<()>();
        let (release, hold) = std::sync::mpsc::channel::<()>();
        let stuck = apartment
            .submit(move || {
                let _ = started.send(());
                let _ = hold.recv();
            })
            .unwrap();
        running.await.unwrap();
        apartment.retire().unwrap();

        let next = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            apartment.submit(|| (thread::current().id(), on_apartment_thread())).unwrap(),
        )
        .await
        .expect("queued job waited for the stuck one")
        .unwrap();

        assert_ne!(next.0, stuck_on);
        assert_eq!(next.0, apartment.thread_id());
        assert!(next.1);

        release.send(()).unwrap();
        stuck.await.unwrap();
    }
}
