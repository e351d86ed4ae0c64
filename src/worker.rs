use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Mutex, PoisonError},
    thread::JoinHandle,
};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A background thread running jobs one at a time, in submission order.
///
/// Used for work that must not block the host's calling thread: fetching test data and uploading
/// logs.
pub(crate) struct Worker {
    /// `None` once the worker has been shut down.
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn start() -> std::io::Result<Worker> {
        let (sender, receiver) = mpsc::channel::<Job>();

        let join_handle = std::thread::Builder::new()
            .name("clutch-worker".to_owned())
            .spawn(move || {
                log::debug!(target: "clutch", "worker started");
                // Exits once every sender is dropped and the queue is drained.
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::warn!(target: "clutch", "worker job panicked");
                    }
                }
                log::debug!(target: "clutch", "worker stopped");
            })?;

        Ok(Worker {
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Queue `job`. Returns `false` if the worker has been shut down and the job was dropped.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => {
                log::warn!(target: "clutch", "worker is shut down, dropping job");
                false
            }
        }
    }

    /// Stop accepting jobs, run the queued ones and wait for the thread to exit.
    pub(crate) fn shutdown(&self) -> Result<()> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let join_handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join_handle) = join_handle {
            // Jobs are run under catch_unwind, so the thread itself never panics.
            join_handle.join().map_err(|_| Error::SyncPanicked)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    use super::Worker;

    #[test]
    fn runs_jobs_in_order() {
        let worker = Worker::start().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            assert!(worker.execute(move || seen.lock().unwrap().push(i)));
        }
        worker.shutdown().unwrap();
        assert_eq!(*seen.lock().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn survives_panicking_job() {
        let worker = Worker::start().unwrap();
        let (sender, receiver) = mpsc::channel();

        worker.execute(|| panic!("job failure"));
        worker.execute(move || sender.send("still running").unwrap());

        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            "still running"
        );
        worker.shutdown().unwrap();
    }

    #[test]
    fn drops_jobs_after_shutdown() {
        let worker = Worker::start().unwrap();
        worker.shutdown().unwrap();
        assert!(!worker.execute(|| {}));
        // Shutting down twice is fine.
        worker.shutdown().unwrap();
    }
}
