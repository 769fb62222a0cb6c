//! Deferred-work facility.
//!
//! A single worker thread draining queued jobs. The transmit pump uses it to
//! hop from interrupt level to thread context: pumping the FIFO may wake
//! blocked writers, which is not legal work for an interrupt handler.

use std::sync::mpsc;
use std::thread;

use crate::error::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkQueue {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn the worker thread. `name` shows up in thread listings.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("spawn work queue thread");
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Queue a job for execution on the worker thread.
    pub fn queue(&self, job: Job) -> Result<(), Error> {
        self.sender
            .as_ref()
            .ok_or(Error::Io)?
            .send(job)
            .map_err(|_| Error::Io)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop. A job that ends up
        // dropping the queue itself must not join its own thread.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
