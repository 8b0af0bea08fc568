//! In-memory encoder used by pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EncodeHandle, EncodeRequest, Encoder, EncoderError, EncoderEvent, JobId};
use crate::renderer::Frame;

#[derive(Default)]
struct Stats {
    started: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    stopped: AtomicUsize,
    frames: AtomicUsize,
}

struct Current {
    job_id: JobId,
    events: mpsc::UnboundedSender<EncoderEvent>,
    alive: Arc<AtomicBool>,
}

/// Counts jobs and lets tests crash the running one
#[derive(Clone, Default)]
pub struct FakeEncoder {
    stats: Arc<Stats>,
    start_failures: Arc<Mutex<VecDeque<bool>>>,
    current: Arc<Mutex<Option<Current>>>,
    requests: Arc<Mutex<Vec<EncodeRequest>>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` starts fail
    pub fn fail_next_starts(&self, n: usize) {
        let mut queue = self.start_failures.lock().unwrap();
        for _ in 0..n {
            queue.push_back(true);
        }
    }

    /// Simulate the running process dying on its own
    pub fn crash_current(&self, diagnostic: &str) -> Option<JobId> {
        let current = self.current.lock().unwrap();
        let current = current.as_ref()?;
        current.alive.store(false, Ordering::SeqCst);
        let _ = current.events.send(EncoderEvent::Failed {
            job_id: current.job_id,
            diagnostic: diagnostic.to_string(),
        });
        Some(current.job_id)
    }

    pub fn started(&self) -> usize {
        self.stats.started.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.stats.max_live.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stats.stopped.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.stats.frames.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<EncodeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn start(
        &self,
        request: EncodeRequest,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> Result<Box<dyn EncodeHandle>, EncoderError> {
        self.stats.started.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let fail = self.start_failures.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            return Err(EncoderError::StartFailure("scripted start failure".into()));
        }

        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);

        let alive = Arc::new(AtomicBool::new(true));
        *self.current.lock().unwrap() = Some(Current {
            job_id: request.job_id,
            events: events.clone(),
            alive: alive.clone(),
        });
        let _ = events.send(EncoderEvent::Started {
            job_id: request.job_id,
        });

        Ok(Box::new(FakeHandle {
            job_id: request.job_id,
            stats: self.stats.clone(),
            events,
            alive,
            stopped: false,
        }))
    }
}

struct FakeHandle {
    job_id: JobId,
    stats: Arc<Stats>,
    events: mpsc::UnboundedSender<EncoderEvent>,
    alive: Arc<AtomicBool>,
    stopped: bool,
}

impl FakeHandle {
    fn release(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.alive.store(false, Ordering::SeqCst);
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
            self.stats.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EncodeHandle for FakeHandle {
    async fn write_frame(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
        if !self.is_open() {
            return Err(EncoderError::PipeClosed);
        }
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.stopped && self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        let crashed = !self.alive.load(Ordering::SeqCst);
        self.release();
        if !crashed {
            let _ = self.events.send(EncoderEvent::Ended {
                job_id: self.job_id,
            });
        }
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.release();
    }
}
