use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::Sender;
use penelope_backend::delivery::{Cue, Downstream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Cue(Cue),
    Utterance(String),
}

/// Output worker standing in for a speech pipeline.
///
/// Utterances are delivered on a background thread at a fixed pace per
/// character; while one is being delivered the console reports itself busy.
pub struct Console {
    tx: Option<Sender<Output>>,
    busy: Arc<AtomicBool>,
    outstanding: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl Console {
    pub fn spawn(pace: Duration) -> Self {
        let (tx, rx) = flume::unbounded::<Output>();
        let busy = Arc::new(AtomicBool::new(false));
        let outstanding = Arc::new(AtomicUsize::new(0));

        let worker_busy = busy.clone();
        let worker_outstanding = outstanding.clone();
        let worker = std::thread::spawn(move || {
            for output in rx.iter() {
                match output {
                    Output::Cue(cue) => tracing::trace!("Cue: {:?}", cue),
                    Output::Utterance(text) => {
                        worker_busy.store(true, Ordering::SeqCst);
                        tracing::debug!("Utterance: {}", text.trim());
                        if !pace.is_zero() {
                            let chars = text.chars().count() as u32;
                            std::thread::sleep(pace * chars);
                        }
                        worker_busy.store(false, Ordering::SeqCst);
                    }
                }
                worker_outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            tx: Some(tx),
            busy,
            outstanding,
            worker: Some(worker),
        }
    }

    pub fn send(&self, output: Output) {
        let Some(tx) = &self.tx else {
            return;
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if tx.send(output).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Output worker is gone; dropping output");
        }
    }

    /// Block until everything sent so far has been delivered.
    pub fn drain(&self) {
        while self.outstanding.load(Ordering::SeqCst) > 0 {
            if self.worker.as_ref().map_or(true, |w| w.is_finished()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Downstream for Console {
    fn queue_depth(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Output worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_queued_utterances() {
        let console = Console::spawn(Duration::from_millis(1));
        console.send(Output::Utterance("Hello there.".to_string()));
        console.send(Output::Cue(Cue::GentleThought));
        console.send(Output::Utterance("How are you?".to_string()));
        console.drain();
        assert_eq!(console.queue_depth(), 0);
        assert!(!console.is_busy());
    }

    #[test]
    fn idle_console_is_not_busy() {
        let console = Console::spawn(Duration::ZERO);
        assert!(!console.is_busy());
        assert_eq!(console.queue_depth(), 0);
    }
}
