//! Explicit ownership of the concurrent stages of one signing run.
//!
//! A [`Pipeline`] spawns each stage on its own thread and owns the handles.
//! Stages report their final status on a channel; [`Pipeline::join`] blocks
//! on that channel (no polling) and cancels every remaining stage as soon
//! as one fails, then reaps all threads before returning.

use super::stream::{is_knock_on, CancelToken};
use super::{SignError, StageName};
use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// What a stage hands back when it completes successfully.
#[derive(Debug)]
pub enum StageOutput {
    Done,
    /// SHA-256 of the bytes the stage consumed.
    Digest(Vec<u8>),
    Signed {
        digest: Vec<u8>,
        signature: Vec<u8>,
    },
}

type StageStatus = (StageName, io::Result<StageOutput>);

pub struct Pipeline {
    handles: Vec<(StageName, JoinHandle<()>)>,
    status_tx: Option<Sender<StageStatus>>,
    status_rx: Receiver<StageStatus>,
    cancel: CancelToken,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        let (status_tx, status_rx) = channel();
        Self {
            handles: Vec::new(),
            status_tx: Some(status_tx),
            status_rx,
            cancel: CancelToken::default(),
        }
    }

    /// Token every stream of this pipeline must observe.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start `stage` on a dedicated thread.
    pub fn spawn<F>(&mut self, name: StageName, stage: F) -> Result<(), SignError>
    where
        F: FnOnce() -> io::Result<StageOutput> + Send + 'static,
    {
        let tx = self
            .status_tx
            .clone()
            .ok_or(SignError::StageSpawn {
                stage: name,
                source: io::Error::other("pipeline already joined"),
            })?;

        let handle = thread::Builder::new()
            .name(format!("tracedrop-{name}"))
            .spawn(move || {
                let result = stage();
                let _ = tx.send((name, result));
            })
            .map_err(|source| {
                self.kill_all();
                SignError::StageSpawn {
                    stage: name,
                    source,
                }
            })?;

        tracing::debug!(stage = %name, "pipeline stage started");
        self.handles.push((name, handle));
        Ok(())
    }

    /// Ask every stage to stop at its next read or write.
    pub fn kill_all(&self) {
        self.cancel.cancel();
    }

    /// Wait for every stage. Succeeds only if all stages succeeded.
    ///
    /// When several stages fail, the reported stage is the one whose error
    /// was not merely a consequence of a neighbour dying.
    pub fn join(mut self) -> Result<Vec<(StageName, StageOutput)>, SignError> {
        drop(self.status_tx.take());

        let mut outputs = Vec::with_capacity(self.handles.len());
        let mut failures: Vec<(StageName, io::Error)> = Vec::new();

        while let Ok((name, result)) = self.status_rx.recv() {
            match result {
                Ok(output) => {
                    tracing::debug!(stage = %name, "pipeline stage finished");
                    outputs.push((name, output));
                }
                Err(err) => {
                    if failures.is_empty() {
                        tracing::debug!(
                            stage = %name,
                            error = %err,
                            "stage failed, cancelling pipeline"
                        );
                        self.kill_all();
                    }
                    failures.push((name, err));
                }
            }
        }

        let mut panicked = None;
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() && panicked.is_none() {
                panicked = Some(name);
            }
        }

        if let Some(stage) = panicked {
            return Err(SignError::StagePanicked { stage });
        }

        if !failures.is_empty() {
            let root = failures
                .iter()
                .position(|(_, e)| !is_knock_on(e))
                .unwrap_or(0);
            let (stage, source) = failures.swap_remove(root);
            return Err(SignError::Stage { stage, source });
        }

        Ok(outputs)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Stages still running past an abandoned pipeline must wind down.
        if !self.handles.is_empty() {
            self.cancel.cancel();
        }
    }
}
