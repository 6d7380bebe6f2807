//! Background workers draining the registry
//!
//! One task per concern: the periodic sweep, persistence (calls,
//! registrations and circuits), audio hand-off, file bookkeeping, and a
//! blocking delete worker that destroys sessions once their outstanding work
//! has drained. All of them stop on the shared [`CancellationToken`]; the
//! hand-off tasks flush what is already queued before exiting.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::call::CallHandle;
use crate::calltable::Calltable;
use crate::config::SelectionConfig;
use crate::logging::session_span;
use crate::persist::{
    AudioJob, AudioSink, FileSink, PersistRecord, PersistSink, serialize_circuit, serialize_for_persist,
};

/// Consumers the workers hand finalized sessions to
#[derive(Clone)]
pub struct CalltableSinks {
    pub persist: Arc<dyn PersistSink>,
    pub audio: Option<Arc<dyn AudioSink>>,
    pub files: Option<Arc<dyn FileSink>>,
}

impl CalltableSinks {
    pub fn new(persist: Arc<dyn PersistSink>) -> Self {
        Self {
            persist,
            audio: None,
            files: None,
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioSink>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileSink>) -> Self {
        self.files = Some(files);
        self
    }
}

pub struct CalltableWorkers {
    calltable: Arc<Calltable>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl CalltableWorkers {
    /// Start all workers on the current tokio runtime
    pub fn spawn(calltable: Arc<Calltable>, sinks: CalltableSinks) -> Self {
        let cancel = CancellationToken::new();
        let tasks = vec![
            ("sweep", tokio::spawn(sweep_loop(Arc::clone(&calltable), cancel.clone()))),
            (
                "persist",
                tokio::spawn(persist_loop(Arc::clone(&calltable), Arc::clone(&sinks.persist), cancel.clone())),
            ),
            ("audio", tokio::spawn(audio_loop(Arc::clone(&calltable), sinks.audio.clone(), cancel.clone()))),
            ("files", tokio::spawn(file_loop(Arc::clone(&calltable), sinks.files.clone(), cancel.clone()))),
            ("delete", spawn_delete_worker(Arc::clone(&calltable), cancel.clone())),
        ];
        info!(workers = tasks.len(), "Calltable workers started");
        Self {
            calltable,
            cancel,
            tasks,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every worker and wait for it, then destroy whatever became
    /// destroyable during the final flush
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(worker = name, error = %e, "Worker ended abnormally");
            }
        }
        let calltable = self.calltable;
        match tokio::task::spawn_blocking(move || calltable.destroy_ready()).await {
            Ok(destroyed) => info!(destroyed, "Calltable workers stopped"),
            Err(e) => warn!(error = %e, "Final destroy pass failed"),
        }
    }
}

async fn sweep_loop(calltable: Arc<Calltable>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(calltable.config().workers.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = calltable.capture_now();
                if now == 0 {
                    continue;
                }
                let calls = calltable.sweep(now);
                let registrations = calltable.sweep_registrations(now);
                let circuits = calltable.sweep_circuits(now);
                if calls + registrations + circuits > 0 {
                    debug!(now, calls, registrations, circuits, "Sweep pass");
                }
            }
        }
    }
}

async fn save(sink: &Arc<dyn PersistSink>, record: PersistRecord) {
    let serial = record.serial();
    if let Err(e) = sink.save(record).await {
        error!(serial, error = %e, "Persist sink failed");
    }
}

async fn save_call(sink: &Arc<dyn PersistSink>, call: CallHandle, selection: &SelectionConfig) {
    let span = session_span(&call);
    let record = serialize_for_persist(&call, selection);
    drop(call);
    save(sink, record).instrument(span).await;
}

async fn convert(sink: &Arc<dyn AudioSink>, job: AudioJob) {
    let span = session_span(&job.call);
    async move {
        if let Err(e) = sink.convert(job).await {
            error!(error = %e, "Audio sink failed");
        }
    }
    .instrument(span)
    .await;
}

async fn persist_loop(calltable: Arc<Calltable>, sink: Arc<dyn PersistSink>, cancel: CancellationToken) {
    let selection = calltable.config().selection.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            call = calltable.persist_queue().recv() => save_call(&sink, call, &selection).await,
            call = calltable.registration_persist_queue().recv() => save_call(&sink, call, &selection).await,
            circuit = calltable.circuit_queue().recv() => {
                save(&sink, serialize_circuit(&circuit)).await;
            }
        }
    }

    for call in calltable.persist_queue().drain() {
        save_call(&sink, call, &selection).await;
    }
    for call in calltable.registration_persist_queue().drain() {
        save_call(&sink, call, &selection).await;
    }
    for circuit in calltable.circuit_queue().drain() {
        save(&sink, serialize_circuit(&circuit)).await;
    }
}

async fn audio_loop(calltable: Arc<Calltable>, sink: Option<Arc<dyn AudioSink>>, cancel: CancellationToken) {
    let queue = calltable.audio_queue();
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.recv() => job,
        };
        match &sink {
            Some(sink) => convert(sink, job).await,
            None => debug!(call_id = ?job.call.call_id(), "No audio sink, job discarded"),
        }
    }

    for job in queue.drain() {
        if let Some(sink) = &sink {
            convert(sink, job).await;
        }
    }
}

async fn file_loop(calltable: Arc<Calltable>, sink: Option<Arc<dyn FileSink>>, cancel: CancellationToken) {
    let queue = calltable.file_queue();
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.recv() => job,
        };
        if let Some(sink) = &sink {
            if let Err(e) = sink.record(job).await {
                error!(error = %e, "File sink failed");
            }
        }
    }

    for job in queue.drain() {
        if let Some(sink) = &sink {
            if let Err(e) = sink.record(job).await {
                error!(error = %e, "File sink failed");
            }
        }
    }
}

fn spawn_delete_worker(calltable: Arc<Calltable>, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = calltable.config().workers.drain_interval();
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            let destroyed = calltable.destroy_ready();
            if destroyed > 0 {
                debug!(destroyed, "Delete pass");
            }
            std::thread::sleep(interval);
        }
    })
}
