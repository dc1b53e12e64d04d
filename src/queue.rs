//! Cola de trabajos de ingesta con entrega al-menos-una-vez.
//!
//! Un worker reclama un trabajo y recibe una `Delivery` con un lease. Si no
//! confirma (`complete` / `fail`) antes de que venza, el reaper lo devuelve a
//! la cola y otro worker lo recibe. Las confirmaciones de entregas ya
//! superadas se ignoran.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RagError;
use crate::models::{IngestionJob, JobFailure, JobId, JobStatus};

/// Un trabajo entregado a un worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: IngestionJob,
    /// Número de entrega; identifica el lease vigente.
    pub delivery: u32,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct Lease {
    delivery: u32,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entry {
    job: IngestionJob,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    pending: VecDeque<JobId>,
    /// Trabajos completados, del más antiguo al más reciente.
    completed: VecDeque<JobId>,
}

/// Registros de trabajos completados que se conservan por defecto.
pub const DEFAULT_KEEP_COMPLETED: usize = 1000;

#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
    lease: Duration,
    max_deliveries: u32,
    keep_completed: usize,
}

impl JobQueue {
    pub fn new(lease: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            lease,
            max_deliveries: max_deliveries.max(1),
            keep_completed: DEFAULT_KEEP_COMPLETED,
        }
    }

    /// Número máximo de trabajos completados que se recuerdan. Los fallidos
    /// se conservan siempre para poder inspeccionar el motivo.
    pub fn with_completed_retention(mut self, keep_completed: usize) -> Self {
        self.keep_completed = keep_completed;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encola un trabajo y devuelve su id. No toca el documento.
    pub fn submit(&self, location: impl Into<PathBuf>, media_type: Option<String>) -> JobId {
        let now = Utc::now();
        let job = IngestionJob {
            id: Uuid::new_v4(),
            location: location.into(),
            media_type,
            status: JobStatus::Queued,
            failure: None,
            deliveries: 0,
            chunks_indexed: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        info!(job_id = %id, location = %job.location.display(), "Trabajo encolado");

        {
            let mut state = self.state();
            state.jobs.insert(id, Entry { job, lease: None });
            state.pending.push_back(id);
        }
        self.notify.notify_one();
        id
    }

    /// Espera hasta que haya un trabajo disponible. `None` tras `close()`.
    pub async fn claim(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(delivery) = self.try_claim() {
                return Some(delivery);
            }
            notified.await;
        }
    }

    /// Reclama el siguiente trabajo pendiente sin esperar.
    pub fn try_claim(&self) -> Option<Delivery> {
        let mut state = self.state();
        while let Some(id) = state.pending.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            if entry.job.status != JobStatus::Queued {
                continue;
            }
            if entry.job.deliveries >= self.max_deliveries {
                // Un trabajo que tumba a todos los workers no se reparte sin fin.
                let message = format!("se superaron {} entregas sin confirmación", self.max_deliveries);
                error!(job_id = %id, "{message}");
                entry.job.status = JobStatus::Failed;
                entry.job.failure = Some(JobFailure { kind: "internal".into(), message });
                entry.job.updated_at = Utc::now();
                continue;
            }

            entry.job.deliveries += 1;
            entry.job.status = JobStatus::Running;
            entry.job.updated_at = Utc::now();
            entry.lease = Some(Lease {
                delivery: entry.job.deliveries,
                expires_at: Instant::now() + self.lease,
            });
            return Some(Delivery { job: entry.job.clone(), delivery: entry.job.deliveries });
        }
        None
    }

    /// Devuelve la entrada si la entrega sigue siendo la vigente.
    fn current<'a>(state: &'a mut State, delivery: &Delivery) -> Option<&'a mut Entry> {
        let entry = state.jobs.get_mut(&delivery.job.id)?;
        let is_current = entry.job.status == JobStatus::Running
            && entry.lease.as_ref().is_some_and(|l| l.delivery == delivery.delivery);
        if is_current {
            Some(entry)
        } else {
            warn!(job_id = %delivery.job.id, delivery = delivery.delivery, "Confirmación de una entrega superada, se ignora");
            None
        }
    }

    pub fn complete(&self, delivery: &Delivery, chunks_indexed: usize) -> bool {
        let mut state = self.state();
        let Some(entry) = Self::current(&mut state, delivery) else {
            return false;
        };
        entry.job.status = JobStatus::Completed;
        entry.job.chunks_indexed = Some(chunks_indexed);
        entry.job.updated_at = Utc::now();
        entry.lease = None;

        state.completed.push_back(delivery.job.id);
        while state.completed.len() > self.keep_completed {
            if let Some(oldest) = state.completed.pop_front() {
                state.jobs.remove(&oldest);
            }
        }
        true
    }

    /// Estado terminal: el trabajo no se reenvía automáticamente.
    pub fn fail(&self, delivery: &Delivery, err: &RagError) -> bool {
        let mut state = self.state();
        let Some(entry) = Self::current(&mut state, delivery) else {
            return false;
        };
        entry.job.status = JobStatus::Failed;
        entry.job.failure = Some(JobFailure { kind: err.kind().to_string(), message: err.to_string() });
        entry.job.updated_at = Utc::now();
        entry.lease = None;
        true
    }

    /// Devuelve el trabajo a la cola para que lo reciba otro worker.
    pub fn release(&self, delivery: &Delivery) -> bool {
        {
            let mut state = self.state();
            let Some(entry) = Self::current(&mut state, delivery) else {
                return false;
            };
            entry.job.status = JobStatus::Queued;
            entry.job.updated_at = Utc::now();
            entry.lease = None;
            state.pending.push_back(delivery.job.id);
        }
        self.notify.notify_one();
        true
    }

    /// Reencola los trabajos cuyo lease venció antes de `now`.
    pub fn requeue_expired(&self, now: Instant) -> usize {
        let mut requeued = Vec::new();
        {
            let mut state = self.state();
            let State { jobs, pending, .. } = &mut *state;
            for (id, entry) in jobs.iter_mut() {
                let expired = entry.job.status == JobStatus::Running
                    && entry.lease.as_ref().is_some_and(|l| l.expires_at <= now);
                if expired {
                    entry.job.status = JobStatus::Queued;
                    entry.job.updated_at = Utc::now();
                    entry.lease = None;
                    pending.push_back(*id);
                    requeued.push(*id);
                }
            }
        }
        for id in &requeued {
            warn!(job_id = %id, "Lease vencido, el trabajo se vuelve a entregar");
            self.notify.notify_one();
        }
        requeued.len()
    }

    pub fn get(&self, id: JobId) -> Option<IngestionJob> {
        self.state().jobs.get(&id).map(|e| e.job.clone())
    }

    /// Trabajos por fecha de creación, opcionalmente filtrados por estado.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<IngestionJob> {
        let mut jobs: Vec<IngestionJob> = self
            .state()
            .jobs
            .values()
            .filter(|e| status.map_or(true, |s| e.job.status == s))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        let mut stats = QueueStats::default();
        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Despierta a los workers en espera para que terminen.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
