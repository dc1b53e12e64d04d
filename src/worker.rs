//! Workers que consumen la cola de ingesta y reaper de leases vencidos.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ingest::IngestionPipeline;
use crate::queue::JobQueue;

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl WorkerPool {
    /// Lanza `count` workers y un reaper que revisa los leases cada
    /// `reap_every`.
    pub fn spawn(
        queue: Arc<JobQueue>,
        pipeline: Arc<IngestionPipeline>,
        count: usize,
        reap_every: Duration,
    ) -> Self {
        let workers = (0..count.max(1))
            .map(|worker| tokio::spawn(run_worker(worker, queue.clone(), pipeline.clone())))
            .collect();
        let reaper = tokio::spawn(run_reaper(queue.clone(), reap_every));
        info!(workers = count.max(1), "Workers de ingesta arrancados");
        Self { queue, workers, reaper }
    }

    /// Cierra la cola y espera a que los workers terminen el trabajo en curso.
    pub async fn shutdown(self) {
        self.queue.close();
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Un worker terminó de forma anómala: {e}");
            }
        }
        self.reaper.abort();
        info!("Workers de ingesta detenidos");
    }
}

async fn run_worker(worker: usize, queue: Arc<JobQueue>, pipeline: Arc<IngestionPipeline>) {
    while let Some(delivery) = queue.claim().await {
        let job_id = delivery.job.id;
        info!(worker, job_id = %job_id, delivery = delivery.delivery, location = %delivery.job.location.display(), "Procesando trabajo");

        // La ejecución va en su propia tarea: si entra en pánico, el worker
        // sigue vivo y el trabajo se devuelve a la cola sin confirmar.
        let execution = {
            let pipeline = pipeline.clone();
            let job = delivery.job.clone();
            tokio::spawn(async move { pipeline.run(&job).await })
        };

        match execution.await {
            Ok(Ok(summary)) => {
                if queue.complete(&delivery, summary.chunks_indexed) {
                    info!(worker, job_id = %job_id, "Trabajo completado. {summary}");
                }
            }
            Ok(Err(err)) => {
                error!(worker, job_id = %job_id, kind = err.kind(), "Trabajo fallido: {err}");
                queue.fail(&delivery, &err);
            }
            Err(join_err) => {
                error!(worker, job_id = %job_id, "La ejecución del trabajo abortó: {join_err}");
                queue.release(&delivery);
            }
        }
    }
}

async fn run_reaper(queue: Arc<JobQueue>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if queue.is_closed() {
            break;
        }
        let requeued = queue.requeue_expired(tokio::time::Instant::now());
        if requeued > 0 {
            warn!(requeued, "Trabajos reencolados por lease vencido");
        }
    }
}
