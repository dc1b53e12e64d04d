use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{config::AppConfig, queue::JobQueue, rag::QueryService, vector_store::VectorIndex};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub queue: Arc<JobQueue>,
    pub query: Arc<QueryService>,
    pub index: Arc<dyn VectorIndex>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}
