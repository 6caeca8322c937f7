use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::audit::AuditRunner;
use crate::config::AppConfig;
use crate::neo4j_client::Neo4jStore;
use crate::rerun::RerunService;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Neo4jStore,
    pub runner: Arc<AuditRunner>,
    pub reruns: Arc<RerunService>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    /// Auditorías y re-ejecuciones en curso.
    pub in_flight: usize,
}

impl Status {
    pub fn begin(&mut self, message: String) {
        self.in_flight += 1;
        self.is_busy = true;
        self.message = message;
    }

    pub fn finish(&mut self, message: String) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.is_busy = self.in_flight > 0;
        self.message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracks_overlapping_jobs() {
        let mut status = Status::default();
        status.begin("audit 1".into());
        status.begin("audit 2".into());
        status.finish("audit 1 ok".into());
        assert!(status.is_busy);
        status.finish("audit 2 ok".into());
        assert!(!status.is_busy);
        assert_eq!(status.in_flight, 0);
        status.finish("spurious".into());
        assert_eq!(status.in_flight, 0);
    }
}
