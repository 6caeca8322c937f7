//! Interfaces con los colaboradores externos: transcripciones persistidas,
//! configuración de auditorías, contexto de producto y persistencia de
//! resultados. El núcleo sólo habla con estas interfaces, nunca con una
//! base de datos.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::audit::AuditReport;
use crate::models::{AuditDefinition, StepDefinition, StoredRecording};
use crate::rerun::RerunRecord;

/// Transcripciones por grabación de una llamada (timeline ya construido).
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn load_recordings(&self, call_id: &str) -> Result<Vec<StoredRecording>>;
}

/// Definiciones de auditoría, sólo lectura.
#[async_trait]
pub trait AuditConfigSource: Send + Sync {
    async fn load_audit_definition(&self, audit_config_id: &str) -> Result<AuditDefinition>;
}

/// Vinculación con el catálogo de productos. Se usa siempre en modo
/// "mejor esfuerzo": un error equivale a no tener contexto de producto.
#[async_trait]
pub trait ProductContextProvider: Send + Sync {
    async fn product_context(&self, call_id: &str, step: &StepDefinition) -> Result<Option<String>>;
}

/// Persistencia de auditorías y del historial de re-ejecuciones.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Inserta o reemplaza el informe completo.
    async fn save_audit(&self, report: &AuditReport) -> Result<()>;
    async fn load_audit(&self, audit_id: &str) -> Result<AuditReport>;
    async fn append_rerun(&self, record: &RerunRecord) -> Result<()>;
}

// ---------------------------------------------------------------------
// CACHÉ DE TRANSCRIPCIONES
// ---------------------------------------------------------------------

/// Almacén clave → transcripciones. La capacidad y la expulsión las decide
/// quien lo crea.
pub trait TranscriptCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<StoredRecording>>;
    fn put(&self, key: String, recordings: Vec<StoredRecording>);
    fn invalidate(&self, key: &str);
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Vec<StoredRecording>>,
    insertion_order: VecDeque<String>,
}

/// Caché en memoria con capacidad fija y expulsión FIFO.
pub struct InMemoryTranscriptCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl InMemoryTranscriptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }
}

impl TranscriptCache for InMemoryTranscriptCache {
    fn get(&self, key: &str) -> Option<Vec<StoredRecording>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(key).cloned()
    }

    fn put(&self, key: String, recordings: Vec<StoredRecording>) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.insert(key.clone(), recordings).is_none() {
            state.insertion_order.push_back(key);
        }
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.insertion_order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    fn invalidate(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.entries.remove(key).is_some() {
            state.insertion_order.retain(|k| k != key);
        }
    }
}

/// Fuente de transcripciones con caché delante. Sólo se cachean llamadas
/// cuyas grabaciones tienen todas transcripción: una llamada incompleta
/// puede completarse más tarde.
pub struct CachedTranscriptSource {
    inner: Arc<dyn TranscriptSource>,
    cache: Arc<dyn TranscriptCache>,
}

impl CachedTranscriptSource {
    pub fn new(inner: Arc<dyn TranscriptSource>, cache: Arc<dyn TranscriptCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl TranscriptSource for CachedTranscriptSource {
    async fn load_recordings(&self, call_id: &str) -> Result<Vec<StoredRecording>> {
        if let Some(hit) = self.cache.get(call_id) {
            debug!(call_id, "Transcripción servida desde caché");
            return Ok(hit);
        }
        let recordings = self.inner.load_recordings(call_id).await?;
        if !recordings.is_empty() && recordings.iter().all(|r| r.chunks.is_some()) {
            self.cache.put(call_id.to_string(), recordings.clone());
        }
        Ok(recordings)
    }
}
