//! Índice en memoria sobre los chunks de transcripción de una llamada.
//!
//! Dos vistas sobre los mismos datos:
//!   - búsqueda exacta `(recordingIndex, chunkIndex) → Chunk` para recuperar
//!     texto literal y validar citas;
//!   - lista plana ordenada con el texto normalizado precalculado, que es
//!     sobre la que busca la herramienta de búsqueda.
//!
//! Se construye una vez por ejecución de auditoría (o de re-run) y no se
//! modifica nunca.

use std::collections::HashMap;

use crate::models::{Chunk, ChunkRef, RecordingTimeline};
use crate::text::normalize;

/// Chunk junto a su texto normalizado.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub normalized_text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    entries: Vec<IndexedChunk>,
    by_ref: HashMap<ChunkRef, usize>,
    recording_lens: HashMap<usize, usize>,
}

impl ChunkIndex {
    /// Construye el índice a partir de los timelines por grabación.
    /// Una entrada vacía produce un índice sin chunks.
    pub fn build(recordings: &[RecordingTimeline]) -> Self {
        let mut entries: Vec<IndexedChunk> = recordings
            .iter()
            .flat_map(|rec| {
                rec.chunks.iter().map(move |c| IndexedChunk {
                    normalized_text: normalize(&c.full_text),
                    chunk: Chunk {
                        recording_index: rec.recording_index,
                        chunk_index: c.chunk_index,
                        start_timestamp: c.start_timestamp,
                        end_timestamp: c.end_timestamp,
                        speakers: c.speakers.clone(),
                        full_text: c.full_text.clone(),
                        recording_date: rec.recording_date.clone(),
                        recording_time: rec.recording_time.clone(),
                        recording_url: rec.recording_url.clone(),
                    },
                })
            })
            .collect();

        entries.sort_by_key(|e| e.chunk.chunk_ref());
        // Si el timeline repite una identidad, gana la primera aparición.
        entries.dedup_by_key(|e| e.chunk.chunk_ref());

        let by_ref = entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.chunk.chunk_ref(), pos))
            .collect();

        let mut recording_lens = HashMap::new();
        for e in &entries {
            *recording_lens.entry(e.chunk.recording_index).or_insert(0) += 1;
        }

        Self {
            entries,
            by_ref,
            recording_lens,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Chunks en orden ascendente `(recordingIndex, chunkIndex)`.
    pub fn entries(&self) -> &[IndexedChunk] {
        &self.entries
    }

    pub fn get(&self, chunk_ref: ChunkRef) -> Option<&IndexedChunk> {
        self.by_ref.get(&chunk_ref).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, chunk_ref: ChunkRef) -> bool {
        self.by_ref.contains_key(&chunk_ref)
    }

    /// Número de grabaciones con al menos un chunk.
    pub fn recording_count(&self) -> usize {
        self.recording_lens.len()
    }

    /// Número de chunks indexados para una grabación.
    pub fn chunks_in_recording(&self, recording_index: usize) -> usize {
        self.recording_lens.get(&recording_index).copied().unwrap_or(0)
    }
}
