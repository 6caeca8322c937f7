//! Herramientas de transcripción expuestas al agente de razonamiento.
//!
//! El agente nunca recibe la transcripción completa: primero localiza
//! evidencias con `search` (vistas previas acotadas) y después recupera el
//! texto literal con `getChunks`, que es el único camino por el que llega
//! texto exacto para citar.
//!
//! Las funciones `search` y `get_chunks` son puras sobre el índice; los
//! tipos `SearchTranscriptTool` y `GetChunksTool` las envuelven como
//! herramientas de Rig y aplican los límites de parámetros.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use rig::completion::ToolDefinition;
use rig::tool::Tool;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::chunk_index::ChunkIndex;
use crate::models::ChunkRef;
use crate::text::{normalize, preview, truncate_with_marker};

pub const SEARCH_MAX_RESULTS_LIMIT: usize = 50;
pub const SEARCH_DEFAULT_MAX_RESULTS: usize = 20;
pub const MIN_TERM_LENGTH_RANGE: (usize, usize) = (2, 8);
pub const SEARCH_DEFAULT_MIN_TERM_LENGTH: usize = 3;
pub const SEARCH_PREVIEW_CHARS: usize = 240;

pub const GET_CHUNKS_MAX_REFS: usize = 60;
pub const MAX_NEIGHBORS: usize = 2;
pub const MAX_CHARS_RANGE: (usize, usize) = (1_000, 80_000);
pub const GET_CHUNKS_DEFAULT_MAX_CHARS: usize = 20_000;

// ---------------------------------------------------------------------
// BÚSQUEDA
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub max_results: usize,
    pub min_term_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub recording_index: usize,
    pub chunk_index: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub speakers: BTreeSet<String>,
    pub recording_date: String,
    pub recording_time: String,
    pub score: usize,
    pub matched_terms: Vec<String>,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub terms: Vec<String>,
    pub total_matches: usize,
    pub matches: Vec<SearchMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Términos únicos (en orden de aparición) de la consulta normalizada.
fn query_terms(query: &str, min_term_length: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    normalize(query)
        .split(' ')
        .filter(|t| t.chars().count() >= min_term_length)
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Búsqueda por palabras clave: cada chunk puntúa por el número de términos
/// distintos que contiene (contención literal sobre texto normalizado).
pub fn search(index: &ChunkIndex, params: &SearchParams) -> SearchResponse {
    let terms = query_terms(&params.query, params.min_term_length);

    if terms.is_empty() {
        return SearchResponse {
            query: params.query.clone(),
            terms,
            total_matches: 0,
            matches: Vec::new(),
            note: Some(format!(
                "Aucun terme exploitable : chaque terme doit contenir au moins {} caractères.",
                params.min_term_length
            )),
        };
    }

    let mut scored: Vec<(usize, ChunkRef, Vec<String>)> = index
        .entries()
        .iter()
        .filter_map(|entry| {
            let matched: Vec<String> = terms
                .iter()
                .filter(|t| entry.normalized_text.contains(t.as_str()))
                .cloned()
                .collect();
            (!matched.is_empty()).then(|| (matched.len(), entry.chunk.chunk_ref(), matched))
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let total_matches = scored.len();

    let matches: Vec<SearchMatch> = scored
        .into_iter()
        .take(params.max_results)
        .filter_map(|(score, chunk_ref, matched_terms)| {
            let chunk = &index.get(chunk_ref)?.chunk;
            Some(SearchMatch {
                recording_index: chunk.recording_index,
                chunk_index: chunk.chunk_index,
                start_timestamp: chunk.start_timestamp,
                end_timestamp: chunk.end_timestamp,
                speakers: chunk.speakers.clone(),
                recording_date: chunk.recording_date.clone(),
                recording_time: chunk.recording_time.clone(),
                score,
                matched_terms,
                preview: preview(&chunk.full_text, SEARCH_PREVIEW_CHARS),
            })
        })
        .collect();

    let note = if matches.is_empty() {
        Some("Aucun extrait ne contient ces termes.".to_string())
    } else {
        None
    };

    SearchResponse {
        query: params.query.clone(),
        terms,
        total_matches,
        matches,
        note,
    }
}

// ---------------------------------------------------------------------
// RECUPERACIÓN LITERAL
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GetChunksParams {
    pub refs: Vec<ChunkRef>,
    pub include_neighbors: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub recording_index: usize,
    pub chunk_index: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub speakers: BTreeSet<String>,
    pub recording_date: String,
    pub recording_time: String,
    #[serde(rename = "full_text")]
    pub full_text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChunksResponse {
    pub chunks: Vec<RetrievedChunk>,
    pub truncated: bool,
    pub returned_chars: usize,
}

/// Recupera texto literal: deduplica, expande vecinos de la misma
/// grabación, descarta referencias inexistentes, ordena y llena el
/// presupuesto de caracteres recortando el último chunk incluido.
pub fn get_chunks(index: &ChunkIndex, params: &GetChunksParams) -> GetChunksResponse {
    let mut wanted = BTreeSet::new();
    for r in &params.refs {
        // Una referencia inexistente no arrastra vecinos.
        if !index.contains(*r) {
            continue;
        }
        let from = r.chunk_index.saturating_sub(params.include_neighbors);
        let to = r.chunk_index.saturating_add(params.include_neighbors);
        for chunk_index in from..=to {
            let candidate = ChunkRef::new(r.recording_index, chunk_index);
            if index.contains(candidate) {
                wanted.insert(candidate);
            }
        }
    }

    let mut chunks = Vec::new();
    let mut used = 0usize;
    let mut truncated = false;

    for chunk_ref in wanted {
        let Some(entry) = index.get(chunk_ref) else {
            continue;
        };
        let remaining = params.max_chars.saturating_sub(used);
        if remaining == 0 {
            truncated = true;
            break;
        }

        let chunk = &entry.chunk;
        let (full_text, cut) = truncate_with_marker(&chunk.full_text, remaining);
        used += chunk.full_text.chars().count().min(remaining);
        chunks.push(RetrievedChunk {
            recording_index: chunk.recording_index,
            chunk_index: chunk.chunk_index,
            start_timestamp: chunk.start_timestamp,
            end_timestamp: chunk.end_timestamp,
            speakers: chunk.speakers.clone(),
            recording_date: chunk.recording_date.clone(),
            recording_time: chunk.recording_time.clone(),
            full_text,
            truncated: cut,
        });

        if cut {
            truncated = true;
            break;
        }
    }

    GetChunksResponse {
        chunks,
        truncated,
        returned_chars: used,
    }
}

// ---------------------------------------------------------------------
// HERRAMIENTAS RIG
// ---------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TranscriptToolError {
    #[error("la liste 'chunks' doit contenir au moins une référence")]
    NoChunkRefs,
    #[error("trop de références demandées ({requested}), maximum {max}")]
    TooManyChunkRefs { requested: usize, max: usize },
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchArgs {
    /// Mots-clés ou expression à chercher dans la transcription.
    pub query: String,
    /// Nombre maximum de résultats (1-50, 20 par défaut).
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Longueur minimale d'un terme pris en compte (2-8, 3 par défaut).
    #[serde(default)]
    pub min_term_length: Option<usize>,
}

impl SearchArgs {
    pub fn into_params(self) -> SearchParams {
        SearchParams {
            query: self.query,
            max_results: self
                .max_results
                .unwrap_or(SEARCH_DEFAULT_MAX_RESULTS)
                .clamp(1, SEARCH_MAX_RESULTS_LIMIT),
            min_term_length: self
                .min_term_length
                .unwrap_or(SEARCH_DEFAULT_MIN_TERM_LENGTH)
                .clamp(MIN_TERM_LENGTH_RANGE.0, MIN_TERM_LENGTH_RANGE.1),
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetChunksArgs {
    /// Références {recordingIndex, chunkIndex} à récupérer (1-60).
    pub chunks: Vec<ChunkRef>,
    /// Nombre d'extraits voisins à inclure avant et après (0-2).
    #[serde(default)]
    pub include_neighbors: Option<usize>,
    /// Budget de caractères du texte renvoyé (1000-80000).
    #[serde(default)]
    pub max_chars: Option<usize>,
}

impl GetChunksArgs {
    pub fn into_params(self) -> Result<GetChunksParams, TranscriptToolError> {
        if self.chunks.is_empty() {
            return Err(TranscriptToolError::NoChunkRefs);
        }
        if self.chunks.len() > GET_CHUNKS_MAX_REFS {
            return Err(TranscriptToolError::TooManyChunkRefs {
                requested: self.chunks.len(),
                max: GET_CHUNKS_MAX_REFS,
            });
        }
        Ok(GetChunksParams {
            refs: self.chunks,
            include_neighbors: self.include_neighbors.unwrap_or(0).min(MAX_NEIGHBORS),
            max_chars: self
                .max_chars
                .unwrap_or(GET_CHUNKS_DEFAULT_MAX_CHARS)
                .clamp(MAX_CHARS_RANGE.0, MAX_CHARS_RANGE.1),
        })
    }
}

fn parameters_schema<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }))
}

#[derive(Clone)]
pub struct SearchTranscriptTool {
    index: Arc<ChunkIndex>,
}

impl SearchTranscriptTool {
    pub fn new(index: Arc<ChunkIndex>) -> Self {
        Self { index }
    }
}

impl Tool for SearchTranscriptTool {
    const NAME: &'static str = "search";

    type Error = TranscriptToolError;
    type Args = SearchArgs;
    type Output = SearchResponse;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Recherche par mots-clés dans la transcription de l'appel. \
                Renvoie les extraits les plus pertinents avec un aperçu court et leurs \
                références {recordingIndex, chunkIndex}. Utiliser ensuite getChunks \
                pour obtenir le texte exact à citer."
                .to_string(),
            parameters: parameters_schema::<SearchArgs>(),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let params = args.into_params();
        let response = search(&self.index, &params);
        debug!(
            query = %params.query,
            matches = response.matches.len(),
            "Herramienta search ejecutada"
        );
        Ok(response)
    }
}

#[derive(Clone)]
pub struct GetChunksTool {
    index: Arc<ChunkIndex>,
}

impl GetChunksTool {
    pub fn new(index: Arc<ChunkIndex>) -> Self {
        Self { index }
    }
}

impl Tool for GetChunksTool {
    const NAME: &'static str = "getChunks";

    type Error = TranscriptToolError;
    type Args = GetChunksArgs;
    type Output = GetChunksResponse;

    async fn definition(&self, _prompt: String) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Récupère le texte verbatim d'extraits de la transcription \
                (avec voisins optionnels). Seul ce texte peut servir de citation exacte."
                .to_string(),
            parameters: parameters_schema::<GetChunksArgs>(),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let params = args.into_params()?;
        let response = get_chunks(&self.index, &params);
        debug!(
            requested = params.refs.len(),
            returned = response.chunks.len(),
            truncated = response.truncated,
            "Herramienta getChunks ejecutada"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{recording, sample_index, timeline_chunk};
    use crate::text::TRUNCATION_MARKER;

    fn params(query: &str) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            max_results: 20,
            min_term_length: 3,
        }
    }

    #[test]
    fn search_on_empty_index_returns_nothing() {
        let index = ChunkIndex::build(&[]);
        let response = search(&index, &params("anything"));
        assert!(response.matches.is_empty());
        assert_eq!(response.total_matches, 0);
    }

    #[test]
    fn search_without_usable_terms_explains_why() {
        let index = sample_index();
        let response = search(&index, &params("le à un"));
        assert!(response.terms.is_empty());
        assert!(response.matches.is_empty());
        assert!(response.note.is_some());
    }

    #[test]
    fn search_ranks_by_distinct_terms_then_position() {
        let index = sample_index();
        let response = search(&index, &params("RÉTRACTATION délai quatorze"));

        assert_eq!(response.terms, vec!["retractation", "delai", "quatorze"]);
        let refs: Vec<(usize, usize)> = response
            .matches
            .iter()
            .map(|m| (m.recording_index, m.chunk_index))
            .collect();
        // (0,2) contiene los tres términos; (0,3) y (1,0) sólo uno.
        assert_eq!(refs, vec![(0, 2), (0, 3), (1, 0)]);
        assert_eq!(response.matches[0].score, 3);
    }

    #[test]
    fn search_respects_max_results_and_previews() {
        let long = "garantie ".repeat(100);
        let index = ChunkIndex::build(&[recording(
            0,
            (0..5).map(|i| timeline_chunk(i, &long)).collect(),
        )]);
        let response = search(
            &index,
            &SearchParams {
                query: "garantie".into(),
                max_results: 2,
                min_term_length: 3,
            },
        );
        assert_eq!(response.total_matches, 5);
        assert_eq!(response.matches.len(), 2);
        assert!(response.matches[0].preview.chars().count() <= SEARCH_PREVIEW_CHARS + 1);
    }

    #[test]
    fn get_chunks_dedups_expands_and_filters() {
        let index = sample_index();
        let response = get_chunks(
            &index,
            &GetChunksParams {
                refs: vec![
                    ChunkRef::new(0, 2),
                    ChunkRef::new(0, 2),
                    ChunkRef::new(5, 0),
                    ChunkRef::new(1, 0),
                ],
                include_neighbors: 1,
                max_chars: 80_000,
            },
        );
        let refs: Vec<(usize, usize)> = response
            .chunks
            .iter()
            .map(|c| (c.recording_index, c.chunk_index))
            .collect();
        assert_eq!(refs, vec![(0, 1), (0, 2), (0, 3), (1, 0), (1, 1)]);
        assert!(!response.truncated);
    }

    #[test]
    fn unknown_refs_do_not_pull_in_neighbors() {
        let index = sample_index();
        let response = get_chunks(
            &index,
            &GetChunksParams {
                refs: vec![ChunkRef::new(0, 4), ChunkRef::new(1, 2)],
                include_neighbors: 1,
                max_chars: 80_000,
            },
        );
        assert!(response.chunks.is_empty());
        assert_eq!(response.returned_chars, 0);
    }

    #[test]
    fn get_chunks_truncates_last_chunk_to_budget() {
        let text = "x".repeat(200);
        let index = ChunkIndex::build(&[recording(0, vec![timeline_chunk(0, &text)])]);
        let response = get_chunks(
            &index,
            &GetChunksParams {
                refs: vec![ChunkRef::new(0, 0)],
                include_neighbors: 0,
                max_chars: 50,
            },
        );
        assert!(response.truncated);
        let chunk = &response.chunks[0];
        assert!(chunk.truncated);
        assert_eq!(chunk.full_text, format!("{}{}", "x".repeat(50), TRUNCATION_MARKER));
        assert_eq!(response.returned_chars, 50);
    }

    #[test]
    fn get_chunks_stops_when_budget_exhausted() {
        let index = ChunkIndex::build(&[recording(
            0,
            vec![
                timeline_chunk(0, &"a".repeat(10)),
                timeline_chunk(1, &"b".repeat(10)),
                timeline_chunk(2, &"c".repeat(10)),
            ],
        )]);
        let response = get_chunks(
            &index,
            &GetChunksParams {
                refs: vec![ChunkRef::new(0, 0), ChunkRef::new(0, 1), ChunkRef::new(0, 2)],
                include_neighbors: 0,
                max_chars: 20,
            },
        );
        assert_eq!(response.chunks.len(), 2);
        assert!(response.chunks.iter().all(|c| !c.truncated));
        assert!(response.truncated);
    }

    #[test]
    fn tool_args_are_bounded() {
        let search_params = SearchArgs {
            query: "prix".into(),
            max_results: Some(500),
            min_term_length: Some(1),
        }
        .into_params();
        assert_eq!(search_params.max_results, SEARCH_MAX_RESULTS_LIMIT);
        assert_eq!(search_params.min_term_length, 2);

        let chunk_params = GetChunksArgs {
            chunks: vec![ChunkRef::new(0, 0)],
            include_neighbors: Some(9),
            max_chars: Some(10),
        }
        .into_params()
        .unwrap();
        assert_eq!(chunk_params.include_neighbors, MAX_NEIGHBORS);
        assert_eq!(chunk_params.max_chars, MAX_CHARS_RANGE.0);

        let too_many = GetChunksArgs {
            chunks: (0..61).map(|i| ChunkRef::new(0, i)).collect(),
            include_neighbors: None,
            max_chars: None,
        };
        assert!(matches!(
            too_many.into_params(),
            Err(TranscriptToolError::TooManyChunkRefs { requested: 61, .. })
        ));
    }

    #[tokio::test]
    async fn rig_tools_answer_from_shared_index() {
        let index = Arc::new(sample_index());
        let search_tool = SearchTranscriptTool::new(index.clone());
        let found = search_tool
            .call(SearchArgs {
                query: "rétractation".into(),
                max_results: None,
                min_term_length: None,
            })
            .await
            .unwrap();
        assert!(!found.matches.is_empty());

        let get_tool = GetChunksTool::new(index);
        let def = get_tool.definition(String::new()).await;
        assert_eq!(def.name, "getChunks");
        let err = get_tool
            .call(GetChunksArgs {
                chunks: vec![],
                include_neighbors: None,
                max_chars: None,
            })
            .await;
        assert!(matches!(err, Err(TranscriptToolError::NoChunkRefs)));
    }
}
