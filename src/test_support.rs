//! Datos y dobles de prueba compartidos por los tests de los módulos.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::chunk_index::ChunkIndex;
use crate::llm::{StepEvaluationRequest, StepEvaluator};
use crate::models::{
    Citation, Conforme, ControlPoint, NiveauConformite, RecordingTimeline, Statut,
    StepDefinition, StepResult, StoredRecording, TimelineChunk,
};

pub fn timeline_chunk(chunk_index: usize, text: &str) -> TimelineChunk {
    let start = chunk_index as f64 * 30.0;
    TimelineChunk {
        chunk_index,
        start_timestamp: start,
        end_timestamp: start + 30.0,
        speakers: BTreeSet::from(["agent".to_string(), "client".to_string()]),
        full_text: text.to_string(),
    }
}

pub fn recording(recording_index: usize, chunks: Vec<TimelineChunk>) -> RecordingTimeline {
    RecordingTimeline {
        recording_index,
        chunks,
        recording_date: "2024-05-02".to_string(),
        recording_time: format!("10:0{recording_index}"),
        recording_url: format!("https://rec/{recording_index}"),
    }
}

pub fn sample_recordings() -> Vec<RecordingTimeline> {
    vec![
        recording(
            0,
            vec![
                timeline_chunk(
                    0,
                    "Bonjour Madame, je suis Julien de la société Énergie Plus, je vous appelle au sujet de votre contrat.",
                ),
                timeline_chunk(1, "Avant de commencer, je vous informe que cet appel est enregistré."),
                timeline_chunk(
                    2,
                    "Vous disposez d'un délai de rétractation de quatorze jours à compter de la signature.",
                ),
                timeline_chunk(3, "Le délai de livraison est de trois semaines."),
            ],
        ),
        recording(
            1,
            vec![
                timeline_chunk(0, "Pour la rétractation il suffit d'envoyer le formulaire."),
                timeline_chunk(1, "Merci, bonne journée."),
            ],
        ),
    ]
}

pub fn sample_index() -> ChunkIndex {
    ChunkIndex::build(&sample_recordings())
}

pub fn stored_recordings() -> Vec<StoredRecording> {
    sample_recordings()
        .into_iter()
        .map(|r| StoredRecording {
            recording_index: r.recording_index,
            recording_date: r.recording_date,
            recording_time: r.recording_time,
            recording_url: r.recording_url,
            chunks: Some(r.chunks),
        })
        .collect()
}

pub fn step_def(position: u32, weight: u32, points: &[&str]) -> StepDefinition {
    StepDefinition {
        position,
        name: format!("Etape {position}"),
        weight,
        is_critical: false,
        control_points: points.iter().map(|p| p.to_string()).collect(),
        custom_instructions: None,
        verify_product_info: false,
    }
}

pub fn citation(recording_index: usize, chunk_index: usize, texte: &str) -> Citation {
    Citation {
        recording_index,
        chunk_index,
        texte: texte.to_string(),
        minutage: String::new(),
    }
}

pub fn control_point(point: &str, statut: Statut, citations: Vec<Citation>) -> ControlPoint {
    ControlPoint {
        point: point.to_string(),
        statut,
        commentaire: String::new(),
        citations,
        minutages: Vec::new(),
    }
}

pub fn step_result(score: f64, conforme: Conforme, points: Vec<ControlPoint>) -> StepResult {
    let niveau_conformite = match conforme {
        Conforme::Conforme => NiveauConformite::Bon,
        Conforme::Partiel => NiveauConformite::Acceptable,
        Conforme::NonConforme => NiveauConformite::Insuffisant,
    };
    StepResult {
        score,
        conforme,
        niveau_conformite,
        commentaire_global: String::new(),
        points_controle: points,
        minutages: Vec::new(),
    }
}

/// Lo que vio el evaluador en cada llamada.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub step: StepDefinition,
    pub extra_context: Option<String>,
    pub product_context: Option<String>,
    pub chunk_count: usize,
}

/// Evaluador que devuelve respuestas preparadas en orden.
#[derive(Default)]
pub struct ScriptedEvaluator {
    responses: Mutex<VecDeque<Result<StepResult>>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedEvaluator {
    pub fn new(responses: Vec<Result<StepResult>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepEvaluator for ScriptedEvaluator {
    async fn evaluate_step(&self, request: StepEvaluationRequest<'_>) -> Result<StepResult> {
        self.calls.lock().unwrap().push(RecordedCall {
            step: request.step.clone(),
            extra_context: request.extra_context.clone(),
            product_context: request.product_context.clone(),
            chunk_count: request.index.len(),
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("respuesta no preparada")))
    }
}

/// Evaluador con respuestas preparadas por posición de etapa, para
/// ejecuciones concurrentes donde el orden de llamada no es fijo.
#[derive(Default)]
pub struct PerStepEvaluator {
    responses: Mutex<HashMap<u32, VecDeque<Result<StepResult>>>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl PerStepEvaluator {
    pub fn new(responses: Vec<(u32, Vec<Result<StepResult>>)>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|(position, list)| (position, list.into()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StepEvaluator for PerStepEvaluator {
    async fn evaluate_step(&self, request: StepEvaluationRequest<'_>) -> Result<StepResult> {
        let position = request.step.position;
        self.calls.lock().unwrap().push(RecordedCall {
            step: request.step.clone(),
            extra_context: request.extra_context.clone(),
            product_context: request.product_context.clone(),
            chunk_count: request.index.len(),
        });
        self.responses
            .lock()
            .unwrap()
            .get_mut(&position)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(anyhow!("respuesta no preparada para la etapa {position}")))
    }
}
