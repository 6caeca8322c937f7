//! Modelos de dominio: transcripción por chunks, puntos de control,
//! resultados de etapa y definiciones de auditoría.
//!
//! Los nombres en el cable siguen el contrato JSON del resto del sistema
//! (camelCase en francés: `pointsControle`, `commentaireGlobal`...).

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------
// TRANSCRIPCIÓN
// ---------------------------------------------------------------------

/// Identidad de un chunk: `(recordingIndex, chunkIndex)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub recording_index: usize,
    pub chunk_index: usize,
}

impl ChunkRef {
    pub fn new(recording_index: usize, chunk_index: usize) -> Self {
        Self {
            recording_index,
            chunk_index,
        }
    }
}

/// Trozo inmutable de transcripción con su ventana temporal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub recording_index: usize,
    pub chunk_index: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub speakers: BTreeSet<String>,
    pub full_text: String,
    pub recording_date: String,
    pub recording_time: String,
    pub recording_url: String,
}

impl Chunk {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef::new(self.recording_index, self.chunk_index)
    }
}

/// Chunk tal y como lo entrega el constructor de timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineChunk {
    pub chunk_index: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    #[serde(default)]
    pub speakers: BTreeSet<String>,
    pub full_text: String,
}

/// Timeline de una grabación de la llamada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingTimeline {
    pub recording_index: usize,
    pub chunks: Vec<TimelineChunk>,
    #[serde(default)]
    pub recording_date: String,
    #[serde(default)]
    pub recording_time: String,
    #[serde(default)]
    pub recording_url: String,
}

/// Grabación persistida; `chunks` es `None` si aún no hay transcripción.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecording {
    pub recording_index: usize,
    pub recording_date: String,
    pub recording_time: String,
    pub recording_url: String,
    pub chunks: Option<Vec<TimelineChunk>>,
}

impl StoredRecording {
    /// Convierte a timeline si hay transcripción disponible.
    pub fn into_timeline(self) -> Option<RecordingTimeline> {
        let chunks = self.chunks?;
        Some(RecordingTimeline {
            recording_index: self.recording_index,
            chunks,
            recording_date: self.recording_date,
            recording_time: self.recording_time,
            recording_url: self.recording_url,
        })
    }
}

// ---------------------------------------------------------------------
// VEREDICTOS
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Statut {
    Present,
    Partiel,
    Absent,
    NonApplicable,
}

impl Statut {
    /// PRESENT y PARTIEL afirman algo y por tanto exigen evidencia.
    pub fn is_affirmative(self) -> bool {
        matches!(self, Self::Present | Self::Partiel)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Partiel => "PARTIEL",
            Self::Absent => "ABSENT",
            Self::NonApplicable => "NON_APPLICABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conforme {
    Conforme,
    Partiel,
    NonConforme,
}

impl Conforme {
    /// Orden de indulgencia: CONFORME > PARTIEL > NON_CONFORME.
    pub fn rank(self) -> u8 {
        match self {
            Self::Conforme => 2,
            Self::Partiel => 1,
            Self::NonConforme => 0,
        }
    }

    pub fn is_stricter_than(self, other: Conforme) -> bool {
        self.rank() < other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conforme => "CONFORME",
            Self::Partiel => "PARTIEL",
            Self::NonConforme => "NON_CONFORME",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NiveauConformite {
    Excellent,
    Bon,
    Acceptable,
    Insuffisant,
    Rejet,
}

impl NiveauConformite {
    /// Orden de indulgencia: EXCELLENT > BON > ACCEPTABLE > INSUFFISANT > REJET.
    pub fn rank(self) -> u8 {
        match self {
            Self::Excellent => 4,
            Self::Bon => 3,
            Self::Acceptable => 2,
            Self::Insuffisant => 1,
            Self::Rejet => 0,
        }
    }

    pub fn is_stricter_than(self, other: NiveauConformite) -> bool {
        self.rank() < other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT",
            Self::Bon => "BON",
            Self::Acceptable => "ACCEPTABLE",
            Self::Insuffisant => "INSUFFISANT",
            Self::Rejet => "REJET",
        }
    }
}

// ---------------------------------------------------------------------
// RESULTADOS
// ---------------------------------------------------------------------

/// Extracto citado como evidencia de un punto de control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub recording_index: usize,
    pub chunk_index: usize,
    pub texte: String,
    #[serde(default)]
    pub minutage: String,
}

impl Citation {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef::new(self.recording_index, self.chunk_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPoint {
    pub point: String,
    pub statut: Statut,
    #[serde(default)]
    pub commentaire: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub minutages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub score: f64,
    pub conforme: Conforme,
    pub niveau_conformite: NiveauConformite,
    #[serde(default)]
    pub commentaire_global: String,
    #[serde(default)]
    pub points_controle: Vec<ControlPoint>,
    #[serde(default)]
    pub minutages: Vec<String>,
}

impl StepResult {
    pub fn total_citations(&self) -> usize {
        self.points_controle.iter().map(|cp| cp.citations.len()).sum()
    }
}

// ---------------------------------------------------------------------
// CONFIGURACIÓN DE AUDITORÍA
// ---------------------------------------------------------------------

/// Definición de etapa, propiedad del módulo de configuración. Sólo lectura.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub position: u32,
    pub name: String,
    pub weight: u32,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub control_points: Vec<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub verify_product_info: bool,
}

impl StepDefinition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidDefinition(format!(
                "la etapa {} no tiene nombre",
                self.position
            )));
        }
        if self.weight == 0 {
            return Err(ConfigError::InvalidDefinition(format!(
                "la etapa {} ('{}') tiene peso 0",
                self.position, self.name
            )));
        }
        Ok(())
    }

    /// Copia de la etapa reducida a un único punto de control.
    pub fn narrowed_to(&self, control_point_index: usize) -> Result<Self, ConfigError> {
        let point = self
            .control_points
            .get(control_point_index)
            .ok_or(ConfigError::ControlPointOutOfRange {
                position: self.position,
                index: control_point_index,
                available: self.control_points.len(),
            })?;
        Ok(Self {
            control_points: vec![point.clone()],
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDefinition>,
}

impl AuditDefinition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::InvalidDefinition(format!(
                "la auditoría '{}' no tiene etapas",
                self.id
            )));
        }
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            step.validate()?;
            if !seen.insert(step.position) {
                return Err(ConfigError::InvalidDefinition(format!(
                    "posición de etapa duplicada: {}",
                    step.position
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, position: u32) -> Result<&StepDefinition, ConfigError> {
        self.steps
            .iter()
            .find(|s| s.position == position)
            .ok_or_else(|| ConfigError::UnknownStep {
                audit_id: self.id.clone(),
                position,
            })
    }
}
