//! Persistencia en Neo4j.
//!
//! Modelo del grafo:
//!   (:Call)-[:HAS_RECORDING]->(:Recording)-[:HAS_CHUNK]->(:TranscriptChunk)
//!   (:Call)-[:CONCERNS_PRODUCT]->(:Product)
//!   (:AuditConfig {id, payload})
//!   (:Call)-[:HAS_AUDIT]->(:Audit {id, payload})-[:HAS_STEP]->(:StepResult {payload})
//!   (:Audit)-[:HAS_RERUN]->(:RerunEntry {id, payload})
//!
//! Los `payload` son JSON serializado de los tipos del dominio.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info};
use url::Url;

use crate::audit::AuditReport;
use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::models::{AuditDefinition, StepDefinition, StoredRecording, TimelineChunk};
use crate::rerun::RerunRecord;
use crate::store::{AuditConfigSource, AuditStore, ProductContextProvider, TranscriptSource};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea los constraints de unicidad de las etiquetas con identificador.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT call_id IF NOT EXISTS
         FOR (c:Call)
         REQUIRE c.id IS UNIQUE",
        "CREATE CONSTRAINT audit_config_id IF NOT EXISTS
         FOR (ac:AuditConfig)
         REQUIRE ac.id IS UNIQUE",
        "CREATE CONSTRAINT audit_id IF NOT EXISTS
         FOR (a:Audit)
         REQUIRE a.id IS UNIQUE",
        "CREATE CONSTRAINT rerun_entry_id IF NOT EXISTS
         FOR (r:RerunEntry)
         REQUIRE r.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

// ---------------------------------------------------------------------
// FILAS → DOMINIO
// ---------------------------------------------------------------------

/// Una fila de la consulta de transcripciones: una por chunk, o una sola
/// con los campos de chunk a `None` si la grabación no tiene chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRow {
    pub recording_index: usize,
    pub recording_date: String,
    pub recording_time: String,
    pub recording_url: String,
    pub has_transcript: bool,
    pub chunk: Option<TimelineChunk>,
}

/// Agrupa las filas por grabación. Una grabación sin marca de
/// transcripción y sin chunks queda con `chunks: None`.
pub fn assemble_recordings(rows: Vec<RecordingRow>) -> Vec<StoredRecording> {
    let mut recordings: BTreeMap<usize, StoredRecording> = BTreeMap::new();
    for row in rows {
        let recording = recordings
            .entry(row.recording_index)
            .or_insert_with(|| StoredRecording {
                recording_index: row.recording_index,
                recording_date: row.recording_date.clone(),
                recording_time: row.recording_time.clone(),
                recording_url: row.recording_url.clone(),
                chunks: None,
            });
        // Con al menos un chunk la grabación está transcrita, tenga o no la marca.
        if row.has_transcript || row.chunk.is_some() {
            let chunks = recording.chunks.get_or_insert_with(Vec::new);
            if let Some(chunk) = row.chunk {
                chunks.push(chunk);
            }
        }
    }

    let mut out: Vec<StoredRecording> = recordings.into_values().collect();
    for recording in &mut out {
        if let Some(chunks) = recording.chunks.as_mut() {
            chunks.sort_by_key(|c| c.chunk_index);
        }
    }
    out
}

fn to_index(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("valor negativo en '{field}': {value}"))
}

// ---------------------------------------------------------------------
// STORE
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct Neo4jStore {
    graph: Arc<Graph>,
}

impl Neo4jStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    /// Comprobación de salud: `RETURN 1`.
    pub async fn ping(&self) -> Result<()> {
        self.graph.run(query("RETURN 1")).await?;
        Ok(())
    }

    async fn read_payload(&self, cypher: &str, id: &str) -> Result<Option<String>> {
        let mut cursor = self
            .graph
            .execute(query(cypher).param("id", id.to_string()))
            .await?;
        match cursor.next().await? {
            Some(row) => Ok(row.get::<String>("payload")),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TranscriptSource for Neo4jStore {
    async fn load_recordings(&self, call_id: &str) -> Result<Vec<StoredRecording>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (:Call {id: $call_id})-[:HAS_RECORDING]->(r:Recording)
                     OPTIONAL MATCH (r)-[:HAS_CHUNK]->(c:TranscriptChunk)
                     RETURN r.index AS recording_index,
                            coalesce(r.date, '') AS recording_date,
                            coalesce(r.time, '') AS recording_time,
                            coalesce(r.url, '') AS recording_url,
                            coalesce(r.has_transcript, false) AS has_transcript,
                            c.index AS chunk_index,
                            c.start AS start_timestamp,
                            c.end AS end_timestamp,
                            coalesce(c.speakers, []) AS speakers,
                            c.text AS full_text
                     ORDER BY recording_index, chunk_index",
                )
                .param("call_id", call_id.to_string()),
            )
            .await?;

        let mut rows = Vec::new();
        while let Some(row) = cursor.next().await? {
            let recording_index: i64 = row
                .get("recording_index")
                .ok_or_else(|| anyhow!("Falta campo 'recording_index' en resultado de Neo4j"))?;

            let chunk = match (row.get::<i64>("chunk_index"), row.get::<String>("full_text")) {
                (Some(chunk_index), Some(full_text)) => {
                    let start_timestamp: f64 = row.get("start_timestamp").unwrap_or_default();
                    let end_timestamp: f64 = row.get("end_timestamp").unwrap_or(start_timestamp);
                    let speakers: Vec<String> = row.get("speakers").unwrap_or_default();
                    Some(TimelineChunk {
                        chunk_index: to_index(chunk_index, "chunk_index")?,
                        start_timestamp,
                        end_timestamp,
                        speakers: speakers.into_iter().collect(),
                        full_text,
                    })
                }
                _ => None,
            };

            rows.push(RecordingRow {
                recording_index: to_index(recording_index, "recording_index")?,
                recording_date: row.get("recording_date").unwrap_or_default(),
                recording_time: row.get("recording_time").unwrap_or_default(),
                recording_url: row.get("recording_url").unwrap_or_default(),
                has_transcript: row.get("has_transcript").unwrap_or(false),
                chunk,
            });
        }

        let recordings = assemble_recordings(rows);
        debug!(call_id, recordings = recordings.len(), "Transcripciones leídas de Neo4j");
        Ok(recordings)
    }
}

#[async_trait]
impl AuditConfigSource for Neo4jStore {
    async fn load_audit_definition(&self, audit_config_id: &str) -> Result<AuditDefinition> {
        let payload = self
            .read_payload(
                "MATCH (ac:AuditConfig {id: $id}) RETURN ac.payload AS payload",
                audit_config_id,
            )
            .await?
            .ok_or_else(|| ConfigError::UnknownAudit(audit_config_id.to_string()))?;

        let definition: AuditDefinition = serde_json::from_str(&payload)
            .map_err(|e| ConfigError::InvalidDefinition(format!("'{audit_config_id}': {e}")))?;
        Ok(definition)
    }
}

#[async_trait]
impl ProductContextProvider for Neo4jStore {
    async fn product_context(&self, call_id: &str, step: &StepDefinition) -> Result<Option<String>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (:Call {id: $call_id})-[:CONCERNS_PRODUCT]->(p:Product)
                     RETURN p.name AS name, coalesce(p.description, '') AS description
                     ORDER BY name",
                )
                .param("call_id", call_id.to_string()),
            )
            .await?;

        let mut lines = Vec::new();
        while let Some(row) = cursor.next().await? {
            if let Some(name) = row.get::<String>("name") {
                let description: String = row.get("description").unwrap_or_default();
                lines.push(format!("- {name} : {description}"));
            }
        }
        debug!(call_id, step = step.position, products = lines.len(), "Contexto de producto");
        Ok((!lines.is_empty()).then(|| lines.join("\n")))
    }
}

#[async_trait]
impl AuditStore for Neo4jStore {
    async fn save_audit(&self, report: &AuditReport) -> Result<()> {
        let payload = serde_json::to_string(report)?;
        let tx = self.graph.start_txn().await?;

        tx.run(
            query(
                "MERGE (a:Audit {id: $id})
                 SET a.call_id = $call_id, a.audit_config_id = $audit_config_id,
                     a.updated_at = $updated_at, a.percentage = $percentage,
                     a.conforme = $conforme, a.payload = $payload
                 WITH a
                 MATCH (c:Call {id: $call_id})
                 MERGE (c)-[:HAS_AUDIT]->(a)",
            )
            .param("id", report.audit_id.clone())
            .param("call_id", report.call_id.clone())
            .param("audit_config_id", report.audit_config_id.clone())
            .param("updated_at", report.updated_at.to_rfc3339())
            .param("percentage", report.totals.percentage)
            .param("conforme", report.conforme.as_str())
            .param("payload", payload),
        )
        .await?;

        for step in &report.steps {
            tx.run(
                query(
                    "MATCH (a:Audit {id: $audit_id})
                     MERGE (a)-[:HAS_STEP]->(s:StepResult {audit_id: $audit_id, position: $position})
                     SET s.name = $name, s.score = $score, s.conforme = $conforme, s.payload = $payload",
                )
                .param("audit_id", report.audit_id.clone())
                .param("position", i64::from(step.position))
                .param("name", step.name.clone())
                .param("score", step.result.score)
                .param("conforme", step.result.conforme.as_str())
                .param("payload", serde_json::to_string(step)?),
            )
            .await?;
        }

        tx.commit().await?;
        debug!(audit_id = %report.audit_id, steps = report.steps.len(), "Auditoría persistida en Neo4j");
        Ok(())
    }

    async fn load_audit(&self, audit_id: &str) -> Result<AuditReport> {
        let payload = self
            .read_payload("MATCH (a:Audit {id: $id}) RETURN a.payload AS payload", audit_id)
            .await?
            .ok_or_else(|| ConfigError::UnknownAudit(audit_id.to_string()))?;
        serde_json::from_str(&payload)
            .with_context(|| format!("payload de auditoría ilegible: '{audit_id}'"))
    }

    async fn append_rerun(&self, record: &RerunRecord) -> Result<()> {
        self.graph
            .run(
                query(
                    "MATCH (a:Audit {id: $audit_id})
                     CREATE (a)-[:HAS_RERUN]->(:RerunEntry {
                         id: $id, created_at: $created_at, step_position: $step_position,
                         payload: $payload
                     })",
                )
                .param("audit_id", record.audit_id.clone())
                .param("id", record.rerun_id.clone())
                .param("created_at", record.created_at.to_rfc3339())
                .param("step_position", i64::from(record.comparison.step_position))
                .param("payload", serde_json::to_string(record)?),
            )
            .await?;
        Ok(())
    }
}
