//! Ejecución completa de una auditoría sobre una llamada.
//!
//! Flujo:
//!   1. Carga de la definición de auditoría y validación.
//!   2. Reconstrucción del índice de chunks desde las transcripciones
//!      persistidas (las grabaciones sin transcripción se omiten).
//!   3. Evaluación de cada etapa con concurrencia acotada: contexto de
//!      producto (mejor esfuerzo), primera pasada, gate y doble verificación.
//!   4. Agregación del informe y entrega al colaborador de persistencia.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk_index::ChunkIndex;
use crate::double_check::{evaluate_with_double_check, DoubleCheckPolicy};
use crate::error::ConfigError;
use crate::evidence_gate::{conforme_for_ratio, GatePolicy, GateStats};
use crate::llm::{StepEvaluationRequest, StepEvaluator};
use crate::models::{AuditDefinition, Conforme, RecordingTimeline, StepDefinition, StepResult};
use crate::store::{AuditConfigSource, AuditStore, ProductContextProvider, TranscriptSource};

// ---------------------------------------------------------------------
// CONTEXTO DE TRANSCRIPCIÓN
// ---------------------------------------------------------------------

/// Índice reconstruido para una llamada, con las grabaciones omitidas.
#[derive(Debug, Clone)]
pub struct TranscriptContext {
    pub index: Arc<ChunkIndex>,
    pub recordings_indexed: usize,
    pub recordings_skipped: Vec<usize>,
}

/// Reconstruye el índice desde el almacenamiento de transcripciones.
/// Una grabación sin transcripción no es un error: se avisa y se sigue.
pub async fn load_transcript(source: &dyn TranscriptSource, call_id: &str) -> Result<TranscriptContext> {
    let recordings = source.load_recordings(call_id).await?;

    let mut timelines: Vec<RecordingTimeline> = Vec::with_capacity(recordings.len());
    let mut recordings_skipped = Vec::new();
    for recording in recordings {
        let recording_index = recording.recording_index;
        match recording.into_timeline() {
            Some(timeline) => timelines.push(timeline),
            None => {
                warn!(
                    call_id,
                    recording_index, "Grabación sin transcripción, se omite del contexto"
                );
                recordings_skipped.push(recording_index);
            }
        }
    }

    let index = ChunkIndex::build(&timelines);
    if index.is_empty() {
        warn!(call_id, "No hay ningún chunk de transcripción para esta llamada");
    }

    Ok(TranscriptContext {
        recordings_indexed: timelines.len(),
        index: Arc::new(index),
        recordings_skipped,
    })
}

/// Contexto de producto en modo mejor esfuerzo: cualquier fallo se registra
/// y se trata como "sin contexto".
pub async fn fetch_product_context(
    provider: Option<&dyn ProductContextProvider>,
    call_id: &str,
    step: &StepDefinition,
) -> Option<String> {
    if !step.verify_product_info {
        return None;
    }
    let provider = provider?;
    match provider.product_context(call_id, step).await {
        Ok(context) => context.filter(|c| !c.trim().is_empty()),
        Err(err) => {
            warn!(
                call_id,
                step = step.position,
                "No se pudo obtener el contexto de producto: {err:#}"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------
// INFORME
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub position: u32,
    pub name: String,
    pub weight: u32,
    pub is_critical: bool,
    pub result: StepResult,
    pub double_checked: bool,
    pub double_check_reasoning: String,
    pub first_pass_score: f64,
    pub second_pass_score: Option<f64>,
    pub product_context_used: bool,
    #[serde(default)]
    pub last_rerun_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTotals {
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub audit_id: String,
    pub audit_config_id: String,
    pub audit_name: String,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub totals: AuditTotals,
    pub conforme: Conforme,
    pub critical_failures: Vec<u32>,
    pub gate_stats: GateStats,
    pub double_checked_steps: usize,
    pub recordings_indexed: usize,
    pub recordings_skipped: Vec<usize>,
    pub chunks_indexed: usize,
}

impl AuditReport {
    /// Recalcula totales, etapas críticas fallidas y veredicto global.
    /// Una etapa crítica NON_CONFORME hace la auditoría NON_CONFORME.
    pub fn recompute_totals(&mut self, policy: &GatePolicy) {
        let total_score: f64 = self.steps.iter().map(|s| s.result.score).sum();
        let max_score: f64 = self.steps.iter().map(|s| f64::from(s.weight)).sum();
        let ratio = if max_score > 0.0 { total_score / max_score } else { 1.0 };

        self.totals = AuditTotals {
            total_score,
            max_score,
            percentage: (ratio * 1000.0).round() / 10.0,
        };
        self.critical_failures = self
            .steps
            .iter()
            .filter(|s| s.is_critical && s.result.conforme == Conforme::NonConforme)
            .map(|s| s.position)
            .collect();
        self.conforme = if self.critical_failures.is_empty() {
            conforme_for_ratio(ratio, policy)
        } else {
            Conforme::NonConforme
        };
    }

    pub fn step(&self, position: u32) -> Result<&StepReport, ConfigError> {
        self.steps
            .iter()
            .find(|s| s.position == position)
            .ok_or_else(|| ConfigError::UnknownStep {
                audit_id: self.audit_id.clone(),
                position,
            })
    }

    /// Sustituye el resultado de una etapa tras una re-ejecución.
    pub fn supersede_step(
        &mut self,
        position: u32,
        result: StepResult,
        rerun_id: &str,
        policy: &GatePolicy,
    ) -> Result<(), ConfigError> {
        let audit_id = self.audit_id.clone();
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.position == position)
            .ok_or(ConfigError::UnknownStep { audit_id, position })?;
        step.result = result;
        step.last_rerun_id = Some(rerun_id.to_string());
        self.updated_at = Utc::now();
        self.recompute_totals(policy);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// EJECUCIÓN
// ---------------------------------------------------------------------

pub struct AuditRunner {
    pub transcripts: Arc<dyn TranscriptSource>,
    pub configs: Arc<dyn AuditConfigSource>,
    pub store: Arc<dyn AuditStore>,
    pub products: Option<Arc<dyn ProductContextProvider>>,
    pub evaluator: Arc<dyn StepEvaluator>,
    pub gate_policy: GatePolicy,
    pub double_check_policy: DoubleCheckPolicy,
    pub max_concurrency: usize,
}

struct StepRun {
    report: StepReport,
    stats: GateStats,
}

impl AuditRunner {
    /// Ejecuta la auditoría configurada sobre una llamada y la persiste.
    pub async fn run(&self, call_id: &str, audit_config_id: &str) -> Result<AuditReport> {
        let definition = self.configs.load_audit_definition(audit_config_id).await?;
        let report = self.run_definition(call_id, &definition).await?;
        self.store.save_audit(&report).await?;
        info!(
            audit_id = %report.audit_id,
            call_id,
            score = report.totals.total_score,
            max = report.totals.max_score,
            "✅ Auditoría completada y guardada"
        );
        Ok(report)
    }

    /// Ejecuta una definición ya cargada, sin persistir.
    pub async fn run_definition(&self, call_id: &str, definition: &AuditDefinition) -> Result<AuditReport> {
        definition.validate()?;

        let transcript = load_transcript(self.transcripts.as_ref(), call_id).await?;
        info!(
            call_id,
            chunks = transcript.index.len(),
            recordings = transcript.recordings_indexed,
            skipped = transcript.recordings_skipped.len(),
            "Índice de transcripción construido"
        );

        let mut steps: Vec<&StepDefinition> = definition.steps.iter().collect();
        steps.sort_by_key(|s| s.position);

        let step_futures: Vec<_> = steps
            .into_iter()
            .map(|step| self.run_step(call_id, &definition.name, step, transcript.index.clone()))
            .collect();
        let runs: Vec<StepRun> = stream::iter(step_futures)
            .buffered(self.max_concurrency.max(1))
            .try_collect()
            .await?;

        let mut gate_stats = GateStats::default();
        for run in &runs {
            gate_stats.merge(&run.stats);
        }
        info!(call_id, stats = ?gate_stats, "Estadísticas del gate de evidencias");

        let now = Utc::now();
        let steps: Vec<StepReport> = runs.into_iter().map(|r| r.report).collect();
        let mut report = AuditReport {
            audit_id: Uuid::new_v4().to_string(),
            audit_config_id: definition.id.clone(),
            audit_name: definition.name.clone(),
            call_id: call_id.to_string(),
            created_at: now,
            updated_at: now,
            double_checked_steps: steps.iter().filter(|s| s.double_checked).count(),
            steps,
            totals: AuditTotals::default(),
            conforme: Conforme::Conforme,
            critical_failures: Vec::new(),
            gate_stats,
            recordings_indexed: transcript.recordings_indexed,
            recordings_skipped: transcript.recordings_skipped,
            chunks_indexed: transcript.index.len(),
        };
        report.recompute_totals(&self.gate_policy);
        Ok(report)
    }

    async fn run_step(
        &self,
        call_id: &str,
        audit_name: &str,
        step: &StepDefinition,
        index: Arc<ChunkIndex>,
    ) -> Result<StepRun> {
        let product_context = fetch_product_context(self.products.as_deref(), call_id, step).await;
        let product_context_used = product_context.is_some();

        let request = StepEvaluationRequest {
            audit_name,
            step,
            index,
            extra_context: None,
            product_context,
        };
        let outcome = evaluate_with_double_check(
            self.evaluator.as_ref(),
            request,
            &self.gate_policy,
            &self.double_check_policy,
        )
        .await?;

        info!(
            step = step.position,
            score = outcome.result.score,
            conforme = outcome.result.conforme.as_str(),
            removed = outcome.stats.citations_removed,
            downgraded = outcome.stats.control_points_downgraded,
            double_checked = outcome.double_checked,
            "Etapa '{}' evaluada",
            step.name
        );

        Ok(StepRun {
            stats: outcome.stats,
            report: StepReport {
                position: step.position,
                name: step.name.clone(),
                weight: step.weight,
                is_critical: step.is_critical,
                first_pass_score: outcome.first_pass_score,
                second_pass_score: outcome.second_pass_score,
                double_checked: outcome.double_checked,
                double_check_reasoning: outcome.reasoning,
                result: outcome.result,
                product_context_used,
                last_rerun_id: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::models::Statut;
    use crate::store::memory::{
        FixedProductContext, InMemoryAuditConfigs, InMemoryAuditStore, InMemoryTranscriptSource,
    };
    use crate::test_support::{
        citation, control_point, step_def, step_result, stored_recordings, PerStepEvaluator,
    };

    fn definition() -> AuditDefinition {
        let mut critical = step_def(2, 8, &["Enregistrement", "Rétractation"]);
        critical.is_critical = true;
        critical.verify_product_info = true;
        AuditDefinition {
            id: "vente-distance".into(),
            name: "Vente à distance".into(),
            description: String::new(),
            steps: vec![critical, step_def(1, 4, &["Présentation"])],
        }
    }

    fn presentation_ok() -> StepResult {
        step_result(
            4.0,
            Conforme::Conforme,
            vec![control_point(
                "Présentation",
                Statut::Present,
                vec![citation(0, 0, "je suis Julien de la société")],
            )],
        )
    }

    fn legal_ok() -> StepResult {
        step_result(
            8.0,
            Conforme::Conforme,
            vec![
                control_point("Enregistrement", Statut::Present, vec![citation(0, 1, "cet appel est enregistré")]),
                control_point(
                    "Rétractation",
                    Statut::Present,
                    vec![citation(0, 2, "délai de rétractation de quatorze jours")],
                ),
            ],
        )
    }

    fn runner(evaluator: PerStepEvaluator, products: Option<Arc<dyn ProductContextProvider>>) -> (AuditRunner, Arc<InMemoryAuditStore>) {
        let store = Arc::new(InMemoryAuditStore::default());
        let runner = AuditRunner {
            transcripts: Arc::new(InMemoryTranscriptSource::with_call("call-1", stored_recordings())),
            configs: Arc::new(InMemoryAuditConfigs::with(definition())),
            store: store.clone(),
            products,
            evaluator: Arc::new(evaluator),
            gate_policy: GatePolicy::default(),
            double_check_policy: DoubleCheckPolicy::default(),
            max_concurrency: 2,
        };
        (runner, store)
    }

    #[tokio::test]
    async fn runs_steps_in_position_order_and_persists() {
        let evaluator = PerStepEvaluator::new(vec![(1, vec![Ok(presentation_ok())]), (2, vec![Ok(legal_ok())])]);
        let products: Arc<dyn ProductContextProvider> =
            Arc::new(FixedProductContext(Ok(Some("Offre Énergie Plus 12 mois".into()))));
        let (runner, store) = runner(evaluator, Some(products));

        let report = runner.run("call-1", "vente-distance").await.unwrap();

        let positions: Vec<u32> = report.steps.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(report.totals.total_score, 12.0);
        assert_eq!(report.totals.max_score, 12.0);
        assert_eq!(report.totals.percentage, 100.0);
        assert_eq!(report.conforme, Conforme::Conforme);
        assert_eq!(report.chunks_indexed, 6);
        assert_eq!(report.gate_stats.steps_gated, 2);
        assert_eq!(report.gate_stats.citations_removed, 0);
        assert!(!report.steps[0].product_context_used);
        assert!(report.steps[1].product_context_used);

        let saved = store.load_audit(&report.audit_id).await.unwrap();
        assert_eq!(saved, report);
    }

    #[tokio::test]
    async fn critical_failure_fails_the_audit_after_double_check() {
        let failing = step_result(
            8.0,
            Conforme::Conforme,
            vec![
                control_point("Enregistrement", Statut::Present, vec![citation(0, 1, "l'appel n'est pas enregistré du tout")]),
                control_point("Rétractation", Statut::Absent, vec![]),
            ],
        );
        let still_failing = step_result(0.0, Conforme::NonConforme, vec![]);
        let evaluator = PerStepEvaluator::new(vec![
            (1, vec![Ok(presentation_ok())]),
            (2, vec![Ok(failing), Ok(still_failing)]),
        ]);
        let (runner, _) = runner(evaluator, None);

        let report = runner.run("call-1", "vente-distance").await.unwrap();
        let legal = report.step(2).unwrap();
        assert!(legal.double_checked);
        assert_eq!(legal.result.score, 0.0);
        assert_eq!(legal.result.points_controle[0].statut, Statut::Absent);
        assert_eq!(report.critical_failures, vec![2]);
        assert_eq!(report.conforme, Conforme::NonConforme);
        assert_eq!(report.double_checked_steps, 1);
        assert_eq!(report.gate_stats.control_points_downgraded, 1);
    }

    #[tokio::test]
    async fn product_lookup_failure_is_not_fatal() {
        let evaluator = PerStepEvaluator::new(vec![(1, vec![Ok(presentation_ok())]), (2, vec![Ok(legal_ok())])]);
        let products: Arc<dyn ProductContextProvider> =
            Arc::new(FixedProductContext(Err("catalogue indisponible".into())));
        let (runner, _) = runner(evaluator, Some(products));

        let report = runner.run("call-1", "vente-distance").await.unwrap();
        assert!(!report.steps[1].product_context_used);
        assert_eq!(report.totals.total_score, 12.0);
    }

    #[tokio::test]
    async fn llm_failure_propagates() {
        let evaluator = PerStepEvaluator::new(vec![
            (1, vec![Ok(presentation_ok())]),
            (2, vec![Err(anyhow!("rate limit"))]),
        ]);
        let (runner, store) = runner(evaluator, None);
        assert!(runner.run("call-1", "vente-distance").await.is_err());
        assert!(store.audits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_config_and_invalid_definitions_fail_fast() {
        let (runner, _) = runner(PerStepEvaluator::new(vec![]), None);
        let err = runner.run("call-1", "inconnue").await.unwrap_err();
        assert!(matches!(ConfigError::find_in(&err), Some(ConfigError::UnknownAudit(_))));

        let mut broken = definition();
        broken.steps[0].weight = 0;
        let err = runner.run_definition("call-1", &broken).await.unwrap_err();
        assert!(matches!(ConfigError::find_in(&err), Some(ConfigError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn missing_transcripts_are_skipped() {
        let mut recordings = stored_recordings();
        recordings[0].chunks = None;
        let source = InMemoryTranscriptSource::with_call("call-9", recordings);
        let ctx = load_transcript(&source, "call-9").await.unwrap();
        assert_eq!(ctx.recordings_skipped, vec![0]);
        assert_eq!(ctx.recordings_indexed, 1);
        assert_eq!(ctx.index.len(), 2);

        let empty = load_transcript(&source, "sin-llamada").await.unwrap();
        assert!(empty.index.is_empty());
    }

    #[test]
    fn supersede_recomputes_totals() {
        let now = Utc::now();
        let mut report = AuditReport {
            audit_id: "a".into(),
            audit_config_id: "c".into(),
            audit_name: "n".into(),
            call_id: "call".into(),
            created_at: now,
            updated_at: now,
            steps: vec![StepReport {
                position: 1,
                name: "Etape 1".into(),
                weight: 10,
                is_critical: true,
                result: step_result(2.0, Conforme::NonConforme, vec![]),
                double_checked: false,
                double_check_reasoning: String::new(),
                first_pass_score: 2.0,
                second_pass_score: None,
                product_context_used: false,
                last_rerun_id: None,
            }],
            totals: AuditTotals::default(),
            conforme: Conforme::Conforme,
            critical_failures: vec![],
            gate_stats: GateStats::default(),
            double_checked_steps: 0,
            recordings_indexed: 1,
            recordings_skipped: vec![],
            chunks_indexed: 3,
        };
        let policy = GatePolicy::default();
        report.recompute_totals(&policy);
        assert_eq!(report.critical_failures, vec![1]);
        assert_eq!(report.conforme, Conforme::NonConforme);

        report
            .supersede_step(1, step_result(9.0, Conforme::Conforme, vec![]), "r-1", &policy)
            .unwrap();
        assert_eq!(report.totals.percentage, 90.0);
        assert_eq!(report.conforme, Conforme::Conforme);
        assert_eq!(report.steps[0].last_rerun_id.as_deref(), Some("r-1"));
        assert!(report.supersede_step(4, step_result(1.0, Conforme::Partiel, vec![]), "r-2", &policy).is_err());
    }
}
