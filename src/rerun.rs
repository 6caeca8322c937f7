//! Re-ejecución dirigida de una etapa o de un único punto de control de una
//! auditoría ya persistida.
//!
//! La transcripción se reconstruye siempre desde el almacenamiento (nunca
//! desde caché), el resultado previo y las consignas del operador se
//! inyectan como contexto, y la respuesta del modelo pasa por el mismo gate
//! de evidencias que la primera pasada. Una re-ejecución nunca lanza doble
//! verificación.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::audit::{fetch_product_context, load_transcript, AuditReport};
use crate::error::ConfigError;
use crate::evidence_gate::{
    append_note, gate_step, rederive_from_evidence, GatePolicy, GateStats, GatedStep,
};
use crate::llm::{StepEvaluationRequest, StepEvaluator};
use crate::models::{ControlPoint, StepDefinition, StepResult};
use crate::store::{AuditConfigSource, AuditStore, ProductContextProvider, TranscriptSource};

// ---------------------------------------------------------------------
// COMPARACIÓN ANTES / DESPUÉS
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RerunKind {
    Step,
    ControlPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RerunPayload {
    Step(StepResult),
    ControlPoint(ControlPoint),
}

/// Diferencias entre el resultado original y el re-ejecutado.
///
/// `score_*` y `conforme_*` se refieren siempre a la etapa completa; en una
/// re-ejecución de punto de control, `statut_*` y `citations_*` se refieren
/// al punto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunComparison {
    pub kind: RerunKind,
    pub step_position: u32,
    pub control_point_index: Option<usize>,
    pub statut_changed: bool,
    pub score_changed: bool,
    pub conforme_changed: bool,
    pub citations_changed: bool,
    pub score_delta: f64,
    pub citation_count_delta: i64,
    pub before: RerunPayload,
    pub after: RerunPayload,
}

fn count_delta(before: usize, after: usize) -> i64 {
    after as i64 - before as i64
}

pub fn compare_steps(position: u32, before: &StepResult, after: &StepResult) -> RerunComparison {
    let statuts_before: Vec<_> = before.points_controle.iter().map(|cp| cp.statut).collect();
    let statuts_after: Vec<_> = after.points_controle.iter().map(|cp| cp.statut).collect();
    let (citations_before, citations_after) = (before.total_citations(), after.total_citations());

    RerunComparison {
        kind: RerunKind::Step,
        step_position: position,
        control_point_index: None,
        statut_changed: statuts_before != statuts_after,
        score_changed: before.score != after.score,
        conforme_changed: before.conforme != after.conforme,
        citations_changed: citations_before != citations_after,
        score_delta: after.score - before.score,
        citation_count_delta: count_delta(citations_before, citations_after),
        before: RerunPayload::Step(before.clone()),
        after: RerunPayload::Step(after.clone()),
    }
}

pub fn compare_control_points(
    position: u32,
    control_point_index: usize,
    step_before: &StepResult,
    step_after: &StepResult,
    before: &ControlPoint,
    after: &ControlPoint,
) -> RerunComparison {
    RerunComparison {
        kind: RerunKind::ControlPoint,
        step_position: position,
        control_point_index: Some(control_point_index),
        statut_changed: before.statut != after.statut,
        score_changed: step_before.score != step_after.score,
        conforme_changed: step_before.conforme != step_after.conforme,
        citations_changed: before.citations.len() != after.citations.len(),
        score_delta: step_after.score - step_before.score,
        citation_count_delta: count_delta(before.citations.len(), after.citations.len()),
        before: RerunPayload::ControlPoint(before.clone()),
        after: RerunPayload::ControlPoint(after.clone()),
    }
}

/// Entrada del historial de re-ejecuciones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunRecord {
    pub rerun_id: String,
    pub audit_id: String,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub operator_instructions: Option<String>,
    pub comparison: RerunComparison,
}

#[derive(Debug, Clone)]
pub struct RerunOutcome {
    pub record: RerunRecord,
    pub stats: GateStats,
    /// Informe ya actualizado y persistido.
    pub report: AuditReport,
}

// ---------------------------------------------------------------------
// CONTEXTO INYECTADO
// ---------------------------------------------------------------------

pub fn summarize_control_point(cp: &ControlPoint) -> String {
    let minutages = if cp.minutages.is_empty() {
        "aucun".to_string()
    } else {
        cp.minutages.join(", ")
    };
    let commentaire = if cp.commentaire.trim().is_empty() {
        "(aucun)"
    } else {
        cp.commentaire.trim()
    };
    format!(
        "Résultat précédent pour ce point de contrôle :\n- statut : {}\n- citations : {}\n- minutages : {}\n- commentaire : {}\n",
        cp.statut.as_str(),
        cp.citations.len(),
        minutages,
        commentaire
    )
}

pub fn summarize_step(result: &StepResult, weight: u32) -> String {
    let mut summary = format!(
        "Résultat précédent de l'étape : score {}/{}, {}\n",
        result.score,
        weight,
        result.conforme.as_str()
    );
    for cp in &result.points_controle {
        summary.push_str(&format!(
            "- {} : {} ({} citation(s))\n",
            cp.point,
            cp.statut.as_str(),
            cp.citations.len()
        ));
    }
    if !result.commentaire_global.trim().is_empty() {
        summary.push_str(&format!("Commentaire : {}\n", result.commentaire_global.trim()));
    }
    summary
}

/// Consigna del operador primero y resumen del resultado previo después.
/// Las instrucciones propias de la etapa las añade el contexto de etapa.
pub fn rerun_context(operator_instructions: Option<&str>, prior_summary: &str) -> String {
    let mut ctx = String::new();
    if let Some(instructions) = operator_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        ctx.push_str("Consigne de l'opérateur (prioritaire) :\n");
        ctx.push_str(instructions);
        ctx.push_str("\n\n");
    }
    ctx.push_str(prior_summary);
    ctx
}

/// Sustituye un punto de control en el resultado de la etapa y recalcula
/// score y veredicto desde el ratio de evidencias.
pub fn splice_control_point(
    original: &StepResult,
    position: u32,
    control_point_index: usize,
    rerun_point: ControlPoint,
    weight: u32,
    policy: &GatePolicy,
) -> Result<StepResult, ConfigError> {
    let mut spliced = original.clone();
    let available = spliced.points_controle.len();
    let slot = spliced
        .points_controle
        .get_mut(control_point_index)
        .ok_or(ConfigError::ControlPointOutOfRange {
            position,
            index: control_point_index,
            available,
        })?;
    let note = format!(
        "point {} réévalué : {} → {}.",
        control_point_index + 1,
        slot.statut.as_str(),
        rerun_point.statut.as_str()
    );
    *slot = rerun_point;
    rederive_from_evidence(&mut spliced, weight, policy);
    append_note(&mut spliced.commentaire_global, &note);
    Ok(spliced)
}

// ---------------------------------------------------------------------
// SERVICIO
// ---------------------------------------------------------------------

pub struct RerunService {
    /// Fuente autoritativa, sin caché delante.
    pub transcripts: Arc<dyn TranscriptSource>,
    pub configs: Arc<dyn AuditConfigSource>,
    pub store: Arc<dyn AuditStore>,
    pub products: Option<Arc<dyn ProductContextProvider>>,
    pub evaluator: Arc<dyn StepEvaluator>,
    pub gate_policy: GatePolicy,
}

/// Lo que comparten las dos variantes antes de llamar al modelo.
struct RerunTarget {
    report: AuditReport,
    step: StepDefinition,
    original: StepResult,
}

impl RerunService {
    async fn load_target(&self, audit_id: &str, position: u32) -> Result<RerunTarget> {
        let report = self.store.load_audit(audit_id).await?;
        let definition = self
            .configs
            .load_audit_definition(&report.audit_config_id)
            .await?;
        let step = definition.step(position)?.clone();
        step.validate()?;
        let original = report.step(position)?.result.clone();
        Ok(RerunTarget {
            report,
            step,
            original,
        })
    }

    /// Evalúa `step` una sola vez sobre la transcripción reconstruida y
    /// pasa la respuesta por el gate.
    async fn evaluate(
        &self,
        report: &AuditReport,
        step: &StepDefinition,
        extra_context: String,
    ) -> Result<GatedStep> {
        let transcript = load_transcript(self.transcripts.as_ref(), &report.call_id).await?;
        let product_context =
            fetch_product_context(self.products.as_deref(), &report.call_id, step).await;

        let request = StepEvaluationRequest {
            audit_name: &report.audit_name,
            step,
            index: transcript.index.clone(),
            extra_context: Some(extra_context),
            product_context,
        };
        let raw = self.evaluator.evaluate_step(request).await?;
        let gated = gate_step(raw, step, &transcript.index, &self.gate_policy);
        info!(
            step = step.position,
            removed = gated.stats.citations_removed,
            downgraded = gated.stats.control_points_downgraded,
            "Re-ejecución evaluada y verificada"
        );
        Ok(gated)
    }

    /// Re-ejecuta una etapa completa y sustituye su resultado.
    pub async fn rerun_step(
        &self,
        audit_id: &str,
        position: u32,
        operator_instructions: Option<&str>,
    ) -> Result<RerunOutcome> {
        let target = self.load_target(audit_id, position).await?;
        info!(audit_id, step = position, "🔁 Re-ejecutando etapa '{}'", target.step.name);

        let extra = rerun_context(
            operator_instructions,
            &summarize_step(&target.original, target.step.weight),
        );
        let gated = self.evaluate(&target.report, &target.step, extra).await?;

        let comparison = compare_steps(position, &target.original, &gated.result);
        self.persist(
            target.report,
            position,
            gated.result,
            operator_instructions,
            comparison,
            gated.stats,
        )
        .await
    }

    /// Re-ejecuta un único punto de control. La etapa se reduce a ese
    /// punto; el resultado se inserta en la etapa original y su score se
    /// recalcula desde las evidencias.
    pub async fn rerun_control_point(
        &self,
        audit_id: &str,
        position: u32,
        control_point_index: usize,
        operator_instructions: Option<&str>,
    ) -> Result<RerunOutcome> {
        let target = self.load_target(audit_id, position).await?;
        let narrowed = target.step.narrowed_to(control_point_index)?;
        let before = target
            .original
            .points_controle
            .get(control_point_index)
            .cloned()
            .ok_or(ConfigError::ControlPointOutOfRange {
                position,
                index: control_point_index,
                available: target.original.points_controle.len(),
            })?;
        info!(
            audit_id,
            step = position,
            control_point = control_point_index,
            "🔁 Re-ejecutando punto de control '{}'",
            before.point
        );

        let extra = rerun_context(operator_instructions, &summarize_control_point(&before));
        let gated = self.evaluate(&target.report, &narrowed, extra).await?;

        let after = gated
            .result
            .points_controle
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("la re-ejecución no devolvió ningún punto de control"))?;
        let spliced = splice_control_point(
            &target.original,
            position,
            control_point_index,
            after.clone(),
            target.step.weight,
            &self.gate_policy,
        )?;

        let comparison = compare_control_points(
            position,
            control_point_index,
            &target.original,
            &spliced,
            &before,
            &after,
        );
        self.persist(
            target.report,
            position,
            spliced,
            operator_instructions,
            comparison,
            gated.stats,
        )
        .await
    }

    async fn persist(
        &self,
        mut report: AuditReport,
        position: u32,
        result: StepResult,
        operator_instructions: Option<&str>,
        comparison: RerunComparison,
        stats: GateStats,
    ) -> Result<RerunOutcome> {
        let record = RerunRecord {
            rerun_id: Uuid::new_v4().to_string(),
            audit_id: report.audit_id.clone(),
            call_id: report.call_id.clone(),
            created_at: Utc::now(),
            operator_instructions: operator_instructions.map(str::to_string),
            comparison,
        };

        report.supersede_step(position, result, &record.rerun_id, &self.gate_policy)?;
        self.store.save_audit(&report).await?;
        self.store.append_rerun(&record).await?;

        info!(
            audit_id = %record.audit_id,
            rerun_id = %record.rerun_id,
            step = position,
            score_delta = record.comparison.score_delta,
            "✅ Re-ejecución guardada"
        );
        Ok(RerunOutcome {
            record,
            stats,
            report,
        })
    }
}
