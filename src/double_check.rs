//! Doble verificación de etapas de alto riesgo.
//!
//! Si la primera pasada concluye no conformidad (o conformidad parcial con
//! score muy bajo) en una etapa pesada o crítica y con pocas citas, se lanza
//! una segunda pasada con criterios de verificación relajados y se elige
//! el resultado final con una regla de precedencia fija. Las dos pasadas
//! pasan por el gate de evidencias antes de compararse.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::evidence_gate::{gate_step, GatePolicy, GateStats};
use crate::llm::{StepEvaluationRequest, StepEvaluator};
use crate::models::{Conforme, StepDefinition, StepResult};

pub const RELAXED_VERIFICATION_PROMPT: &str = "\
VÉRIFICATION COMPLÉMENTAIRE (seconde lecture) :
Une première analyse a conclu à une non-conformité. Relis la transcription avec un regard plus souple :
- accepte les formulations indirectes et les reformulations qui transmettent la même information ;
- en cas de doute raisonnable, privilégie PARTIEL plutôt qu'ABSENT ;
- justifie chaque statut, dans un sens comme dans l'autre, et cite le texte exact obtenu via getChunks.";

/// Umbrales de la política de doble verificación.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoubleCheckPolicy {
    /// Diferencia máxima de score para considerar dos pasadas empatadas.
    pub tie_threshold: f64,
    pub min_weight: u32,
    /// PARTIEL cuenta como fallo si `score < weight · partial_score_ratio`.
    pub partial_score_ratio: f64,
    /// Con este número de citas o más, la primera pasada se da por buena.
    pub min_citations: usize,
}

impl Default for DoubleCheckPolicy {
    fn default() -> Self {
        Self {
            tie_threshold: 1.0,
            min_weight: 7,
            partial_score_ratio: 0.30,
            min_citations: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassChoice {
    FirstPass,
    SecondPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeBranch {
    HigherScore,
    BetterDocumented,
    FirstPassConfirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeDecision {
    pub choice: PassChoice,
    pub branch: MergeBranch,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleCheckOutcome {
    pub result: StepResult,
    /// Estadísticas del gate de todas las pasadas ejecutadas.
    pub stats: GateStats,
    pub double_checked: bool,
    pub chosen: PassChoice,
    pub reasoning: String,
    pub first_pass_score: f64,
    pub second_pass_score: Option<f64>,
}

pub fn should_double_check(
    result: &StepResult,
    step: &StepDefinition,
    policy: &DoubleCheckPolicy,
) -> bool {
    let weight = f64::from(step.weight);
    let failing = match result.conforme {
        Conforme::NonConforme => true,
        Conforme::Partiel => result.score < weight * policy.partial_score_ratio,
        Conforme::Conforme => false,
    };
    let high_stakes = step.weight >= policy.min_weight || step.is_critical;
    let thin_evidence = result.total_citations() < policy.min_citations;

    failing && high_stakes && thin_evidence
}

/// Regla de precedencia entre la primera pasada y la relajada.
pub fn merge_passes(
    first: &StepResult,
    second: &StepResult,
    policy: &DoubleCheckPolicy,
) -> MergeDecision {
    let (first_citations, second_citations) = (first.total_citations(), second.total_citations());

    if second.score > first.score {
        MergeDecision {
            choice: PassChoice::SecondPass,
            branch: MergeBranch::HigherScore,
            reasoning: format!(
                "Seconde lecture retenue : score {} contre {} (preuves supplémentaires trouvées).",
                second.score, first.score
            ),
        }
    } else if (second.score - first.score).abs() <= policy.tie_threshold
        && second_citations > first_citations
    {
        MergeDecision {
            choice: PassChoice::SecondPass,
            branch: MergeBranch::BetterDocumented,
            reasoning: format!(
                "Seconde lecture retenue : scores équivalents ({} / {}) mais mieux documentée ({} citations contre {}).",
                second.score, first.score, second_citations, first_citations
            ),
        }
    } else {
        MergeDecision {
            choice: PassChoice::FirstPass,
            branch: MergeBranch::FirstPassConfirmed,
            reasoning: format!(
                "Première analyse confirmée : la seconde lecture (score {}, {} citations) n'apporte pas de preuve supplémentaire.",
                second.score, second_citations
            ),
        }
    }
}

/// Etapa con las instrucciones relajadas añadidas a las originales.
pub fn relaxed_step(step: &StepDefinition) -> StepDefinition {
    let custom_instructions = match step.custom_instructions.as_deref().map(str::trim) {
        Some(original) if !original.is_empty() => {
            format!("{original}\n\n{RELAXED_VERIFICATION_PROMPT}")
        }
        _ => RELAXED_VERIFICATION_PROMPT.to_string(),
    };
    StepDefinition {
        custom_instructions: Some(custom_instructions),
        ..step.clone()
    }
}

/// Evalúa una etapa, la pasa por el gate y, si procede, lanza la segunda
/// pasada relajada. Los errores del LLM se propagan sin reintentos.
pub async fn evaluate_with_double_check(
    evaluator: &dyn StepEvaluator,
    request: StepEvaluationRequest<'_>,
    gate_policy: &GatePolicy,
    policy: &DoubleCheckPolicy,
) -> Result<DoubleCheckOutcome> {
    let step = request.step;
    let index = request.index.clone();

    let first_raw = evaluator.evaluate_step(request.clone()).await?;
    let first = gate_step(first_raw, step, &index, gate_policy);
    let mut stats = first.stats;

    if !should_double_check(&first.result, step, policy) {
        return Ok(DoubleCheckOutcome {
            first_pass_score: first.result.score,
            result: first.result,
            stats,
            double_checked: false,
            chosen: PassChoice::FirstPass,
            reasoning: "Analyse unique : les conditions de double vérification ne sont pas réunies."
                .to_string(),
            second_pass_score: None,
        });
    }

    info!(
        step = step.position,
        score = first.result.score,
        citations = first.result.total_citations(),
        "Lanzando doble verificación de la etapa '{}'",
        step.name
    );

    let relaxed = relaxed_step(step);
    let second_raw = evaluator
        .evaluate_step(StepEvaluationRequest {
            step: &relaxed,
            ..request
        })
        .await?;
    let second = gate_step(second_raw, step, &index, gate_policy);
    stats.merge(&second.stats);

    let decision = merge_passes(&first.result, &second.result, policy);
    info!(
        step = step.position,
        branch = ?decision.branch,
        first = first.result.score,
        second = second.result.score,
        "Doble verificación resuelta"
    );

    let first_pass_score = first.result.score;
    let second_pass_score = second.result.score;
    let result = match decision.choice {
        PassChoice::FirstPass => first.result,
        PassChoice::SecondPass => second.result,
    };

    Ok(DoubleCheckOutcome {
        result,
        stats,
        double_checked: true,
        chosen: decision.choice,
        reasoning: decision.reasoning,
        first_pass_score,
        second_pass_score: Some(second_pass_score),
    })
}
