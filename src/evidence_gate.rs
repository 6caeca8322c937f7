//! Gate de evidencias: validación determinista (sin LLM) de las citas de un
//! resultado de etapa.
//!
//! Reglas, en orden:
//!   1. Una cita es válida si su chunk existe, si su texto normalizado es
//!      subcadena literal del texto normalizado del chunk y si tiene al
//!      menos `min_quote_chars` caracteres normalizados.
//!   2. ABSENT / NON_APPLICABLE se quedan sin citas. PRESENT / PARTIEL sólo
//!      conservan las válidas.
//!   3. Un punto afirmativo sin citas tras la poda pasa a ABSENT.
//!   4. Los minutajes se reconstruyen desde las citas supervivientes.
//!   5. Score, veredicto y nivel se recalculan desde el ratio de evidencias
//!      y sólo se aplican si son más severos que los del modelo. El nivel se
//!      deriva del veredicto ya ajustado.
//!
//! Aplicar el gate dos veces da el mismo resultado que aplicarlo una.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::chunk_index::ChunkIndex;
use crate::models::{
    Citation, Conforme, ControlPoint, NiveauConformite, Statut, StepDefinition, StepResult,
};
use crate::text::normalize;

pub const AUTO_CHECK_PREFIX: &str = "[Vérification automatique]";

/// Umbrales de la política de gating. Los valores por defecto son los de
/// producción; se pueden sobreescribir desde la configuración.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatePolicy {
    pub conforme_threshold: f64,
    pub partiel_threshold: f64,
    pub excellent_threshold: f64,
    pub min_quote_chars: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            conforme_threshold: 0.85,
            partiel_threshold: 0.40,
            excellent_threshold: 0.95,
            min_quote_chars: 12,
        }
    }
}

/// Estadísticas de diagnóstico, acumulables entre etapas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStats {
    pub steps_gated: usize,
    pub citations_seen: usize,
    pub citations_removed: usize,
    pub control_points_downgraded: usize,
    pub control_points_missing: usize,
    pub steps_score_reduced: usize,
    pub steps_conformity_adjusted: usize,
}

impl GateStats {
    pub fn merge(&mut self, other: &GateStats) {
        self.steps_gated += other.steps_gated;
        self.citations_seen += other.citations_seen;
        self.citations_removed += other.citations_removed;
        self.control_points_downgraded += other.control_points_downgraded;
        self.control_points_missing += other.control_points_missing;
        self.steps_score_reduced += other.steps_score_reduced;
        self.steps_conformity_adjusted += other.steps_conformity_adjusted;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatedStep {
    pub result: StepResult,
    pub stats: GateStats,
}

// ---------------------------------------------------------------------
// PIEZAS PURAS
// ---------------------------------------------------------------------

pub fn is_citation_valid(index: &ChunkIndex, citation: &Citation, policy: &GatePolicy) -> bool {
    let Some(entry) = index.get(citation.chunk_ref()) else {
        return false;
    };
    let quote = normalize(&citation.texte);
    quote.chars().count() >= policy.min_quote_chars && entry.normalized_text.contains(&quote)
}

/// `(PRESENT + 0.5·PARTIEL) / aplicables`; 1 si no hay puntos aplicables.
pub fn evidence_ratio(points: &[ControlPoint]) -> f64 {
    let mut applicable = 0usize;
    let mut credit = 0.0;
    for cp in points {
        match cp.statut {
            Statut::NonApplicable => continue,
            Statut::Present => credit += 1.0,
            Statut::Partiel => credit += 0.5,
            Statut::Absent => {}
        }
        applicable += 1;
    }
    if applicable == 0 {
        1.0
    } else {
        credit / applicable as f64
    }
}

pub fn derived_score(ratio: f64, weight: u32) -> f64 {
    (ratio * f64::from(weight)).round().clamp(0.0, f64::from(weight))
}

pub fn conforme_for_ratio(ratio: f64, policy: &GatePolicy) -> Conforme {
    if ratio >= policy.conforme_threshold {
        Conforme::Conforme
    } else if ratio >= policy.partiel_threshold {
        Conforme::Partiel
    } else {
        Conforme::NonConforme
    }
}

pub fn niveau_for(conforme: Conforme, ratio: f64, policy: &GatePolicy) -> NiveauConformite {
    match conforme {
        Conforme::Conforme if ratio >= policy.excellent_threshold => NiveauConformite::Excellent,
        Conforme::Conforme => NiveauConformite::Bon,
        Conforme::Partiel => NiveauConformite::Acceptable,
        Conforme::NonConforme => NiveauConformite::Insuffisant,
    }
}

/// `MM:SS` (o `H:MM:SS`) a partir de segundos.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Minutajes únicos de las citas, en orden de primera aparición.
pub fn citation_minutages(citations: &[Citation]) -> Vec<String> {
    let mut seen = HashSet::new();
    citations
        .iter()
        .map(|c| c.minutage.clone())
        .filter(|m| !m.is_empty() && seen.insert(m.clone()))
        .collect()
}

/// Unión de los minutajes de todos los puntos, en orden de primera aparición.
pub fn step_minutages(points: &[ControlPoint]) -> Vec<String> {
    let mut seen = HashSet::new();
    points
        .iter()
        .flat_map(|cp| cp.minutages.iter())
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect()
}

pub fn append_note(comment: &mut String, note: &str) {
    if !comment.trim().is_empty() {
        comment.push('\n');
    }
    comment.push_str(AUTO_CHECK_PREFIX);
    comment.push(' ');
    comment.push_str(note);
}

// ---------------------------------------------------------------------
// ALINEACIÓN CON LA DEFINICIÓN
// ---------------------------------------------------------------------

/// Reordena los puntos devueltos por el modelo según la definición de la
/// etapa: primero todos por texto normalizado, después los que queden por
/// posición. Los que falten se crean como ABSENT; los sobrantes se
/// descartan.
fn align_control_points(
    raw: Vec<ControlPoint>,
    step: &StepDefinition,
    stats: &mut GateStats,
) -> Vec<ControlPoint> {
    if step.control_points.is_empty() {
        return raw;
    }

    let normalized_raw: Vec<String> = raw.iter().map(|cp| normalize(&cp.point)).collect();
    let mut slots: Vec<Option<ControlPoint>> = raw.into_iter().map(Some).collect();
    let mut matched: Vec<Option<ControlPoint>> = step.control_points.iter().map(|_| None).collect();

    // Primera pasada: texto normalizado, para todos los puntos configurados.
    for (pos, configured) in step.control_points.iter().enumerate() {
        let wanted = normalize(configured);
        if let Some(i) = (0..slots.len()).find(|&i| slots[i].is_some() && normalized_raw[i] == wanted) {
            matched[pos] = slots[i].take();
        }
    }

    // Segunda pasada: posición, sólo entre los puntos del modelo no reclamados.
    for (pos, slot) in matched.iter_mut().enumerate() {
        if slot.is_none() && pos < slots.len() {
            *slot = slots[pos].take();
        }
    }

    let mut aligned = Vec::with_capacity(step.control_points.len());
    for (configured, found) in step.control_points.iter().zip(matched) {
        match found {
            Some(mut cp) => {
                cp.point = configured.clone();
                aligned.push(cp);
            }
            None => {
                stats.control_points_missing += 1;
                let mut commentaire = String::new();
                append_note(&mut commentaire, "Point non évalué par le modèle, considéré comme absent.");
                aligned.push(ControlPoint {
                    point: configured.clone(),
                    statut: Statut::Absent,
                    commentaire,
                    citations: Vec::new(),
                    minutages: Vec::new(),
                });
            }
        }
    }
    aligned
}

// ---------------------------------------------------------------------
// GATE
// ---------------------------------------------------------------------

fn gate_control_point(
    mut cp: ControlPoint,
    index: &ChunkIndex,
    policy: &GatePolicy,
    stats: &mut GateStats,
) -> ControlPoint {
    stats.citations_seen += cp.citations.len();

    if !cp.statut.is_affirmative() {
        stats.citations_removed += cp.citations.len();
        cp.citations.clear();
        cp.minutages.clear();
        return cp;
    }

    let before = cp.citations.len();
    let mut kept: Vec<Citation> = Vec::with_capacity(before);
    for mut citation in cp.citations.drain(..) {
        if !is_citation_valid(index, &citation, policy) {
            continue;
        }
        if citation.minutage.trim().is_empty() {
            if let Some(entry) = index.get(citation.chunk_ref()) {
                citation.minutage = format_timestamp(entry.chunk.start_timestamp);
            }
        }
        kept.push(citation);
    }
    stats.citations_removed += before - kept.len();
    cp.citations = kept;

    if cp.citations.is_empty() {
        let previous = cp.statut;
        cp.statut = Statut::Absent;
        stats.control_points_downgraded += 1;
        append_note(
            &mut cp.commentaire,
            &format!(
                "Statut {} ramené à ABSENT : aucune citation vérifiable dans la transcription.",
                previous.as_str()
            ),
        );
    }

    cp.minutages = citation_minutages(&cp.citations);
    cp
}

/// Aplica el gate a un resultado de etapa. Puro y determinista.
pub fn gate_step(
    raw: StepResult,
    step: &StepDefinition,
    index: &ChunkIndex,
    policy: &GatePolicy,
) -> GatedStep {
    let mut stats = GateStats {
        steps_gated: 1,
        ..GateStats::default()
    };
    let mut result = raw;

    let aligned = align_control_points(std::mem::take(&mut result.points_controle), step, &mut stats);
    result.points_controle = aligned
        .into_iter()
        .map(|cp| gate_control_point(cp, index, policy, &mut stats))
        .collect();

    let weight = f64::from(step.weight);
    let ratio = evidence_ratio(&result.points_controle);

    let candidate = derived_score(ratio, step.weight).min(result.score.min(weight));
    if candidate < result.score {
        let note = format!(
            "Score ajusté de {} à {} d'après les preuves vérifiées (ratio {:.0} %).",
            result.score,
            candidate,
            ratio * 100.0
        );
        append_note(&mut result.commentaire_global, &note);
        result.score = candidate;
        stats.steps_score_reduced += 1;
    }

    let evidence_verdict = conforme_for_ratio(ratio, policy);
    if evidence_verdict.is_stricter_than(result.conforme) {
        let note = format!(
            "Conformité ajustée de {} à {} d'après les preuves vérifiées.",
            result.conforme.as_str(),
            evidence_verdict.as_str()
        );
        append_note(&mut result.commentaire_global, &note);
        result.conforme = evidence_verdict;
        stats.steps_conformity_adjusted += 1;
    }

    // El nivel sigue al veredicto ya ajustado; REJET del modelo se respeta.
    let evidence_niveau = niveau_for(result.conforme, ratio, policy);
    if evidence_niveau.is_stricter_than(result.niveau_conformite) {
        let note = format!(
            "Niveau ajusté de {} à {} d'après les preuves vérifiées.",
            result.niveau_conformite.as_str(),
            evidence_niveau.as_str()
        );
        append_note(&mut result.commentaire_global, &note);
        result.niveau_conformite = evidence_niveau;
    }

    result.minutages = step_minutages(&result.points_controle);

    GatedStep { result, stats }
}

/// Recalcula score y veredicto desde el ratio de evidencias, en ambos
/// sentidos. Sólo para resultados que ya han pasado por el gate y cuyos
/// puntos han cambiado por una re-evaluación explícita.
pub fn rederive_from_evidence(result: &mut StepResult, weight: u32, policy: &GatePolicy) {
    let ratio = evidence_ratio(&result.points_controle);
    result.score = derived_score(ratio, weight);
    result.conforme = conforme_for_ratio(ratio, policy);
    result.niveau_conformite = niveau_for(result.conforme, ratio, policy);
    result.minutages = step_minutages(&result.points_controle);
}
