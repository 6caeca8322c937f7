//! Abstracción sobre Rig para evaluar una etapa de auditoría con un LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.
//!
//! El agente recibe la descripción de la etapa y dos herramientas
//! (`search` y `getChunks`) sobre el índice de la transcripción; nunca el
//! texto completo. Su respuesta final es un JSON con el resultado de etapa.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::chunk_index::ChunkIndex;
use crate::config::{AppConfig, LlmProvider};
use crate::models::{Conforme, ControlPoint, NiveauConformite, StepDefinition, StepResult};
use crate::transcript_tools::{GetChunksTool, SearchTranscriptTool};

/// Todo lo que necesita una evaluación de etapa.
#[derive(Clone)]
pub struct StepEvaluationRequest<'a> {
    pub audit_name: &'a str,
    pub step: &'a StepDefinition,
    pub index: Arc<ChunkIndex>,
    /// Contexto adicional (resultado previo, instrucciones del operador...).
    pub extra_context: Option<String>,
    pub product_context: Option<String>,
}

/// Costura entre el núcleo y el proveedor de LLM.
#[async_trait]
pub trait StepEvaluator: Send + Sync {
    async fn evaluate_step(&self, request: StepEvaluationRequest<'_>) -> Result<StepResult>;
}

/// Resultado tal y como lo devuelve el modelo, antes de validarlo.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStepResult {
    pub score: f64,
    pub conforme: Conforme,
    #[serde(default)]
    pub niveau_conformite: Option<NiveauConformite>,
    #[serde(default)]
    pub commentaire_global: String,
    #[serde(default)]
    pub points_controle: Vec<ControlPoint>,
}

impl RawStepResult {
    /// Validación de frontera: score finito (negativos a 0) y nivel por
    /// defecto coherente con el veredicto si el modelo no lo da.
    pub fn into_step_result(self) -> Result<StepResult> {
        if !self.score.is_finite() {
            return Err(anyhow!("score no numérico en la respuesta del modelo"));
        }
        let niveau_conformite = self.niveau_conformite.unwrap_or(match self.conforme {
            Conforme::Conforme => NiveauConformite::Bon,
            Conforme::Partiel => NiveauConformite::Acceptable,
            Conforme::NonConforme => NiveauConformite::Insuffisant,
        });
        Ok(StepResult {
            score: self.score.max(0.0),
            conforme: self.conforme,
            niveau_conformite,
            commentaire_global: self.commentaire_global,
            points_controle: self.points_controle,
            minutages: Vec::new(),
        })
    }
}

/// Limpia la respuesta del LLM (bloques ```json, texto alrededor) y la
/// convierte en resultado de etapa.
pub fn parse_step_response(response: &str) -> Result<StepResult> {
    let trimmed = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(anyhow!("la respuesta del modelo no contiene un objeto JSON")),
    };

    let raw: RawStepResult = serde_json::from_str(json)
        .with_context(|| format!("JSON de resultado de etapa inválido: '{json}'"))?;
    raw.into_step_result()
}

const AUDIT_SYSTEM_PROMPT: &str = r#"
Tu es un auditeur qualité chargé de vérifier la conformité réglementaire d'appels de vente.
Tu évalues UNE étape d'audit, point de contrôle par point de contrôle.

Règles de preuve :
- Tu n'as pas la transcription complète. Utilise l'outil `search` pour localiser les passages pertinents,
  puis `getChunks` pour lire le texte exact.
- Chaque point PRESENT ou PARTIEL doit être justifié par au moins une citation copiée mot pour mot
  depuis le texte renvoyé par `getChunks`, avec son recordingIndex et son chunkIndex.
- Un point ABSENT ou NON_APPLICABLE n'a aucune citation.
- N'invente jamais de citation : une citation introuvable sera supprimée et le point compté comme absent.

Réponds uniquement avec un objet JSON :
{
  "score": <nombre entre 0 et le poids de l'étape>,
  "conforme": "CONFORME" | "PARTIEL" | "NON_CONFORME",
  "niveauConformite": "EXCELLENT" | "BON" | "ACCEPTABLE" | "INSUFFISANT" | "REJET",
  "commentaireGlobal": "<synthèse>",
  "pointsControle": [
    {
      "point": "<texte du point>",
      "statut": "PRESENT" | "PARTIEL" | "ABSENT" | "NON_APPLICABLE",
      "commentaire": "<justification>",
      "citations": [{"recordingIndex": 0, "chunkIndex": 0, "texte": "<citation exacte>", "minutage": "MM:SS"}]
    }
  ]
}
"#;

const STEP_TASK_PROMPT: &str =
    "Évalue l'étape décrite dans le contexte en recherchant les preuves dans la transcription, puis renvoie le JSON demandé.";

/// Descripción textual de la etapa que recibe el agente como contexto.
pub fn build_step_context(request: &StepEvaluationRequest<'_>) -> String {
    let step = request.step;
    let mut ctx = String::new();

    ctx.push_str(&format!("Audit : {}\n", request.audit_name));
    ctx.push_str(&format!(
        "Étape {} : {} (poids {}{})\n",
        step.position,
        step.name,
        step.weight,
        if step.is_critical { ", étape critique" } else { "" }
    ));

    ctx.push_str("\nPoints de contrôle, dans l'ordre :\n");
    for (i, point) in step.control_points.iter().enumerate() {
        ctx.push_str(&format!("{}. {}\n", i + 1, point));
    }

    if let Some(extra) = request.extra_context.as_deref().filter(|s| !s.trim().is_empty()) {
        ctx.push_str(&format!("\n{}\n", extra.trim()));
    }
    if let Some(instructions) = step.custom_instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        ctx.push_str(&format!("\nInstructions spécifiques :\n{}\n", instructions.trim()));
    }
    if let Some(products) = request.product_context.as_deref().filter(|s| !s.trim().is_empty()) {
        ctx.push_str(&format!("\nInformations produit de référence :\n{}\n", products.trim()));
    }

    // Metadatos de grabaciones: fecha, hora y número de extractos.
    if request.index.recording_count() == 0 {
        ctx.push_str("\nAucune transcription disponible pour cet appel.\n");
    } else {
        let mut recordings: BTreeMap<usize, (&str, &str)> = BTreeMap::new();
        for entry in request.index.entries() {
            let c = &entry.chunk;
            recordings
                .entry(c.recording_index)
                .or_insert((c.recording_date.as_str(), c.recording_time.as_str()));
        }
        ctx.push_str("\nEnregistrements disponibles :\n");
        for (idx, (date, time)) in recordings {
            ctx.push_str(&format!(
                "- recordingIndex {idx} : {date} {time}, {} extraits\n",
                request.index.chunks_in_recording(idx)
            ));
        }
    }

    ctx
}

/// Gestor de LLMs.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
    pub max_turns: usize,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            max_turns: cfg.agent_max_turns,
        })
    }

    async fn evaluate_with_openai(&self, request: StepEvaluationRequest<'_>) -> Result<StepResult> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let step_context = build_step_context(&request);
        let index = request.index.clone();

        let agent = client
            .agent(model_name)
            .preamble(AUDIT_SYSTEM_PROMPT)
            .context(&step_context)
            .tool(SearchTranscriptTool::new(index.clone()))
            .tool(GetChunksTool::new(index))
            .temperature(0.0)
            .build();

        info!(
            step = request.step.position,
            model = model_name,
            "Evaluando etapa '{}' con el LLM",
            request.step.name
        );

        let response = agent
            .prompt(STEP_TASK_PROMPT)
            .multi_turn(self.max_turns)
            .await
            .with_context(|| format!("fallo del LLM en la etapa {}", request.step.position))?;

        debug!(step = request.step.position, "Respuesta del LLM: {}", response);
        parse_step_response(&response)
    }
}

#[async_trait]
impl StepEvaluator for LlmManager {
    async fn evaluate_step(&self, request: StepEvaluationRequest<'_>) -> Result<StepResult> {
        match self.provider {
            LlmProvider::OpenAI => self.evaluate_with_openai(request).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para auditorías",
                other
            )),
        }
    }
}
