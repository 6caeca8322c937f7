//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + políticas).

use std::env;
use std::str::FromStr;

use anyhow::Result;

use crate::double_check::DoubleCheckPolicy;
use crate::error::ConfigError;
use crate::evidence_gate::GatePolicy;

#[derive(Clone, Debug, PartialEq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    /// Profundidad máxima del bucle de herramientas del agente.
    pub agent_max_turns: usize,

    /// Etapas evaluadas en paralelo dentro de una auditoría.
    pub audit_max_concurrency: usize,
    pub transcript_cache_capacity: usize,

    pub gate_policy: GatePolicy,
    pub double_check_policy: DoubleCheckPolicy,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = required("NEO4J_URI")?;
        let neo4j_user = required("NEO4J_USER")?;
        let neo4j_password = required("NEO4J_PASSWORD")?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let gate_defaults = GatePolicy::default();
        let gate_policy = GatePolicy {
            conforme_threshold: parsed("GATE_CONFORME_THRESHOLD", gate_defaults.conforme_threshold)?,
            partiel_threshold: parsed("GATE_PARTIEL_THRESHOLD", gate_defaults.partiel_threshold)?,
            excellent_threshold: parsed("GATE_EXCELLENT_THRESHOLD", gate_defaults.excellent_threshold)?,
            min_quote_chars: parsed("GATE_MIN_QUOTE_CHARS", gate_defaults.min_quote_chars)?,
        };

        let dc_defaults = DoubleCheckPolicy::default();
        let double_check_policy = DoubleCheckPolicy {
            tie_threshold: parsed("DOUBLE_CHECK_TIE_THRESHOLD", dc_defaults.tie_threshold)?,
            min_weight: parsed("DOUBLE_CHECK_MIN_WEIGHT", dc_defaults.min_weight)?,
            partial_score_ratio: parsed("DOUBLE_CHECK_PARTIAL_RATIO", dc_defaults.partial_score_ratio)?,
            min_citations: parsed("DOUBLE_CHECK_MIN_CITATIONS", dc_defaults.min_citations)?,
        };

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_chat_model,
            agent_max_turns: parsed("AGENT_MAX_TURNS", 12)?,
            audit_max_concurrency: parsed::<usize>("AUDIT_MAX_CONCURRENCY", 3)?.max(1),
            transcript_cache_capacity: parsed("TRANSCRIPT_CACHE_CAPACITY", 64)?,
            gate_policy,
            double_check_policy,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_are_case_insensitive() {
        assert_eq!(LlmProvider::from_str("OpenAI").unwrap(), LlmProvider::OpenAI);
        assert!(matches!(
            LlmProvider::from_str("mistral"),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[test]
    fn parsed_falls_back_and_rejects_garbage() {
        assert_eq!(parsed("CALL_AUDIT_TEST_UNSET_VAR", 7u32).unwrap(), 7);

        env::set_var("CALL_AUDIT_TEST_BAD_VAR", "sept");
        assert!(matches!(
            parsed::<u32>("CALL_AUDIT_TEST_BAD_VAR", 7),
            Err(ConfigError::InvalidEnv { .. })
        ));

        env::set_var("CALL_AUDIT_TEST_GOOD_VAR", " 0.9 ");
        assert_eq!(parsed::<f64>("CALL_AUDIT_TEST_GOOD_VAR", 0.85).unwrap(), 0.9);
    }
}
