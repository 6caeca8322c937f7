use thiserror::Error;

/// Errores de configuración: se devuelven al llamante tal cual y nunca se
/// reintentan en silencio.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("falta {0} en el entorno")]
    MissingEnv(&'static str),

    #[error("valor inválido para {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },

    #[error("proveedor LLM no soportado: {0}")]
    UnknownProvider(String),

    #[error("definición de auditoría inválida: {0}")]
    InvalidDefinition(String),

    #[error("auditoría desconocida: {0}")]
    UnknownAudit(String),

    #[error("la auditoría '{audit_id}' no tiene etapa en la posición {position}")]
    UnknownStep { audit_id: String, position: u32 },

    #[error("punto de control {index} fuera de rango en la etapa {position} ({available} disponibles)")]
    ControlPointOutOfRange {
        position: u32,
        index: usize,
        available: usize,
    },
}

impl ConfigError {
    /// Busca un `ConfigError` en la cadena de causas de un `anyhow::Error`.
    pub fn find_in(err: &anyhow::Error) -> Option<&ConfigError> {
        err.chain().find_map(|cause| cause.downcast_ref::<ConfigError>())
    }
}
