//! Normalización de texto compartida por el índice de chunks, la búsqueda
//! y el gate de evidencias. Una sola función para que las tres partes
//! comparen exactamente lo mismo.

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Marca que se añade al texto recortado por presupuesto de caracteres.
pub const TRUNCATION_MARKER: &str = "…[tronqué]";

/// Minúsculas, sin diacríticos, y cualquier secuencia no alfanumérica
/// colapsada en un único espacio. Total e idempotente.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_space = false;

    for c in lowered.nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }

    out
}

/// Vista previa acotada del texto original (no normalizado).
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Recorta a `max_chars` caracteres exactos y añade [`TRUNCATION_MARKER`].
/// Devuelve `(texto, recortado)`.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str(TRUNCATION_MARKER);
    (cut, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_diacritics_and_case() {
        assert_eq!(normalize("Élève À Noël"), "eleve a noel");
        assert_eq!(normalize("ÇA VA, Monsieur ?"), "ca va monsieur");
    }

    #[test]
    fn collapses_punctuation_and_whitespace() {
        assert_eq!(normalize("  le   prix -- est de 30€/mois!! "), "le prix est de 30 mois");
        assert_eq!(normalize("d'accord\n\tmerci"), "d accord merci");
    }

    #[test]
    fn is_total_and_idempotent() {
        for sample in ["", "   ", "...", "Ça coûte 12,50 € TTC", "İstanbul œuvre ﬁn"] {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "no idempotente para {sample:?}");
        }
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "é".repeat(10);
        let (cut, truncated) = truncate_with_marker(&text, 4);
        assert!(truncated);
        assert_eq!(cut, format!("éééé{TRUNCATION_MARKER}"));

        let (same, truncated) = truncate_with_marker("court", 10);
        assert!(!truncated);
        assert_eq!(same, "court");
    }

    #[test]
    fn preview_is_bounded() {
        assert_eq!(preview("bonjour", 20), "bonjour");
        assert_eq!(preview("bonjour madame", 8), "bonjour…");
    }
}
