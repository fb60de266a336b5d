//! Structured Logging via tracing-subscriber
//!
//! Level und Format kommen aus `[logging]`, koennen aber per Umgebung
//! ueberschrieben werden:
//! - `KURIER_LOG_LEVEL`: EnvFilter-Direktive, z.B. `debug` oder `kurier_relay=trace`
//! - `KURIER_LOG_FORMAT`: `text` oder `json`

use tracing_subscriber::{fmt, EnvFilter};

const LEVEL_ENV: &str = "KURIER_LOG_LEVEL";
const FORMAT_ENV: &str = "KURIER_LOG_FORMAT";

/// Initialisiert das Logging-System
///
/// Ungueltige Filter fallen auf `info` zurueck.
pub fn logging_initialisieren(level: &str, format: &str) {
    let filter = EnvFilter::try_from_env(LEVEL_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = std::env::var(FORMAT_ENV).unwrap_or_else(|_| format.to_string());

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .init();
        }
        _ => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Prueft ob ein Log-Format unterstuetzt wird
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_formate() {
        assert!(log_format_gueltig("text"));
        assert!(log_format_gueltig("json"));
        assert!(!log_format_gueltig("JSON"));
        assert!(!log_format_gueltig(""));
    }
}
