use std::path::PathBuf;

/// Runtime configuration, read once at startup from the environment.
///
/// Boolean flags accept `1`, `true`, or `yes` (case-insensitive).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Base URL of the OpenAI-compatible chat endpoint.
    pub llm_endpoint: String,
    /// Bearer token for the upstream endpoint.
    pub llm_api_key: String,
    /// Model identifier sent with every chat request.
    pub llm_model: String,
    /// Per-call deadline for chat completions, in seconds.
    pub llm_timeout_secs: u64,
    /// Maximum extraction attempts per ingest (initial call + repairs).
    pub max_attempts: u32,
    /// End-to-end cap for a single ingest, in milliseconds.
    pub request_deadline_ms: u64,
    /// Maximum concurrent upstream chat requests.
    pub llm_concurrency: usize,
    /// Enables completeness checks on extracted rows.
    pub strict_extraction: bool,
    /// Requires the full CBC panel when the document looks like a CBC.
    pub require_expected_tests: bool,
    /// Requires a patient name and identifier in the extraction.
    pub require_patient: bool,
    /// Retains an extracted report date when it parses as ISO-8601.
    pub allow_report_date: bool,
    /// Minimum row count for LAB extractions under strict mode.
    pub min_observations: usize,
    /// Optional master key that bypasses the key store.
    pub master_api_key: Option<String>,
    /// Directory for persisted original files.
    pub upload_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Per-file upload size cap in bytes.
    pub max_upload_bytes: usize,
    /// Chain-of-thought delimiter pair stripped from model output.
    pub thinking_open: String,
    pub thinking_close: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8000"),
            llm_endpoint: env_string("llm_endpoint", "http://localhost:8001"),
            llm_api_key: env_string("llm_api_key", ""),
            llm_model: env_string("llm_model", "google/medgemma-1.5-4b-it"),
            llm_timeout_secs: env_parse("llm_timeout_secs", 90),
            max_attempts: env_parse("max_attempts", 3),
            request_deadline_ms: env_parse("request_deadline_ms", 120_000),
            llm_concurrency: env_parse("llm_concurrency", 8),
            strict_extraction: env_flag("strict_extraction", false),
            require_expected_tests: env_flag("require_expected_tests", false),
            require_patient: env_flag("require_patient", false),
            allow_report_date: env_flag("allow_report_date", false),
            min_observations: env_parse("min_observations", 3),
            master_api_key: std::env::var("master_api_key")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            upload_dir: PathBuf::from(env_string("upload_dir", "uploaded_files")),
            db_path: PathBuf::from(env_string("db_path", "fhir_bridge.db")),
            max_upload_bytes: env_parse("max_upload_bytes", 15 * 1024 * 1024),
            thinking_open: env_string("thinking_open", "<unused94>"),
            thinking_close: env_string("thinking_close", "<unused95>"),
        }
    }

    /// Config for in-process tests: permissive checks, short deadlines.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            llm_endpoint: "http://localhost:8001".into(),
            llm_api_key: "test-key".into(),
            llm_model: "test-model".into(),
            llm_timeout_secs: 5,
            max_attempts: 3,
            request_deadline_ms: 10_000,
            llm_concurrency: 8,
            strict_extraction: false,
            require_expected_tests: false,
            require_patient: false,
            allow_report_date: false,
            min_observations: 3,
            master_api_key: None,
            upload_dir: PathBuf::from("uploaded_files"),
            db_path: PathBuf::from(":memory:"),
            max_upload_bytes: 15 * 1024 * 1024,
            thinking_open: "<unused94>".into(),
            thinking_close: "<unused95>".into(),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::for_tests();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.llm_concurrency, 8);
        assert_eq!(cfg.min_observations, 3);
        assert!(!cfg.strict_extraction);
        assert_eq!(cfg.thinking_open, "<unused94>");
        assert_eq!(cfg.thinking_close, "<unused95>");
    }

    #[test]
    fn env_flag_accepts_truthy_spellings() {
        std::env::set_var("fhir_bridge_test_flag_a", "YES");
        assert!(env_flag("fhir_bridge_test_flag_a", false));
        std::env::set_var("fhir_bridge_test_flag_a", "0");
        assert!(!env_flag("fhir_bridge_test_flag_a", true));
        std::env::remove_var("fhir_bridge_test_flag_a");
        assert!(env_flag("fhir_bridge_test_flag_a", true));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("fhir_bridge_test_parse_a", "not-a-number");
        assert_eq!(env_parse("fhir_bridge_test_parse_a", 7u32), 7);
        std::env::remove_var("fhir_bridge_test_parse_a");
    }
}
