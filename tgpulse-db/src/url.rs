use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::path::PathBuf;

/// Assembles the Postgres URL from `POSTGRES_*` environment variables.
/// The password may be supplied inline or through a file (the usual
/// docker-secrets arrangement).
pub fn postgres_url_from_environment() -> String {
    #[derive(Debug, PartialEq, Deserialize)]
    struct PostgresConfig {
        user: String,
        password: Option<String>,
        password_file: Option<PathBuf>,
        host: Option<String>,
        db: String,
    }
    let provider = figment::providers::Env::prefixed("POSTGRES_");
    let postgres_config: PostgresConfig = figment::Figment::from(provider)
        .extract()
        .expect("Postgres configuration environment variable(s) missing or invalid");

    let password = if let Some(password) = postgres_config.password {
        password
    } else if let Some(password_file) = postgres_config.password_file {
        std::fs::read_to_string(password_file).expect("Failed to read postgres password file")
    } else {
        panic!("One of POSTGRES_PASSWORD or POSTGRES_PASSWORD_FILE must be provided");
    };

    // A single trailing newline is almost certainly an artifact of how the
    // secret file was written, so strip it. Any other newline would be
    // silently truncated further down the stack, which turns a strong
    // password into a weak one, so refuse to proceed.
    let password = password.strip_suffix("\n").unwrap_or(&password);
    if password.contains("\n") {
        panic!(
            "Postgres password contains a non-terminal newline and would be insecurely \
            truncated. Please use a password without embedded newlines."
        );
    }

    let password = utf8_percent_encode(password, NON_ALPHANUMERIC);
    let host = postgres_config.host.as_deref().unwrap_or("db");

    format!(
        "postgres://{}:{}@{}/{}",
        postgres_config.user, password, host, postgres_config.db
    )
}
