use clap::Parser;

/// Runtime configuration, read from flags or the environment. Required values
/// without defaults abort startup before any stage runs.
#[derive(Debug, Parser, Clone)]
pub struct Config {
    #[clap(long, env)]
    pub database_url: String,

    /// Base URL of the course-platform API.
    #[clap(long, env)]
    pub source_api_url: String,

    /// Service API key exchanged for short-lived signed tokens.
    #[clap(long, env)]
    pub source_api_key: String,

    /// Base URL of the prediction model host.
    #[clap(long, env)]
    pub prediction_api_url: String,

    /// Shared secret for signing prediction-host bearer tokens.
    #[clap(long, env)]
    pub prediction_api_secret: String,

    /// Key for reversible encryption of student identifiers.
    #[clap(long, env)]
    pub pii_encryption_key: String,

    /// Restrict course-metadata refresh to a single course id.
    #[clap(long, env)]
    pub dev_course_lock: Option<String>,

    #[clap(long, env, default_value_t = 30)]
    pub request_timeout_secs: u64,
}
