//! Error types for PostFlow

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PostflowError>;

#[derive(Error, Debug)]
pub enum PostflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PostflowError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PostflowError::Scheduler(SchedulerError::AlreadyRunning { .. }) => 3,
            PostflowError::Config(_) => 2,
            PostflowError::InvalidInput(_) => 2,
            PostflowError::Scheduler(_) => 1,
            PostflowError::Platform(_) => 1,
            PostflowError::Validation(_) => 1,
            PostflowError::Database(_) => 1,
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PostflowError::Platform(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures reported by (or while talking to) a remote platform API
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    /// Timeout, refused connection, reset stream
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP 429 seen on every attempt
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// 4xx other than the media-not-ready code
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Media not ready ({code}): {message}")]
    MediaNotReady { code: String, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Transient errors are worth another attempt; everything else is fatal
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Network(_)
                | PlatformError::RateLimit(_)
                | PlatformError::Server { .. }
                | PlatformError::MediaNotReady { .. }
        )
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, PlatformError::Server { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PlatformError::Server { status, .. } | PlatformError::Api { status, .. } => {
                Some(*status)
            }
            PlatformError::UnexpectedStatus(status) => Some(*status),
            PlatformError::RateLimit(_) => Some(429),
            _ => None,
        }
    }
}

/// Pre-flight content and media checks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Caption is {length} characters, limit is {limit}")]
    CaptionTooLong { length: usize, limit: usize },

    #[error("Post has no media attached")]
    NoMedia,

    #[error("Post has {count} media items, limit is {limit}")]
    TooManyMedia { count: usize, limit: usize },

    #[error("Media {url} is unreachable: {reason}")]
    MediaUnreachable { url: String, reason: String },

    #[error("Media {url} is not an image (content type: {content_type})")]
    NotAnImage { url: String, content_type: String },

    #[error("Media {url} is {size} bytes, limit is {limit}")]
    MediaTooLarge { url: String, size: u64, limit: u64 },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler already running with PID {pid} (lock file: {})", .path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("Lock file error: {0}")]
    Lock(#[from] std::io::Error),

    #[error("Job registration failed: {0}")]
    Registration(String),
}

/// Matching a synced post back to a scheduled post failed
///
/// Link resolution is best effort; callers log this and carry on.
#[derive(Error, Debug)]
#[error("Could not link {platform} post {platform_post_id}: {reason}")]
pub struct LinkResolutionError {
    pub platform: String,
    pub platform_post_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_already_running() {
        let error = PostflowError::Scheduler(SchedulerError::AlreadyRunning {
            pid: 4242,
            path: PathBuf::from("/tmp/postflow_scheduler.lock"),
        });
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = PostflowError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        let platform = PostflowError::Platform(PlatformError::Network("reset".to_string()));
        assert_eq!(platform.exit_code(), 1);

        let db = PostflowError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 1);
    }

    #[test]
    fn test_already_running_message() {
        let error = SchedulerError::AlreadyRunning {
            pid: 77,
            path: PathBuf::from("/tmp/x.lock"),
        };
        assert_eq!(
            error.to_string(),
            "Scheduler already running with PID 77 (lock file: /tmp/x.lock)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::Network("timeout".to_string()).is_transient());
        assert!(PlatformError::RateLimit("slow down".to_string()).is_transient());
        assert!(PlatformError::Server {
            status: 502,
            message: "bad gateway".to_string()
        }
        .is_transient());
        assert!(PlatformError::MediaNotReady {
            code: "9007".to_string(),
            message: "not ready".to_string()
        }
        .is_transient());

        assert!(!PlatformError::Api {
            status: 400,
            code: Some("100".to_string()),
            message: "bad param".to_string()
        }
        .is_transient());
        assert!(!PlatformError::Authentication("expired".to_string()).is_transient());
        assert!(!PlatformError::UnexpectedStatus(204).is_transient());
    }

    #[test]
    fn test_validation_errors_are_not_transient() {
        let error: PostflowError = ValidationError::NoMedia.into();
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "Validation failed: Post has no media attached");
    }

    #[test]
    fn test_status_accessor() {
        let error = PlatformError::Api {
            status: 404,
            code: None,
            message: "Record not found".to_string(),
        };
        assert_eq!(error.status(), Some(404));
        assert_eq!(PlatformError::Network("x".to_string()).status(), None);
    }

    #[test]
    fn test_error_message_formatting_platform() {
        let error = PostflowError::Platform(PlatformError::Api {
            status: 400,
            code: Some("100".to_string()),
            message: "OAuthException (100): Invalid parameter".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "Platform error: API error (400): OAuthException (100): Invalid parameter"
        );
    }

    #[test]
    fn test_error_conversion_from_config_error() {
        let config_error = ConfigError::MissingField("test".to_string());
        let error: PostflowError = config_error.into();

        match error {
            PostflowError::Config(_) => {}
            _ => panic!("Expected PostflowError::Config"),
        }
    }
}
