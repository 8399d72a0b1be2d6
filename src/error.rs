//! Centralized error types for funclet

use thiserror::Error;

/// Dispatch and scaling error types
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission rejected by the broker's rate limiter
    #[error("Rate limit exceeded for function '{0}'")]
    ResourceExhausted(String),

    /// A queued request outlived its deadline
    #[error("Request deadline exceeded after {waited_ms}ms in queue for '{function_name}'")]
    DeadlineExceeded {
        function_name: String,
        waited_ms: u64,
    },

    /// No worker can take the request and queueing is disabled
    #[error("No available worker for function '{0}'")]
    NoAvailableWorker(String),

    /// The controller has no profile for the requested function
    #[error("No function profile registered for '{0}'")]
    NoFunction(String),

    /// A credential was registered twice
    #[error("Credential '{credential}' already registered for function '{function_name}'")]
    DuplicateCredential {
        function_name: String,
        credential: String,
    },

    /// Lookup by credential found nothing
    #[error("No worker with credential '{credential}' for function '{function_name}'")]
    WorkerNotFound {
        function_name: String,
        credential: String,
    },

    /// A bind was attempted on a credential that is not pending
    #[error("Credential '{credential}' for function '{function_name}' is not pending")]
    CredentialNotPending {
        function_name: String,
        credential: String,
    },

    /// IPC to a worker process failed
    #[error("Delegate error: {0}")]
    Ipc(String),

    /// A worker invocation failed; annotated with the serving worker and queue wait
    #[error("Worker '{worker_name}' invoke failed after {queueing_ms}ms queueing: {message}")]
    Pipe {
        worker_name: String,
        queueing_ms: u64,
        message: String,
    },

    /// Worker process launch failed
    #[error("Worker launch failed: {message}")]
    Launch { fatal: bool, message: String },

    /// Queued requests were failed due to a worker start error
    #[error("{0}")]
    FastFail(String),

    /// Downstream control-plane RPC failed
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a launch failure is fatal to pending requests
    pub fn is_fatal_launch(&self) -> bool {
        matches!(self, Self::Launch { fatal: true, .. })
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_resource_exhausted() {
        let err = Error::ResourceExhausted("echo".into());
        assert_eq!(err.to_string(), "Rate limit exceeded for function 'echo'");
    }

    #[test]
    fn test_error_display_deadline_exceeded() {
        let err = Error::DeadlineExceeded {
            function_name: "echo".into(),
            waited_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "Request deadline exceeded after 500ms in queue for 'echo'"
        );
    }

    #[test]
    fn test_error_display_no_available_worker() {
        let err = Error::NoAvailableWorker("echo".into());
        assert_eq!(err.to_string(), "No available worker for function 'echo'");
    }

    #[test]
    fn test_error_display_no_function() {
        let err = Error::NoFunction("ghost".into());
        assert_eq!(
            err.to_string(),
            "No function profile registered for 'ghost'"
        );
    }

    #[test]
    fn test_error_display_duplicate_credential() {
        let err = Error::DuplicateCredential {
            function_name: "echo".into(),
            credential: "cred-1".into(),
        };
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_error_display_pipe() {
        let err = Error::Pipe {
            worker_name: "hello".into(),
            queueing_ms: 12,
            message: "peer reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Worker 'hello' invoke failed after 12ms queueing: peer reset"
        );
    }

    #[test]
    fn test_error_display_fast_fail_is_opaque() {
        let err = Error::FastFail("start failed: OOM".into());
        assert_eq!(err.to_string(), "start failed: OOM");
    }

    #[test]
    fn test_is_fatal_launch() {
        let fatal = Error::Launch {
            fatal: true,
            message: "image missing".into(),
        };
        let transient = Error::Launch {
            fatal: false,
            message: "slot busy".into(),
        };
        assert!(fatal.is_fatal_launch());
        assert!(!transient.is_fatal_launch());
        assert!(!Error::Other("x".into()).is_fatal_launch());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }

    #[test]
    fn test_result_type_alias() {
        let ok: Result<u32> = Ok(42);
        assert!(matches!(ok, Ok(42)));
        let err: Result<u32> = Err(Error::Other("test".into()));
        assert!(err.is_err());
    }
}
