use std::fmt;
use std::path::PathBuf;

/// Result type alias for crosscache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cache coordination
#[derive(Debug)]
pub enum Error {
    /// The coordinator was opened a second time without an intervening close
    AlreadyOpen { cache: String },

    /// An operation was attempted on a coordinator that is not open
    CacheClosed { operation: &'static str },

    /// The coordinator was closed from a thread that still owns a use-cache frame
    CacheInUse { cache: String },

    /// A cache operation was requested while the coordinator holds a shared lock
    SharedModeDoesNotSupportWrite { operation: String },

    /// A cache was re-registered under the same name with incompatible parameters
    InvalidCacheReuse { name: String, reason: String },

    /// A file-access operation was invoked off the owner thread or with no lock held
    FileAccessRequiresLock { operation: &'static str },

    /// The lock manager failed to produce or maintain a lock
    LockManager {
        lock_file: PathBuf,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The initialization handshake failed
    Initialization {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// File system operations
    FileSystem {
        path: PathBuf,
        operation: String,
        source: std::io::Error,
    },

    /// Key or value (de)serialization failed
    Serialization {
        cache: String,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyOpen { cache } => {
                write!(f, "cache '{cache}' is already open")
            }
            Error::CacheClosed { operation } => {
                write!(f, "cannot {operation}: the cache is not open")
            }
            Error::CacheInUse { cache } => {
                write!(
                    f,
                    "cannot close cache '{cache}' while the calling thread is inside a use-cache frame"
                )
            }
            Error::SharedModeDoesNotSupportWrite { operation } => {
                write!(
                    f,
                    "shared mode does not permit cache operations (requested '{operation}')"
                )
            }
            Error::InvalidCacheReuse { name, reason } => {
                write!(
                    f,
                    "cache '{name}' was already registered with different parameters: {reason}"
                )
            }
            Error::FileAccessRequiresLock { operation } => {
                write!(f, "file access requires acquired lock (requested '{operation}')")
            }
            Error::LockManager {
                lock_file, message, ..
            } => {
                write!(f, "lock on '{}' failed: {message}", lock_file.display())
            }
            Error::Initialization { message, .. } => {
                write!(f, "cache initialization failed: {message}")
            }
            Error::FileSystem {
                path,
                operation,
                source,
            } => {
                write!(f, "failed to {operation} '{}': {source}", path.display())
            }
            Error::Serialization { cache, message, .. } if cache.is_empty() => {
                write!(f, "serialization error: {message}")
            }
            Error::Serialization { cache, message, .. } => {
                write!(f, "serialization error in cache '{cache}': {message}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::LockManager { source, .. }
            | Error::Initialization { source, .. }
            | Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            Error::FileSystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Error {
    /// Create an already-open error
    #[must_use]
    pub fn already_open(cache: impl Into<String>) -> Self {
        Error::AlreadyOpen {
            cache: cache.into(),
        }
    }

    /// Create a not-open error
    #[must_use]
    pub fn cache_closed(operation: &'static str) -> Self {
        Error::CacheClosed { operation }
    }

    /// Create a close-while-in-use error
    #[must_use]
    pub fn cache_in_use(cache: impl Into<String>) -> Self {
        Error::CacheInUse {
            cache: cache.into(),
        }
    }

    /// Create a shared-mode error
    #[must_use]
    pub fn shared_mode(operation: impl Into<String>) -> Self {
        Error::SharedModeDoesNotSupportWrite {
            operation: operation.into(),
        }
    }

    /// Create an invalid cache reuse error
    #[must_use]
    pub fn invalid_cache_reuse(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidCacheReuse {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a file-access error
    #[must_use]
    pub fn file_access_requires_lock(operation: &'static str) -> Self {
        Error::FileAccessRequiresLock { operation }
    }

    /// Create a lock manager error
    #[must_use]
    pub fn lock_manager(lock_file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::LockManager {
            lock_file: lock_file.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a lock manager error wrapping an underlying failure
    #[must_use]
    pub fn lock_manager_with_source(
        lock_file: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::LockManager {
            lock_file: lock_file.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an initialization error
    #[must_use]
    pub fn initialization(message: impl Into<String>) -> Self {
        Error::Initialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(
        cache: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            cache: cache.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_mode_message_names_the_policy() {
        let error = Error::shared_mode("compile-cache");
        assert!(error
            .to_string()
            .contains("shared mode does not permit cache operations"));
    }

    #[test]
    fn file_access_message_names_the_lock() {
        let error = Error::file_access_requires_lock("update_file");
        assert!(error
            .to_string()
            .contains("file access requires acquired lock"));
    }

    #[test]
    fn file_system_error_exposes_source() {
        let error = Error::file_system(
            "/tmp/store.lock",
            "open lock file",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&error).is_some());
    }
}
