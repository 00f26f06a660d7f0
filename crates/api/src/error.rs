//! Heart error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The kind of a [HeartError]. Callers decide how to react based on the
/// kind alone, the context string is for humans and logs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ErrorKind {
    /// Caller-supplied value invalid. Never retried.
    BadInput,

    /// Wallet or account not booted.
    NotInitialized,

    /// Object, type, relation or record absent.
    NotFound,

    /// Id or unique-key collision on create.
    AlreadyExists,

    /// Mutation violates type or ACL restrictions.
    Restricted,

    /// Signature, HMAC or JSON mismatch. Never auto-repaired.
    CorruptRecord,

    /// KV integrity failure. Triggers backup restore.
    CorruptStore,

    /// Cannot reach a peer or a remote service.
    TransportUnavailable,

    /// A cancellation was propagated.
    Canceled,

    /// Assertion or otherwise unexpected failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The core heart error type. This type is used in all public apis.
///
/// This type is required to implement `Clone` to ease the use of
/// shared futures, which require the entire `Result` to be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeartError {
    /// Generic error tagged with a kind.
    #[error("{kind}: {ctx} (src: {src})")]
    Other {
        /// The kind of failure.
        kind: ErrorKind,

        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// The object was closed and rejects further operations.
    #[error("object is closed: {0}")]
    ClosedObject(Arc<str>),

    /// A create-if-not-exists raced with an existing cache entry.
    #[error("object already exists in cache: {0}")]
    ExistsInCache(Arc<str>),

    /// The remote peer speaks a protocol version we cannot talk to.
    #[error("incompatible protocol version: local {local}, remote {remote}")]
    IncompatibleProtoVersion {
        /// Our protocol version.
        local: u32,

        /// The version announced by the remote.
        remote: u32,
    },
}

impl HeartError {
    /// Construct an "internal" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::kind_src(ErrorKind::Internal, ctx, src)
    }

    /// Construct an "internal" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::Internal, ctx)
    }

    /// Construct an error of the given kind.
    pub fn kind<C: std::fmt::Display>(kind: ErrorKind, ctx: C) -> Self {
        Self::Other {
            kind,
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct an error of the given kind with an inner source error.
    pub fn kind_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        kind: ErrorKind,
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            kind,
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// [ErrorKind::BadInput] shortcut.
    pub fn bad_input<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::BadInput, ctx)
    }

    /// [ErrorKind::NotFound] shortcut.
    pub fn not_found<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::NotFound, ctx)
    }

    /// [ErrorKind::NotInitialized] shortcut.
    pub fn not_initialized<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::NotInitialized, ctx)
    }

    /// [ErrorKind::CorruptRecord] shortcut.
    pub fn corrupt_record<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::CorruptRecord, ctx)
    }

    /// [ErrorKind::Canceled] shortcut.
    pub fn canceled<C: std::fmt::Display>(ctx: C) -> Self {
        Self::kind(ErrorKind::Canceled, ctx)
    }

    /// [ErrorKind::TransportUnavailable] with an inner source.
    pub fn unavailable_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::kind_src(ErrorKind::TransportUnavailable, ctx, src)
    }

    /// Get the [ErrorKind] of this error.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Other { kind, .. } => *kind,
            Self::ClosedObject(_) => ErrorKind::Internal,
            Self::ExistsInCache(_) => ErrorKind::AlreadyExists,
            Self::IncompatibleProtoVersion { .. } => {
                ErrorKind::TransportUnavailable
            }
        }
    }

    /// True if this error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.error_kind() == kind
    }
}

impl From<std::io::Error> for HeartError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => ErrorKind::BadInput,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::UnexpectedEof => {
                ErrorKind::TransportUnavailable
            }
            _ => ErrorKind::Internal,
        };
        Self::kind_src(kind, "io error", err)
    }
}

/// The core heart result type.
pub type HeartResult<T> = Result<T, HeartError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "Internal: bla (src: None)",
            HeartError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "NotFound: bla (src: None)",
            HeartError::not_found("bla".to_string()).to_string().as_str(),
        );
        assert_eq!(
            "Internal: foo (src: bar)",
            HeartError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn error_debug() {
        assert_eq!(
            "Other { kind: Internal, ctx: \"bla\", src: None }",
            format!("{:?}", HeartError::other("bla")).as_str(),
        );
    }

    #[test]
    fn error_kinds() {
        assert!(HeartError::bad_input("x").is(ErrorKind::BadInput));
        assert!(HeartError::ExistsInCache("a".into())
            .is(ErrorKind::AlreadyExists));
        assert!(HeartError::IncompatibleProtoVersion {
            local: 2,
            remote: 1
        }
        .is(ErrorKind::TransportUnavailable));
        let io: HeartError =
            std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(io.is(ErrorKind::NotFound));
    }

    #[test]
    fn ensure_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(HeartError::other("bla"));
    }
}
