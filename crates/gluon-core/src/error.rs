use crate::shape::Shape;

/// All errors that can occur within gluon.
///
/// Parameter lifecycle failures, scope misuse, persistence problems and the
/// array-level mismatches raised by `NDArray` share one enum so that `?`
/// works across every crate in the workspace. Every variant that concerns a
/// parameter or block carries its fully-qualified name.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A shape was unknown, incompatible, or zero-sized where a concrete
    /// shape was required.
    #[error("invalid shape for '{name}': {reason}")]
    InvalidShape { name: String, reason: String },

    /// Data or gradient accessed before `init` was ever called.
    #[error(
        "parameter '{name}' has not been initialized; call initialize() on its block or init() on the parameter"
    )]
    Uninitialized { name: String },

    /// Data or gradient accessed while initialization is still deferred.
    #[error(
        "parameter '{name}' has deferred initialization because its shape is not known yet; run a forward pass first"
    )]
    DeferredInit { name: String },

    /// The parameter is materialized, but not on the requested context.
    #[error("parameter '{name}' was not initialized on context {context}; it was only initialized on {available}")]
    ContextMismatch {
        name: String,
        context: String,
        available: String,
    },

    /// Gradient accessed on a parameter whose grad_req is `null`.
    #[error("cannot get gradient array for parameter '{name}' because grad_req is 'null'")]
    NullGradient { name: String },

    /// A dictionary lookup or merge disagreed with what is already stored.
    #[error("name conflict for '{name}': {attribute} is {existing} but {requested} was requested")]
    NameConflict {
        name: String,
        attribute: String,
        existing: String,
        requested: String,
    },

    /// Missing/extra names, or a shape/dtype disagreement, during load.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A naming scope was exited without a matching enter.
    #[error("scope imbalance: {0}")]
    ScopeImbalance(String),

    /// Trainer parameters disagree on the ordered list of contexts they live on.
    #[error(
        "all parameters must be initialized on the same ordered list of contexts, but parameter '{name}' is initialized on {got} while previous parameters are initialized on {expected}"
    )]
    InconsistentContexts {
        name: String,
        expected: String,
        got: String,
    },

    /// An update was requested for a gradient no backward pass refreshed.
    #[error(
        "gradient of parameter '{name}' on context {context} has not been updated by backward since last step; set ignore_stale_grad to skip this check"
    )]
    StaleGradient { name: String, context: String },

    /// A caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shape mismatch between two arrays.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between two arrays.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn invalid_shape(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidShape {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout gluon.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_and_uninitialized_messages_differ() {
        let deferred = Error::DeferredInit { name: "dense0_weight".into() }.to_string();
        let never = Error::Uninitialized { name: "dense0_weight".into() }.to_string();
        assert!(deferred.contains("forward pass"));
        assert!(!never.contains("forward pass"));
        assert!(deferred.contains("dense0_weight") && never.contains("dense0_weight"));
    }

    #[test]
    fn test_name_conflict_mentions_both_values() {
        let e = Error::NameConflict {
            name: "net_w".into(),
            attribute: "shape".into(),
            existing: "[3]".into(),
            requested: "[4]".into(),
        };
        let s = e.to_string();
        assert!(s.contains("net_w") && s.contains("[3]") && s.contains("[4]"));
    }
}
