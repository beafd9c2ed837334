/// `scripting/error.rs` — error types for the scripting engine
use std::sync::Arc;

use thiserror::Error;

/// Failure to load a script record or the script index from the content store.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot find {0}")]
    NotFound(String),
    #[error("Malformed content for {id}: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Loading {0} panicked")]
    Panicked(String),
}

/// Raised inside a script that writes to or deletes from an immutable proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot remove or modify property '{property}' as the object is immutable.")]
pub struct ImmutableError {
    pub property: String,
}

impl ImmutableError {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }
}

/// Errors returned by `ScriptEngine` operations.
#[derive(Debug, Error)]
pub enum ScriptEngineError {
    /// The script id (or the content behind it) could not be resolved.
    #[error("No such script: {id}")]
    NotFound {
        id: String,
        #[source]
        source: Arc<LoadError>,
    },
    /// The script source failed to parse.
    #[error("Cannot compile script {id}: {source}")]
    Compile {
        id: String,
        #[source]
        source: mlua::Error,
    },
    /// The script raised while running.
    #[error("Error running script {id}: {source}")]
    Evaluation {
        id: String,
        #[source]
        source: mlua::Error,
    },
    /// A module pulled in with `require` failed.
    #[error("Error requiring script {id}: {source}")]
    Require {
        id: String,
        #[source]
        source: Box<ScriptEngineError>,
    },
    /// A value could not cross the host/script boundary.
    #[error("Cannot marshal value: {0}")]
    Marshal(String),
    /// The Lua state or the detached pool could not be created.
    #[error("Script engine initialisation failed: {0}")]
    Init(String),
}

impl ScriptEngineError {
    pub(crate) fn evaluation(id: &str) -> impl FnOnce(mlua::Error) -> Self + '_ {
        move |source| Self::Evaluation {
            id: id.to_string(),
            source,
        }
    }

    pub(crate) fn compile(id: &str) -> impl FnOnce(mlua::Error) -> Self + '_ {
        move |source| Self::Compile {
            id: id.to_string(),
            source,
        }
    }

    /// The immutability violation that caused this error, if any.
    pub fn immutability_violation(&self) -> Option<&ImmutableError> {
        match self {
            Self::Evaluation { source, .. } => find_immutable(source),
            Self::Require { source, .. } => source.immutability_violation(),
            _ => None,
        }
    }

    pub fn is_immutability_violation(&self) -> bool {
        self.immutability_violation().is_some()
    }
}

fn find_immutable(err: &mlua::Error) -> Option<&ImmutableError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => find_immutable(cause),
        mlua::Error::ExternalError(inner) => {
            if let Some(immutable) = inner.downcast_ref::<ImmutableError>() {
                return Some(immutable);
            }
            inner
                .downcast_ref::<ScriptEngineError>()
                .and_then(ScriptEngineError::immutability_violation)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_message_names_the_property() {
        let err = ImmutableError::new("aspects");
        assert_eq!(
            err.to_string(),
            "Cannot remove or modify property 'aspects' as the object is immutable."
        );
    }

    #[test]
    fn finds_immutability_through_callback_and_require_layers() {
        let raised = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: Arc::new(mlua::Error::external(ImmutableError::new("x"))),
        };
        let inner = ScriptEngineError::Evaluation {
            id: "module".into(),
            source: raised,
        };
        let outer = ScriptEngineError::Evaluation {
            id: "caller".into(),
            source: mlua::Error::external(ScriptEngineError::Require {
                id: "module".into(),
                source: Box::new(inner),
            }),
        };
        assert_eq!(outer.immutability_violation().map(|e| e.property.as_str()), Some("x"));
    }

    #[test]
    fn plain_runtime_errors_are_not_immutability_violations() {
        let err = ScriptEngineError::Evaluation {
            id: "s".into(),
            source: mlua::Error::RuntimeError("boom".into()),
        };
        assert!(!err.is_immutability_violation());
    }
}
