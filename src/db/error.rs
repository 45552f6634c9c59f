use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors raised by the store-facing parts of the engine.
#[derive(Debug)]
pub enum EngineError {
    /// A statement failed; `context` names what was being attempted.
    Store {
        context: String,
        source: diesel::result::Error,
    },
    /// Creating a table, index or column failed.
    Provision {
        table: String,
        source: diesel::result::Error,
    },
    /// A table or column name derived from a payload or rule is not a safe identifier.
    InvalidIdentifier(String),
}

impl EngineError {
    pub fn store(context: impl Into<String>, source: diesel::result::Error) -> Self {
        EngineError::Store {
            context: context.into(),
            source,
        }
    }

    pub fn provision(table: impl Into<String>, source: diesel::result::Error) -> Self {
        EngineError::Provision {
            table: table.into(),
            source,
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Store { context, source } => write!(f, "{}: {}", context, source),
            EngineError::Provision { table, source } => {
                write!(f, "provisioning {} failed: {}", table, source)
            }
            EngineError::InvalidIdentifier(raw) => write!(f, "invalid identifier {:?}", raw),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Store { source, .. } => Some(source),
            EngineError::Provision { source, .. } => Some(source),
            EngineError::InvalidIdentifier(_) => None,
        }
    }
}

// Required by `Connection::transaction`, which reports BEGIN/COMMIT failures through `E`.
impl From<diesel::result::Error> for EngineError {
    fn from(value: diesel::result::Error) -> Self {
        EngineError::store("transaction", value)
    }
}
