//! Calculation errors.

use std::error::Error;
use std::rc::Rc;

use thiserror::Error;

use super::contract::VertexKey;

/// Result of evaluating a calculation.
pub type CalcResult<T> = Result<T, CalcError>;

/// Why a calculation has no value.
#[derive(Debug, Clone, Error)]
pub enum CalcError {
    /// The calculation was re-entered while running. `origin` is the vertex
    /// that detected the re-entry.
    #[error("dependency cycle detected at {origin}")]
    Cycle { origin: VertexKey },

    /// The calculation body failed.
    #[error("{0}")]
    Thrown(Rc<dyn Error>),
}

impl CalcError {
    /// Wrap any error raised by a calculation body.
    pub fn thrown<E>(error: E) -> Self
    where
        E: Error + 'static,
    {
        Self::Thrown(Rc::new(error))
    }

    /// A plain message error.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::thrown(Message(message.into()))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }

    pub fn cycle_origin(&self) -> Option<VertexKey> {
        match self {
            Self::Cycle { origin } => Some(*origin),
            Self::Thrown(_) => None,
        }
    }
}

/// Cycle errors compare by origin; thrown errors by identity, so a cached
/// error compared with itself is equal.
impl PartialEq for CalcError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cycle { origin: a }, Self::Cycle { origin: b }) => a == b,
            (Self::Thrown(a), Self::Thrown(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_errors_compare_by_origin() {
        let key = VertexKey::new();
        assert_eq!(CalcError::Cycle { origin: key }, CalcError::Cycle { origin: key });
        assert_ne!(
            CalcError::Cycle { origin: key },
            CalcError::Cycle {
                origin: VertexKey::new()
            }
        );
    }

    #[test]
    fn thrown_errors_compare_by_identity() {
        let error = CalcError::msg("boom");
        assert_eq!(error, error.clone());
        assert_ne!(error, CalcError::msg("boom"));
        assert_eq!(error.to_string(), "boom");
        assert!(!error.is_cycle());
    }
}
