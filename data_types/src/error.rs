use std::fmt::Display;

/// A type-erased error, used where heterogeneous failures are aggregated.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Collects multiple errors from an operation that must attempt every
/// step regardless of earlier failures (e.g. fsync-then-rename chains).
#[derive(Debug, Default)]
pub struct MultiError(Vec<DynError>);

impl MultiError {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the error of `result`, if any.
    pub fn add<T, E>(&mut self, result: Result<T, E>)
    where
        E: Into<DynError>,
    {
        if let Err(e) = result {
            self.0.push(e.into());
        }
    }

    /// Push an error directly.
    pub fn push(&mut self, e: impl Into<DynError>) {
        self.0.push(e.into());
    }

    /// Returns `Err(self)` if any error was collected.
    pub fn err(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no errors were collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for e in &self.0 {
            write!(f, " {e};")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ok() {
        assert!(MultiError::new().err().is_ok());
    }

    #[test]
    fn test_collects_errors() {
        let mut errors = MultiError::new();
        errors.add(Ok::<_, std::io::Error>(()));
        errors.add(Err::<(), _>(std::io::Error::new(
            std::io::ErrorKind::Other,
            "boom",
        )));
        errors.push(std::io::Error::new(std::io::ErrorKind::Other, "bang"));

        let err = errors.err().unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("bang"));
    }
}
