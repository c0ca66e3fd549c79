//! Upload identifier naming.

use thiserror::Error;
use uuid::Uuid;

/// Failure to produce an upload identifier.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NamingError(pub String);

impl NamingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Produces identifiers for new uploads.
///
/// Implementations must be pure with respect to engine state: the engine
/// checks uniqueness itself and never calls back into the namer twice for the
/// same creation request.
pub trait Namer: Send + Sync + 'static {
    /// Produce an identifier, optionally guided by a client-supplied hint.
    fn name(&self, hint: Option<&str>) -> Result<String, NamingError>;
}

impl<F> Namer for F
where
    F: Fn(Option<&str>) -> Result<String, NamingError> + Send + Sync + 'static,
{
    fn name(&self, hint: Option<&str>) -> Result<String, NamingError> {
        self(hint)
    }
}

/// Default namer: 32 lowercase hex characters from a random v4 UUID.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidNamer;

impl Namer for UuidNamer {
    fn name(&self, _hint: Option<&str>) -> Result<String, NamingError> {
        Ok(Uuid::new_v4().simple().to_string())
    }
}

/// Check that an identifier can address both the object and its sidecar.
pub fn validate_id(id: &str) -> Result<(), NamingError> {
    if id.is_empty() {
        return Err(NamingError::new("generated identifier is empty"));
    }
    if id.ends_with(crate::INFO_SUFFIX) {
        return Err(NamingError::new(format!(
            "identifier {id:?} collides with the metadata suffix"
        )));
    }
    if id.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(NamingError::new(format!(
            "identifier {id:?} contains an empty or relative path segment"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_namer_shape() {
        let a = UuidNamer.name(None).unwrap();
        let b = UuidNamer.name(Some("ignored")).unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_closure_namer_uses_hint() {
        let namer = |hint: Option<&str>| match hint {
            Some(h) => Ok(format!("uploads/{h}")),
            None => Err(NamingError::new("hint required")),
        };
        assert_eq!(namer.name(Some("x")).unwrap(), "uploads/x");
        assert_eq!(namer.name(None).unwrap_err().to_string(), "hint required");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("abc").is_ok());
        assert!(validate_id("tenant/abc").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("abc.info").is_err());
        assert!(validate_id("../abc").is_err());
        assert!(validate_id("a//b").is_err());
        assert!(validate_id("/abc").is_err());
    }
}
