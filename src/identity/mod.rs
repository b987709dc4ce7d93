use std::fmt;

use uuid::Uuid;

#[derive(Debug)]
pub enum IdentityError {
    GenerationFailed,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenerationFailed => write!(f, "failed to generate a device identifier"),
        }
    }
}

impl std::error::Error for IdentityError {}

// Device and channel identifiers are UUIDs on the wire, accepted with or
// without hyphens.
pub fn valid(id: &str) -> bool {
    !id.is_empty() && Uuid::try_parse(id).is_ok()
}

// Server-assigned identifiers are always the compact 32-hex rendering.
pub fn generate() -> Result<String, IdentityError> {
    Ok(Uuid::new_v4().simple().to_string())
}
