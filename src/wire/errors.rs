use std::fmt;

use crate::store::StoreError;

// Client-visible failure kinds. Each maps to the `{status, error}` pair
// overlaid on the echoed request in the standard error envelope.
#[derive(Debug)]
pub enum WorkerError {
    UnknownCommand,
    // Command not valid in the connection's current state.
    InvalidCommand,
    InvalidParams,
    NoParams,
    InvalidId,
    ExistingId,
    BadPayload,
    TooManyPings,
    Store(StoreError),
}

impl WorkerError {
    pub fn to_status(&self) -> (u16, String) {
        match self {
            Self::UnknownCommand
            | Self::InvalidCommand
            | Self::InvalidParams
            | Self::NoParams
            | Self::InvalidId
            | Self::ExistingId
            | Self::BadPayload
            | Self::TooManyPings => (401, self.to_string()),
            Self::Store(_) => (500, self.to_string()),
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand => write!(f, "Unknown Command"),
            Self::InvalidCommand => write!(f, "Invalid Command"),
            Self::InvalidParams => write!(f, "Invalid Parameters"),
            Self::NoParams => write!(f, "Missing Parameters"),
            Self::InvalidId => write!(f, "Invalid Identifier"),
            Self::ExistingId => write!(f, "Existing Identifier"),
            Self::BadPayload => write!(f, "Bad Payload"),
            Self::TooManyPings => write!(f, "Too Many Pings"),
            Self::Store(source) => write!(f, "Storage Failure: {source}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<StoreError> for WorkerError {
    fn from(source: StoreError) -> Self {
        Self::Store(source)
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerError;
    use crate::store::StoreError;

    #[test]
    fn protocol_errors_map_to_401_with_their_message() {
        let (status, message) = WorkerError::TooManyPings.to_status();
        assert_eq!(status, 401);
        assert_eq!(message, "Too Many Pings");

        let (status, message) = WorkerError::InvalidCommand.to_status();
        assert_eq!(status, 401);
        assert_eq!(message, "Invalid Command");
    }

    #[test]
    fn store_errors_map_to_500() {
        let err = WorkerError::Store(StoreError::ChannelCeilingExceeded { limit: 4 });
        let (status, message) = err.to_status();
        assert_eq!(status, 500);
        assert!(message.starts_with("Storage Failure"));
    }
}
