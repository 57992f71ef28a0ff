use crate::sessions::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: SessionStatus,
        actual: SessionStatus,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
