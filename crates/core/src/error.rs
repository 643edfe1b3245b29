use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid holder address: {0}")]
    InvalidAddress(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid pool id: {0}")]
    InvalidPoolId(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_address() {
        let err = CoreError::InvalidAddress("GXYZ".to_string());
        assert_eq!(err.to_string(), "Invalid holder address: GXYZ");
    }

    #[test]
    fn test_error_display_invalid_amount() {
        let err = CoreError::InvalidAmount("-1".to_string());
        assert_eq!(err.to_string(), "Invalid amount: -1");
    }
}
