use thiserror::Error;

pub type EncodingResult<T> = Result<T, EncodingError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("Ring degree {degree} not supported")]
    InvalidRingDegree { degree: usize },

    #[error("Slot count {slots} must be a power of two no larger than {max}")]
    InvalidSlotCount { slots: usize, max: usize },

    #[error("Input too long: got {got}, max {max}")]
    InputTooLong { got: usize, max: usize },

    #[error("Scale {scale} must be finite and positive")]
    InvalidScale { scale: f64 },

    #[error("Coefficient {value} out of range")]
    CoefficientOutOfRange { value: f64 },
}
