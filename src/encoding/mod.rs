pub mod embedding;
pub mod errors;

pub use embedding::SlotEncoder;
pub use errors::{EncodingError, EncodingResult};
