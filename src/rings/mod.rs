//! Runtime-degree RNS polynomial arithmetic over `Z_Q[X] / (X^N + 1)`.

pub mod basis;
pub mod errors;
pub mod poly;

pub use basis::{NttTable, RnsBasis};
pub use errors::{RingError, RingResult};
pub use poly::{Domain, RnsPoly};
