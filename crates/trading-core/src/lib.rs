pub mod error;
pub mod position;
pub mod traits;
pub mod types;

pub use error::*;
pub use position::*;
pub use traits::*;
pub use types::*;
