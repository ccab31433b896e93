pub mod internal_key;
pub mod signature;

pub use internal_key::*;
pub use signature::*;
