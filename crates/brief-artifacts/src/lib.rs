pub mod envelope;
pub mod store;

pub use envelope::*;
pub use store::*;
