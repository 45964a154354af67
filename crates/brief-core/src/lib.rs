pub mod errors;
pub mod freshness;
pub mod ids;
pub mod model;
pub mod text;
pub mod types;

pub use errors::*;
pub use freshness::*;
pub use ids::*;
pub use model::*;
pub use text::*;
pub use types::*;
