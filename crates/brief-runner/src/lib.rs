pub mod config;
pub mod orchestrator;
pub mod producer;
pub mod runner;
pub mod scenario;
pub mod util;

pub use config::*;
pub use orchestrator::*;
pub use producer::*;
pub use runner::*;
pub use util::*;
