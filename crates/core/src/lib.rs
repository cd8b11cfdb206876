pub mod artifact;
pub mod config;
pub mod error;
pub mod task;

pub use artifact::Artifact;
pub use config::KilnConfig;
pub use error::*;
pub use task::*;
