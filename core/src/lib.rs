pub mod application;
pub mod benchmark;
pub mod cli;
pub mod config;
pub mod errors;
pub mod executor;
pub mod pool;
pub mod recipe;
pub mod registry;
pub mod settings;
pub mod types;

// Re-export main types
pub use errors::*;
pub use types::*;

pub use pool::{PoolController, PoolStats};
pub use recipe::{Recipe, RecipeStep, TypedRecipe};
pub use registry::{OperationDescriptor, OperationRegistry};
pub use settings::PoolSettings;

// Re-export init API for convenience
pub use application::{initialize, Application, InitBuilder, InitOptions};
