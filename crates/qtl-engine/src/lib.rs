//! Compiles SQL templates into parameterized queries and renders them
//! against registered data sources.

pub mod builtins;
mod context;
mod engine;
mod environment;
mod error;
pub mod extensions;
pub mod logging;
mod passes;
pub mod validators;
mod value;

pub use context::Context;
pub use context::ExecutionMetadata;
pub use engine::CompiledArtifact;
pub use engine::FileTemplateProvider;
pub use engine::InMemoryTemplateProvider;
pub use engine::RenderOptions;
pub use engine::Template;
pub use engine::TemplateEngine;
pub use engine::TemplateProvider;
pub use environment::BuildTimeEnvironment;
pub use environment::CompiledTemplate;
pub use environment::RuntimeEnvironment;
pub use environment::MAX_AST_DEPTH;
pub use error::EngineError;
pub use value::Value;
