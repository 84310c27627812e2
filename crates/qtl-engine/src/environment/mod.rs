mod build_time;
mod runtime;

pub use build_time::BuildTimeEnvironment;
pub use build_time::CompiledTemplate;
pub use build_time::MAX_AST_DEPTH;
pub use runtime::RuntimeEnvironment;
pub(crate) use runtime::execute_builder;
