//! Tags and filters every engine ships with.

mod cache;
mod error_tag;
mod filters;
mod masking;
mod req;

use std::sync::Arc;

use qtl_query::QueryExecutor;

pub use cache::CacheTagBuilder;
pub use cache::CacheTagRunner;
pub use error_tag::ErrorTagBuilder;
pub use error_tag::ErrorTagRunner;
pub use filters::ExecuteFilter;
pub use filters::SanitizerFilter;
pub use filters::StandardFilter;
pub use masking::MaskingTagBuilder;
pub use masking::MaskingTagRunner;
pub use req::ReqTagBuilder;
pub use req::ReqTagRunner;

use crate::error::EngineError;
use crate::extensions::ExtensionRegistry;
use crate::validators::ValidatorLoader;

/// Export name of the builder whose value is the template result.
pub const FINAL_BUILDER_NAME: &str = "@final_builder";
/// Variable of the implicit main `req` wrapping a whole template.
pub const WRAPPED_BUILDER_NAME: &str = "@wrapped_builder";
/// Variable of a `cache` tag declared without a name.
pub const CACHE_MAIN_BUILDER_NAME: &str = "@cache_main_builder";

pub(crate) const SANITIZER_FILTER_NAME: &str = "sanitizer";
pub(crate) const RAW_FILTER_NAME: &str = "raw";
pub(crate) const EXECUTE_FILTER_NAME: &str = "execute";

/// Registers both halves of every built-in tag and filter, and a filter per
/// validator.
pub fn register_builtins(
    registry: &mut ExtensionRegistry,
    executor: &Arc<QueryExecutor>,
    validators: &ValidatorLoader,
) -> Result<(), EngineError> {
    registry.add_tag_builder(Arc::new(ReqTagBuilder))?;
    registry.add_tag_runner(Arc::new(ReqTagRunner::new(Arc::clone(executor))))?;
    registry.add_tag_builder(Arc::new(CacheTagBuilder))?;
    registry.add_tag_runner(Arc::new(CacheTagRunner::new(Arc::clone(executor))))?;
    registry.add_tag_builder(Arc::new(ErrorTagBuilder))?;
    registry.add_tag_runner(Arc::new(ErrorTagRunner))?;
    registry.add_tag_builder(Arc::new(MaskingTagBuilder))?;
    registry.add_tag_runner(Arc::new(MaskingTagRunner))?;

    let sanitizer = Arc::new(SanitizerFilter);
    registry.add_filter_builder(sanitizer.clone())?;
    registry.add_filter_runner(sanitizer)?;
    let execute = Arc::new(ExecuteFilter);
    registry.add_filter_builder(execute.clone())?;
    registry.add_filter_runner(execute)?;
    for filter in StandardFilter::all() {
        let filter = Arc::new(filter);
        registry.add_filter_builder(filter.clone())?;
        registry.add_filter_runner(filter)?;
    }

    for filter in validators.filters() {
        let filter = Arc::new(filter);
        registry.add_filter_builder(filter.clone())?;
        registry.add_filter_runner(filter)?;
    }
    Ok(())
}
