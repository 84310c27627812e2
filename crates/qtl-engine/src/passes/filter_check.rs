use std::collections::BTreeSet;

use qtl_templates::Node;
use rustc_hash::FxHashSet;
use serde_json::Value as JsonValue;

use crate::error::EngineError;
use crate::extensions::AstVisitor;

/// Fails compilation on filters no extension provides and reports the
/// filters a template uses.
///
/// Registered after the sanitizer, so the `sanitizer` filters it injects into
/// an `Output` are checked when the walk reaches them.
pub struct FilterCheckVisitor {
    known: FxHashSet<String>,
    used: BTreeSet<String>,
}

impl FilterCheckVisitor {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().collect(),
            used: BTreeSet::new(),
        }
    }
}

impl AstVisitor for FilterCheckVisitor {
    fn on_visit(&mut self, node: &mut Node) -> Result<(), EngineError> {
        let Node::Filter { name, loc, .. } = node else {
            return Ok(());
        };
        if !self.known.contains(name.as_str()) {
            return Err(EngineError::syntax(format!("filter not found: {name}"), *loc));
        }
        if !self.used.contains(name.as_str()) {
            self.used.insert(name.clone());
        }
        Ok(())
    }

    fn metadata(&self) -> Option<(&'static str, JsonValue)> {
        Some((
            "filters",
            JsonValue::Array(self.used.iter().cloned().map(JsonValue::String).collect()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use qtl_templates::parse_template;
    use qtl_templates::NoExtensions;
    use serde_json::json;

    use super::*;
    use crate::passes::run_visitor;
    use crate::passes::SanitizerVisitor;

    fn visitor() -> FilterCheckVisitor {
        FilterCheckVisitor::new(["upper", "raw", "sanitizer"].map(String::from))
    }

    #[test]
    fn test_used_filters_are_sorted_and_distinct() {
        let mut root = parse_template("{{ a | upper | raw }}{{ b | upper }}", &NoExtensions).unwrap();
        let mut check = visitor();
        run_visitor(&mut check, &mut root).unwrap();
        assert_eq!(check.metadata().unwrap().1, json!(["raw", "upper"]));
    }

    #[test]
    fn test_unknown_filter_fails_with_location() {
        let mut root = parse_template("{{ a | shout }}", &NoExtensions).unwrap();
        let err = run_visitor(&mut visitor(), &mut root).unwrap_err();
        assert_eq!(err.to_string(), "filter not found: shout (at 1:8)");
    }

    #[test]
    fn test_injected_sanitizers_are_checked() {
        let mut root = parse_template("{{ a | upper }}", &NoExtensions).unwrap();
        let mut check = visitor();
        run_visitor(&mut SanitizerVisitor, &mut root).unwrap();
        run_visitor(&mut check, &mut root).unwrap();
        assert_eq!(check.metadata().unwrap().1, json!(["sanitizer", "upper"]));

        let mut root = parse_template("{{ a }}", &NoExtensions).unwrap();
        let mut check = FilterCheckVisitor::new(["upper".to_string()]);
        run_visitor(&mut SanitizerVisitor, &mut root).unwrap();
        let err = run_visitor(&mut check, &mut root).unwrap_err();
        assert_eq!(err.to_string(), "filter not found: sanitizer (at 1:4)");
    }
}
