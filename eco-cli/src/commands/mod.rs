//! Command implementations

pub mod data;
pub mod tree;
pub mod use_modules;

use eco_modules::Exports;

/// Human readable rendering of a module's exports
pub fn render_exports(exports: &Exports) -> String {
    if exports.is_empty() {
        return "(empty)".to_string();
    }
    match exports.as_json() {
        Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        None => "<opaque>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_exports() {
        assert_eq!(render_exports(&Exports::empty()), "(empty)");
        assert_eq!(render_exports(&Exports::new(3_u8)), "<opaque>");
        assert_eq!(render_exports(&Exports::from(json!([1]))), "[\n  1\n]");
    }
}
