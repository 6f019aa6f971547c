//! Query parsing and evaluation: expression trees, candidate generators,
//! batched property fetching and field rendering.

pub mod expr;
mod eval;
pub mod fields;
pub mod file_result;
pub mod glob;
mod parse;
pub mod wildmatch;

pub use eval::{QueryContextState, QueryResult, execute};
pub use expr::{CustomExpr, Expr, ExprRegistry};
pub use parse::{Query, QueryPath};

use crate::query::expr::BUILTIN_TERMS;

/// Capability strings advertised by this query engine; extension terms
/// registered at runtime add their own `term-<name>` entries.
pub fn capabilities(registry: Option<&ExprRegistry>) -> Vec<String> {
    let mut caps: Vec<String> = BUILTIN_TERMS
        .iter()
        .map(|term| format!("term-{term}"))
        .collect();
    caps.extend(
        [
            "relative_root",
            "dedup_results",
            "glob_generator",
            "suffix-set",
            "wildmatch",
            "wildmatch-multislash",
            "field-new",
            "field-content.sha1hex",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if let Some(registry) = registry {
        caps.extend(registry.capabilities());
    }
    caps.sort();
    caps
}
