use std::sync::Arc;

use parking_lot::RwLock;
use regex::RegexBuilder;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::{
    errors::QueryParseError,
    fileinfo::DType,
    name::path_cat,
    query::{
        file_result::FileResult,
        wildmatch::{WildFlags, wildmatch},
    },
};

/// Per-file evaluation scratch: the wholename is computed at most once per
/// file and shared by every term that needs it.
pub struct EvalScratch {
    /// Byte offset where the wholename starts inside full paths; derived
    /// from `relative_root` (or the root path) plus one separator.
    pub name_start: usize,
    wholename: Option<String>,
}

impl EvalScratch {
    pub fn new(name_start: usize) -> Self {
        Self {
            name_start,
            wholename: None,
        }
    }

    pub fn reset(&mut self) {
        self.wholename = None;
    }

    /// The file's path relative to the root (or relative_root).
    pub fn wholename(&mut self, file: &dyn FileResult) -> &str {
        if self.wholename.is_none() {
            self.wholename = Some(compute_wholename(self.name_start, file));
        }
        self.wholename.as_deref().unwrap()
    }
}

pub fn compute_wholename(name_start: usize, file: &dyn FileResult) -> String {
    let dir = file.dir_name();
    if name_start > dir.len() {
        file.base_name().to_owned()
    } else {
        path_cat(&dir[name_start..], file.base_name())
    }
}

/// Open-ended expression terms contributed through the registry.
pub trait CustomExpr: Send + Sync {
    fn evaluate(&self, scratch: &mut EvalScratch, file: &mut dyn FileResult) -> Option<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy)]
pub struct IntCompare {
    pub op: CompareOp,
    pub operand: i64,
}

impl IntCompare {
    pub fn eval(&self, value: i64) -> bool {
        match self.op {
            CompareOp::Eq => value == self.operand,
            CompareOp::Ne => value != self.operand,
            CompareOp::Gt => value > self.operand,
            CompareOp::Ge => value >= self.operand,
            CompareOp::Lt => value < self.operand,
            CompareOp::Le => value <= self.operand,
        }
    }

    /// Parses `["size", "eq", 1024]`-shaped terms.
    pub fn parse(term: &[Value]) -> Result<Self, QueryParseError> {
        if term.len() != 3 {
            return Err(QueryParseError::new("integer comparator must have 3 elements"));
        }
        let op_name = term[1]
            .as_str()
            .ok_or_else(|| QueryParseError::new("integer comparator op must be a string"))?;
        let operand = term[2]
            .as_i64()
            .ok_or_else(|| QueryParseError::new("integer comparator operand must be an integer"))?;
        let op = match op_name {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            other => {
                return Err(QueryParseError::new(format!(
                    "integer comparator opname `{other}' is invalid"
                )));
            }
        };
        Ok(Self { op, operand })
    }
}

/// The expression tree. Evaluation returns `None` when a needed property is
/// not loaded yet; the file is then parked for a batched fetch and
/// re-evaluated.
pub enum Expr {
    True,
    False,
    Exists,
    Empty,
    Type(char),
    Size(IntCompare),
    Suffix(FxHashSet<String>),
    Name {
        values: FxHashSet<String>,
        wholename: bool,
        casefold: bool,
    },
    Match {
        pattern: String,
        wholename: bool,
        flags: WildFlags,
    },
    Pcre {
        regex: regex::Regex,
        wholename: bool,
    },
    AllOf(Vec<Expr>),
    AnyOf(Vec<Expr>),
    Not(Box<Expr>),
    Custom(Arc<dyn CustomExpr>),
}

impl Expr {
    pub fn evaluate(
        &self,
        scratch: &mut EvalScratch,
        file: &mut dyn FileResult,
    ) -> Option<bool> {
        match self {
            Expr::True => Some(true),
            Expr::False => Some(false),
            Expr::Exists => file.exists(),
            Expr::Empty => {
                let exists = file.exists()?;
                if !exists {
                    return Some(false);
                }
                let stat = file.stat()?;
                let size = file.size()?;
                if stat.is_dir() || stat.is_file() {
                    Some(size == 0)
                } else {
                    Some(false)
                }
            }
            Expr::Type(code) => {
                let dtype = file.dtype()?;
                if dtype != DType::Unknown {
                    return Some(dtype.code() == *code);
                }
                let stat = file.stat()?;
                Some(stat.dtype().code() == *code)
            }
            Expr::Size(comp) => {
                let exists = file.exists()?;
                // Removed files never match a size comparison.
                if !exists {
                    return Some(false);
                }
                let size = file.size()?;
                Some(comp.eval(size as i64))
            }
            Expr::Suffix(set) => {
                let base = file.base_name();
                let suffix = base
                    .rsplit_once('.')
                    .map(|(_, suffix)| suffix.to_ascii_lowercase());
                Some(suffix.is_some_and(|suffix| set.contains(&suffix)))
            }
            Expr::Name {
                values,
                wholename,
                casefold,
            } => {
                let subject = if *wholename {
                    scratch.wholename(file).to_owned()
                } else {
                    file.base_name().to_owned()
                };
                let subject = if *casefold {
                    subject.to_ascii_lowercase()
                } else {
                    subject
                };
                Some(values.contains(&subject))
            }
            Expr::Match {
                pattern,
                wholename,
                flags,
            } => {
                let subject = if *wholename {
                    scratch.wholename(file).to_owned()
                } else {
                    file.base_name().to_owned()
                };
                Some(wildmatch(pattern, &subject, *flags))
            }
            Expr::Pcre { regex, wholename } => {
                let subject = if *wholename {
                    scratch.wholename(file).to_owned()
                } else {
                    file.base_name().to_owned()
                };
                Some(regex.is_match(&subject))
            }
            Expr::AllOf(children) => {
                let mut result = Some(true);
                for child in children {
                    match child.evaluate(scratch, file) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Expr::AnyOf(children) => {
                let mut result = Some(false);
                for child in children {
                    match child.evaluate(scratch, file) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Expr::Not(child) => child.evaluate(scratch, file).map(|matched| !matched),
            Expr::Custom(custom) => custom.evaluate(scratch, file),
        }
    }
}

pub type ExprParserFn =
    Arc<dyn Fn(&ParseEnv, &Value) -> Result<Expr, QueryParseError> + Send + Sync>;

/// What term parsers need to know about the enclosing query.
pub struct ParseEnv {
    pub case_sensitive: bool,
}

/// Registry of expression term parsers. Built-in terms are always
/// available; `register` adds new terms and their capability strings.
#[derive(Default)]
pub struct ExprRegistry {
    parsers: RwLock<FxHashMap<String, ExprParserFn>>,
    capabilities: RwLock<Vec<String>>,
}

impl ExprRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, term: &str, parser: ExprParserFn) {
        self.parsers.write().insert(term.to_owned(), parser);
        self.capabilities.write().push(format!("term-{term}"));
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities.read().clone()
    }

    fn lookup(&self, term: &str) -> Option<ExprParserFn> {
        self.parsers.read().get(term).cloned()
    }
}

/// Built-in terms plus their registered capability names.
pub const BUILTIN_TERMS: &[&str] = &[
    "true", "false", "exists", "empty", "type", "size", "suffix", "name", "iname", "match",
    "imatch", "pcre", "ipcre", "allof", "anyof", "not",
];

/// Parses an expression term: either a bare string (`"exists"`) or an array
/// whose first element names the term (`["type", "f"]`).
pub fn parse_expr(
    env: &ParseEnv,
    term: &Value,
    registry: Option<&ExprRegistry>,
) -> Result<Expr, QueryParseError> {
    let (name, args): (&str, &[Value]) = match term {
        Value::String(name) => (name.as_str(), &[]),
        Value::Array(items) => {
            let first = items
                .first()
                .ok_or_else(|| QueryParseError::new("expected array or string for an expression"))?;
            let name = first
                .as_str()
                .ok_or_else(|| {
                    QueryParseError::new("first element of an expression must be a string")
                })?;
            (name, items.as_slice())
        }
        _ => {
            return Err(QueryParseError::new(
                "expected array or string for an expression",
            ));
        }
    };

    match name {
        "true" => Ok(Expr::True),
        "false" => Ok(Expr::False),
        "exists" => Ok(Expr::Exists),
        "empty" => Ok(Expr::Empty),
        "type" => parse_type(args),
        "size" => {
            if args.is_empty() {
                return Err(QueryParseError::new("Expected array for 'size' term"));
            }
            Ok(Expr::Size(IntCompare::parse(args)?))
        }
        "suffix" => parse_suffix_term(args),
        "name" => parse_name(args, env.case_sensitive, "name"),
        "iname" => parse_name(args, false, "iname"),
        "match" => parse_match(args, env.case_sensitive, "match"),
        "imatch" => parse_match(args, false, "imatch"),
        "pcre" => parse_pcre(args, env.case_sensitive, "pcre"),
        "ipcre" => parse_pcre(args, false, "ipcre"),
        "allof" => {
            let children = parse_children(env, args, registry)?;
            if children.is_empty() {
                return Err(QueryParseError::new("must have at least one term in 'allof'"));
            }
            Ok(Expr::AllOf(children))
        }
        "anyof" => {
            let children = parse_children(env, args, registry)?;
            if children.is_empty() {
                return Err(QueryParseError::new("must have at least one term in 'anyof'"));
            }
            Ok(Expr::AnyOf(aggregate_anyof(children)))
        }
        "not" => {
            if args.len() != 2 {
                return Err(QueryParseError::new("must have exactly one term in 'not'"));
            }
            Ok(Expr::Not(Box::new(parse_expr(env, &args[1], registry)?)))
        }
        other => {
            if let Some(parser) = registry.and_then(|r| r.lookup(other)) {
                return parser(env, term);
            }
            Err(QueryParseError::new(format!(
                "unknown expression term '{other}'"
            )))
        }
    }
}

fn parse_children(
    env: &ParseEnv,
    args: &[Value],
    registry: Option<&ExprRegistry>,
) -> Result<Vec<Expr>, QueryParseError> {
    args.iter()
        .skip(1)
        .map(|term| parse_expr(env, term, registry))
        .collect()
}

/// Merges multiple suffix sets inside an `anyof` into a single set lookup.
fn aggregate_anyof(children: Vec<Expr>) -> Vec<Expr> {
    let mut merged_suffixes: Option<FxHashSet<String>> = None;
    let mut rest = Vec::with_capacity(children.len());
    for child in children {
        match child {
            Expr::Suffix(set) => match &mut merged_suffixes {
                Some(merged) => merged.extend(set),
                None => merged_suffixes = Some(set),
            },
            other => rest.push(other),
        }
    }
    if let Some(set) = merged_suffixes {
        rest.push(Expr::Suffix(set));
    }
    rest
}

fn parse_type(args: &[Value]) -> Result<Expr, QueryParseError> {
    let type_str = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            QueryParseError::new("First parameter to \"type\" term must be a type string")
        })?;
    let mut chars = type_str.chars();
    let (Some(code), None) = (chars.next(), chars.next()) else {
        return Err(QueryParseError::new(format!(
            "invalid type string '{type_str}'"
        )));
    };
    if !"bcdfplsD".contains(code) {
        return Err(QueryParseError::new(format!(
            "invalid type string '{type_str}'"
        )));
    }
    Ok(Expr::Type(code))
}

fn parse_suffix_term(args: &[Value]) -> Result<Expr, QueryParseError> {
    if args.len() != 2 {
        return Err(QueryParseError::new(
            "Invalid number of arguments for 'suffix' term",
        ));
    }
    let mut set = FxHashSet::default();
    match &args[1] {
        Value::String(suffix) => {
            set.insert(suffix.to_ascii_lowercase());
        }
        Value::Array(items) => {
            for item in items {
                let suffix = item.as_str().ok_or_else(|| {
                    QueryParseError::new(
                        "Argument 2 to 'suffix' must be either a string or an array of string",
                    )
                })?;
                set.insert(suffix.to_ascii_lowercase());
            }
        }
        _ => {
            return Err(QueryParseError::new(
                "Argument 2 to 'suffix' must be either a string or an array of string",
            ));
        }
    }
    Ok(Expr::Suffix(set))
}

fn parse_scope(args: &[Value], index: usize, which: &str) -> Result<bool, QueryParseError> {
    match args.get(index) {
        None => Ok(false),
        Some(Value::String(scope)) => match scope.as_str() {
            "basename" => Ok(false),
            "wholename" => Ok(true),
            other => Err(QueryParseError::new(format!(
                "Invalid scope '{other}' for {which} expression"
            ))),
        },
        Some(_) => Err(QueryParseError::new(format!(
            "Argument 3 to '{which}' must be a string"
        ))),
    }
}

fn parse_name(
    args: &[Value],
    case_sensitive: bool,
    which: &str,
) -> Result<Expr, QueryParseError> {
    if args.len() < 2 || args.len() > 3 {
        return Err(QueryParseError::new(format!(
            "Invalid number of arguments for '{which}' term"
        )));
    }
    let wholename = parse_scope(args, 2, which)?;
    let casefold = !case_sensitive;
    let mut values = FxHashSet::default();
    match &args[1] {
        Value::String(name) => {
            values.insert(if casefold {
                name.to_ascii_lowercase()
            } else {
                name.clone()
            });
        }
        Value::Array(items) => {
            for item in items {
                let name = item.as_str().ok_or_else(|| {
                    QueryParseError::new(format!(
                        "Argument 2 to '{which}' must be either a string or an array of string"
                    ))
                })?;
                values.insert(if casefold {
                    name.to_ascii_lowercase()
                } else {
                    name.to_owned()
                });
            }
        }
        _ => {
            return Err(QueryParseError::new(format!(
                "Argument 2 to '{which}' must be either a string or an array of string"
            )));
        }
    }
    Ok(Expr::Name {
        values,
        wholename,
        casefold,
    })
}

fn parse_match(
    args: &[Value],
    case_sensitive: bool,
    which: &str,
) -> Result<Expr, QueryParseError> {
    if args.len() > 4 {
        return Err(QueryParseError::new(format!(
            "too many parameters passed to \"{which}\" expression"
        )));
    }
    let pattern = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            QueryParseError::new(format!(
                "First parameter to \"{which}\" term must be a pattern string"
            ))
        })?;
    let wholename = parse_scope(args, 2, which)?;

    let mut noescape = false;
    let mut includedotfiles = false;
    if let Some(opts) = args.get(3) {
        let opts = opts.as_object().ok_or_else(|| {
            QueryParseError::new(format!(
                "Third parameter to \"{which}\" term must be an optional object"
            ))
        })?;
        if let Some(value) = opts.get("noescape") {
            noescape = value.as_bool().ok_or_else(|| {
                QueryParseError::new(format!(
                    "noescape option for \"{which}\" term must be a boolean"
                ))
            })?;
        }
        if let Some(value) = opts.get("includedotfiles") {
            includedotfiles = value.as_bool().ok_or_else(|| {
                QueryParseError::new(format!(
                    "includedotfiles option for \"{which}\" term must be a boolean"
                ))
            })?;
        }
    }

    let mut flags = WildFlags::empty();
    if !includedotfiles {
        flags |= WildFlags::PERIOD;
    }
    if noescape {
        flags |= WildFlags::NOESCAPE;
    }
    if wholename {
        flags |= WildFlags::PATHNAME;
    }
    if !case_sensitive {
        flags |= WildFlags::CASEFOLD;
    }
    Ok(Expr::Match {
        pattern: pattern.to_owned(),
        wholename,
        flags,
    })
}

fn parse_pcre(
    args: &[Value],
    case_sensitive: bool,
    which: &str,
) -> Result<Expr, QueryParseError> {
    let pattern = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            QueryParseError::new(format!(
                "First parameter to \"{which}\" term must be a pattern string"
            ))
        })?;
    let wholename = parse_scope(args, 2, which)?;
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|err| {
            QueryParseError::new(format!("invalid {which} pattern '{pattern}': {err}"))
        })?;
    Ok(Expr::Pcre { regex, wholename })
}
