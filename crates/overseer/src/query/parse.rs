use std::time::Duration;

use serde_json::Value;

use crate::{
    clock::SinceSpec,
    errors::QueryParseError,
    name::path_cat,
    query::{
        expr::{Expr, ExprRegistry, ParseEnv, parse_expr},
        fields::{FieldList, parse_field_list},
        glob::GlobTree,
        wildmatch::WildFlags,
    },
    root::{CaseSensitivity, Root},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPath {
    pub name: String,
    /// 0 = direct children only, -1 = unlimited.
    pub depth: i64,
}

/// A parsed query, ready for execution against a root.
pub struct Query {
    pub case_sensitive: bool,
    pub fail_if_no_saved_state: bool,
    pub empty_on_fresh_instance: bool,
    pub omit_changed_files: bool,
    pub dedup_results: bool,
    pub bench_iterations: u32,

    /// Absolute path of the relative root, without and with the trailing
    /// slash.
    pub relative_root: Option<String>,
    pub relative_root_slash: Option<String>,

    pub paths: Option<Vec<QueryPath>>,
    pub glob_tree: Option<GlobTree>,
    /// Extra wildmatch flags for the glob generator.
    pub glob_flags: WildFlags,

    pub sync_timeout: Duration,
    pub lock_timeout: Duration,

    /// Evaluated at execution time: named cursors and fresh-instance
    /// detection depend on the root's state at that moment.
    pub since_spec: Option<SinceSpec>,

    pub expr: Option<Expr>,
    pub fields: FieldList,

    pub request_id: Option<String>,
    pub subscription_name: Option<String>,
    pub client_pid: Option<u32>,

    /// The request this query was parsed from.
    pub query_spec: Value,
}

fn parse_bool(query: &Value, name: &str, default: bool) -> Result<bool, QueryParseError> {
    match query.get(name) {
        None => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(QueryParseError::new(format!("{name} must be a boolean"))),
    }
}

fn parse_timeout(
    query: &Value,
    name: &str,
    default: Duration,
) -> Result<Duration, QueryParseError> {
    match query.get(name) {
        None => Ok(default),
        Some(value) => {
            let ms = value.as_i64().ok_or_else(|| {
                QueryParseError::new(format!("{name} must be an integer value >= 0"))
            })?;
            if ms < 0 {
                return Err(QueryParseError::new(format!(
                    "{name} must be an integer value >= 0"
                )));
            }
            Ok(Duration::from_millis(ms as u64))
        }
    }
}

impl Query {
    /// Parses a query request object against a root, per the recognized
    /// option set. Unknown expression terms can be supplied through
    /// `registry`.
    pub fn parse(
        root: &Root,
        query: &Value,
        registry: Option<&ExprRegistry>,
    ) -> Result<Self, QueryParseError> {
        if !query.is_object() {
            return Err(QueryParseError::new("query must be an object"));
        }

        let bench_iterations = match query.get("bench") {
            None => 0,
            Some(Value::Bool(true)) => 100,
            Some(Value::Bool(false)) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| QueryParseError::new("bench must be a boolean or an integer"))?
                as u32,
        };

        let case_sensitive = parse_bool(
            query,
            "case_sensitive",
            root.case_sensitive == CaseSensitivity::CaseSensitive,
        )?;

        let sync_timeout =
            parse_timeout(query, "sync_timeout", root.config.default_sync_timeout())?;
        let lock_timeout =
            parse_timeout(query, "lock_timeout", root.config.default_sync_timeout())?;

        let dedup_results = parse_bool(query, "dedup_results", false)?;
        let empty_on_fresh_instance = parse_bool(query, "empty_on_fresh_instance", false)?;
        let fail_if_no_saved_state = parse_bool(query, "fail_if_no_saved_state", false)?;
        let omit_changed_files = parse_bool(query, "omit_changed_files", false)?;

        let (relative_root, relative_root_slash) = match query.get("relative_root") {
            None => (None, None),
            Some(Value::String(rel)) if rel.is_empty() => (None, None),
            Some(Value::String(rel)) => {
                let rel = rel.trim_matches('/');
                let full = path_cat(root.root_path(), rel);
                let with_slash = format!("{full}/");
                (Some(full), Some(with_slash))
            }
            Some(_) => {
                return Err(QueryParseError::new("'relative_root' must be a string"));
            }
        };

        let mut parsed = Self {
            case_sensitive,
            fail_if_no_saved_state,
            empty_on_fresh_instance,
            omit_changed_files,
            dedup_results,
            bench_iterations,
            relative_root,
            relative_root_slash,
            paths: None,
            glob_tree: None,
            glob_flags: WildFlags::empty(),
            sync_timeout,
            lock_timeout,
            since_spec: None,
            expr: None,
            fields: Vec::new(),
            request_id: None,
            subscription_name: None,
            client_pid: None,
            query_spec: query.clone(),
        };

        parsed.parse_paths(query)?;
        parsed.parse_globs(query)?;
        parsed.parse_suffixes(query)?;
        parsed.parse_since(query)?;

        if let Some(expression) = query.get("expression") {
            let env = ParseEnv { case_sensitive };
            parsed.expr = Some(parse_expr(&env, expression, registry)?);
        }

        if let Some(request_id) = query.get("request_id") {
            parsed.request_id = Some(
                request_id
                    .as_str()
                    .ok_or_else(|| QueryParseError::new("'request_id' must be a string"))?
                    .to_owned(),
            );
        }
        if let Some(name) = query.get("subscriptionName") {
            parsed.subscription_name = Some(
                name.as_str()
                    .ok_or_else(|| QueryParseError::new("'subscriptionName' must be a string"))?
                    .to_owned(),
            );
        }

        parsed.fields = parse_field_list(query.get("fields"))?;
        Ok(parsed)
    }

    fn parse_paths(&mut self, query: &Value) -> Result<(), QueryParseError> {
        let Some(paths) = query.get("paths").or_else(|| query.get("path")) else {
            return Ok(());
        };
        let paths = paths
            .as_array()
            .ok_or_else(|| QueryParseError::new("'path' must be an array"))?;
        let mut parsed = Vec::with_capacity(paths.len());
        for element in paths {
            match element {
                Value::String(name) => parsed.push(QueryPath {
                    name: name.trim_matches('/').to_owned(),
                    depth: -1,
                }),
                Value::Object(object) => {
                    let name = object
                        .get("path")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            QueryParseError::new(
                                "expected object with 'path' and 'depth' properties",
                            )
                        })?;
                    let depth = object
                        .get("depth")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| QueryParseError::new("path.depth must be an integer"))?;
                    parsed.push(QueryPath {
                        name: name.trim_matches('/').to_owned(),
                        depth,
                    });
                }
                _ => {
                    return Err(QueryParseError::new(
                        "expected object with 'path' and 'depth' properties",
                    ));
                }
            }
        }
        self.paths = Some(parsed);
        Ok(())
    }

    fn parse_globs(&mut self, query: &Value) -> Result<(), QueryParseError> {
        let Some(globs) = query.get("glob") else {
            return Ok(());
        };
        let globs = globs
            .as_array()
            .ok_or_else(|| QueryParseError::new("'glob' must be an array"))?;

        // Globs implicitly enable dedup mode.
        self.dedup_results = true;

        let noescape = parse_bool(query, "glob_noescape", false)?;
        let includedotfiles = parse_bool(query, "glob_includedotfiles", false)?;
        let mut flags = WildFlags::empty();
        if !includedotfiles {
            flags |= WildFlags::PERIOD;
        }
        if noescape {
            flags |= WildFlags::NOESCAPE;
        }
        self.glob_flags = flags;

        let mut tree = GlobTree::root();
        for glob in globs {
            let pattern = glob
                .as_str()
                .ok_or_else(|| QueryParseError::new("glob patterns must be strings"))?;
            tree.add_glob(pattern)?;
        }
        self.glob_tree = Some(tree);
        Ok(())
    }

    fn parse_suffixes(&mut self, query: &Value) -> Result<(), QueryParseError> {
        let Some(suffixes) = query.get("suffix") else {
            return Ok(());
        };
        if query.get("glob").is_some() {
            return Err(QueryParseError::new(
                "'suffix' cannot be used together with the 'glob' generator",
            ));
        }
        let list: Vec<&str> = match suffixes {
            Value::String(suffix) => vec![suffix.as_str()],
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().ok_or_else(|| {
                        QueryParseError::new("'suffix' must be a string or an array of strings")
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(QueryParseError::new(
                    "'suffix' must be a string or an array of strings",
                ));
            }
        };

        // Suffix generation compiles down to `**/*.<suffix>` globs; suffix
        // queries are case insensitive by definition and dedup'd.
        self.dedup_results = true;
        self.glob_flags = WildFlags::CASEFOLD;
        let mut tree = GlobTree::root();
        for suffix in list {
            let pattern = format!("**/*.{}", suffix.to_ascii_lowercase());
            tree.add_glob(&pattern)?;
        }
        self.glob_tree = Some(tree);
        Ok(())
    }

    fn parse_since(&mut self, query: &Value) -> Result<(), QueryParseError> {
        match query.get("since") {
            None => Ok(()),
            Some(value @ (Value::Number(_) | Value::String(_))) => {
                self.since_spec = Some(SinceSpec::parse(value)?);
                Ok(())
            }
            Some(Value::Object(_)) => Err(QueryParseError::new(
                "scm-aware 'since' specs are not supported by this server",
            )),
            Some(_) => Err(QueryParseError::new("invalid value for 'since'")),
        }
    }

    /// Byte offset at which wholenames start inside full paths, based on
    /// `relative_root` or the root path.
    pub fn name_start(&self, root_path: &str) -> usize {
        match &self.relative_root {
            Some(relative_root) => relative_root.len() + 1,
            None => root_path.len() + 1,
        }
    }

    pub fn is_field_requested(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }
}
