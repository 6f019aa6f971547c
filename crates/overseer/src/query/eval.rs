use std::{sync::Arc, time::Duration};

use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::debug;

use crate::{
    clock::QuerySince,
    engine::InMemoryView,
    errors::QueryExecError,
    name::path_cat,
    query::{
        expr::EvalScratch,
        fields::{RenderCtx, file_result_to_json},
        file_result::{FileResult, InMemoryFileResult, batch_fetch_properties},
        glob::GlobTree,
        parse::Query,
        wildmatch::{WildFlags, wildmatch},
    },
    root::Root,
    view::{DirId, ViewDatabase},
};

/// Balance between memory held by deferred files and the cost of each batch
/// fetch round.
const EVAL_BATCH_THRESHOLD: usize = 20480;
const RENDER_BATCH_THRESHOLD: usize = 1024;

/// Phases of query execution, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryContextState {
    NotStarted,
    WaitingForCookieSync,
    Generating,
    Rendering,
    Completed,
}

/// The result of one query execution, shaped per the response contract.
pub struct QueryResult {
    pub is_fresh_instance: bool,
    pub clock: String,
    pub files: Vec<Value>,
    /// Populated when the query ran with dedup_results.
    pub deduped_file_names: Option<FxHashSet<String>>,
    pub state_trans_count: u32,
    pub saved_state_info: Option<Value>,
    pub warning: Option<String>,
    pub debug: Option<Value>,
}

impl QueryResult {
    pub fn render(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("clock".into(), Value::String(self.clock.clone()));
        object.insert(
            "is_fresh_instance".into(),
            Value::Bool(self.is_fresh_instance),
        );
        object.insert("files".into(), Value::Array(self.files.clone()));
        if let Some(info) = &self.saved_state_info {
            object.insert("saved-state-info".into(), info.clone());
        }
        if let Some(warning) = &self.warning {
            object.insert("warning".into(), Value::String(warning.clone()));
        }
        if let Some(debug) = &self.debug {
            object.insert("debug".into(), debug.clone());
        }
        Value::Object(object)
    }
}

struct QueryContext<'q> {
    query: &'q Query,
    root: &'q Arc<Root>,
    engine: Arc<InMemoryView>,
    since: QuerySince,
    scratch: EvalScratch,
    state: QueryContextState,

    results: Vec<Value>,
    dedup: FxHashSet<String>,
    num_deduped: u64,
    num_walked: u64,
    eval_batch: Vec<Box<dyn FileResult>>,
    render_batch: Vec<Box<dyn FileResult>>,
    disable_fresh_instance: bool,
}

impl<'q> QueryContext<'q> {
    fn new(query: &'q Query, root: &'q Arc<Root>, since: QuerySince) -> Self {
        let engine = Arc::clone(root.engine());
        let name_start = query.name_start(root.root_path());
        Self {
            query,
            root,
            engine,
            since,
            scratch: EvalScratch::new(name_start),
            state: QueryContextState::NotStarted,
            results: Vec::new(),
            dedup: FxHashSet::default(),
            num_deduped: 0,
            num_walked: 0,
            eval_batch: Vec::new(),
            render_batch: Vec::new(),
            disable_fresh_instance: false,
        }
    }

    fn render_ctx(&self) -> RenderCtx<'_> {
        RenderCtx {
            clock_id: self.root.clock_id(),
            clock_at_start: self.engine.current_clock(),
            since: self.since,
            name_start: self.scratch.name_start,
        }
    }

    fn process_file(&mut self, mut file: Box<dyn FileResult>) {
        self.scratch.reset();

        // For fresh instances, only files that currently exist are
        // reported.
        if !self.disable_fresh_instance
            && !self.since.is_timestamp()
            && self.since.is_fresh_instance()
        {
            match file.exists() {
                None => {
                    self.add_to_eval_batch(file);
                    return;
                }
                Some(false) => return,
                Some(true) => {}
            }
        }

        if let Some(expr) = &self.query.expr {
            match expr.evaluate(&mut self.scratch, file.as_mut()) {
                None => {
                    self.add_to_eval_batch(file);
                    return;
                }
                Some(false) => return,
                Some(true) => {}
            }
        }

        if self.query.dedup_results {
            let name = self.scratch.wholename(file.as_ref()).to_owned();
            if !self.dedup.insert(name) {
                self.num_deduped += 1;
                return;
            }
        }

        self.maybe_render(file);
    }

    fn maybe_render(&mut self, mut file: Box<dyn FileResult>) {
        let rendered = file_result_to_json(&self.query.fields, file.as_mut(), &self.render_ctx());
        match rendered {
            Some(value) => self.results.push(value),
            None => self.add_to_render_batch(file),
        }
    }

    fn add_to_eval_batch(&mut self, file: Box<dyn FileResult>) {
        self.eval_batch.push(file);
        if self.eval_batch.len() >= EVAL_BATCH_THRESHOLD {
            self.fetch_eval_batch_now();
        }
    }

    fn fetch_eval_batch_now(&mut self) {
        if self.eval_batch.is_empty() {
            return;
        }
        let mut batch = std::mem::take(&mut self.eval_batch);
        batch_fetch_properties(&mut batch);
        for file in batch {
            self.process_file(file);
        }
        debug_assert!(
            self.eval_batch.is_empty(),
            "batch fetch must satisfy every deferred evaluation"
        );
    }

    fn add_to_render_batch(&mut self, file: Box<dyn FileResult>) {
        self.render_batch.push(file);
        if self.render_batch.len() >= RENDER_BATCH_THRESHOLD {
            self.fetch_render_batch_now();
        }
    }

    /// Fetches and re-renders the render batch. Returns true when nothing
    /// remains deferred.
    fn fetch_render_batch_now(&mut self) -> bool {
        if self.render_batch.is_empty() {
            return true;
        }
        let mut batch = std::mem::take(&mut self.render_batch);
        batch_fetch_properties(&mut batch);
        for mut file in batch {
            let rendered =
                file_result_to_json(&self.query.fields, file.as_mut(), &self.render_ctx());
            match rendered {
                Some(value) => self.results.push(value),
                None => self.render_batch.push(file),
            }
        }
        self.render_batch.is_empty()
    }

    fn file_matches_relative_root(&self, dir_path: &str) -> bool {
        let (Some(relative_root), Some(relative_root_slash)) = (
            self.query.relative_root.as_deref(),
            self.query.relative_root_slash.as_deref(),
        ) else {
            return true;
        };
        dir_path == relative_root || dir_path.starts_with(relative_root_slash)
    }

    fn make_file_result(
        &self,
        view: &ViewDatabase,
        file_id: crate::view::FileId,
    ) -> Box<dyn FileResult> {
        Box::new(InMemoryFileResult::new(
            Arc::clone(&self.engine),
            view,
            file_id,
        ))
    }

    /// Walks the recency list until otime crosses the since boundary.
    /// Comparisons are inclusive so that coarse unix-timestamp cursors do
    /// not miss boundary changes.
    fn time_generator(&mut self) {
        let engine = Arc::clone(&self.engine);
        let view = engine.view().read();
        let mut cursor = view.latest_file();
        while let Some(file_id) = cursor {
            cursor = view.next_changed(file_id);
            self.num_walked += 1;
            let file = view.file(file_id);
            match self.since {
                QuerySince::Timestamp(ts) => {
                    if file.otime.timestamp <= ts {
                        break;
                    }
                }
                QuerySince::Clock { ticks, .. } => {
                    if file.otime.ticks <= ticks {
                        break;
                    }
                }
            }
            let dir_path = view.dir_path(file.parent);
            if !self.file_matches_relative_root(&dir_path) {
                continue;
            }
            let result = self.make_file_result(&view, file_id);
            self.process_file(result);
        }
    }

    fn all_files_generator(&mut self) {
        let engine = Arc::clone(&self.engine);
        let view = engine.view().read();
        let mut cursor = view.latest_file();
        while let Some(file_id) = cursor {
            cursor = view.next_changed(file_id);
            self.num_walked += 1;
            let dir_path = view.dir_path(view.file(file_id).parent);
            if !self.file_matches_relative_root(&dir_path) {
                continue;
            }
            let result = self.make_file_result(&view, file_id);
            self.process_file(result);
        }
    }

    fn path_generator(&mut self) {
        let engine = Arc::clone(&self.engine);
        let root_path = engine.root_path().to_owned();
        let base = self
            .query
            .relative_root
            .clone()
            .unwrap_or_else(|| root_path.clone());
        let paths = self.query.paths.clone().unwrap_or_default();

        let view = engine.view().read();
        for path in &paths {
            let full_name = if path.name.is_empty() {
                base.clone()
            } else {
                path_cat(&base, &path.name)
            };

            let dir = if full_name == root_path {
                // dirname on the root is outside the root, which is useless
                view.resolve_dir_readonly(&full_name)
            } else {
                let parent_path = crate::name::dir_name(&full_name);
                let Some(parent) = view.resolve_dir_readonly(parent_path) else {
                    // Doesn't exist, and never has.
                    continue;
                };
                let leaf = crate::name::base_name(&full_name);

                // We may be looking at a file, or at a dir that was deleted
                // and replaced by a file; prefer the file node when it is
                // not an existing directory.
                if let Some(&file_id) = view.dir(parent).files.get(leaf) {
                    let file = view.file(file_id);
                    if !file.exists || !file.stat.is_some_and(|st| st.is_dir()) {
                        self.num_walked += 1;
                        let result = self.make_file_result(&view, file_id);
                        self.process_file(result);
                        continue;
                    }
                }
                view.dir(parent).dirs.get(leaf).copied()
            };

            if let Some(dir) = dir {
                self.dir_generator(&view, dir, path.depth);
            }
        }
    }

    fn dir_generator(&mut self, view: &ViewDatabase, dir: DirId, depth: i64) {
        let file_ids: Vec<crate::view::FileId> = view.dir(dir).files.values().copied().collect();
        for file_id in file_ids {
            self.num_walked += 1;
            let result = self.make_file_result(view, file_id);
            self.process_file(result);
        }
        if depth != 0 {
            let child_dirs: Vec<DirId> = view.dir(dir).dirs.values().copied().collect();
            for child in child_dirs {
                self.dir_generator(view, child, depth - 1);
            }
        }
    }

    fn glob_generator(&mut self) -> Result<(), QueryExecError> {
        let engine = Arc::clone(&self.engine);
        let base = self
            .query
            .relative_root
            .clone()
            .unwrap_or_else(|| engine.root_path().to_owned());

        let view = engine.view().read();
        let Some(dir) = view.resolve_dir_readonly(&base) else {
            return Err(QueryExecError::other(format!(
                "glob_generator could not resolve {base}, check your relative_root parameter!"
            )));
        };
        let tree = self
            .query
            .glob_tree
            .as_ref()
            .expect("glob generator requires a glob tree");
        self.glob_generator_tree(&view, tree, dir);
        Ok(())
    }

    fn glob_flags(&self, pathname: bool) -> WildFlags {
        let mut flags = self.query.glob_flags;
        if pathname {
            flags |= WildFlags::PATHNAME;
        }
        if !self.query.case_sensitive {
            flags |= WildFlags::CASEFOLD;
        }
        flags
    }

    /// Matches each child of the pattern node against the children of the
    /// directory, descending both trees in lockstep.
    fn glob_generator_tree(&mut self, view: &ViewDatabase, node: &GlobTree, dir: DirId) {
        if !node.doublestar_children.is_empty() {
            self.glob_generator_doublestar(view, dir, node, "");
        }

        for child_node in &node.children {
            debug_assert!(!child_node.is_doublestar);

            // Even a leaf pattern may name a directory further constrained
            // by a later pattern (["some_dir", "some_dir/file"]).
            if !view.dir(dir).dirs.is_empty() {
                if !child_node.had_specials && self.query.case_sensitive {
                    if let Some(&child_dir) = view.dir(dir).dirs.get(child_node.pattern.as_str()) {
                        self.glob_generator_tree(view, child_node, child_dir);
                    }
                } else {
                    let flags = self.glob_flags(false);
                    let candidates: Vec<(String, DirId)> = view
                        .dir(dir)
                        .dirs
                        .iter()
                        .map(|(name, &id)| (name.to_string(), id))
                        .collect();
                    for (name, child_dir) in candidates {
                        if !view.dir(child_dir).last_check_existed {
                            continue;
                        }
                        if wildmatch(&child_node.pattern, &name, flags) {
                            self.glob_generator_tree(view, child_node, child_dir);
                        }
                    }
                }
            }

            if child_node.is_leaf && !view.dir(dir).files.is_empty() {
                if !child_node.had_specials && self.query.case_sensitive {
                    if let Some(&file_id) = view.dir(dir).files.get(child_node.pattern.as_str()) {
                        self.num_walked += 1;
                        if view.file(file_id).exists {
                            let result = self.make_file_result(view, file_id);
                            self.process_file(result);
                        }
                    }
                } else {
                    let flags = self.glob_flags(false);
                    let candidates: Vec<(String, crate::view::FileId)> = view
                        .dir(dir)
                        .files
                        .iter()
                        .map(|(name, &id)| (name.to_string(), id))
                        .collect();
                    for (name, file_id) in candidates {
                        self.num_walked += 1;
                        if !view.file(file_id).exists {
                            continue;
                        }
                        if wildmatch(&child_node.pattern, &name, flags) {
                            let result = self.make_file_result(view, file_id);
                            self.process_file(result);
                        }
                    }
                }
            }
        }
    }

    /// The `**` walk: every file in the subtree is matched against each
    /// doublestar pattern, stopping at the first pattern that accepts it.
    fn glob_generator_doublestar(
        &mut self,
        view: &ViewDatabase,
        dir: DirId,
        node: &GlobTree,
        dir_relative: &str,
    ) {
        let flags = self.glob_flags(true);
        let file_ids: Vec<(String, crate::view::FileId)> = view
            .dir(dir)
            .files
            .iter()
            .map(|(name, &id)| (name.to_string(), id))
            .collect();
        for (name, file_id) in file_ids {
            self.num_walked += 1;
            if !view.file(file_id).exists {
                // Globs can only match files that exist.
                continue;
            }
            let subject = path_cat(dir_relative, &name);
            for child_node in &node.doublestar_children {
                if wildmatch(&child_node.pattern, &subject, flags) {
                    let result = self.make_file_result(view, file_id);
                    self.process_file(result);
                    break;
                }
            }
        }

        let child_dirs: Vec<(String, DirId)> = view
            .dir(dir)
            .dirs
            .iter()
            .map(|(name, &id)| (name.to_string(), id))
            .collect();
        for (name, child_dir) in child_dirs {
            if !view.dir(child_dir).last_check_existed {
                continue;
            }
            let subject = path_cat(dir_relative, &name);
            self.glob_generator_doublestar(view, child_dir, node, &subject);
        }
    }

    fn default_generators(&mut self) -> Result<(), QueryExecError> {
        let mut generated = false;

        // Time based query.
        if self.since.is_timestamp() || !self.since.is_fresh_instance() {
            self.time_generator();
            generated = true;
        }

        if self.query.paths.is_some() {
            self.path_generator();
            generated = true;
        }

        if self.query.glob_tree.is_some() {
            self.glob_generator()?;
            generated = true;
        }

        // Failing everything else, walk all known files.
        if !generated {
            self.all_files_generator();
        }
        Ok(())
    }

    fn run(&mut self) -> Result<bool, QueryExecError> {
        let fresh_instance = !self.since.is_timestamp() && self.since.is_fresh_instance();

        self.state = QueryContextState::Generating;
        if !(fresh_instance && self.query.empty_on_fresh_instance)
            && !self.query.omit_changed_files
        {
            self.default_generators()?;
        }

        self.state = QueryContextState::Rendering;
        // Deferred evaluations first, then keep fetching for the renderers
        // until everything has the data it needs.
        self.fetch_eval_batch_now();
        while !self.fetch_render_batch_now() {}

        self.state = QueryContextState::Completed;
        debug!(
            state = ?self.state,
            walked = self.num_walked,
            results = self.results.len(),
            deduped = self.num_deduped,
            "query generation complete"
        );
        Ok(fresh_instance)
    }
}

/// Runs a parsed query against a root: cookie sync, since evaluation,
/// generation, batched fetching and rendering.
pub fn execute(root: &Arc<Root>, query: &Query) -> Result<QueryResult, QueryExecError> {
    root.check_healthy()?;
    root.note_cmd();

    if let Some(request_id) = &query.request_id {
        debug!(request_id, "executing query");
    }

    if query.fail_if_no_saved_state {
        return Err(QueryExecError::other(
            "fail_if_no_saved_state was set in the query but no saved state is available",
        ));
    }

    if query.sync_timeout > Duration::ZERO {
        root.sync_to_now(query.sync_timeout)
            .map_err(QueryExecError::Sync)?;
    }

    let engine = root.engine();
    let clock_at_start = engine.current_clock();
    let last_age_out_tick = engine.last_age_out_tick();
    let since = match &query.since_spec {
        Some(spec) => root.evaluate_since(spec, clock_at_start, last_age_out_tick),
        None => QuerySince::fresh(),
    };

    for _ in 0..query.bench_iterations {
        let mut bench_ctx = QueryContext::new(query, root, since);
        bench_ctx.run()?;
    }

    let mut ctx = QueryContext::new(query, root, since);
    let mut is_fresh_instance = ctx.run()?;
    // The since evaluation may have degraded to fresh-instance semantics
    // even when the caller supplied a clock.
    is_fresh_instance |= since.is_fresh_instance() && !since.is_timestamp();

    Ok(QueryResult {
        is_fresh_instance,
        clock: root.clock_id().format(clock_at_start),
        files: std::mem::take(&mut ctx.results),
        deduped_file_names: if query.dedup_results {
            Some(std::mem::take(&mut ctx.dedup))
        } else {
            None
        },
        state_trans_count: root.state_trans_count(),
        saved_state_info: None,
        warning: root.warning(),
        debug: None,
    })
}
