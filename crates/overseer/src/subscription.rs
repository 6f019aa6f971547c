use std::{collections::VecDeque, sync::Arc, time::Duration};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    clock::SinceSpec,
    errors::QueryExecError,
    publisher::SubscriberQueue,
    query::{self, Query},
    root::Root,
};

/// Insertion-ordered so that settle updates dispatch in the order the
/// subscriptions were established.
type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

struct SubscriptionState {
    query: Query,
    /// The clock we last returned to the client; the next update is
    /// incremental from here.
    last_clock: String,
}

/// One client's subscriptions against a root: accumulated query updates
/// plus the root's settle/state broadcasts, drained by the client writer.
pub struct ClientSubscriptions {
    root: Arc<Root>,
    subscriptions: Mutex<FxIndexMap<String, SubscriptionState>>,
    updates: Mutex<VecDeque<Value>>,
    broadcasts: Arc<SubscriberQueue>,
}

impl ClientSubscriptions {
    pub fn new(root: &Arc<Root>) -> Self {
        Self {
            root: Arc::clone(root),
            subscriptions: Mutex::new(FxIndexMap::default()),
            updates: Mutex::new(VecDeque::new()),
            broadcasts: root.unilateral.subscribe(),
        }
    }

    /// Establishes a subscription. The initial result set is queued as the
    /// first update and the returned acknowledgement carries the clock the
    /// subscription starts from.
    pub fn subscribe(&self, name: &str, query: Query) -> Result<Value, QueryExecError> {
        let result = query::execute(&self.root, &query)?;
        let ack = json!({
            "subscribe": name,
            "clock": result.clock,
        });
        self.push_update(name, None, &result);
        self.subscriptions.lock().insert(
            name.to_owned(),
            SubscriptionState {
                query,
                last_clock: result.clock,
            },
        );
        Ok(ack)
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        self.subscriptions.lock().shift_remove(name).is_some()
    }

    /// Processes the root's broadcast stream: settle events re-run the
    /// subscription queries; state and cancel events pass through to the
    /// client.
    pub fn process_broadcasts(&self) -> Result<(), QueryExecError> {
        for item in self.broadcasts.drain() {
            let is_settle = item.get("settled").is_some();
            if is_settle {
                self.run_subscription_queries()?;
            } else {
                self.updates.lock().push_back((*item).clone());
            }
        }
        Ok(())
    }

    /// Synchronously flushes: cookie-sync the root, then deliver whatever
    /// the subscriptions now see.
    pub fn flush(&self, timeout: Duration) -> Result<(), QueryExecError> {
        self.root
            .sync_to_now(timeout)
            .map_err(QueryExecError::Sync)?;
        self.run_subscription_queries()
    }

    /// Accumulated updates, in arrival order.
    pub fn drain_updates(&self) -> Vec<Value> {
        self.updates.lock().drain(..).collect()
    }

    fn run_subscription_queries(&self) -> Result<(), QueryExecError> {
        let mut subscriptions = self.subscriptions.lock();
        for (name, state) in subscriptions.iter_mut() {
            let since = SinceSpec::parse_str(&state.last_clock)
                .map_err(QueryExecError::Parse)?;
            state.query.since_spec = Some(since);
            let result = query::execute(&self.root, &state.query)?;

            if result.files.is_empty() && !result.is_fresh_instance {
                // Nothing to tell this client; keep the cursor where the
                // query left it so the next settle diff stays incremental.
                state.last_clock = result.clock;
                continue;
            }
            debug!(
                subscription = name.as_str(),
                files = result.files.len(),
                "dispatching subscription update"
            );
            self.push_update(name, Some(&state.last_clock), &result);
            state.last_clock = result.clock.clone();
        }
        Ok(())
    }

    fn push_update(&self, name: &str, since: Option<&str>, result: &query::QueryResult) {
        let mut update = serde_json::Map::new();
        update.insert("subscription".into(), Value::String(name.to_owned()));
        update.insert("root".into(), Value::String(self.root.root_path().into()));
        update.insert("clock".into(), Value::String(result.clock.clone()));
        if let Some(since) = since {
            update.insert("since".into(), Value::String(since.to_owned()));
        }
        update.insert(
            "is_fresh_instance".into(),
            Value::Bool(result.is_fresh_instance),
        );
        update.insert("files".into(), Value::Array(result.files.clone()));
        self.updates.lock().push_back(Value::Object(update));
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::SystemTime};

    use serde_json::json;

    use super::*;
    use crate::{
        clock::ClockId,
        config::Config,
        pending::PendingFlags,
        root::Root,
        watcher::fake::FakeWatcher,
    };

    fn fixture() -> (tempfile::TempDir, Arc<Root>) {
        let dir = tempfile::tempdir().unwrap();
        let watcher = Arc::new(FakeWatcher::per_file());
        let root = Root::open(
            dir.path(),
            Arc::new(Config::default()),
            watcher,
            1,
            Arc::new(ClockId::new()),
        )
        .unwrap();
        root.engine().client_mode_crawl(&root);
        (dir, root)
    }

    fn parse_query(root: &Root, spec: serde_json::Value) -> Query {
        Query::parse(root, &spec, None).unwrap()
    }

    #[test]
    fn settle_dispatches_incremental_updates() {
        let (dir, root) = fixture();
        let subscriptions = ClientSubscriptions::new(&root);

        let query = parse_query(
            &root,
            json!({"expression": ["exists"], "fields": ["name"], "sync_timeout": 0}),
        );
        let ack = subscriptions.subscribe("mysub", query).unwrap();
        assert_eq!(ack["subscribe"], "mysub");

        // The initial (fresh instance) result is queued immediately.
        let initial = subscriptions.drain_updates();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0]["is_fresh_instance"], true);

        // A change followed by a settle produces one incremental update.
        fs::write(dir.path().join("fresh.txt"), b"x").unwrap();
        root.engine().pending().lock().add(
            &crate::name::path_cat(root.root_path(), "fresh.txt"),
            SystemTime::now(),
            PendingFlags::VIA_NOTIFY,
        );
        root.engine().process_pending_now(&root);
        root.unilateral.enqueue(json!({"settled": true}));
        subscriptions.process_broadcasts().unwrap();

        let updates = subscriptions.drain_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["subscription"], "mysub");
        assert_eq!(updates[0]["is_fresh_instance"], false);
        assert_eq!(updates[0]["files"], json!(["fresh.txt"]));

        // A settle with no changes stays quiet.
        root.unilateral.enqueue(json!({"settled": true}));
        subscriptions.process_broadcasts().unwrap();
        assert!(subscriptions.drain_updates().is_empty());
    }

    #[test]
    fn updates_dispatch_in_subscription_order() {
        let (dir, root) = fixture();
        let subscriptions = ClientSubscriptions::new(&root);

        // Names chosen so alphabetical or hash order would differ from
        // insertion order.
        for name in ["zeta", "alpha", "midway"] {
            let query = parse_query(&root, json!({"fields": ["name"], "sync_timeout": 0}));
            subscriptions.subscribe(name, query).unwrap();
        }
        subscriptions.drain_updates();

        fs::write(dir.path().join("shared.txt"), b"x").unwrap();
        root.engine().pending().lock().add(
            &crate::name::path_cat(root.root_path(), "shared.txt"),
            SystemTime::now(),
            PendingFlags::VIA_NOTIFY,
        );
        root.engine().process_pending_now(&root);
        root.unilateral.enqueue(json!({"settled": true}));
        subscriptions.process_broadcasts().unwrap();

        let names: Vec<String> = subscriptions
            .drain_updates()
            .iter()
            .map(|update| update["subscription"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "midway"]);
    }

    #[test]
    fn state_broadcasts_pass_through() {
        let (_dir, root) = fixture();
        let subscriptions = ClientSubscriptions::new(&root);

        root.assert_state("build", Some(json!({"id": 1})));
        root.leave_state("build", false);
        subscriptions.process_broadcasts().unwrap();

        let updates = subscriptions.drain_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0]["state-enter"], "build");
        assert_eq!(updates[0]["metadata"], json!({"id": 1}));
        assert_eq!(updates[1]["state-leave"], "build");
        assert!(root.state_trans_count() >= 2);
    }

    #[test]
    fn unsubscribe_stops_updates() {
        let (dir, root) = fixture();
        let subscriptions = ClientSubscriptions::new(&root);
        let query = parse_query(&root, json!({"fields": ["name"], "sync_timeout": 0}));
        subscriptions.subscribe("gone", query).unwrap();
        subscriptions.drain_updates();
        assert!(subscriptions.unsubscribe("gone"));
        assert!(!subscriptions.unsubscribe("gone"));

        fs::write(dir.path().join("later.txt"), b"x").unwrap();
        root.engine().pending().lock().add(
            &crate::name::path_cat(root.root_path(), "later.txt"),
            SystemTime::now(),
            PendingFlags::VIA_NOTIFY,
        );
        root.engine().process_pending_now(&root);
        root.unilateral.enqueue(json!({"settled": true}));
        subscriptions.process_broadcasts().unwrap();
        assert!(subscriptions.drain_updates().is_empty());
    }
}
