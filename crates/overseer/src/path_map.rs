use std::collections::BTreeMap;

/// Helpers for using a `BTreeMap<String, V>` of `/`-separated paths as an
/// ordered path map with efficient child-range operations.
///
/// Children of `path` occupy the contiguous key range `[path + "/", path +
/// "0")` because `'0'` is the code point immediately after `'/'`.
pub trait OrderedPathMapExt<V> {
    /// Removes `path` and every path below it, returning them in key order.
    fn extract_path_with_children(&mut self, path: &str) -> Vec<(String, V)>;

    /// Collects references to the children of `path`, excluding `path`
    /// itself.
    fn path_children(&self, path: &str) -> Vec<(&String, &V)>;
}

fn child_bounds(path: &str) -> (String, String) {
    let mut low = String::with_capacity(path.len() + 1);
    low.push_str(path);
    low.push('/');
    let mut high = String::with_capacity(path.len() + 1);
    high.push_str(path);
    high.push('0');
    (low, high)
}

impl<V> OrderedPathMapExt<V> for BTreeMap<String, V> {
    fn extract_path_with_children(&mut self, path: &str) -> Vec<(String, V)> {
        let mut extracted = Vec::new();
        if let Some(value) = self.remove(path) {
            extracted.push((path.to_owned(), value));
        }
        let (low, high) = child_bounds(path);
        let keys: Vec<String> = self.range(low..high).map(|(k, _)| k.clone()).collect();
        for key in keys {
            let value = self.remove(&key).unwrap();
            extracted.push((key, value));
        }
        extracted
    }

    fn path_children(&self, path: &str) -> Vec<(&String, &V)> {
        let (low, high) = child_bounds(path);
        self.range(low..high).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_path_with_children() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1);
        map.insert("a/b".to_string(), 2);
        map.insert("a/b/c".to_string(), 3);
        map.insert("a/b/d".to_string(), 4);
        map.insert("a/b/d/e".to_string(), 5);
        map.insert("a/c".to_string(), 6);
        map.insert("a.b".to_string(), 7);
        map.insert("x/y/z".to_string(), 8);

        let extracted = map.extract_path_with_children("a/b");
        assert_eq!(
            extracted,
            vec![
                ("a/b".to_string(), 2),
                ("a/b/c".to_string(), 3),
                ("a/b/d".to_string(), 4),
                ("a/b/d/e".to_string(), 5),
            ]
        );

        // Lexically-close-but-unrelated keys survive.
        assert_eq!(map.len(), 4);
        assert!(map.contains_key("a.b"));
        assert!(map.contains_key("a/c"));
    }

    #[test]
    fn path_children_excludes_self() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1);
        map.insert("a/b".to_string(), 2);
        map.insert("a/c".to_string(), 3);
        map.insert("ab".to_string(), 4);

        let children: Vec<_> = map
            .path_children("a")
            .into_iter()
            .map(|(k, _)| k.clone())
            .collect();
        assert_eq!(children, vec!["a/b".to_string(), "a/c".to_string()]);
    }
}
