use std::{
    borrow::Borrow,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::Arc,
};

use rustc_hash::FxHasher;

/// An immutable, cheaply cloneable string used for node names and map keys.
///
/// The content hash is computed once at construction and used as a fast path
/// for equality; the `Hash` impl delegates to `str` so maps can be probed
/// with a borrowed `&str`.
#[derive(Clone)]
pub struct Name {
    text: Arc<str>,
    hash: u64,
}

impl Name {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text = text.into();
        let mut hasher = FxHasher::default();
        hasher.write(text.as_bytes());
        let hash = hasher.finish();
        Self { text, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn precomputed_hash(&self) -> u64 {
        self.hash
    }
}

impl From<&str> for Name {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Name {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.text == other.text
    }
}

impl Eq for Name {}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.as_bytes().cmp(other.text.as_bytes())
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Delegate to str so that Borrow<str> lookups hash identically.
        self.text.hash(state);
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.text
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.text, f)
    }
}

/// Returns the final path component, or the whole string when there is no
/// separator.
pub fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, base)| base)
}

/// Returns everything before the final separator, or `""` when there is
/// none.
pub fn dir_name(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Joins `dir` and `name` around a unix separator. `dir` may be empty.
pub fn path_cat(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        let mut out = String::with_capacity(dir.len() + name.len() + 1);
        out.push_str(dir);
        out.push('/');
        out.push_str(name);
        out
    }
}

/// True when `prefix` names `key` itself or an ancestor directory of it.
///
/// A plain `starts_with` is not enough: "foo/bar" is a prefix of "foo/bard"
/// as a string, but not as a path.
pub fn is_path_prefix(key: &str, prefix: &str) -> bool {
    key.len() >= prefix.len()
        && key.as_bytes()[..prefix.len()] == *prefix.as_bytes()
        && (key.len() == prefix.len() || key.as_bytes()[prefix.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;

    #[test]
    fn name_equality_and_lookup() {
        let a = Name::new("foo.txt");
        let b = Name::new("foo.txt");
        assert_eq!(a, b);
        assert_eq!(a.precomputed_hash(), b.precomputed_hash());

        let mut map: FxHashMap<Name, u32> = FxHashMap::default();
        map.insert(a, 1);
        assert_eq!(map.get("foo.txt"), Some(&1));
        assert_eq!(map.get("bar.txt"), None);
    }

    #[test]
    fn path_pieces() {
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
        assert_eq!(base_name("c.txt"), "c.txt");
        assert_eq!(dir_name("a/b/c.txt"), "a/b");
        assert_eq!(dir_name("c.txt"), "");
        assert_eq!(path_cat("a/b", "c"), "a/b/c");
        assert_eq!(path_cat("", "c"), "c");
    }

    #[test]
    fn path_prefix_respects_component_boundaries() {
        assert!(is_path_prefix("foo/bar", "foo"));
        assert!(is_path_prefix("foo", "foo"));
        assert!(!is_path_prefix("foo/bar", "foo/bard"));
        assert!(!is_path_prefix("foobar", "foo"));
        assert!(is_path_prefix("foo/bar/baz", "foo/bar"));
    }
}
