use crate::{errors::QueryParseError, name::path_cat};

/// A node in the compiled multi-glob tree.
///
/// Globs are split on `/` and share structure for common prefixes, so
/// `["some/deep/foo.h", "some/deep/bar.h"]` walks `some/deep` once at
/// execution time. `**` patterns are segregated because they force a full
/// subtree walk.
#[derive(Debug, Default)]
pub struct GlobTree {
    pub pattern: String,
    /// Child rules, excluding any `**` rules.
    pub children: Vec<GlobTree>,
    /// The `**` rules that exist under this node.
    pub doublestar_children: Vec<GlobTree>,
    /// If true, this node can match files (it ended a pattern).
    pub is_leaf: bool,
    /// If false, the component can be matched by plain string comparison.
    pub had_specials: bool,
    pub is_doublestar: bool,
}

impl GlobTree {
    fn node(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            ..Self::default()
        }
    }

    pub fn root() -> Self {
        Self::node("")
    }

    /// Compiles one glob pattern into the tree, one node per `/`-separated
    /// component.
    pub fn add_glob(&mut self, glob: &str) -> Result<(), QueryParseError> {
        if glob.starts_with('/') {
            return Err(QueryParseError::new(format!(
                "glob `{glob}` is an absolute path.  All globs must be relative paths!"
            )));
        }

        let mut parent = self;
        let mut rest = glob;
        while !rest.is_empty() {
            let (sep, had_specials) = find_sep_and_specials(rest);
            let mut end = sep.unwrap_or(rest.len());
            let mut is_doublestar = false;

            // A doublestar component takes the remainder of the pattern:
            // the subtree walk has to try the whole match at every node.
            if had_specials && rest.len() >= 2 && rest.starts_with("**") {
                end = rest.len();
                is_doublestar = true;
            }
            let component = &rest[..end];

            let container = if is_doublestar {
                &mut parent.doublestar_children
            } else {
                &mut parent.children
            };
            let position = container.iter().position(|kid| kid.pattern == component);
            let index = match position {
                Some(index) => index,
                None => {
                    let mut node = GlobTree::node(component);
                    node.had_specials = had_specials;
                    node.is_doublestar = is_doublestar;
                    container.push(node);
                    container.len() - 1
                }
            };

            let node = &mut container[index];
            if end >= rest.len() || sep.is_none() || is_doublestar {
                // No separator in the remainder: this component matches
                // files.
                node.is_leaf = true;
                break;
            }
            rest = &rest[end + 1..];
            parent = node;
        }
        Ok(())
    }

    /// Reverses the parse, producing the list of glob strings this tree
    /// represents.
    pub fn unparse(&self) -> Vec<String> {
        let mut result = Vec::new();
        self.unparse_into(&mut result, "");
        result
    }

    fn unparse_into(&self, globs: &mut Vec<String>, relative: &str) {
        if self.is_leaf || (self.children.is_empty() && self.doublestar_children.is_empty()) {
            globs.push(path_cat(relative, &self.pattern));
        }
        let prefix = path_cat(relative, &self.pattern);
        for child in self.children.iter().chain(&self.doublestar_children) {
            child.unparse_into(globs, &prefix);
        }
    }
}

/// Scans for the next `/`, noting whether any wildmatch special characters
/// occur before it.
fn find_sep_and_specials(pattern: &str) -> (Option<usize>, bool) {
    let mut had_specials = false;
    for (i, b) in pattern.bytes().enumerate() {
        match b {
            b'*' | b'?' | b'[' | b'\\' => had_specials = true,
            b'/' => return (Some(i), had_specials),
            _ => {}
        }
    }
    (None, had_specials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefixes_collapse() {
        let mut tree = GlobTree::root();
        tree.add_glob("some/deep/foo.h").unwrap();
        tree.add_glob("some/deep/bar.h").unwrap();

        assert_eq!(tree.children.len(), 1);
        let some = &tree.children[0];
        assert_eq!(some.pattern, "some");
        assert!(!some.had_specials);
        let deep = &some.children[0];
        assert_eq!(deep.children.len(), 2);
        assert!(deep.children.iter().all(|kid| kid.is_leaf));
    }

    #[test]
    fn doublestar_takes_the_remainder() {
        let mut tree = GlobTree::root();
        tree.add_glob("foo/**/*.h").unwrap();

        let foo = &tree.children[0];
        assert!(foo.children.is_empty());
        assert_eq!(foo.doublestar_children.len(), 1);
        let doublestar = &foo.doublestar_children[0];
        assert_eq!(doublestar.pattern, "**/*.h");
        assert!(doublestar.is_doublestar);
        assert!(doublestar.is_leaf);
    }

    #[test]
    fn absolute_globs_are_rejected() {
        let mut tree = GlobTree::root();
        assert!(tree.add_glob("/abs/path").is_err());
    }

    #[test]
    fn unparse_round_trips() {
        let mut tree = GlobTree::root();
        tree.add_glob("a/b/*.c").unwrap();
        tree.add_glob("a/d.txt").unwrap();
        tree.add_glob("**/*.rs").unwrap();

        let mut globs = tree.unparse();
        globs.sort();
        assert_eq!(globs, vec!["**/*.rs", "a/b/*.c", "a/d.txt"]);
    }

    #[test]
    fn intermediate_component_is_not_leaf() {
        let mut tree = GlobTree::root();
        tree.add_glob("dir/file").unwrap();
        tree.add_glob("dir").unwrap();
        let dir = &tree.children[0];
        // "dir" was later added as a pattern of its own, so the node is both
        // an interior node and a leaf.
        assert!(dir.is_leaf);
        assert_eq!(dir.children.len(), 1);
    }
}
