use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// One operator wildcard, stored in canonical form: the bare host suffix
/// (`example.com` for `*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    pub suffix: String,
    /// Which source API produced it.
    pub source: String,
    /// Free-form program label supplied by the source.
    pub program: String,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Index into the owning trie's pattern arena.
    terminal: Option<usize>,
}

/// Reverse-label suffix trie: TLD at the root, one node per DNS label.
/// A terminal node matches strict sub-domains of its suffix only — the
/// apex itself is never a match.
#[derive(Debug, Default)]
pub struct WildcardTrie {
    root: TrieNode,
    patterns: Vec<WildcardPattern>,
}

impl WildcardTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a canonical pattern. First insert of a suffix wins;
    /// later duplicates are ignored.
    pub fn insert(&mut self, pattern: WildcardPattern) {
        if pattern.suffix.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for label in pattern.suffix.split('.').rev() {
            if label.is_empty() {
                return;
            }
            node = node.children.entry(label.to_string()).or_default();
        }
        if node.terminal.is_none() {
            self.patterns.push(pattern);
            node.terminal = Some(self.patterns.len() - 1);
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[WildcardPattern] {
        &self.patterns
    }

    /// Walk the host's labels in reverse and return the most specific
    /// terminal passed, provided at least one input label remains beyond
    /// it. Expects a normalized host: lowercase, no trailing dot, no
    /// leading `*.`. O(labels), allocation-free.
    pub fn matches(&self, host: &str) -> Option<&WildcardPattern> {
        if host.is_empty() {
            return None;
        }
        let mut remaining = host.split('.').count();
        let mut node = &self.root;
        let mut best: Option<usize> = None;
        for label in host.split('.').rev() {
            if label.is_empty() {
                return None;
            }
            match node.children.get(label) {
                Some(next) => {
                    node = next;
                    remaining -= 1;
                    if remaining >= 1 {
                        if let Some(idx) = next.terminal {
                            best = Some(idx);
                        }
                    }
                }
                None => break,
            }
        }
        best.map(|idx| &self.patterns[idx])
    }
}

/// Shared handle over the current trie. The refresher swaps in a freshly
/// built trie; readers load a snapshot and keep using it even across a
/// concurrent swap.
pub struct WildcardIndex {
    current: ArcSwap<WildcardTrie>,
}

impl WildcardIndex {
    pub fn new() -> Self {
        Self { current: ArcSwap::from_pointee(WildcardTrie::new()) }
    }

    pub fn snapshot(&self) -> Arc<WildcardTrie> {
        self.current.load_full()
    }

    pub fn swap(&self, trie: WildcardTrie) {
        self.current.store(Arc::new(trie));
    }

    /// Number of patterns in the current trie.
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl Default for WildcardIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(suffix: &str) -> WildcardPattern {
        WildcardPattern { suffix: suffix.into(), source: "test".into(), program: "prog".into() }
    }

    fn trie(suffixes: &[&str]) -> WildcardTrie {
        let mut t = WildcardTrie::new();
        for s in suffixes {
            t.insert(pat(s));
        }
        t
    }

    #[test]
    fn subdomain_matches() {
        let t = trie(&["example.com"]);
        assert_eq!(t.matches("api.example.com").unwrap().suffix, "example.com");
        assert_eq!(t.matches("foo.bar.example.com").unwrap().suffix, "example.com");
    }

    #[test]
    fn apex_is_not_a_match() {
        let t = trie(&["example.com"]);
        assert!(t.matches("example.com").is_none());
    }

    #[test]
    fn unrelated_hosts_miss() {
        let t = trie(&["example.com"]);
        assert!(t.matches("example.org").is_none());
        assert!(t.matches("notexample.com").is_none());
        assert!(t.matches("com").is_none());
    }

    #[test]
    fn empty_and_malformed_inputs() {
        let t = trie(&["example.com"]);
        assert!(t.matches("").is_none());
        assert!(t.matches("api..example.com").is_none());
    }

    #[test]
    fn most_specific_terminal_wins() {
        let t = trie(&["example.com", "dev.example.com"]);
        assert_eq!(t.matches("x.dev.example.com").unwrap().suffix, "dev.example.com");
        // dev.example.com itself is the apex of the deeper pattern but a
        // strict sub-domain of the shallower one.
        assert_eq!(t.matches("dev.example.com").unwrap().suffix, "example.com");
        assert_eq!(t.matches("api.example.com").unwrap().suffix, "example.com");
    }

    #[test]
    fn duplicate_suffix_first_wins() {
        let mut t = WildcardTrie::new();
        t.insert(WildcardPattern { suffix: "example.com".into(), source: "a".into(), program: "p1".into() });
        t.insert(WildcardPattern { suffix: "example.com".into(), source: "b".into(), program: "p2".into() });
        assert_eq!(t.len(), 1);
        assert_eq!(t.matches("x.example.com").unwrap().program, "p1");
    }

    #[test]
    fn swap_leaves_existing_snapshots_intact() {
        let index = WildcardIndex::new();
        index.swap(trie(&["example.com"]));
        let snap = index.snapshot();
        index.swap(trie(&["example.org"]));
        // Old snapshot still answers for the old set.
        assert!(snap.matches("api.example.com").is_some());
        assert!(snap.matches("api.example.org").is_none());
        // New readers see the new set.
        let fresh = index.snapshot();
        assert!(fresh.matches("api.example.org").is_some());
        assert!(fresh.matches("api.example.com").is_none());
    }

    #[test]
    fn label_arithmetic_for_deep_suffixes() {
        let t = trie(&["a.b.example.com"]);
        assert!(t.matches("a.b.example.com").is_none());
        assert!(t.matches("b.example.com").is_none());
        assert_eq!(t.matches("x.a.b.example.com").unwrap().suffix, "a.b.example.com");
    }
}
