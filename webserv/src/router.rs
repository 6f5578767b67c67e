// src/router.rs
//! Segment trie mapping request paths to the longest matching location.
//!
//! `/cgi-bin` matches `/cgi-bin` and `/cgi-bin/run.py`, never `/cgi-binary`.

#[derive(Debug, Clone, Default)]
pub struct RouteNode {
    pub segment: String,
    pub location: Option<usize>,
    pub children: Vec<RouteNode>,
}

impl RouteNode {
    pub fn new(segment: &str) -> Self {
        Self {
            segment: segment.to_string(),
            location: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocationRouter {
    root: RouteNode,
}

impl LocationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prefix` for `location`. Returns false if the prefix is
    /// already taken.
    pub fn add(&mut self, prefix: &str, location: usize) -> bool {
        let mut current = &mut self.root;

        for segment in prefix.split('/').filter(|s| !s.is_empty()) {
            let idx = match current.children.iter().position(|c| c.segment == segment) {
                Some(idx) => idx,
                None => {
                    current.children.push(RouteNode::new(segment));
                    current.children.len() - 1
                }
            };
            current = &mut current.children[idx];
        }

        if current.location.is_some() {
            return false;
        }
        current.location = Some(location);
        true
    }

    /// Deepest registered prefix along `path`.
    pub fn match_location(&self, path: &str) -> Option<usize> {
        let mut current = &self.root;
        let mut best = current.location;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match current.children.iter().find(|c| c.segment == segment) {
                Some(child) => {
                    current = child;
                    if child.location.is_some() {
                        best = child.location;
                    }
                }
                None => break,
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_longest_prefix() {
        let mut router = LocationRouter::new();
        assert!(router.add("/", 0));
        assert!(router.add("/cgi-bin", 1));
        assert!(router.add("/cgi-bin/admin/", 2));

        assert_eq!(router.match_location("/"), Some(0));
        assert_eq!(router.match_location("/index.html"), Some(0));
        assert_eq!(router.match_location("/cgi-bin"), Some(1));
        assert_eq!(router.match_location("/cgi-bin/run.py"), Some(1));
        assert_eq!(router.match_location("/cgi-bin/admin/x"), Some(2));
        assert_eq!(router.match_location("/cgi-binary"), Some(0));
    }

    #[test]
    fn test_router_duplicates_and_no_root() {
        let mut router = LocationRouter::new();
        assert!(router.add("/static", 0));
        assert!(!router.add("/static/", 1));
        assert_eq!(router.match_location("/other"), None);
    }
}
