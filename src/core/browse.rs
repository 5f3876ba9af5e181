//! Class hierarchy and object name tree for browsing an archive.
//!
//! Classes hang off the parent named by their default object's archetype.
//! Objects form a tree by splitting qualified names at the last `.` or `:`;
//! prefixes that were never dumped become folder nodes without a class.

use std::collections::{BTreeMap, HashMap};
use std::iter;

use tracing::debug;

use crate::infra::utils::NameUtils;

/// One archived class as the hierarchy builder sees it.
#[derive(Debug, Clone, Copy)]
pub struct ClassLink<'a> {
    pub name: &'a str,
    pub parent: Option<&'a str>,
    pub objects: u64,
}

/// Parent/child links between archived classes, by position in the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassHierarchy {
    pub parent: Vec<Option<usize>>,
    pub children: Vec<Vec<usize>>,
    /// Objects of the class or any subclass
    pub total_objects: Vec<u64>,
}

impl ClassHierarchy {
    /// Parents that are not archived, or that would close a loop, are left
    /// unlinked.
    pub fn build(links: &[ClassLink<'_>]) -> Self {
        let by_key: HashMap<String, usize> = links
            .iter()
            .enumerate()
            .map(|(i, c)| (NameUtils::key(c.name), i))
            .collect();

        let mut parent: Vec<Option<usize>> = vec![None; links.len()];
        for (i, link) in links.iter().enumerate() {
            let Some(p) = link.parent.and_then(|p| by_key.get(&NameUtils::key(p)).copied()) else {
                continue;
            };
            let loops = iter::successors(Some(p), |&c| parent[c]).any(|a| a == i);
            if loops {
                debug!(class = link.name, parent = links[p].name, "class parent would form a cycle");
                continue;
            }
            parent[i] = Some(p);
        }

        let mut children = vec![Vec::new(); links.len()];
        let mut total_objects = vec![0; links.len()];
        for (i, link) in links.iter().enumerate() {
            if let Some(p) = parent[i] {
                children[p].push(i);
            }
            for a in iter::successors(Some(i), |&c| parent[c]) {
                total_objects[a] += link.objects;
            }
        }

        Self {
            parent,
            children,
            total_objects,
        }
    }

    /// The class and all its ancestors, ascending.
    pub fn aggregate(&self, class: usize) -> Vec<usize> {
        let mut ids: Vec<usize> = iter::successors(Some(class), |&c| self.parent[c]).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub short_name: String,
    pub separator: Option<char>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// `(class, object)` position of the dump this node stands for
    pub object: Option<(usize, usize)>,
    /// All nodes below this one, folders included
    pub total_children: u64,
    /// Class position -> whether a descendant of that class exists
    pub show_classes: BTreeMap<usize, bool>,
}

/// Object names arranged by their qualified-name prefixes.
#[derive(Debug, Clone, Default)]
pub struct ObjectTree {
    pub nodes: Vec<TreeNode>,
    pub roots: Vec<usize>,
    by_key: HashMap<String, usize>,
}

/// `GD_Foo.Bar:Baz` → `("GD_Foo.Bar", ':', "Baz")`.
fn split_name(name: &str) -> Option<(&str, char, &str)> {
    let idx = name.rfind(|c| c == '.' || c == ':')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    let separator = name[idx..].chars().next()?;
    Some((&name[..idx], separator, &name[idx + 1..]))
}

impl ObjectTree {
    /// Attach a dumped object. Returns false when a dump already holds that
    /// name (case-insensitively); the first one keeps the node.
    pub fn insert(&mut self, name: &str, object: (usize, usize)) -> bool {
        let idx = self.get_or_add(name);
        let node = &mut self.nodes[idx];
        if node.object.is_some() {
            return false;
        }
        node.object = Some(object);
        true
    }

    pub fn get(&self, name: &str) -> Option<&TreeNode> {
        self.by_key.get(&NameUtils::key(name)).map(|&i| &self.nodes[i])
    }

    fn get_or_add(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.by_key.get(&NameUtils::key(name)) {
            return idx;
        }
        let (parent, separator, short_name) = match split_name(name) {
            Some((prefix, sep, short)) => (Some(self.get_or_add(prefix)), Some(sep), short),
            None => (None, None, name),
        };

        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            name: name.to_string(),
            short_name: short_name.to_string(),
            separator,
            parent,
            children: Vec::new(),
            object: None,
            total_children: 0,
            show_classes: BTreeMap::new(),
        });
        self.by_key.insert(NameUtils::key(name), idx);

        match parent {
            Some(p) => {
                self.nodes[p].children.push(idx);
                let mut up = Some(p);
                while let Some(a) = up {
                    self.nodes[a].total_children += 1;
                    up = self.nodes[a].parent;
                }
            }
            None => self.roots.push(idx),
        }
        idx
    }

    /// Sort siblings by key and record, for every node, which classes have
    /// an object at or below it.
    pub fn finish(&mut self, classes: &ClassHierarchy) {
        let keys: Vec<String> = self.nodes.iter().map(|n| NameUtils::key(&n.name)).collect();
        for node in &mut self.nodes {
            node.children.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
        }
        self.roots.sort_by(|a, b| keys[*a].cmp(&keys[*b]));

        for idx in 0..self.nodes.len() {
            let Some((class, _)) = self.nodes[idx].object else {
                continue;
            };
            let aggregate = classes.aggregate(class);
            for &c in &aggregate {
                self.nodes[idx].show_classes.entry(c).or_insert(false);
            }
            let mut up = self.nodes[idx].parent;
            while let Some(p) = up {
                for &c in &aggregate {
                    self.nodes[p].show_classes.insert(c, true);
                }
                up = self.nodes[p].parent;
            }
        }
    }

    /// Depth-first order, siblings by key. Index storage follows it.
    pub fn preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            out.push(idx);
            stack.extend(self.nodes[idx].children.iter().rev());
        }
        out
    }
}
