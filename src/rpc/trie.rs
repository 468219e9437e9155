//! A byte-wise trie mapping function names to values, so that finding a name costs one step per
//! byte regardless of how many names are registered.

struct Node<T> {
    /// Sorted by byte, so children can be binary searched.
    children: Vec<(u8, usize)>,
    value: Option<T>,
}

impl<T> Node<T> {
    const fn new() -> Self {
        Self {
            children: Vec::new(),
            value: None,
        }
    }

    fn child(&self, byte: u8) -> Option<usize> {
        self.children
            .binary_search_by_key(&byte, |(b, _)| *b)
            .ok()
            .map(|i| self.children[i].1)
    }
}

pub struct Trie<T> {
    nodes: Vec<Node<T>>,
    len: usize,
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new()],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Associates `value` with `key`, returning the value previously stored under it.
    pub fn insert(&mut self, key: &str, value: T) -> Option<T> {
        let mut current = 0;

        for &byte in key.as_bytes() {
            current = match self.nodes[current].children.binary_search_by_key(&byte, |(b, _)| *b) {
                Ok(i) => self.nodes[current].children[i].1,
                Err(i) => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::new());
                    self.nodes[current].children.insert(i, (byte, next));
                    next
                }
            };
        }

        let previous = self.nodes[current].value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }

        previous
    }

    /// Finds the value stored under exactly `key`. Prefixes of stored keys don't match.
    pub fn get(&self, key: &str) -> Option<&T> {
        let mut current = 0;
        for &byte in key.as_bytes() {
            current = self.nodes[current].child(byte)?;
        }

        self.nodes[current].value.as_ref()
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}
