use std::fmt;

/// An ordered sequence of `(name, value)` pairs representing one wire message.
///
/// Insertion order is preserved and names may repeat, the dictionary does not enforce key
/// uniqueness. Lookups by name return the first matching pair. Pairs with an empty name are
/// positional arguments, see [`MessageDict::add_arg`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MessageDict {
    pairs: Vec<(String, Vec<u8>)>,
}

impl MessageDict {
    pub const fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// The amount of pairs, arguments included.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Appends a pair, even if a pair with the same name already exists.
    pub fn set_var<N: Into<String>, V: AsRef<[u8]>>(&mut self, name: N, value: V) {
        self.pairs.push((name.into(), value.as_ref().to_vec()));
    }

    /// Appends an indexed variable, named `name` followed by the decimal `index` (e.g. `file0`).
    pub fn set_var_indexed<V: AsRef<[u8]>>(&mut self, name: &str, index: usize, value: V) {
        self.set_var(format!("{name}{index}"), value);
    }

    /// Replaces the value of the first pair named `name`, or appends it if there's none.
    pub fn replace_var<V: AsRef<[u8]>>(&mut self, name: &str, value: V) {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => {
                v.clear();
                v.extend_from_slice(value.as_ref());
            }
            None => self.set_var(name, value),
        }
    }

    /// Removes the first pair named `name`. Returns whether one was found.
    pub fn remove_var(&mut self, name: &str) -> bool {
        match self.pairs.iter().position(|(n, _)| n == name) {
            Some(index) => {
                self.pairs.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn get_var(&self, name: &str) -> Option<&[u8]> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    /// Gets the value of a variable as a string, or `None` if it's missing or not valid UTF-8.
    pub fn get_var_str(&self, name: &str) -> Option<&str> {
        self.get_var(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Gets the value of a variable parsed as a decimal integer.
    pub fn get_var_int(&self, name: &str) -> Option<i64> {
        self.get_var_str(name).and_then(|s| s.trim().parse().ok())
    }

    pub fn get_var_indexed(&self, name: &str, index: usize) -> Option<&[u8]> {
        self.get_var(&format!("{name}{index}"))
    }

    /// Gets the pair at position `index`, in insertion order.
    pub fn get_var_at(&self, index: usize) -> Option<(&str, &[u8])> {
        self.pairs.get(index).map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Appends a positional argument.
    pub fn add_arg<V: AsRef<[u8]>>(&mut self, value: V) {
        self.set_var(String::new(), value);
    }

    pub fn arg_count(&self) -> usize {
        self.pairs.iter().filter(|(n, _)| n.is_empty()).count()
    }

    pub fn get_arg(&self, index: usize) -> Option<&[u8]> {
        self.pairs.iter().filter(|(n, _)| n.is_empty()).nth(index).map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Appends copies of all of `other`'s pairs, preserving their order.
    pub fn extend_from(&mut self, other: &MessageDict) {
        self.pairs.extend(other.pairs.iter().cloned());
    }
}

impl<N: Into<String>, V: AsRef<[u8]>> FromIterator<(N, V)> for MessageDict {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut dict = MessageDict::new();
        for (name, value) in iter {
            dict.set_var(name, value);
        }

        dict
    }
}

impl fmt::Debug for MessageDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.pairs.iter().map(|(n, v)| (n, String::from_utf8_lossy(v))))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MessageDict;

    #[test]
    fn test_duplicate_names_keep_order() {
        let mut dict = MessageDict::new();
        dict.set_var("user", "alice");
        dict.set_var("user", "bob");

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get_var("user"), Some(&b"alice"[..]));
        assert_eq!(dict.get_var_at(1), Some(("user", &b"bob"[..])));
    }

    #[test]
    fn test_indexed_vars() {
        let mut dict = MessageDict::new();
        for (i, file) in ["a.c", "b.c", "c.c"].iter().enumerate() {
            dict.set_var_indexed("depotFile", i, file);
        }

        assert_eq!(dict.get_var_indexed("depotFile", 1), Some(&b"b.c"[..]));
        assert_eq!(dict.get_var("depotFile2"), Some(&b"c.c"[..]));
        assert_eq!(dict.get_var_indexed("depotFile", 3), None);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut dict: MessageDict = [("a", "1"), ("b", "2"), ("a", "3")].into_iter().collect();

        dict.replace_var("a", "x");
        assert_eq!(dict.get_var_str("a"), Some("x"));
        assert_eq!(dict.get_var_at(2), Some(("a", &b"3"[..])));

        dict.replace_var("c", "4");
        assert_eq!(dict.get_var_at(3), Some(("c", &b"4"[..])));

        assert!(dict.remove_var("a"));
        assert_eq!(dict.get_var_str("a"), Some("3"));
        assert!(!dict.remove_var("zzz"));
    }

    #[test]
    fn test_args_are_unnamed_pairs() {
        let mut dict = MessageDict::new();
        dict.add_arg("-f");
        dict.set_var("func", "user-sync");
        dict.add_arg("//depot/...");

        assert_eq!(dict.arg_count(), 2);
        assert_eq!(dict.get_arg(0), Some(&b"-f"[..]));
        assert_eq!(dict.get_arg(1), Some(&b"//depot/..."[..]));
        assert_eq!(dict.get_arg(2), None);
    }

    #[test]
    fn test_get_var_int() {
        let dict: MessageDict = [("sndbuf", "65536"), ("bad", "12x")].into_iter().collect();
        assert_eq!(dict.get_var_int("sndbuf"), Some(65536));
        assert_eq!(dict.get_var_int("bad"), None);
        assert_eq!(dict.get_var_int("missing"), None);
    }
}
