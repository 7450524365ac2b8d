//! Variable trees passed to wrapper startup scripts.
//!
//! A task's environment is a tree of strings, insertion-ordered maps and
//! sequences. Startup-script generation walks the tree once per target
//! language; an emitter decides per container node whether the walk descends
//! or the emitter captures the subtree itself.

use std::fmt;

/// One value in a task's variable tree.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Str(String),
    Seq(Vec<VarValue>),
    Map(VarMap),
}

impl VarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VarValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Build a sequence of plain strings.
    pub fn seq_of<I>(items: I) -> VarValue
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        VarValue::Seq(items.into_iter().map(|s| VarValue::Str(s.into())).collect())
    }
}

impl From<String> for VarValue {
    fn from(s: String) -> Self {
        VarValue::Str(s)
    }
}

impl From<&str> for VarValue {
    fn from(s: &str) -> Self {
        VarValue::Str(s.to_owned())
    }
}

impl From<VarMap> for VarValue {
    fn from(m: VarMap) -> Self {
        VarValue::Map(m)
    }
}

/// A map that keeps insertion order. Inserting an existing key replaces the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarMap {
    entries: Vec<(String, VarValue)>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<VarValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One step of the name path: a map key or a sequence index.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => write!(f, "{k}"),
            PathSeg::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Name path carried through an encoding walk.
#[derive(Debug, Default)]
pub struct EncodePath {
    segs: Vec<PathSeg>,
}

impl EncodePath {
    /// True for direct entries of the variable map.
    pub fn is_first_level(&self) -> bool {
        self.segs.len() == 1
    }

    /// True when the current node is an entry of a nested map.
    pub fn in_map(&self) -> bool {
        self.segs.len() > 1 && matches!(self.segs.last(), Some(PathSeg::Key(_)))
    }

    /// True when the current node is an element of a sequence.
    pub fn in_seq(&self) -> bool {
        self.segs.len() > 1 && matches!(self.segs.last(), Some(PathSeg::Index(_)))
    }

    /// Key of the current node, if it is a map entry (or a root variable).
    pub fn last_key(&self) -> Option<&str> {
        match self.segs.last() {
            Some(PathSeg::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// The full path joined by a separator, sequence indices included.
    pub fn joined(&self, separator: char) -> String {
        join(self.segs.iter().map(|seg| seg.to_string()), separator)
    }
}

/// Receives the nodes of a variable tree in order.
///
/// `open_map`/`open_seq` return whether the walk should descend into the
/// container; emitters that capture a subtree whole return `false`, and the
/// matching close call is then skipped.
pub trait VariableEmitter {
    fn open_map(&mut self, path: &EncodePath, map: &VarMap) -> bool;

    fn close_map(&mut self, path: &EncodePath, map: &VarMap);

    fn open_seq(&mut self, path: &EncodePath, seq: &[VarValue]) -> bool;

    fn close_seq(&mut self, path: &EncodePath, seq: &[VarValue]);

    fn emit_str(&mut self, path: &EncodePath, value: &str);
}

/// Walk a variable map in insertion order, feeding every node to `emitter`.
pub fn encode_variables(vars: &VarMap, emitter: &mut dyn VariableEmitter) {
    let mut path = EncodePath::default();
    for (name, value) in vars.iter() {
        path.segs.push(PathSeg::Key(name.to_owned()));
        encode_value(emitter, &mut path, value);
        path.segs.pop();
    }
}

fn encode_value(emitter: &mut dyn VariableEmitter, path: &mut EncodePath, value: &VarValue) {
    match value {
        VarValue::Str(s) => emitter.emit_str(path, s),
        VarValue::Seq(items) => {
            if emitter.open_seq(path, items) {
                for (index, item) in items.iter().enumerate() {
                    path.segs.push(PathSeg::Index(index));
                    encode_value(emitter, path, item);
                    path.segs.pop();
                }
                emitter.close_seq(path, items);
            }
        }
        VarValue::Map(map) => {
            if emitter.open_map(path, map) {
                for (key, item) in map.iter() {
                    path.segs.push(PathSeg::Key(key.to_owned()));
                    encode_value(emitter, path, item);
                    path.segs.pop();
                }
                emitter.close_map(path, map);
            }
        }
    }
}

/// Concatenate string representations, separated by the given character.
pub fn join<I>(items: I, separator: char) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut buffer = String::new();
    for item in items {
        if !buffer.is_empty() {
            buffer.push(separator);
        }
        buffer.push_str(item.as_ref());
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the walk as a flat trace for assertions.
    #[derive(Default)]
    struct Tracer {
        trace: Vec<String>,
        descend: bool,
    }

    impl VariableEmitter for Tracer {
        fn open_map(&mut self, path: &EncodePath, _map: &VarMap) -> bool {
            self.trace.push(format!("map({})", path.joined('.')));
            self.descend
        }

        fn close_map(&mut self, path: &EncodePath, _map: &VarMap) {
            self.trace.push(format!("/map({})", path.joined('.')));
        }

        fn open_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) -> bool {
            self.trace.push(format!("seq({})", path.joined('.')));
            self.descend
        }

        fn close_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) {
            self.trace.push(format!("/seq({})", path.joined('.')));
        }

        fn emit_str(&mut self, path: &EncodePath, value: &str) {
            self.trace.push(format!("{}={}", path.joined('.'), value));
        }
    }

    fn sample() -> VarMap {
        let mut inner = VarMap::new();
        inner.insert("TASK", "build");
        inner.insert("RESULT", "ok");
        let mut vars = VarMap::new();
        vars.insert("NAME", "value");
        vars.insert("ITEMS", VarValue::seq_of(["a", "b"]));
        vars.insert("PROD", inner);
        vars
    }

    #[test]
    fn test_walk_descends_in_order() {
        let mut tracer = Tracer {
            descend: true,
            ..Tracer::default()
        };
        encode_variables(&sample(), &mut tracer);
        assert_eq!(
            tracer.trace,
            [
                "NAME=value",
                "seq(ITEMS)",
                "ITEMS.0=a",
                "ITEMS.1=b",
                "/seq(ITEMS)",
                "map(PROD)",
                "PROD.TASK=build",
                "PROD.RESULT=ok",
                "/map(PROD)",
            ]
        );
    }

    #[test]
    fn test_open_false_skips_subtree_and_close() {
        let mut tracer = Tracer::default();
        encode_variables(&sample(), &mut tracer);
        assert_eq!(tracer.trace, ["NAME=value", "seq(ITEMS)", "map(PROD)"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut vars = VarMap::new();
        vars.insert("A", "1");
        vars.insert("B", "2");
        vars.insert("A", "3");
        assert_eq!(vars.keys().collect::<Vec<_>>(), ["A", "B"]);
        assert_eq!(vars.get("A"), Some(&VarValue::Str("3".into())));
    }

    #[test]
    fn test_path_predicates() {
        struct Probe {
            seen: Vec<(String, bool, bool, bool)>,
        }
        impl VariableEmitter for Probe {
            fn open_map(&mut self, _p: &EncodePath, _m: &VarMap) -> bool {
                true
            }
            fn close_map(&mut self, _p: &EncodePath, _m: &VarMap) {}
            fn open_seq(&mut self, _p: &EncodePath, _s: &[VarValue]) -> bool {
                true
            }
            fn close_seq(&mut self, _p: &EncodePath, _s: &[VarValue]) {}
            fn emit_str(&mut self, path: &EncodePath, value: &str) {
                self.seen.push((
                    value.to_owned(),
                    path.is_first_level(),
                    path.in_map(),
                    path.in_seq(),
                ));
            }
        }

        let mut probe = Probe { seen: Vec::new() };
        encode_variables(&sample(), &mut probe);
        assert_eq!(
            probe.seen,
            [
                ("value".to_owned(), true, false, false),
                ("a".to_owned(), false, false, true),
                ("b".to_owned(), false, false, true),
                ("build".to_owned(), false, true, false),
                ("ok".to_owned(), false, true, false),
            ]
        );
    }
}
