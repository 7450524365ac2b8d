//! Flattened view of a variable tree.
//!
//! Used by the languages without nested data structures (shell, batch, make)
//! and by the build-file generators (Ant, NAnt): every node becomes one
//! variable whose name is the path joined by a separator. Maps additionally
//! publish a `…KEYS` variable listing their keys, so wrappers can iterate.

use crate::value::{EncodePath, VarMap, VarValue, VariableEmitter};

/// Value of a flattened variable.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Str(String),
    /// Elements of a sequence, captured whole; the per-language writer
    /// decides how to join and quote them.
    Seq(Vec<String>),
}

/// Emitter that flattens a variable tree into `(name, value)` pairs.
pub struct VariableFlattener {
    separator: char,
    variables: Vec<(String, FlatValue)>,
}

impl VariableFlattener {
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            variables: Vec::new(),
        }
    }

    /// The flattened variables, in walk order.
    pub fn into_variables(self) -> Vec<(String, FlatValue)> {
        self.variables
    }
}

impl VariableEmitter for VariableFlattener {
    fn open_map(&mut self, path: &EncodePath, map: &VarMap) -> bool {
        let name = format!("{}{}KEYS", path.joined(self.separator), self.separator);
        let keys = map.keys().map(str::to_owned).collect();
        self.variables.push((name, FlatValue::Seq(keys)));
        true
    }

    fn close_map(&mut self, _path: &EncodePath, _map: &VarMap) {}

    fn open_seq(&mut self, path: &EncodePath, seq: &[VarValue]) -> bool {
        let elements = seq.iter().map(scalar_text).collect();
        self.variables
            .push((path.joined(self.separator), FlatValue::Seq(elements)));
        false
    }

    fn close_seq(&mut self, _path: &EncodePath, _seq: &[VarValue]) {
        debug_assert!(false, "sequences are captured whole");
    }

    fn emit_str(&mut self, path: &EncodePath, value: &str) {
        self.variables
            .push((path.joined(self.separator), FlatValue::Str(value.to_owned())));
    }
}

/// Scalar text of a value; nested containers collapse to a space-joined form.
fn scalar_text(value: &VarValue) -> String {
    match value {
        VarValue::Str(s) => s.clone(),
        VarValue::Seq(items) => crate::value::join(items.iter().map(scalar_text), ' '),
        VarValue::Map(map) => {
            crate::value::join(map.iter().map(|(_, v)| scalar_text(v)), ' ')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::encode_variables;

    fn flatten(vars: &VarMap, separator: char) -> Vec<(String, FlatValue)> {
        let mut flattener = VariableFlattener::new(separator);
        encode_variables(vars, &mut flattener);
        flattener.into_variables()
    }

    #[test]
    fn test_scalar_and_sequence() {
        let mut vars = VarMap::new();
        vars.insert("FOO", "a b");
        vars.insert("SF_INPUTS", VarValue::seq_of(["A", "B"]));
        assert_eq!(
            flatten(&vars, '_'),
            [
                ("FOO".to_owned(), FlatValue::Str("a b".to_owned())),
                (
                    "SF_INPUTS".to_owned(),
                    FlatValue::Seq(vec!["A".to_owned(), "B".to_owned()])
                ),
            ]
        );
    }

    #[test]
    fn test_nested_map_paths_and_keys() {
        let mut producer = VarMap::new();
        producer.insert("TASK", "build");
        producer.insert("LOCATOR", "pub/bin.tgz");
        let mut input = VarMap::new();
        input.insert("build", producer);
        let mut prod = VarMap::new();
        prod.insert("BINARY", input);
        let mut vars = VarMap::new();
        vars.insert("SF_PROD", prod);

        assert_eq!(
            flatten(&vars, '_'),
            [
                (
                    "SF_PROD_KEYS".to_owned(),
                    FlatValue::Seq(vec!["BINARY".to_owned()])
                ),
                (
                    "SF_PROD_BINARY_KEYS".to_owned(),
                    FlatValue::Seq(vec!["build".to_owned()])
                ),
                (
                    "SF_PROD_BINARY_build_KEYS".to_owned(),
                    FlatValue::Seq(vec!["TASK".to_owned(), "LOCATOR".to_owned()])
                ),
                (
                    "SF_PROD_BINARY_build_TASK".to_owned(),
                    FlatValue::Str("build".to_owned())
                ),
                (
                    "SF_PROD_BINARY_build_LOCATOR".to_owned(),
                    FlatValue::Str("pub/bin.tgz".to_owned())
                ),
            ]
        );
    }

    #[test]
    fn test_dot_separator() {
        let mut vars = VarMap::new();
        let mut map = VarMap::new();
        map.insert("k", "v");
        vars.insert("M", map);
        let flat = flatten(&vars, '.');
        assert_eq!(flat[0].0, "M.KEYS");
        assert_eq!(flat[1].0, "M.k");
    }
}
