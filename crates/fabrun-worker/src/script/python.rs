//! Generic wrapper for running Python scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{encode_variables, EncodePath, TaskRunError, VarMap, VarValue, VariableEmitter};

use crate::runlog::RunLog;
use crate::script::{path_str, LanguageRun};

pub struct PythonRun {
    wrapper_path: PathBuf,
}

impl PythonRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("PythonRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }

    fn quote(value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

impl LanguageRun for PythonRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        let mut emitter = PythonEmitter {
            out,
            first: Vec::new(),
        };
        encode_variables(vars, &mut emitter);
        // Works for both Python 2 and 3.
        out.push_str(&format!(
            "exec(open({}).read())\n",
            Self::quote(&path_str(&self.wrapper_path))
        ));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![
            "python".to_owned(),
            "-u".to_owned(),
            path_str(startup_path),
        ]
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("PYTHONIOENCODING".to_owned(), "UTF-8".to_owned()),
            ("PYTHONUTF8".to_owned(), "1".to_owned()),
        ]
    }
}

struct PythonEmitter<'a> {
    out: &'a mut String,
    /// Tracks, per open container, whether the next element is the first.
    first: Vec<bool>,
}

impl PythonEmitter<'_> {
    fn separate(&mut self) {
        if let Some(first) = self.first.last_mut() {
            if *first {
                *first = false;
            } else {
                self.out.push_str(", ");
            }
        }
    }

    fn open_value(&mut self, path: &EncodePath) {
        if path.is_first_level() {
            self.out.push_str(path.last_key().unwrap_or_default());
            self.out.push('=');
        } else {
            self.separate();
            if let Some(key) = path.last_key() {
                self.out.push_str(&PythonRun::quote(key));
                self.out.push(':');
            }
        }
    }

    fn close_value(&mut self, path: &EncodePath, bracket: char) {
        self.first.pop();
        self.out.push(bracket);
        if path.is_first_level() {
            self.out.push('\n');
        }
    }
}

impl VariableEmitter for PythonEmitter<'_> {
    fn open_map(&mut self, path: &EncodePath, _map: &VarMap) -> bool {
        self.open_value(path);
        self.out.push('{');
        self.first.push(true);
        true
    }

    fn close_map(&mut self, path: &EncodePath, _map: &VarMap) {
        self.close_value(path, '}');
    }

    fn open_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) -> bool {
        self.open_value(path);
        self.out.push('[');
        self.first.push(true);
        true
    }

    fn close_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) {
        self.close_value(path, ']');
    }

    fn emit_str(&mut self, path: &EncodePath, value: &str) {
        self.open_value(path);
        self.out.push_str(&PythonRun::quote(value));
        if path.is_first_level() {
            self.out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::testutil::sample_vars;

    fn render(vars: &VarMap) -> String {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RunLog::create(&dir.path().join("wrapper_log.txt")).unwrap());
        let run = PythonRun::new(dir.path().join("wrapper.py"), &log);
        let mut out = String::new();
        run.write_startup_script(vars, &mut out).unwrap();
        out
    }

    #[test]
    fn test_scalars_and_sequences() {
        let out = render(&sample_vars());
        assert!(out.contains("SF_INPUTS=['A', 'B']\n"));
        assert!(out.contains("FOO='a b'\n"));
        assert!(out.ends_with(".read())\n"));
    }

    #[test]
    fn test_nested_map() {
        let mut producer = VarMap::new();
        producer.insert("TASK", "build");
        producer.insert("RESULT", "ok");
        let mut prod = VarMap::new();
        prod.insert("BINARY", producer);
        let mut vars = VarMap::new();
        vars.insert("SF_PROD", prod);

        let out = render(&vars);
        assert!(out.contains(
            "SF_PROD={'BINARY':{'TASK':'build', 'RESULT':'ok'}}\n"
        ));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(PythonRun::quote("it's"), "'it\\'s'");
        assert_eq!(PythonRun::quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_environment() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RunLog::create(&dir.path().join("wrapper_log.txt")).unwrap());
        let run = PythonRun::new(dir.path().join("wrapper.py"), &log);
        let env = run.environment();
        assert!(env.contains(&("PYTHONIOENCODING".to_owned(), "UTF-8".to_owned())));
        assert!(env.contains(&("PYTHONUTF8".to_owned(), "1".to_owned())));
    }
}
