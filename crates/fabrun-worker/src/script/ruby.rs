//! Generic wrapper for running Ruby scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{encode_variables, EncodePath, TaskRunError, VarMap, VarValue, VariableEmitter};

use crate::runlog::RunLog;
use crate::script::{path_str, LanguageRun};

pub struct RubyRun {
    wrapper_path: PathBuf,
}

impl RubyRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("RubyRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }

    fn quote(value: &str) -> String {
        format!("'{}'", value.replace('\'', "\\'"))
    }
}

impl LanguageRun for RubyRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        let mut emitter = RubyEmitter {
            out,
            first: Vec::new(),
        };
        encode_variables(vars, &mut emitter);
        out.push_str(&format!(
            "load {}\n",
            Self::quote(&path_str(&self.wrapper_path))
        ));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![
            "ruby".to_owned(),
            "--external-encoding=UTF-8".to_owned(),
            path_str(startup_path),
        ]
    }
}

struct RubyEmitter<'a> {
    out: &'a mut String,
    first: Vec<bool>,
}

impl RubyEmitter<'_> {
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
            self.out.push('$');
            self.out.push_str(path.last_key().unwrap_or_default());
            self.out.push('=');
        } else {
            self.separate();
            if let Some(key) = path.last_key() {
                self.out.push_str(&RubyRun::quote(key));
                self.out.push_str("=>");
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

impl VariableEmitter for RubyEmitter<'_> {
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
        self.out.push_str(&RubyRun::quote(value));
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
        let run = RubyRun::new(dir.path().join("wrapper.rb"), &log);
        let mut out = String::new();
        run.write_startup_script(vars, &mut out).unwrap();
        out
    }

    #[test]
    fn test_globals_and_load_epilog() {
        let out = render(&sample_vars());
        assert!(out.contains("$SF_INPUTS=['A', 'B']\n"));
        assert!(out.contains("$FOO='a b'\n"));
        assert!(out.contains("load '"));
    }

    #[test]
    fn test_nested_map_uses_arrows() {
        let mut inner = VarMap::new();
        inner.insert("TASK", "build");
        let mut vars = VarMap::new();
        vars.insert("PROD", inner);
        let out = render(&vars);
        assert!(out.contains("$PROD={'TASK'=>'build'}\n"));
    }

    #[test]
    fn test_quote_escapes_single_quote() {
        assert_eq!(RubyRun::quote("it's"), "'it\\'s'");
    }

    #[test]
    fn test_external_encoding_flag() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RunLog::create(&dir.path().join("wrapper_log.txt")).unwrap());
        let run = RubyRun::new(dir.path().join("wrapper.rb"), &log);
        let command = run.startup_command(Path::new("/out/execute.rb"));
        assert_eq!(command[1], "--external-encoding=UTF-8");
    }
}
