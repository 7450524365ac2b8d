//! Generic wrapper for running Perl scripts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{
    encode_variables, join, EncodePath, TaskRunError, VarMap, VarValue, VariableEmitter,
};

use crate::runlog::RunLog;
use crate::script::{path_str, LanguageRun};

pub struct PerlRun {
    wrapper_path: PathBuf,
}

impl PerlRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("PerlRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }

    fn quote(value: &str) -> String {
        format!("'{}'", value.replace('\'', "'.\"'\".'"))
    }
}

impl LanguageRun for PerlRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        out.push_str("no warnings 'once';\n");
        let mut emitter = PerlEmitter {
            out,
            first: Vec::new(),
        };
        encode_variables(vars, &mut emitter);
        out.push_str("use warnings 'once';\n");

        // Run the wrapper with "do" and report whichever of $! / $@ fired.
        let script = Self::quote(&path_str(&self.wrapper_path));
        out.push_str("$! = undef; $@ = '???';\n");
        out.push_str(&format!("if (!defined(do {script})) {{\n"));
        out.push_str("    my $msg = undef;\n");
        out.push_str("    if ($@ eq '???') {\n");
        out.push_str("        $msg = $!;\n");
        out.push_str("    } elsif ($@) {\n");
        out.push_str("        $msg = $@;\n");
        out.push_str("    }\n");
        out.push_str("    if (defined($msg)) {\n");
        out.push_str("        chomp($msg);\n");
        out.push_str("        die $msg, \"\\n\";\n");
        out.push_str("    }\n");
        out.push_str("}\n");
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec!["perl".to_owned(), "-w".to_owned(), path_str(startup_path)]
    }

    fn environment(&self) -> Vec<(String, String)> {
        // https://perldoc.perl.org/perlrun#PERL_UNICODE
        vec![("PERL_UNICODE".to_owned(), "SDA".to_owned())]
    }
}

struct PerlEmitter<'a> {
    out: &'a mut String,
    first: Vec<bool>,
}

impl PerlEmitter<'_> {
    fn separate(&mut self) {
        if let Some(first) = self.first.last_mut() {
            if *first {
                *first = false;
            } else {
                self.out.push_str(", ");
            }
        }
    }

    fn nested_key(&mut self, path: &EncodePath) {
        self.separate();
        if let Some(key) = path.last_key() {
            self.out.push_str(&PerlRun::quote(key));
            self.out.push_str("=>");
        }
    }
}

impl VariableEmitter for PerlEmitter<'_> {
    fn open_map(&mut self, path: &EncodePath, _map: &VarMap) -> bool {
        if path.is_first_level() {
            self.out.push_str(&format!(
                "our %{} = (",
                path.last_key().unwrap_or_default()
            ));
        } else {
            self.nested_key(path);
            self.out.push('{');
        }
        self.first.push(true);
        true
    }

    fn close_map(&mut self, path: &EncodePath, _map: &VarMap) {
        self.first.pop();
        if path.is_first_level() {
            self.out.push_str(");\n");
        } else {
            self.out.push('}');
        }
    }

    fn open_seq(&mut self, path: &EncodePath, seq: &[VarValue]) -> bool {
        if path.is_first_level() {
            let name = path.last_key().unwrap_or_default().to_owned();
            // A sequence of plain strings is also usable as a space-joined
            // scalar, which is what most wrappers want.
            if seq.iter().all(|item| matches!(item, VarValue::Str(_))) {
                let joined = join(seq.iter().filter_map(VarValue::as_str), ' ');
                self.out.push_str(&format!(
                    "our ${} = {};\n",
                    name,
                    PerlRun::quote(&joined)
                ));
            }
            self.out.push_str(&format!("our @{} = (", name));
        } else {
            self.nested_key(path);
            self.out.push('[');
        }
        self.first.push(true);
        true
    }

    fn close_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) {
        self.first.pop();
        if path.is_first_level() {
            self.out.push_str(");\n");
        } else {
            self.out.push(']');
        }
    }

    fn emit_str(&mut self, path: &EncodePath, value: &str) {
        if path.is_first_level() {
            self.out.push_str(&format!(
                "our ${} = {};\n",
                path.last_key().unwrap_or_default(),
                PerlRun::quote(value)
            ));
        } else {
            self.nested_key(path);
            self.out.push_str(&PerlRun::quote(value));
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
        let run = PerlRun::new(dir.path().join("wrapper.pl"), &log);
        let mut out = String::new();
        run.write_startup_script(vars, &mut out).unwrap();
        out
    }

    #[test]
    fn test_string_sequence_has_scalar_and_array_form() {
        let out = render(&sample_vars());
        assert!(out.contains("our $SF_INPUTS = 'A B';\n"));
        assert!(out.contains("our @SF_INPUTS = ('A', 'B');\n"));
        assert!(out.contains("our $FOO = 'a b';\n"));
    }

    #[test]
    fn test_nested_map_entries() {
        let mut producer = VarMap::new();
        producer.insert("TASK", "build");
        producer.insert("LOCATOR", "pub/bin.tgz");
        let mut prod = VarMap::new();
        prod.insert("BINARY", producer);
        let mut vars = VarMap::new();
        vars.insert("SF_PROD", prod);

        let out = render(&vars);
        assert!(out.contains(
            "our %SF_PROD = ('BINARY'=>{'TASK'=>'build', 'LOCATOR'=>'pub/bin.tgz'});\n"
        ));
    }

    #[test]
    fn test_single_quote_escape() {
        assert_eq!(PerlRun::quote("it's"), "'it'.\"'\".'s'");
    }

    #[test]
    fn test_wrapper_invocation_epilog() {
        let out = render(&sample_vars());
        assert!(out.contains("if (!defined(do '"));
        assert!(out.contains("no warnings 'once';\n"));
        assert!(out.contains("use warnings 'once';\n"));
    }
}
