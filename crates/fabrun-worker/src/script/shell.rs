//! Generic wrapper for running shell scripts.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{join, TaskRunError, VarMap};

use crate::runlog::RunLog;
use crate::script::{path_str, write_flattened, FlatFormat, LanguageRun};

/// Characters that need a backslash escape in shell variable values.
const SPECIAL_CHARACTERS: &str = "*|&;()<>~`\"'\\!$ \t?";

pub struct ShellRun {
    wrapper_path: PathBuf,
    shell: String,
}

impl ShellRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("ShellRun: {}", wrapper_path.display()));

        // The shebang line decides which shell runs the wrapper.
        let first_line = match File::open(&wrapper_path) {
            Ok(file) => BufReader::new(file).lines().next().and_then(Result::ok),
            Err(e) => {
                log.warning(&format!("Could not open wrapper to detect shell used: {e}"));
                None
            }
        };
        let mut shell = match first_line.as_deref().and_then(|l| l.strip_prefix("#!")) {
            Some(interpreter) => interpreter.trim().to_owned(),
            None => {
                let shell = "/bin/sh";
                log.info(&format!(
                    "Wrapper script does not start with \"#!\", using default shell \"{shell}\""
                ));
                shell.to_owned()
            }
        };
        if cfg!(windows) {
            // Absolute paths only work within MSYS or other shell ports, not
            // when spawned directly. Use the shell name only, so it will be
            // looked up in the PATH.
            if let Some(index) = shell.rfind('/') {
                shell = shell[index + 1..].to_owned();
            }
        }

        Self {
            wrapper_path,
            shell,
        }
    }

    fn quote(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if SPECIAL_CHARACTERS.contains(c) {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
}

impl LanguageRun for ShellRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        write_flattened(
            vars,
            &FlatFormat {
                line_prefix: "",
                quote: &Self::quote,
                encode_seq: &|items| Self::quote(&join(items.iter(), ' ')),
            },
            out,
        );
        out.push_str(&format!(". {}\n", path_str(&self.wrapper_path)));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![self.shell.clone(), path_str(startup_path)]
    }
}
