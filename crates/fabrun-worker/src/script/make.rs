//! Generic wrapper for running Makefiles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{join, TaskRunError, VarMap};

use crate::runlog::RunLog;
use crate::script::{path_str, write_flattened, FlatFormat, LanguageRun};

pub struct MakeRun {
    wrapper_path: PathBuf,
    output_dir: PathBuf,
}

impl MakeRun {
    pub fn new(wrapper_path: PathBuf, output_dir: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("MakeRun: {}", wrapper_path.display()));
        Self {
            wrapper_path,
            output_dir,
        }
    }

    fn quote(value: &str) -> String {
        // "$" starts a make expansion; double it to keep the literal value.
        value.replace('$', "$$")
    }

    fn encode_seq(items: &[String]) -> String {
        let encoded: Vec<String> = items.iter().map(|item| Self::quote(item)).collect();
        join(encoded, ' ')
    }
}

impl LanguageRun for MakeRun {
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
                encode_seq: &Self::encode_seq,
            },
            out,
        );
        out.push_str(&format!("include {}\n", path_str(&self.wrapper_path)));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![
            "make".to_owned(),
            "-C".to_owned(),
            path_str(&self.output_dir),
            "-f".to_owned(),
            path_str(startup_path),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::testutil::sample_vars;

    #[test]
    fn test_dollar_doubled_and_include_epilog() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RunLog::create(&dir.path().join("wrapper_log.txt")).unwrap());
        let run = MakeRun::new(
            dir.path().join("wrapper.mk"),
            dir.path().to_owned(),
            &log,
        );

        let mut vars = sample_vars();
        vars.insert("PRICE", "$5");
        let mut out = String::new();
        run.write_startup_script(&vars, &mut out).unwrap();
        assert!(out.contains("PRICE=$$5\n"));
        assert!(out.contains("SF_INPUTS=A B\n"));
        assert!(out.trim_end().ends_with(".mk"));

        let command = run.startup_command(Path::new("/out/execute.mk"));
        assert_eq!(command[0], "make");
        assert_eq!(command[1], "-C");
        assert_eq!(command[3], "-f");
        assert_eq!(command[4], "/out/execute.mk");
    }
}
