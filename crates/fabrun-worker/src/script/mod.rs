//! Per-language startup-script generation.
//!
//! The startup script defines the task's variables in the wrapper's own
//! language and then hands control to the wrapper. Each language binding
//! knows how to encode the variable tree, which interpreter to launch, and
//! which environment the interpreter needs.

mod ant;
mod batch;
mod make;
mod nant;
mod perl;
mod python;
mod ruby;
mod shell;
mod wsh;

pub use ant::AntRun;
pub use batch::BatchRun;
pub use make::MakeRun;
pub use nant::NAntRun;
pub use perl::PerlRun;
pub use python::PythonRun;
pub use ruby::RubyRun;
pub use shell::ShellRun;
pub use wsh::WshRun;

use std::path::Path;

use fabrun_core::{encode_variables, FlatValue, TaskRunError, VarMap, VariableFlattener};

/// Language-specific behavior of a task run.
pub trait LanguageRun: Send + Sync {
    /// Absolute path of the wrapper file.
    fn wrapper_path(&self) -> &Path;

    /// File name of the startup script for the given base name. By default
    /// the startup script shares the wrapper's extension.
    fn startup_file_name(&self, base: &str) -> String {
        format!("{base}{}", extension_of(self.wrapper_path()))
    }

    /// Write the startup script contents.
    fn write_startup_script(&self, vars: &VarMap, out: &mut String)
        -> Result<(), TaskRunError>;

    /// Command line elements that run the startup script.
    fn startup_command(&self, startup_path: &Path) -> Vec<String>;

    /// Extra environment variables for the wrapper process.
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// File name extension including the dot, or empty if there is none.
pub(crate) fn extension_of(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Shared shape of the flattened-script languages (shell, batch, make): one
/// `NAME=value` line per flattened variable between a prolog and an epilog.
pub(crate) struct FlatFormat<'a> {
    pub line_prefix: &'a str,
    pub quote: &'a dyn Fn(&str) -> String,
    pub encode_seq: &'a dyn Fn(&[String]) -> String,
}

pub(crate) fn write_flattened(vars: &VarMap, format: &FlatFormat<'_>, out: &mut String) {
    let mut flattener = VariableFlattener::new('_');
    encode_variables(vars, &mut flattener);
    for (name, value) in flattener.into_variables() {
        let encoded = match value {
            FlatValue::Str(s) => (format.quote)(&s),
            FlatValue::Seq(items) => (format.encode_seq)(&items),
        };
        out.push_str(format.line_prefix);
        out.push_str(&name);
        out.push('=');
        out.push_str(&encoded);
        out.push('\n');
    }
}
