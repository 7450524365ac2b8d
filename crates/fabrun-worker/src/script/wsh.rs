//! Generic wrapper for running scripts in Windows Scripting Host.
//!
//! The startup file is a `.wsf` package: a JScript prelude defines the
//! variables, scripts from the `common/` directories are spliced in, and the
//! final `<script>` element runs the wrapper in its own language.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{encode_variables, EncodePath, TaskRunError, VarMap, VarValue, VariableEmitter};

use crate::runlog::RunLog;
use crate::script::{extension_of, path_str, LanguageRun};

/// Extensions recognised by WSH, in priority order, with their language
/// names.
pub const LANGUAGES: [(&str, &str); 2] = [(".vbs", "VBScript"), (".js", "JScript")];

/// Wraps first-level objects so VBScript wrappers can iterate them: VBScript
/// has no `for … in` over JScript objects, so maps get `.size()`/`.get(k)`.
const SF_WRAP_FUNCTION: &str = r#"    function SF_WRAP(value) {
        if (typeof(value) == 'object') {
            if (value instanceof Array) {
                for (var i = 0; i < value.length; i++) {
                    SF_WRAP(value[i]);
                }
            } else {
                var list = new Array();
                for (var prop in value) {
                    if (value.hasOwnProperty(prop)) {
                        list.push(SF_WRAP(value[prop]));
                    }
                }
                value.__list__ = list;
                value.size = function() {
                    return this.__list__.length;
                };
                value.get = function(prop) {
                    var value = this[prop];
                    if (value == undefined) {
                        return this.__list__[prop];
                    } else {
                        return value;
                    }
                };
            }
        }
        return value;
    }
"#;

fn language_of(path: &Path) -> Result<&'static str, TaskRunError> {
    let ext = extension_of(path).to_lowercase();
    LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, language)| *language)
        .ok_or_else(|| TaskRunError::new(format!("Unsupported script extension \"{ext}\"")))
}

pub struct WshRun {
    wrapper_path: PathBuf,
    wrapper_language: &'static str,

    /// `<script>` include elements for the common-dir scripts.
    include_xml: String,
}

impl WshRun {
    pub fn new(
        wrapper_path: PathBuf,
        wrappers_base_dirs: &[PathBuf],
        log: &Arc<RunLog>,
    ) -> Result<Self, TaskRunError> {
        let wrapper_language = language_of(&wrapper_path)?;
        log.info(&format!("WshRun: {}", wrapper_path.display()));

        // Scan the common dirs for scripts every wrapper should see.
        let mut include_xml = String::new();
        for base_dir in wrappers_base_dirs {
            let common_dir = base_dir.join("common");
            if !common_dir.is_dir() {
                continue;
            }
            let entries = std::fs::read_dir(&common_dir).map_err(|e| {
                TaskRunError::with_source("Error scanning common script directory", e)
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| {
                    TaskRunError::with_source("Error scanning common script directory", e)
                })?;
                let path = entry.path();
                if let Ok(language) = language_of(&path) {
                    let path = path.canonicalize().map_err(|e| {
                        TaskRunError::with_source(
                            "Error getting canonical path for included script",
                            e,
                        )
                    })?;
                    include_xml.push_str(&format!(
                        "    <script language=\"{}\" src=\"{}\"/>\n",
                        language,
                        path_str(&path)
                    ));
                }
            }
        }

        Ok(Self {
            wrapper_path,
            wrapper_language,
            include_xml,
        })
    }

    fn quote(value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('\'');
        for c in value.chars() {
            if c == '\'' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('\'');
        out
    }
}

impl LanguageRun for WshRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn startup_file_name(&self, base: &str) -> String {
        format!("{base}.wsf")
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        out.push_str("<?xml version=\"1.0\" ?>\n");
        out.push_str("<package>\n");
        out.push_str("  <job id=\"WshRun\">\n");
        out.push_str("    <?job debug=\"false\" error=\"true\" ?>\n");
        out.push_str("    <script language=\"JScript\"><![CDATA[\n");
        out.push_str(SF_WRAP_FUNCTION);
        let mut emitter = WshEmitter {
            out,
            first: Vec::new(),
        };
        encode_variables(vars, &mut emitter);
        out.push_str("    ]]></script>\n");
        out.push_str(&self.include_xml);
        out.push_str(&format!(
            "    <script language=\"{}\" src=\"{}\"/>\n",
            self.wrapper_language,
            path_str(&self.wrapper_path)
        ));
        out.push_str("  </job>\n");
        out.push_str("</package>\n");
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![
            "CScript".to_owned(),
            "//Nologo".to_owned(),
            path_str(startup_path),
        ]
    }
}

struct WshEmitter<'a> {
    out: &'a mut String,
    first: Vec<bool>,
}

impl WshEmitter<'_> {
    fn separate(&mut self) {
        if let Some(first) = self.first.last_mut() {
            if *first {
                *first = false;
            } else {
                self.out.push(',');
            }
        }
    }

    fn open_value(&mut self, path: &EncodePath, wrap: bool) {
        if path.is_first_level() {
            self.out.push_str("var ");
            self.out.push_str(path.last_key().unwrap_or_default());
            self.out.push_str(" = ");
            if wrap {
                self.out.push_str("SF_WRAP(");
            }
        } else {
            self.separate();
            if let Some(key) = path.last_key() {
                self.out.push_str(key);
                self.out.push(':');
            }
        }
    }

    fn close_value(&mut self, path: &EncodePath, bracket: char) {
        self.first.pop();
        self.out.push(bracket);
        if path.is_first_level() {
            self.out.push_str(");\n");
        }
    }
}

impl VariableEmitter for WshEmitter<'_> {
    fn open_map(&mut self, path: &EncodePath, _map: &VarMap) -> bool {
        self.open_value(path, true);
        self.out.push('{');
        self.first.push(true);
        true
    }

    fn close_map(&mut self, path: &EncodePath, _map: &VarMap) {
        self.close_value(path, '}');
    }

    fn open_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) -> bool {
        self.open_value(path, true);
        self.out.push('[');
        self.first.push(true);
        true
    }

    fn close_seq(&mut self, path: &EncodePath, _seq: &[VarValue]) {
        self.close_value(path, ']');
    }

    fn emit_str(&mut self, path: &EncodePath, value: &str) {
        if path.is_first_level() {
            self.out.push_str("var ");
            self.out.push_str(path.last_key().unwrap_or_default());
            self.out.push_str(" = ");
            self.out.push_str(&WshRun::quote(value));
            self.out.push_str(";\n");
        } else {
            self.separate();
            if let Some(key) = path.last_key() {
                self.out.push_str(key);
                self.out.push(':');
            }
            self.out.push_str(&WshRun::quote(value));
        }
    }
}
