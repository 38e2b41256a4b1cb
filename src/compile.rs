//! # Compiler Backend
//!
//! The narrow compile seam of the pipeline: a [`CompilerBackend`] takes
//! generated source units and returns a [`Build`]. Keeping the contract to a
//! single method lets the backend be swapped or sandboxed without touching
//! the generator or the validation passes.
//!
//! [`ScriptCompiler`] is the in-process backend for calculation script
//! units. It lexes every unit, resolves identifier references against the
//! declared functions and dataset bindings, applies the configured
//! [`CompilerOptions`], filters the known-benign diagnostics produced by
//! structurally-generated numeric casts, and emits the compiled program
//! table as the build assembly.

use crate::codegen::{CALCULATIONS_FILE, DATASETS_FILE};
use crate::model::{
    Build, CompilerMessage, CompilerOptions, Severity, SourceFile, SourceLocation,
};
use crate::token::{self, AGGREGATE_FUNCTIONS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Compiles generated source units into a [`Build`].
pub trait CompilerBackend: Send + Sync {
    fn compile(&self, files: &[SourceFile]) -> Build;
}

/// Diagnostic texts that arise from generated numeric casts and carry no
/// signal for authors. Filtered out entirely: they never count toward
/// success and are never logged.
const BENIGN_DIAGNOSTICS: &[&str] = &[
    "Implicit conversion from 'Double' to 'Decimal'",
    "Implicit conversion from 'Decimal' to 'Double'",
];

/// Script-language keywords that are never reference errors.
const KEYWORDS: &[&str] = &[
    "Function", "End", "As", "Decimal", "Return", "Dim", "If", "Then", "Else", "ElseIf", "EndIf",
    "And", "Or", "Not", "True", "False", "Nothing", "Dataset", "Field", "From",
];

/// The compiled program handed to allocation workers: one entry per
/// calculation function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub functions: BTreeMap<String, String>,
}

/// In-process compiler for calculation script source units.
pub struct ScriptCompiler {
    options: CompilerOptions,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self {
            options: CompilerOptions::default(),
        }
    }

    pub fn with_options(options: CompilerOptions) -> Self {
        Self { options }
    }
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerBackend for ScriptCompiler {
    fn compile(&self, files: &[SourceFile]) -> Build {
        tracing::info!(files = files.len(), "compiling calculation source units");

        let declared = collect_declarations(files);
        let mut messages = Vec::new();
        let mut program = CompiledProgram {
            functions: BTreeMap::new(),
        };

        for file in files {
            if file.file_name == DATASETS_FILE {
                continue;
            }
            self.check_unit(file, &declared, &mut messages, &mut program);
        }

        // Drop the benign cast diagnostics before anything counts them.
        messages.retain(|m| !BENIGN_DIAGNOSTICS.contains(&m.message.as_str()));

        let success = !messages.iter().any(|m| m.severity == Severity::Error);
        let assembly = if success {
            serde_json::to_vec(&program).ok()
        } else {
            None
        };

        tracing::info!(
            success,
            diagnostics = messages.len(),
            "compilation finished"
        );

        Build {
            success,
            source_files: files.to_vec(),
            assembly,
            compiler_messages: messages,
        }
    }
}

impl ScriptCompiler {
    fn check_unit(
        &self,
        file: &SourceFile,
        declared: &Declarations,
        messages: &mut Vec<CompilerMessage>,
        program: &mut CompiledProgram,
    ) {
        let mut current_function: Option<String> = None;
        let mut current_body = String::new();
        let mut locals: HashSet<String> = HashSet::new();

        for (line_no, line) in file.source_code.lines().enumerate() {
            let toks = token::tokens(line);

            // Track function boundaries and Dim-declared locals.
            if let Some(first) = toks.first() {
                if first.text == "Function" {
                    if let Some(name) = toks.get(1) {
                        current_function = Some(name.text.clone());
                        current_body.clear();
                        locals.clear();
                        continue;
                    }
                }
                if first.text == "End" && toks.get(1).map(|t| t.text.as_str()) == Some("Function") {
                    if let Some(name) = current_function.take() {
                        program.functions.insert(name, current_body.trim_end().to_string());
                    }
                    continue;
                }
                if first.text == "Dim" {
                    if let Some(name) = toks.get(1) {
                        locals.insert(name.text.to_ascii_lowercase());
                    }
                }
            }

            if current_function.is_some() {
                current_body.push_str(line.trim_start());
                current_body.push('\n');
            }

            for tok in &toks {
                if !declared.resolves(&tok.text, &locals) {
                    messages.push(CompilerMessage::error(
                        format!("'{}' is not declared", tok.text),
                        SourceLocation::new(file.file_name.clone(), line_no),
                    ));
                }
            }

            // Generated numeric casts surface as implicit-conversion notes.
            if contains_float_literal(line) {
                messages.push(CompilerMessage {
                    severity: Severity::Info,
                    message: "Implicit conversion from 'Double' to 'Decimal'".to_string(),
                    location: SourceLocation::new(file.file_name.clone(), line_no),
                });
            }

            // Returning a string literal from a Decimal function.
            if let Some(rest) = line.trim_start().strip_prefix("Return ") {
                if rest.trim_start().starts_with('"') {
                    let severity = if self.options.option_strict {
                        Severity::Error
                    } else {
                        Severity::Warning
                    };
                    messages.push(CompilerMessage {
                        severity,
                        message: "Option Strict On disallows implicit conversions from 'String' to 'Decimal'".to_string(),
                        location: SourceLocation::new(file.file_name.clone(), line_no),
                    });
                }
            }
        }
    }
}

struct Declarations {
    functions: HashSet<String>,
    fields: HashSet<String>,
    datasets: HashSet<String>,
}

impl Declarations {
    fn resolves(&self, text: &str, locals: &HashSet<String>) -> bool {
        let last = text.rsplit('.').next().unwrap_or(text).to_ascii_lowercase();
        let first = text.split('.').next().unwrap_or(text).to_ascii_lowercase();

        KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(text))
            || AGGREGATE_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(text))
            || locals.contains(&last)
            || locals.contains(&first)
            || self.functions.contains(&last)
            || self.fields.contains(&last)
            || self.datasets.contains(&first)
    }
}

fn collect_declarations(files: &[SourceFile]) -> Declarations {
    let mut functions = HashSet::new();
    let mut fields = HashSet::new();
    let mut datasets = HashSet::new();

    for file in files {
        for line in file.source_code.lines() {
            let toks = token::tokens(line);
            match toks.first().map(|t| t.text.as_str()) {
                Some("Function") if file.file_name == CALCULATIONS_FILE => {
                    if let Some(name) = toks.get(1) {
                        functions.insert(name.text.to_ascii_lowercase());
                    }
                }
                Some("Dataset") => {
                    if let Some(name) = toks.get(1) {
                        datasets.insert(name.text.to_ascii_lowercase());
                    }
                }
                Some("Field") => {
                    if let Some(name) = toks.get(1) {
                        fields.insert(name.text.to_ascii_lowercase());
                    }
                }
                _ => {}
            }
        }
    }

    Declarations {
        functions,
        fields,
        datasets,
    }
}

fn contains_float_literal(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.windows(3).any(|w| {
        w[0].is_ascii_digit() && w[1] == b'.' && w[2].is_ascii_digit()
    })
}

/// Route retained diagnostics to the log by severity, with 1-based lines.
pub fn log_messages(specification_id: &str, messages: &[CompilerMessage]) {
    for message in messages {
        let line = message.location.display_line();
        let owner = message.location.owner.as_str();
        match message.severity {
            Severity::Hidden => {}
            Severity::Info => tracing::debug!(
                specification_id,
                owner,
                line,
                "{}",
                message.message
            ),
            Severity::Warning => tracing::warn!(
                specification_id,
                owner,
                line,
                "{}",
                message.message
            ),
            Severity::Error => tracing::error!(
                specification_id,
                owner,
                line,
                "{}",
                message.message
            ),
        }
    }
}
