//! # Calculation Source Generator
//!
//! Renders a specification's calculations and dataset-relationship bindings
//! into compilable source units. Pure and deterministic: the same inputs
//! always produce byte-identical output, so unchanged specifications compile
//! to identical builds.

use crate::model::{Calculation, DatasetRelationship, SourceFile};
use std::collections::BTreeMap;

/// File name of the generated calculation unit.
pub const CALCULATIONS_FILE: &str = "Calculations.calc";

/// File name of the generated dataset-binding unit.
pub const DATASETS_FILE: &str = "Datasets.calc";

/// Symbol replacements applied when sanitizing author-chosen names into
/// identifiers. Authors name calculations things like "P004 < 16x2" and the
/// generated identifier must still be legal.
const SYMBOL_TOKENS: &[(char, &str)] = &[
    ('<', "LessThan"),
    ('>', "GreaterThan"),
    ('£', "Pound"),
    ('=', "Equals"),
    ('%', "Percent"),
    ('+', "Plus"),
    ('-', "Minus"),
    ('/', "Divide"),
    ('*', "Multiply"),
    ('&', "And"),
];

/// Turn an arbitrary display name into a legal source identifier.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if let Some((_, token)) = SYMBOL_TOKENS.iter().find(|(s, _)| *s == c) {
            out.push_str(token);
        } else if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        }
        // Whitespace and any remaining symbols are dropped.
    }
    if out.is_empty() {
        return "_".to_string();
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Where each calculation's body starts inside the generated calculation
/// unit, keyed by calculation id. Lets diagnostics point back at the owning
/// calculation.
pub type LineIndex = BTreeMap<String, usize>;

/// Renders calculations plus dataset bindings into source units.
pub struct CodeGenerator;

impl CodeGenerator {
    /// Generate the full set of source units for a specification.
    ///
    /// Calculations are ordered by name then id so output is stable across
    /// repository iteration order.
    pub fn generate(
        calculations: &[Calculation],
        relationships: &[DatasetRelationship],
    ) -> Vec<SourceFile> {
        let (calc_unit, _) = Self::generate_calculations(calculations);
        vec![
            calc_unit,
            Self::generate_datasets(relationships),
        ]
    }

    /// Generate the calculation unit together with a line index mapping each
    /// calculation id to the 0-based line where its body starts.
    pub fn generate_calculations(calculations: &[Calculation]) -> (SourceFile, LineIndex) {
        let mut ordered: Vec<&Calculation> = calculations.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let mut code = String::new();
        code.push_str("' Auto-generated calculation unit\n");
        code.push_str("' DO NOT EDIT - regenerated on every build\n\n");

        let mut index = LineIndex::new();
        let mut line = code.matches('\n').count();

        for calc in ordered {
            let ident = if calc.source_code_name.is_empty() {
                sanitize_identifier(&calc.name)
            } else {
                calc.source_code_name.clone()
            };

            code.push_str(&format!("Function {ident}() As Decimal\n"));
            line += 1;
            index.insert(calc.id.clone(), line);

            for body_line in calc.current.source_code.lines() {
                code.push_str("    ");
                code.push_str(body_line);
                code.push('\n');
                line += 1;
            }
            code.push_str("End Function\n\n");
            line += 2;
        }

        (
            SourceFile {
                file_name: CALCULATIONS_FILE.to_string(),
                source_code: code,
            },
            index,
        )
    }

    fn generate_datasets(relationships: &[DatasetRelationship]) -> SourceFile {
        let mut ordered: Vec<&DatasetRelationship> = relationships.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let mut code = String::new();
        code.push_str("' Auto-generated dataset bindings\n\n");

        for rel in ordered {
            let rel_ident = sanitize_identifier(&rel.name);
            code.push_str(&format!("Dataset {rel_ident}\n"));

            let mut fields: Vec<_> = rel.fields.iter().collect();
            fields.sort_by(|a, b| a.name.cmp(&b.name));
            for field in fields {
                let ident = sanitize_identifier(&field.name);
                code.push_str(&format!(
                    "    Field {ident} From \"{}.{}\"\n",
                    rel.name, field.source_name
                ));
            }
            code.push_str("End Dataset\n\n");
        }

        SourceFile {
            file_name: DATASETS_FILE.to_string(),
            source_code: code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CalculationVersion, DatasetField};

    fn calc(id: &str, name: &str, source: &str) -> Calculation {
        Calculation {
            id: id.into(),
            name: name.into(),
            source_code_name: sanitize_identifier(name),
            specification_id: "spec-1".into(),
            current: CalculationVersion {
                source_code: source.into(),
                version: 1,
            },
        }
    }

    #[test]
    fn sanitizes_symbols_into_tokens() {
        assert_eq!(sanitize_identifier("P004 < 16"), "P004LessThan16");
        assert_eq!(sanitize_identifier("Rate %"), "RatePercent");
        assert_eq!(sanitize_identifier("£ per pupil"), "Poundperpupil");
        assert_eq!(sanitize_identifier("a = b + c"), "aEqualsbPlusc");
    }

    #[test]
    fn sanitized_identifier_never_starts_with_digit() {
        assert_eq!(sanitize_identifier("16-19 funding"), "_16Minus19funding");
    }

    #[test]
    fn empty_name_yields_placeholder() {
        assert_eq!(sanitize_identifier("???"), "_");
    }

    #[test]
    fn generation_is_deterministic() {
        let calcs = vec![calc("b", "Beta", "Return 2"), calc("a", "Alpha", "Return 1")];
        let rels = vec![DatasetRelationship {
            id: "rel-1".into(),
            name: "Census".into(),
            fields: vec![DatasetField {
                name: "Pupils".into(),
                source_name: "PupilCount".into(),
                source_relationship_name: "Census".into(),
                is_aggregable: true,
            }],
        }];

        let first = CodeGenerator::generate(&calcs, &rels);
        let reversed: Vec<_> = calcs.iter().rev().cloned().collect();
        let second = CodeGenerator::generate(&reversed, &rels);
        assert_eq!(first, second);
    }

    #[test]
    fn line_index_points_at_function_bodies() {
        let calcs = vec![calc("a", "Alpha", "Return 1"), calc("b", "Beta", "Return 2")];
        let (unit, index) = CodeGenerator::generate_calculations(&calcs);

        let lines: Vec<&str> = unit.source_code.lines().collect();
        let alpha_start = index["a"];
        assert_eq!(lines[alpha_start].trim(), "Return 1");
        let beta_start = index["b"];
        assert_eq!(lines[beta_start].trim(), "Return 2");
    }
}
