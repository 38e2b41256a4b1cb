//! # Aggregate Reference Analyzer
//!
//! Validates every aggregate-function call in a specification's calculation
//! set before anything compiles or runs. Three rules apply:
//!
//! 1. an aggregate argument must be an aggregable dataset field or a
//!    calculation name;
//! 2. a calculation that aggregates another calculation must not itself be
//!    aggregated elsewhere;
//! 3. aggregating a calculation that in turn aggregates something is nested
//!    aggregation, found by walking the aggregate-reference graph.
//!
//! Findings are [`CompilerMessage`] errors, never panics or `Err` values -
//! the caller decides whether to persist or reject. The aggregable-field
//! allow-list is read through a specification-scoped cache entry and only
//! fetched from the dataset-relationship service on a miss.

use crate::clients::{Cache, DatasetFieldsClient};
use crate::error::Result;
use crate::model::{
    dataset_fields_cache_key, Calculation, CompilerMessage, DatasetField, SourceLocation,
};
use crate::token::{self, AggregateCall};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One calculation-to-calculation aggregate edge.
#[derive(Debug, Clone)]
struct AggregateEdge {
    /// Lowercased name of the aggregated calculation.
    target: String,
    call: AggregateCall,
}

pub struct AggregateAnalyzer {
    cache: Arc<dyn Cache>,
    dataset_fields: Arc<dyn DatasetFieldsClient>,
}

impl AggregateAnalyzer {
    pub fn new(cache: Arc<dyn Cache>, dataset_fields: Arc<dyn DatasetFieldsClient>) -> Self {
        Self {
            cache,
            dataset_fields,
        }
    }

    /// Validate every aggregate call across the calculation set. An empty
    /// result means the set is safe to compile and run.
    pub async fn validate(
        &self,
        specification_id: &str,
        calculations: &[Calculation],
    ) -> Result<Vec<CompilerMessage>> {
        let fields = self.aggregable_fields(specification_id).await?;
        Ok(validate_against_fields(calculations, &fields))
    }

    /// The aggregable-field allow-list, cache-first.
    async fn aggregable_fields(&self, specification_id: &str) -> Result<Vec<DatasetField>> {
        let key = dataset_fields_cache_key(specification_id);
        if let Some(fields) = self.cache.get_fields(&key).await? {
            tracing::debug!(specification_id, "aggregable field list served from cache");
            return Ok(fields);
        }

        let fields = self
            .dataset_fields
            .relationship_fields(specification_id)
            .await?;
        self.cache.set_fields(&key, &fields).await?;
        tracing::debug!(
            specification_id,
            fields = fields.len(),
            "aggregable field list cached"
        );
        Ok(fields)
    }
}

/// Distinct names of calculations referenced by any aggregate call, in
/// deterministic order. Used to tag aggregation-driving batch jobs.
pub fn aggregated_calculations(calculations: &[Calculation]) -> Vec<String> {
    let names = calculation_names(calculations);
    let mut out = BTreeSet::new();

    for calc in calculations {
        for call in token::aggregate_calls(&calc.current.source_code) {
            let arg = call.argument_name().to_ascii_lowercase();
            if let Some(alias) = names.get(&arg) {
                out.insert(alias.display.clone());
            }
        }
    }

    out.into_iter().collect()
}

/// Pure validation core, shared by the analyzer and tests.
pub fn validate_against_fields(
    calculations: &[Calculation],
    fields: &[DatasetField],
) -> Vec<CompilerMessage> {
    let aggregable: HashSet<String> = fields
        .iter()
        .filter(|f| f.is_aggregable)
        .map(|f| f.name.to_ascii_lowercase())
        .collect();
    let names = calculation_names(calculations);

    // Deterministic order regardless of repository iteration order.
    let mut ordered: Vec<&Calculation> = calculations.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut messages = Vec::new();
    let mut unresolved_seen: HashSet<String> = HashSet::new();
    // calc (lowercased) -> aggregate edges out of it
    let mut edges: HashMap<String, Vec<AggregateEdge>> = HashMap::new();
    let mut aggregated: HashSet<String> = HashSet::new();
    // calcs whose source performs any aggregation at all
    let mut aggregating: HashSet<String> = HashSet::new();

    for calc in &ordered {
        let key = calc.source_code_name.to_ascii_lowercase();
        let calls = token::aggregate_calls(&calc.current.source_code);
        if !calls.is_empty() {
            aggregating.insert(key.clone());
        }
        for call in calls {
            let arg = call.argument_name().to_ascii_lowercase();

            if aggregable.contains(&arg) {
                continue;
            }
            if let Some(alias) = names.get(&arg) {
                aggregated.insert(alias.canonical.clone());
                edges.entry(key.clone()).or_default().push(AggregateEdge {
                    target: alias.canonical.clone(),
                    call,
                });
                continue;
            }
            // One error per distinct unresolved argument, however many
            // calls reference it.
            if unresolved_seen.insert(arg) {
                messages.push(CompilerMessage::error(
                    format!("{} is not an aggregable field", call.argument_name()),
                    SourceLocation::new(calc.name.clone(), call.line),
                ));
            }
        }
    }

    for calc in &ordered {
        let key = calc.source_code_name.to_ascii_lowercase();
        let Some(outgoing) = edges.get(&key) else {
            continue;
        };

        // Rule 2: this calculation aggregates others while being aggregated
        // itself.
        if aggregated.contains(&key) {
            let line = outgoing.first().map(|e| e.call.line).unwrap_or(0);
            messages.push(CompilerMessage::error(
                format!(
                    "{} is already referenced in an aggregation that would cause nesting",
                    calc.name
                ),
                SourceLocation::new(calc.name.clone(), line),
            ));
        }

        // Rule 3: any aggregated target that itself aggregates, at any depth.
        for edge in outgoing {
            if reaches_aggregation(&edge.target, &edges, &aggregating) {
                messages.push(CompilerMessage::error(
                    format!(
                        "{} cannot reference another calc that is being aggregated",
                        calc.name
                    ),
                    SourceLocation::new(calc.name.clone(), edge.call.line),
                ));
            }
        }
    }

    messages
}

/// Walk the aggregate-reference graph from `start`: true when the referenced
/// calculation performs aggregation itself or anywhere downstream.
fn reaches_aggregation(
    start: &str,
    edges: &HashMap<String, Vec<AggregateEdge>>,
    aggregating: &HashSet<String>,
) -> bool {
    let mut stack = vec![start.to_string()];
    let mut visited = HashSet::new();

    while let Some(node) = stack.pop() {
        if !visited.insert(node.clone()) {
            continue;
        }
        if aggregating.contains(&node) {
            return true;
        }
        if let Some(outgoing) = edges.get(&node) {
            for edge in outgoing {
                stack.push(edge.target.clone());
            }
        }
    }

    false
}

/// A calculation as seen through one of its aliases.
struct NameAlias {
    /// Lowercased source identifier, the key used in the reference graph.
    canonical: String,
    /// Original display name, used in diagnostics and job properties.
    display: String,
}

/// Lowercased lookup of calculation identifiers and display names.
fn calculation_names(calculations: &[Calculation]) -> HashMap<String, NameAlias> {
    let mut names = HashMap::new();
    for calc in calculations {
        let canonical = calc.source_code_name.to_ascii_lowercase();
        names.insert(
            canonical.clone(),
            NameAlias {
                canonical: canonical.clone(),
                display: calc.name.clone(),
            },
        );
        names.insert(
            calc.name.to_ascii_lowercase(),
            NameAlias {
                canonical,
                display: calc.name.clone(),
            },
        );
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::sanitize_identifier;
    use crate::model::{CalculationVersion, Severity};

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

    fn pupils() -> DatasetField {
        DatasetField {
            name: "Pupils".into(),
            source_name: "PupilCount".into(),
            source_relationship_name: "Census".into(),
            is_aggregable: true,
        }
    }

    #[test]
    fn aggregable_field_reference_is_clean() {
        let calcs = vec![calc("a", "Alpha", "Return Sum(Pupils)")];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert!(messages.is_empty());
    }

    #[test]
    fn unknown_argument_errors_once_per_distinct_name() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Mystery)"),
            calc("b", "Beta", "Return Avg(Mystery)"),
        ];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].severity, Severity::Error);
        assert_eq!(messages[0].message, "Mystery is not an aggregable field");
    }

    #[test]
    fn non_aggregable_field_is_rejected() {
        let mut field = pupils();
        field.is_aggregable = false;
        let calcs = vec![calc("a", "Alpha", "Return Sum(Pupils)")];
        let messages = validate_against_fields(&calcs, &[field]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn aggregating_an_aggregating_calculation_nests() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Beta)"),
            calc("b", "Beta", "Return Sum(Pupils)"),
        ];
        // Beta aggregates a field, Alpha aggregates Beta: Alpha violates the
        // nesting rule, Beta is fine on its own.
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].message,
            "Alpha cannot reference another calc that is being aggregated"
        );
    }

    #[test]
    fn plain_calculation_aggregation_is_clean() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Beta)"),
            calc("b", "Beta", "Return 1"),
        ];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert!(messages.is_empty(), "{messages:?}");
    }

    #[test]
    fn referenced_while_aggregated_is_an_error() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Beta)"),
            calc("b", "Beta", "Return 1"),
            calc("c", "Gamma", "Return Sum(Alpha)"),
        ];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert!(messages.iter().any(|m| m.message
            == "Alpha is already referenced in an aggregation that would cause nesting"));
        // Gamma also nests: it aggregates Alpha, which aggregates Beta.
        assert!(messages.iter().any(|m| m.message
            == "Gamma cannot reference another calc that is being aggregated"));
    }

    #[test]
    fn transitive_nesting_walks_beyond_one_level() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Beta)"),
            calc("b", "Beta", "Return Sum(Gamma)"),
            calc("c", "Gamma", "Return Sum(Pupils)"),
        ];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert!(messages.iter().any(|m| m.message
            == "Alpha cannot reference another calc that is being aggregated"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(BETA)"),
            calc("b", "Beta", "Return 1"),
        ];
        let messages = validate_against_fields(&calcs, &[pupils()]);
        assert!(messages.is_empty(), "{messages:?}");
        assert_eq!(aggregated_calculations(&calcs), vec!["Beta"]);
    }

    #[test]
    fn aggregated_calculation_names_are_distinct_and_ordered() {
        let calcs = vec![
            calc("a", "Alpha", "Return Sum(Gamma) + Sum(Beta) + Avg(Beta)"),
            calc("b", "Beta", "Return 1"),
            calc("c", "Gamma", "Return 2"),
        ];
        assert_eq!(aggregated_calculations(&calcs), vec!["Beta", "Gamma"]);
    }
}
