//! Data expansion
//!
//! Turns one case template into concrete cases. Each data source is expanded
//! on its own: unfolded rows become independent cases, a folded source
//! becomes one case that runs every row in sequence.

use tracing::debug;

use super::generics::{self, Bindings};
use super::{Disposition, Invocation};
use crate::config::EngineConfig;
use crate::host::IsolationHost;
use crate::models::{
    format_args, CaseTemplate, DataRow, DataSource, ExpansionStrategy, SourceKind, Value,
};

/// A case produced by expansion, before plan positions are assigned
#[derive(Debug)]
pub(crate) struct ExpandedCase {
    pub id: String,
    pub display_name: String,
    pub invocations: Vec<Invocation>,
    pub bindings: Bindings,
    pub disposition: Disposition,
}

impl ExpandedCase {
    fn single(id: String, display_name: String, disposition: Disposition) -> Self {
        Self {
            invocations: vec![Invocation::new(Vec::new(), display_name.clone())],
            id,
            display_name,
            bindings: Bindings::new(),
            disposition,
        }
    }
}

struct SourceRow {
    row: DataRow,
    /// Set when the row cannot be matched to the signature at all
    error: Option<String>,
}

pub(crate) struct Expander<'a> {
    config: &'a EngineConfig,
    host: &'a dyn IsolationHost,
}

impl<'a> Expander<'a> {
    pub fn new(config: &'a EngineConfig, host: &'a dyn IsolationHost) -> Self {
        Self { config, host }
    }

    pub fn expand(
        &self,
        fixture_id: &str,
        boundary: &str,
        template: &CaseTemplate,
    ) -> Vec<ExpandedCase> {
        let base_id = format!("{fixture_id}.{}", template.name);

        if let Some(reason) = &template.ignore {
            return vec![ExpandedCase::single(
                base_id,
                template.name.clone(),
                Disposition::Skip(reason.clone()),
            )];
        }

        if template.sources.is_empty() {
            return vec![self.expand_plain(base_id, template)];
        }

        let multiple = template.sources.len() > 1;
        let mut cases = Vec::new();
        let mut ordinal = 0;

        for (position, source) in template.sources.iter().enumerate() {
            let source_id = if multiple {
                format!("{base_id}[source {}]", position + 1)
            } else {
                base_id.clone()
            };

            let rows = match self.rows(boundary, template, source) {
                Ok(rows) => rows,
                Err(message) => {
                    let disposition = match &source.ignore {
                        Some(reason) => Disposition::Skip(reason.clone()),
                        None => Disposition::Fail(message),
                    };
                    cases.push(ExpandedCase::single(
                        source_id,
                        template.name.clone(),
                        disposition,
                    ));
                    continue;
                }
            };

            if rows.is_empty() {
                cases.push(ExpandedCase::single(
                    source_id,
                    template.name.clone(),
                    self.empty_source(source),
                ));
                continue;
            }

            let evidence: Vec<&[Value]> = rows
                .iter()
                .filter(|r| r.error.is_none() && ignore_reason(r, source).is_none())
                .map(|r| r.row.values.as_slice())
                .collect();
            let inferred = if evidence.is_empty() {
                Ok(Bindings::new())
            } else {
                generics::infer(&template.params, &template.type_params, &evidence)
            };

            let strategy = source
                .strategy
                .or(template.strategy)
                .unwrap_or(self.config.data_expansion);

            match strategy {
                ExpansionStrategy::Unfold => {
                    for source_row in &rows {
                        ordinal += 1;
                        let display_name = row_label(template, &source_row.row);
                        let disposition = row_disposition(template, source, source_row, &inferred);
                        cases.push(ExpandedCase {
                            id: format!("{base_id}#{ordinal}"),
                            invocations: vec![Invocation::new(
                                source_row.row.values.clone(),
                                display_name.clone(),
                            )],
                            display_name,
                            bindings: inferred.clone().unwrap_or_default(),
                            disposition,
                        });
                    }
                }
                ExpansionStrategy::Fold => {
                    let invocations: Vec<Invocation> = rows
                        .iter()
                        .map(|source_row| {
                            Invocation::new(
                                source_row.row.values.clone(),
                                row_label(template, &source_row.row),
                            )
                            .with_disposition(row_disposition(
                                template, source, source_row, &inferred,
                            ))
                        })
                        .collect();

                    let disposition = if rows
                        .iter()
                        .all(|r| ignore_reason(r, source).is_some())
                    {
                        let reason = rows
                            .iter()
                            .find_map(|r| ignore_reason(r, source))
                            .unwrap_or_default();
                        Disposition::Skip(reason)
                    } else if let Err(message) = &inferred {
                        Disposition::Fail(message.clone())
                    } else {
                        Disposition::Run
                    };

                    cases.push(ExpandedCase {
                        id: source_id,
                        display_name: template.name.clone(),
                        invocations,
                        bindings: inferred.unwrap_or_default(),
                        disposition,
                    });
                }
            }
        }

        debug!("Expanded {} into {} case(s)", base_id, cases.len());
        cases
    }

    /// A template without data sources runs once with no arguments
    fn expand_plain(&self, id: String, template: &CaseTemplate) -> ExpandedCase {
        let no_args: [&[Value]; 1] = [&[]];
        let (bindings, disposition) =
            match generics::infer(&template.params, &template.type_params, &no_args) {
                Err(message) => (Bindings::new(), Disposition::Fail(message)),
                Ok(bindings) => {
                    let disposition =
                        match generics::check_arguments(&template.params, &[], &bindings) {
                            Ok(()) => Disposition::Run,
                            Err(message) => Disposition::Fail(message),
                        };
                    (bindings, disposition)
                }
            };
        ExpandedCase {
            bindings,
            disposition,
            ..ExpandedCase::single(id, template.name.clone(), Disposition::Run)
        }
    }

    fn empty_source(&self, source: &DataSource) -> Disposition {
        if let Some(reason) = &source.ignore {
            return Disposition::Skip(reason.clone());
        }
        let message = "Data source produced no rows".to_string();
        if self.config.empty_data_source_is_inconclusive {
            Disposition::Inconclusive(message)
        } else {
            Disposition::Fail(message)
        }
    }

    fn rows(
        &self,
        boundary: &str,
        template: &CaseTemplate,
        source: &DataSource,
    ) -> Result<Vec<SourceRow>, String> {
        let plain = |rows: Vec<DataRow>| -> Vec<SourceRow> {
            rows.into_iter()
                .map(|row| SourceRow { row, error: None })
                .collect()
        };
        match &source.kind {
            SourceKind::Rows(rows) => Ok(plain(rows.clone())),
            SourceKind::Generator(target) => self
                .host
                .generate_rows(boundary, target)
                .map(plain)
                .map_err(|fault| format!("Data source '{target}' failed: {}", fault.message())),
            SourceKind::Records(records) => Ok(records
                .iter()
                .map(|record| {
                    let mut values = Vec::with_capacity(template.params.len());
                    let mut error = None;
                    for param in &template.params {
                        match record.get(&param.name) {
                            Some(value) => values.push(value.clone()),
                            None => {
                                error.get_or_insert_with(|| {
                                    format!("Record has no value for parameter '{}'", param.name)
                                });
                            }
                        }
                    }
                    if let Some(field) = record
                        .keys()
                        .find(|key| !template.params.iter().any(|p| &p.name == *key))
                    {
                        error.get_or_insert_with(|| {
                            format!("Record field '{field}' does not match any parameter")
                        });
                    }
                    SourceRow {
                        row: DataRow::new(values),
                        error,
                    }
                })
                .collect()),
        }
    }
}

fn ignore_reason(row: &SourceRow, source: &DataSource) -> Option<String> {
    row.row.ignore.clone().or_else(|| source.ignore.clone())
}

fn row_label(template: &CaseTemplate, row: &DataRow) -> String {
    row.display_name
        .clone()
        .unwrap_or_else(|| format!("{} {}", template.name, format_args(&row.values)))
}

fn row_disposition(
    template: &CaseTemplate,
    source: &DataSource,
    source_row: &SourceRow,
    inferred: &Result<Bindings, String>,
) -> Disposition {
    if let Some(reason) = ignore_reason(source_row, source) {
        return Disposition::Skip(reason);
    }
    if let Some(error) = &source_row.error {
        return Disposition::Fail(error.clone());
    }
    match inferred {
        Err(message) => Disposition::Fail(message.clone()),
        Ok(bindings) => {
            match generics::check_arguments(&template.params, &source_row.row.values, bindings) {
                Ok(()) => Disposition::Run,
                Err(message) => Disposition::Fail(message),
            }
        }
    }
}
