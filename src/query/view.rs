use log::{debug, warn};
use serde::Serialize;
use std::collections::HashSet;

use super::expr::quote_ident;
use crate::error::QueryError;
use crate::registry::IDENTIFIER_FIELD;

/// Name of the joined relation all queries run against.
pub const VIEW_NAME: &str = "voertuigen";

/// A dataset ingested into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTable {
    pub dataset: String,
    pub table: String,
    pub priority: u32,
    pub columns: Vec<String>,
}

impl LoadedTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// Where an exposed view column comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnProvenance {
    pub dataset: String,
    pub source_column: String,
    pub exposed_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    name: String,
    datasets: Vec<String>,
    provenance: Vec<ColumnProvenance>,
    definition: String,
}

impl ViewHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Joined datasets, primary first.
    pub fn datasets(&self) -> &[String] {
        &self.datasets
    }

    pub fn provenance(&self) -> &[ColumnProvenance] {
        &self.provenance
    }

    /// The `SELECT` the view is defined as.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.provenance.iter().map(|p| p.exposed_column.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns().any(|c| c == name)
    }
}

/// Left-joins every loaded table onto the primary one by identifier.
///
/// A column name already exposed by an earlier table is re-exposed as
/// `<dataset>__<column>` and recorded in the provenance table. Secondary
/// identifier columns are not repeated.
pub fn build_unified_view(primary: &str, tables: &[LoadedTable]) -> Result<ViewHandle, QueryError> {
    let primary_table = tables.iter().find(|t| t.dataset == primary).ok_or_else(|| {
        QueryError::NotReady(format!("primary dataset {} is not available", primary))
    })?;
    if !primary_table.has_column(IDENTIFIER_FIELD) {
        return Err(QueryError::NotReady(format!(
            "primary dataset {} has no {} column",
            primary, IDENTIFIER_FIELD
        )));
    }

    let mut joined = vec![primary_table];
    for table in tables.iter().filter(|t| t.dataset != primary) {
        if table.has_column(IDENTIFIER_FIELD) {
            joined.push(table);
        } else {
            warn!(
                "Dataset {} has no {} column and is left out of the unified view",
                table.dataset, IDENTIFIER_FIELD
            );
        }
    }

    let mut taken = HashSet::new();
    let mut provenance = Vec::new();
    let mut projections = Vec::new();
    for (i, table) in joined.iter().enumerate() {
        for column in &table.columns {
            if i > 0 && column == IDENTIFIER_FIELD {
                continue;
            }
            let mut exposed = column.clone();
            if taken.contains(&exposed) {
                exposed = format!("{}__{}", table.dataset, column);
                let mut n = 2;
                while taken.contains(&exposed) {
                    exposed = format!("{}__{}_{}", table.dataset, column, n);
                    n += 1;
                }
                debug!(
                    "Column {}.{} collides and is exposed as {}",
                    table.dataset, column, exposed
                );
            }
            taken.insert(exposed.clone());
            projections.push(format!(
                "t{}.{} AS {}",
                i,
                quote_ident(column),
                quote_ident(&exposed)
            ));
            provenance.push(ColumnProvenance {
                dataset: table.dataset.clone(),
                source_column: column.clone(),
                exposed_column: exposed,
            });
        }
    }

    let key = quote_ident(IDENTIFIER_FIELD);
    let mut definition = format!(
        "SELECT {} FROM {} AS t0",
        projections.join(", "),
        quote_ident(&primary_table.table)
    );
    for (i, table) in joined.iter().enumerate().skip(1) {
        definition.push_str(&format!(
            " LEFT JOIN {table} AS t{i} ON t{i}.{key} = t0.{key}",
            table = quote_ident(&table.table),
            i = i,
            key = key
        ));
    }

    Ok(ViewHandle {
        name: VIEW_NAME.to_string(),
        datasets: joined.iter().map(|t| t.dataset.clone()).collect(),
        provenance,
        definition,
    })
}
