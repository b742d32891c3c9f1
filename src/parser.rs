use crate::error::RegistryError;
use crate::types::DatasetDescriptor;
use csv::ReaderBuilder;
use log::debug;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Reads a tab-separated catalog with the columns
/// `id, name, description, estimated_size, priority` and a header row.
pub async fn parse_catalog(path: &Path) -> Result<Vec<DatasetDescriptor>, RegistryError> {
    let mut file = File::open(path).await?;

    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;

    parse_catalog_str(&contents)
}

pub fn parse_catalog_str(contents: &str) -> Result<Vec<DatasetDescriptor>, RegistryError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| RegistryError::ParseError(e.to_string()))?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();

        let id = field(0);
        let name = field(1);
        if id.is_empty() || name.is_empty() {
            return Err(RegistryError::ParseError(format!(
                "row {} is missing an id or name",
                line + 1
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(RegistryError::ParseError(format!(
                "dataset name {} appears more than once",
                name
            )));
        }

        let priority = match field(4) {
            raw if raw.is_empty() => u32::MAX,
            raw => raw.parse().map_err(|_| {
                RegistryError::ParseError(format!("invalid priority {:?} for {}", raw, name))
            })?,
        };

        let entry = DatasetDescriptor {
            id,
            name,
            description: field(2),
            estimated_size: field(3),
            priority,
        };

        debug!("Parsed catalog entry: {:?}", entry);
        entries.push(entry);
    }

    Ok(entries)
}
