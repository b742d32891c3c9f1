use crate::error::RegistryError;
use crate::parser;
use crate::types::DatasetDescriptor;
use log::info;
use std::path::{Path, PathBuf};

/// The dataset every other extract is joined onto.
pub const PRIMARY_DATASET: &str = "gekentekende_voertuigen";

/// Shared vehicle identifier (license plate) across all extracts.
pub const IDENTIFIER_FIELD: &str = "kenteken";

const BUILTIN: &[(&str, &str, &str, &str, u32)] = &[
    (
        "m9d7-ebf2",
        PRIMARY_DATASET,
        "Gekentekende voertuigen",
        "~10 GB",
        1,
    ),
    ("8ys7-d773", "brandstof", "Brandstof per voertuig", "~1.5 GB", 2),
    ("3huj-srit", "assen", "Assen per voertuig", "~1.5 GB", 3),
    ("vezc-m2t6", "carrosserie", "Carrosserie", "~700 MB", 4),
    (
        "jhie-znh9",
        "carrosserie_specificatie",
        "Carrosserie specificatie",
        "~300 MB",
        5,
    ),
    ("kmfi-hrps", "voertuigklasse", "Voertuigklasse", "~100 MB", 6),
    ("2ba7-embk", "subcategorie", "Subcategorie voertuig", "~200 MB", 7),
];

/// Static catalog of datasets, always ordered by ascending priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    datasets: Vec<DatasetDescriptor>,
}

impl Registry {
    pub fn new(mut datasets: Vec<DatasetDescriptor>) -> Self {
        datasets.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Self { datasets }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN
                .iter()
                .map(|(id, name, description, size, priority)| DatasetDescriptor {
                    id: id.to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                    estimated_size: size.to_string(),
                    priority: *priority,
                })
                .collect(),
        )
    }

    pub async fn from_catalog_file(path: &Path) -> Result<Self, RegistryError> {
        let datasets = parser::parse_catalog(path).await?;
        info!(
            "Loaded {} datasets from catalog {}",
            datasets.len(),
            path.display()
        );
        Ok(Self::new(datasets))
    }

    pub fn datasets(&self) -> &[DatasetDescriptor] {
        &self.datasets
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&DatasetDescriptor> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// The most urgent entry; the unified view is built around it.
    pub fn primary(&self) -> Option<&DatasetDescriptor> {
        self.datasets.first()
    }

    /// Narrows the registry to the named datasets, keeping priority order.
    pub fn select(&self, names: &[String]) -> Result<Self, RegistryError> {
        if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
            return Err(RegistryError::UnknownDataset(unknown.clone()));
        }
        Ok(Self::new(
            self.datasets
                .iter()
                .filter(|d| names.contains(&d.name))
                .cloned()
                .collect(),
        ))
    }

    /// Datasets whose CSV is currently present in `data_dir`.
    pub fn available(&self, data_dir: &Path) -> Vec<&DatasetDescriptor> {
        self.datasets
            .iter()
            .filter(|d| dataset_path(data_dir, d).is_file())
            .collect()
    }
}

pub fn dataset_path(data_dir: &Path, dataset: &DatasetDescriptor) -> PathBuf {
    data_dir.join(dataset.file_name())
}

pub fn dataset_url(base_url: &str, dataset: &DatasetDescriptor) -> String {
    format!(
        "{}/api/views/{}/rows.csv?accessType=DOWNLOAD",
        base_url.trim_end_matches('/'),
        dataset.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_primary_is_vehicle_table() {
        let registry = Registry::builtin();
        assert_eq!(registry.primary().unwrap().name, PRIMARY_DATASET);
        assert!(registry
            .datasets()
            .windows(2)
            .all(|w| w[0].priority <= w[1].priority));
    }

    #[test]
    fn url_uses_socrata_view_id() {
        let registry = Registry::builtin();
        let dataset = registry.get("brandstof").unwrap();
        assert_eq!(
            dataset_url("https://opendata.rdw.nl/", dataset),
            "https://opendata.rdw.nl/api/views/8ys7-d773/rows.csv?accessType=DOWNLOAD"
        );
    }

    #[test]
    fn select_rejects_unknown_names() {
        let registry = Registry::builtin();
        let err = registry.select(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDataset(name) if name == "nope"));

        let narrowed = registry
            .select(&["assen".to_string(), PRIMARY_DATASET.to_string()])
            .unwrap();
        let names: Vec<_> = narrowed.datasets().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![PRIMARY_DATASET, "assen"]);
    }
}
