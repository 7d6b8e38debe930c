use crate::common::*;
use crate::gene_model::ArrayWeights;

use hdf5::types::VarLenUnicode;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Hierarchical key-path store of per-gene posterior summaries
///
/// ```text
/// array_weights/<gene>/{Estimate, ..., weight_norm}   f32
/// array_weights/<gene>/array                          strings
/// metadata/metric_names                               strings
/// ```
///
/// Paths are `/`-separated and relative to the root.
pub trait MetricStore {
    fn create_group(&mut self, path: &str) -> Result<()>;

    fn path_exists(&self, path: &str) -> bool;

    /// names of the groups directly under `path`, sorted
    fn list_groups(&self, path: &str) -> Result<Vec<Box<str>>>;

    fn write_floats(&mut self, path: &str, values: &[f32]) -> Result<()>;

    fn write_strings(&mut self, path: &str, values: &[Box<str>]) -> Result<()>;

    fn read_floats(&self, path: &str) -> Result<Vec<f32>>;

    fn read_strings(&self, path: &str) -> Result<Vec<Box<str>>>;

    /// remove a dataset or a group with everything under it
    fn remove_path(&mut self, path: &str) -> Result<()>;
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn split_parent(path: &str) -> (&str, &str) {
    let path = normalize(path);
    match path.rfind('/') {
        Some(p) => (&path[..p], &path[(p + 1)..]),
        None => ("", path),
    }
}

/// Group name of a gene under `array_weights`. `/` would nest groups,
/// so it is escaped as `%2F` (and `%` as `%25`).
pub fn gene_store_key(gene: &str) -> String {
    gene.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`gene_store_key`]
pub fn gene_from_store_key(key: &str) -> Box<str> {
    key.replace("%2F", "/").replace("%25", "%").into_boxed_str()
}

/// Create `array_weights` and `metadata` groups and write the metric
/// names once. Existing content is left untouched.
pub fn initialize_store<S: MetricStore + ?Sized>(store: &mut S) -> Result<()> {
    if !store.path_exists(ARRAY_WEIGHTS_GROUP) {
        store.create_group(ARRAY_WEIGHTS_GROUP)?;
    }
    if !store.path_exists(METADATA_GROUP) {
        store.create_group(METADATA_GROUP)?;
    }
    if !store.path_exists(METRIC_NAMES_PATH) {
        let names: Vec<Box<str>> = METRIC_NAMES.iter().map(|&m| m.into()).collect();
        store.write_strings(METRIC_NAMES_PATH, &names)?;
    }
    Ok(())
}

/// Write one gene's weight table under `array_weights/<gene>`,
/// replacing an earlier entry of the same gene
pub fn write_array_weights<S: MetricStore + ?Sized>(
    store: &mut S,
    gene: &str,
    weights: &ArrayWeights,
) -> Result<()> {
    let group = format!("{}/{}", ARRAY_WEIGHTS_GROUP, gene_store_key(gene));
    if store.path_exists(&group) {
        debug!("replacing {} in the store", group);
        store.remove_path(&group)?;
    }
    store.create_group(&group)?;

    for metric in METRIC_NAMES {
        if let Some(values) = weights.column(metric) {
            store.write_floats(&format!("{}/{}", group, metric), &values)?;
        }
    }
    store.write_strings(&format!("{}/{}", group, ARRAY_COLUMN), &weights.arrays())?;
    Ok(())
}

/// HDF5 file backend
pub struct Hdf5MetricStore {
    file_name: PathBuf,
    backend: hdf5::File,
}

impl Hdf5MetricStore {
    /// Create a new file, truncating an existing one
    pub fn create<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file_name = file.as_ref().to_path_buf();
        if let Some(dir) = file_name.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let backend = hdf5::File::create(&file_name)?;
        Ok(Self { file_name, backend })
    }

    /// Open an existing file for reading and writing
    pub fn open<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file_name = file.as_ref().to_path_buf();
        if !file_name.exists() {
            return Err(LentilError::Store(format!(
                "{} does not exist",
                file_name.display()
            )));
        }
        let backend = hdf5::File::open_rw(&file_name)?;
        Ok(Self { file_name, backend })
    }

    /// Open read-write when the file exists, otherwise create it
    pub fn open_or_create<P: AsRef<Path>>(file: P) -> Result<Self> {
        if file.as_ref().exists() {
            Self::open(file)
        } else {
            Self::create(file)
        }
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()?;
        Ok(())
    }

    fn parent_group(&self, path: &str) -> Result<(hdf5::Group, String)> {
        let (parent, name) = split_parent(path);
        let group = if parent.is_empty() {
            self.backend.group("/")?
        } else {
            self.backend.group(parent)?
        };
        Ok((group, name.to_string()))
    }
}

impl MetricStore for Hdf5MetricStore {
    fn create_group(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_group(path)?;
        parent.create_group(&name)?;
        Ok(())
    }

    fn path_exists(&self, path: &str) -> bool {
        // check each prefix, since a missing intermediate link is an error
        let path = normalize(path);
        let mut prefix = String::new();
        for part in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if !self.backend.link_exists(&prefix) {
                return false;
            }
        }
        !path.is_empty()
    }

    fn list_groups(&self, path: &str) -> Result<Vec<Box<str>>> {
        let group = self.backend.group(normalize(path))?;
        let mut ret: Vec<Box<str>> = group
            .groups()?
            .iter()
            .map(|g| split_parent(&g.name()).1.into())
            .collect();
        ret.sort();
        Ok(ret)
    }

    fn write_floats(&mut self, path: &str, values: &[f32]) -> Result<()> {
        let (parent, name) = self.parent_group(path)?;
        parent
            .new_dataset::<f32>()
            .shape(values.len())
            .create(name.as_str())?
            .write(values)?;
        Ok(())
    }

    fn write_strings(&mut self, path: &str, values: &[Box<str>]) -> Result<()> {
        let values = values
            .iter()
            .map(|x| {
                x.parse::<VarLenUnicode>()
                    .map_err(|e| LentilError::Store(format!("invalid string {}: {}", x, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let (parent, name) = self.parent_group(path)?;
        parent
            .new_dataset::<VarLenUnicode>()
            .shape(values.len())
            .create(name.as_str())?
            .write(&values)?;
        Ok(())
    }

    fn read_floats(&self, path: &str) -> Result<Vec<f32>> {
        Ok(self.backend.dataset(normalize(path))?.read_raw::<f32>()?)
    }

    fn read_strings(&self, path: &str) -> Result<Vec<Box<str>>> {
        let ret = self
            .backend
            .dataset(normalize(path))?
            .read_raw::<VarLenUnicode>()?;
        Ok(ret.iter().map(|x| x.to_string().into_boxed_str()).collect())
    }

    fn remove_path(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_group(path)?;
        parent.unlink(&name)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MemoryEntry {
    Floats(Vec<f32>),
    Strings(Vec<Box<str>>),
}

/// In-memory store with the same path semantics, for tests and dry
/// runs
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricStore {
    groups: BTreeSet<String>,
    datasets: BTreeMap<String, MemoryEntry>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_parent(&self, path: &str) -> Result<()> {
        let (parent, _) = split_parent(path);
        if parent.is_empty() || self.groups.contains(parent) {
            Ok(())
        } else {
            Err(LentilError::Store(format!("no group {}", parent)))
        }
    }

    fn check_vacant(&self, path: &str) -> Result<()> {
        if self.path_exists(path) {
            Err(LentilError::Store(format!("{} already exists", path)))
        } else {
            Ok(())
        }
    }

    fn insert(&mut self, path: &str, entry: MemoryEntry) -> Result<()> {
        let path = normalize(path);
        self.check_parent(path)?;
        self.check_vacant(path)?;
        self.datasets.insert(path.to_string(), entry);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<&MemoryEntry> {
        self.datasets
            .get(normalize(path))
            .ok_or(LentilError::Store(format!("no dataset {}", path)))
    }
}

impl MetricStore for MemoryMetricStore {
    fn create_group(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        self.check_parent(path)?;
        self.check_vacant(path)?;
        self.groups.insert(path.to_string());
        Ok(())
    }

    fn path_exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.groups.contains(path) || self.datasets.contains_key(path)
    }

    fn list_groups(&self, path: &str) -> Result<Vec<Box<str>>> {
        let path = normalize(path);
        if !self.groups.contains(path) {
            return Err(LentilError::Store(format!("no group {}", path)));
        }
        Ok(self
            .groups
            .iter()
            .filter_map(|g| {
                let (parent, name) = split_parent(g);
                (parent == path).then(|| name.into())
            })
            .collect())
    }

    fn write_floats(&mut self, path: &str, values: &[f32]) -> Result<()> {
        self.insert(path, MemoryEntry::Floats(values.to_vec()))
    }

    fn write_strings(&mut self, path: &str, values: &[Box<str>]) -> Result<()> {
        self.insert(path, MemoryEntry::Strings(values.to_vec()))
    }

    fn read_floats(&self, path: &str) -> Result<Vec<f32>> {
        match self.get(path)? {
            MemoryEntry::Floats(v) => Ok(v.clone()),
            MemoryEntry::Strings(_) => Err(LentilError::Store(format!("{} holds strings", path))),
        }
    }

    fn read_strings(&self, path: &str) -> Result<Vec<Box<str>>> {
        match self.get(path)? {
            MemoryEntry::Strings(v) => Ok(v.clone()),
            MemoryEntry::Floats(_) => Err(LentilError::Store(format!("{} holds floats", path))),
        }
    }

    fn remove_path(&mut self, path: &str) -> Result<()> {
        let path = normalize(path).to_string();
        if !self.path_exists(&path) {
            return Err(LentilError::Store(format!("no path {}", path)));
        }
        let prefix = format!("{}/", path);
        self.groups.retain(|g| *g != path && !g.starts_with(&prefix));
        self.datasets
            .retain(|d, _| *d != path && !d.starts_with(&prefix));
        Ok(())
    }
}
