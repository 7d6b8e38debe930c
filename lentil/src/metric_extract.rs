use crate::common::*;
use crate::metric_store::{gene_from_store_key, MetricStore};

use std::collections::HashMap;

/// `[batch x gene]` matrix of one persisted metric
#[derive(Debug, Clone)]
pub struct MetricMatrix {
    pub metric: Box<str>,
    /// `NaN` where a gene has no entry for a batch
    pub values: Mat,
    /// union of batch labels, first-seen order
    pub batches: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
    /// genes left out, with the reason
    pub skipped: Vec<(Box<str>, String)>,
}

impl MetricMatrix {
    pub fn n_batches(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.values.ncols()
    }

    /// values of one gene across batches
    pub fn gene_values(&self, j: usize) -> Vec<f32> {
        self.values.column(j).iter().copied().collect()
    }

    /// rows of `batch, gene_1, ..., gene_n` for a delimited table
    pub fn to_rows(&self) -> Vec<Vec<Box<str>>> {
        self.batches
            .iter()
            .enumerate()
            .map(|(i, b)| {
                std::iter::once(b.clone())
                    .chain(
                        self.values
                            .row(i)
                            .iter()
                            .map(|v| format!("{}", v).into_boxed_str()),
                    )
                    .collect()
            })
            .collect()
    }
}

fn read_gene<S: MetricStore + ?Sized>(
    store: &S,
    key: &str,
    metric: &str,
) -> std::result::Result<(Vec<Box<str>>, Vec<f32>), String> {
    let group = format!("{}/{}", ARRAY_WEIGHTS_GROUP, key);
    let array_path = format!("{}/{}", group, ARRAY_COLUMN);
    let metric_path = format!("{}/{}", group, metric);

    if !store.path_exists(&array_path) {
        return Err(format!("no {} column", ARRAY_COLUMN));
    }
    if !store.path_exists(&metric_path) {
        return Err(format!("no {} column", metric));
    }

    let arrays = store.read_strings(&array_path).map_err(|e| e.to_string())?;
    let values = store.read_floats(&metric_path).map_err(|e| e.to_string())?;

    if arrays.len() != values.len() {
        return Err(format!(
            "{} batch labels for {} values",
            arrays.len(),
            values.len()
        ));
    }
    Ok((arrays, values))
}

/// Read one metric of every gene back into a `[batch x gene]`
/// matrix, aligning genes by batch label
pub fn extract_metric_matrix<S: MetricStore + ?Sized>(
    store: &S,
    metric: &str,
) -> Result<MetricMatrix> {
    if !store.path_exists(ARRAY_WEIGHTS_GROUP) {
        return Err(LentilError::Store(format!(
            "no {} group in the store",
            ARRAY_WEIGHTS_GROUP
        )));
    }

    let mut batches: Vec<Box<str>> = vec![];
    let mut batch_pos: HashMap<Box<str>, usize> = HashMap::new();
    let mut genes = vec![];
    let mut columns = vec![];
    let mut skipped = vec![];

    for key in store.list_groups(ARRAY_WEIGHTS_GROUP)? {
        let gene = gene_from_store_key(&key);
        match read_gene(store, &key, metric) {
            Ok((arrays, values)) => {
                let mut col = vec![];
                for (a, v) in arrays.into_iter().zip(values) {
                    let i = *batch_pos.entry(a.clone()).or_insert_with(|| {
                        batches.push(a);
                        batches.len() - 1
                    });
                    col.push((i, v));
                }
                genes.push(gene);
                columns.push(col);
            }
            Err(reason) => {
                warn!("skipping {}: {}", gene, reason);
                skipped.push((gene, reason));
            }
        }
    }

    if genes.is_empty() {
        return Err(LentilError::DataShape(format!(
            "metric {} is not found for any gene",
            metric
        )));
    }

    let mut values = Mat::from_element(batches.len(), genes.len(), f32::NAN);
    for (j, col) in columns.into_iter().enumerate() {
        for (i, v) in col {
            values[(i, j)] = v;
        }
    }

    info!(
        "{}: {} batches x {} genes ({} skipped)",
        metric,
        batches.len(),
        genes.len(),
        skipped.len()
    );

    Ok(MetricMatrix {
        metric: metric.into(),
        values,
        batches,
        genes,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric_store::{initialize_store, MemoryMetricStore};

    fn labels(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    #[test]
    fn genes_without_the_metric_are_skipped() -> Result<()> {
        let mut store = MemoryMetricStore::new();
        initialize_store(&mut store)?;

        store.create_group("array_weights/g1")?;
        store.write_strings("array_weights/g1/array", &labels(&["b1", "b2"]))?;
        store.write_floats("array_weights/g1/Estimate", &[1.0, 2.0])?;

        store.create_group("array_weights/g2")?;
        store.write_strings("array_weights/g2/array", &labels(&["b1"]))?;

        store.create_group("array_weights/g3")?;
        store.write_strings("array_weights/g3/array", &labels(&["b1", "b2"]))?;
        store.write_floats("array_weights/g3/Estimate", &[1.0])?;

        let mat = extract_metric_matrix(&store, "Estimate")?;
        assert_eq!(mat.genes, labels(&["g1"]));
        assert_eq!(mat.skipped.len(), 2);
        assert_eq!(mat.gene_values(0), vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn no_usable_gene_names_the_metric() -> Result<()> {
        let mut store = MemoryMetricStore::new();
        initialize_store(&mut store)?;
        match extract_metric_matrix(&store, "shape") {
            Err(LentilError::DataShape(msg)) => assert!(msg.contains("shape")),
            _ => panic!("expected a data shape error"),
        }
        Ok(())
    }

    #[test]
    fn missing_group_is_a_store_error() {
        let store = MemoryMetricStore::new();
        assert!(matches!(
            extract_metric_matrix(&store, "Estimate"),
            Err(LentilError::Store(_))
        ));
    }
}
