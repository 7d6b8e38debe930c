use crate::common::*;

use matrix_util::common_io::read_lines_of_words_delim;
use matrix_util::mtx_io::read_mtx_triplets;
use nalgebra_sparse::CooMatrix;
use std::collections::HashMap;

/// Names of the metadata columns
#[derive(Debug, Clone)]
pub struct MetadataColumns {
    pub cell: Box<str>,
    pub pseudotime: Box<str>,
    pub batch: Box<str>,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            cell: "cell".into(),
            pseudotime: "pseudotime".into(),
            batch: "batch".into(),
        }
    }
}

/// Expression with pseudotime and batch of every kept cell
pub struct TrajectoryData {
    /// gene x cell
    pub counts: CscMat,
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    pub pseudotime: Vec<f32>,
    pub batches: Vec<Box<str>>,
}

fn first_words(file: &str) -> anyhow::Result<Vec<Box<str>>> {
    Ok(read_lines_of_words_delim(file, &['\t', ' ', ','], -1)?
        .lines
        .into_iter()
        .filter_map(|w| w.into_iter().next())
        .collect())
}

/// cell -> (pseudotime, batch)
fn read_metadata(
    file: &str,
    columns: &MetadataColumns,
) -> anyhow::Result<HashMap<Box<str>, (f32, Box<str>)>> {
    let delim: &[char] = if file.ends_with(".csv") || file.ends_with(".csv.gz") {
        &[',']
    } else {
        &['\t']
    };

    let out = read_lines_of_words_delim(file, delim, 0)?;
    let find = |name: &str| -> anyhow::Result<usize> {
        out.header
            .iter()
            .position(|h| h.as_ref() == name)
            .ok_or(anyhow::anyhow!("no column {} in {}", name, file))
    };

    let (c_cell, c_time, c_batch) = (
        find(&columns.cell)?,
        find(&columns.pseudotime)?,
        find(&columns.batch)?,
    );

    let mut ret = HashMap::new();
    let mut n_invalid = 0;
    for words in out.lines.iter() {
        let (Some(cell), Some(time), Some(batch)) =
            (words.get(c_cell), words.get(c_time), words.get(c_batch))
        else {
            n_invalid += 1;
            continue;
        };
        match time.parse::<f32>() {
            Ok(t) if t.is_finite() && !batch.is_empty() => {
                ret.insert(cell.clone(), (t, batch.clone()));
            }
            _ => n_invalid += 1,
        }
    }

    if n_invalid > 0 {
        warn!("{} metadata rows without valid pseudotime or batch", n_invalid);
    }
    Ok(ret)
}

/// Read a gene x cell MatrixMarket file with gene and cell names and
/// join each cell to its metadata row by name. Cells without usable
/// metadata are dropped.
///
/// * `mtx_file` - `.mtx` or `.mtx.gz`
/// * `gene_file` - one gene name per line (first word)
/// * `cell_file` - one cell name per line (first word)
/// * `metadata_file` - delimited table with a header
/// * `columns` - cell, pseudotime and batch column names
pub fn read_trajectory_data(
    mtx_file: &str,
    gene_file: &str,
    cell_file: &str,
    metadata_file: &str,
    columns: &MetadataColumns,
) -> anyhow::Result<TrajectoryData> {
    let (triplets, (nrow, ncol, _)) = read_mtx_triplets(mtx_file)?;
    let genes = first_words(gene_file)?;
    let cells = first_words(cell_file)?;

    if genes.len() != nrow || cells.len() != ncol {
        return Err(LentilError::DataShape(format!(
            "{} x {} matrix with {} gene and {} cell names",
            nrow,
            ncol,
            genes.len(),
            cells.len()
        ))
        .into());
    }

    let meta = read_metadata(metadata_file, columns)?;

    let mut kept_cells = vec![];
    let mut pseudotime = vec![];
    let mut batches = vec![];
    let new_col: Vec<Option<usize>> = cells
        .iter()
        .map(|c| {
            meta.get(c).map(|(t, b)| {
                kept_cells.push(c.clone());
                pseudotime.push(*t);
                batches.push(b.clone());
                kept_cells.len() - 1
            })
        })
        .collect();

    let n_dropped = ncol - kept_cells.len();
    if n_dropped > 0 {
        warn!("dropped {} of {} cells without metadata", n_dropped, ncol);
    }
    if kept_cells.is_empty() {
        return Err(LentilError::DataShape(format!(
            "no cell of {} is found in {}",
            cell_file, metadata_file
        ))
        .into());
    }

    let mut coo = CooMatrix::new(nrow, kept_cells.len());
    for (r, c, v) in triplets {
        if let Some(j) = new_col[c as usize] {
            coo.push(r as usize, j, v);
        }
    }

    info!("{} genes x {} cells", nrow, kept_cells.len());

    Ok(TrajectoryData {
        counts: CscMat::from(&coo),
        genes,
        cells: kept_cells,
        pseudotime,
        batches,
    })
}
