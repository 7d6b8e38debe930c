use crate::common_io::*;
use rayon::prelude::*;
use std::io::Write;

/// Write the triplets into a MatrixMarket file with 1-based indices
/// * `triplets` - the triplets to write (0-based `row`, `col`)
/// * `nrow` - number of rows
/// * `ncol` - number of columns
/// * `mtx_file` - the output file (e.g., "matrix.mtx.gz")
pub fn write_mtx_triplets(
    triplets: &[(u64, u64, f32)],
    nrow: usize,
    ncol: usize,
    mtx_file: &str,
) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(mtx_file)?;

    let nnz = triplets.len();
    writeln!(buf, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(buf, "{}\t{}\t{}", nrow, ncol, nnz)?;

    for (row, col, val) in triplets {
        writeln!(buf, "{}\t{}\t{}", row + 1, col + 1, val)?;
    }

    buf.flush()?;
    Ok(())
}

/// Read a matrix market file and return a vector of 0-based triplets
/// (row, col, val) sorted by column and then row, with the declared
/// shape `(nrow, ncol, nnz)`
/// * `mtx_file` - Path to the matrix market file
pub fn read_mtx_triplets(
    mtx_file: &str,
) -> anyhow::Result<(Vec<(u64, u64, f32)>, (usize, usize, usize))> {
    let out = read_lines_of_words_delim(mtx_file, &[' ', '\t'], 0)?;

    let words = |line: &[Box<str>]| -> Vec<Box<str>> {
        line.iter().filter(|w| !w.is_empty()).cloned().collect()
    };

    let hdr = words(&out.header);
    if hdr.len() != 3 {
        return Err(anyhow::anyhow!("failed to parse mtx header: {}", mtx_file));
    }
    let nrow = hdr[0].parse::<usize>()?;
    let ncol = hdr[1].parse::<usize>()?;
    let nnz = hdr[2].parse::<usize>()?;

    fn parse_row_col_val(triplet: &[Box<str>]) -> Option<(u64, u64, f32)> {
        if triplet.len() != 3 {
            return None;
        }
        let val = triplet[2].parse::<f32>().ok()?;
        // convert 1-based to 0-based
        let row = triplet[0].parse::<u64>().ok()?.checked_sub(1)?;
        let col = triplet[1].parse::<u64>().ok()?.checked_sub(1)?;
        Some((row, col, val))
    }

    let mut triplets = out
        .lines
        .par_iter()
        .map(|line| {
            let w = words(line);
            parse_row_col_val(&w).ok_or(anyhow::anyhow!(
                "malformed mtx entry in {}: {}",
                mtx_file,
                w.join(" ")
            ))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(&(r, c, _)) = triplets
        .iter()
        .find(|&&(r, c, _)| r as usize >= nrow || c as usize >= ncol)
    {
        return Err(anyhow::anyhow!(
            "entry ({}, {}) outside of {} x {} in {}",
            r + 1,
            c + 1,
            nrow,
            ncol,
            mtx_file
        ));
    }

    triplets.sort_by_key(|&(row, col, _)| (col, row));
    Ok((triplets, (nrow, ncol, nnz)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtx_round_trip_gz() -> anyhow::Result<()> {
        let file = create_temp_dir_file(".mtx.gz")?;
        let file = file.to_str().expect("temp path");

        let triplets = vec![(0, 0, 1.0), (2, 0, 3.0), (1, 1, 2.5)];
        write_mtx_triplets(&triplets, 3, 2, file)?;

        let (out, (nrow, ncol, nnz)) = read_mtx_triplets(file)?;
        assert_eq!((nrow, ncol, nnz), (3, 2, 3));
        assert_eq!(out, triplets);
        Ok(())
    }

    #[test]
    fn out_of_bound_entry_fails() -> anyhow::Result<()> {
        let file = create_temp_dir_file(".mtx")?;
        let file = file.to_str().expect("temp path");
        write_mtx_triplets(&[(5, 0, 1.0)], 3, 2, file)?;
        assert!(read_mtx_triplets(file).is_err());
        Ok(())
    }
}
