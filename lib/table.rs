//! Plain-text and `.npy` pulse tables.
//!
//! A text table holds one row per line, values separated by whitespace or
//! commas. When the time grid is included it is the first row; every other row
//! is one pulse's coefficients on that grid. Rows may have different lengths
//! (`n - 1` values for step pulses, `n` for cubic ones).
//!
//! A `.npy` table is a 2D `f64` array of width `n`, where `n` is the grid
//! length; shorter rows are padded with trailing zeros.

use std::{
    fs::File,
    io::{ BufRead, BufReader, BufWriter, Write },
    path::Path,
};
use itertools::Itertools;
use ndarray as nd;
use ndarray_npy::{ read_npy, write_npy };
use crate::error::{ SimError, SimResult };

/// Write rows, preceded by `tlist` if given.
pub fn write_table<W>(mut out: W, tlist: Option<&[f64]>, rows: &[Vec<f64>])
    -> SimResult<()>
where W: Write
{
    for row in tlist.into_iter().chain(rows.iter().map(|r| r.as_slice())) {
        writeln!(out, "{}", row.iter().join(" "))?;
    }
    out.flush()?;
    Ok(())
}

/// Parse every non-empty line into a row of values.
pub fn read_table<R>(input: R) -> SimResult<Vec<Vec<f64>>>
where R: BufRead
{
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (k, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() { continue; }
        let row: Vec<f64>
            = line.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>()
                    .map_err(|e| SimError::TableParse {
                        line: k + 1,
                        message: format!("{:?}: {}", s, e),
                    })
            })
            .collect::<SimResult<_>>()?;
        rows.push(row);
    }
    Ok(rows)
}

/// Write a text table to `path`.
pub fn save_table<P>(path: P, tlist: Option<&[f64]>, rows: &[Vec<f64>])
    -> SimResult<()>
where P: AsRef<Path>
{
    write_table(BufWriter::new(File::create(path)?), tlist, rows)
}

/// Read a text table from `path`.
pub fn load_table<P>(path: P) -> SimResult<Vec<Vec<f64>>>
where P: AsRef<Path>
{
    read_table(BufReader::new(File::open(path)?))
}

/// Write a `.npy` table of width `width` to `path`, padding short rows with
/// zeros.
pub fn save_table_npy<P>(
    path: P,
    tlist: Option<&[f64]>,
    rows: &[Vec<f64>],
    width: usize,
) -> SimResult<()>
where P: AsRef<Path>
{
    let all: Vec<&[f64]>
        = tlist.into_iter().chain(rows.iter().map(|r| r.as_slice())).collect();
    let mut table: nd::Array2<f64> = nd::Array2::zeros((all.len(), width));
    for (mut dest, row) in table.rows_mut().into_iter().zip(all) {
        if row.len() > width {
            return Err(SimError::TableParse {
                line: 0,
                message: format!("row of length {} exceeds width {}", row.len(), width),
            });
        }
        dest.iter_mut().zip(row).for_each(|(d, x)| { *d = *x; });
    }
    write_npy(path, &table)?;
    Ok(())
}

/// Read a `.npy` table from `path`.
pub fn load_table_npy<P>(path: P) -> SimResult<nd::Array2<f64>>
where P: AsRef<Path>
{
    Ok(read_npy(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let tlist = [0.0, 0.1, 0.2, 0.30000000000000004];
        let rows = vec![vec![1.0, -2.5, 1e-17], vec![0.1, 0.2, 0.3, 0.4]];
        let mut buf: Vec<u8> = Vec::new();
        write_table(&mut buf, Some(&tlist), &rows).unwrap();
        let read = read_table(buf.as_slice()).unwrap();
        assert_eq!(read[0], tlist.to_vec());
        assert_eq!(&read[1..], rows.as_slice());
    }

    #[test]
    fn commas_and_blank_lines() {
        let read = read_table("1, 2,3\n\n  4 5\n".as_bytes()).unwrap();
        assert_eq!(read, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0]]);
    }

    #[test]
    fn parse_error_line() {
        let res = read_table("1 2\n3 x\n".as_bytes());
        assert!(matches!(res, Err(SimError::TableParse { line: 2, .. })));
    }
}
