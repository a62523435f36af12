//! Bridge between candle tensors and nalgebra for the F64 solve and SVD
//!
//! candle has no LU or SVD, so the two operations that need one round-trip
//! through `DMatrix<f64>`. Everything else stays in candle.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use nalgebra::DMatrix;

/// Copy a 2-D tensor into a column-major nalgebra matrix
pub fn to_dmatrix(tensor: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = tensor.dims2()?;
    let data: Vec<f64> = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
    Ok(DMatrix::from_row_slice(rows, cols, &data))
}

/// Copy a nalgebra matrix back into a row-major F64 tensor
pub fn from_dmatrix(matrix: &DMatrix<f64>, device: &Device) -> Result<Tensor> {
    let (rows, cols) = matrix.shape();
    // Column-major storage of the transpose is row-major storage of the original
    let transposed = matrix.transpose();
    Ok(Tensor::from_slice(transposed.as_slice(), (rows, cols), device)?)
}

/// Solve `a @ x = b` with LU decomposition and partial pivoting.
///
/// Fails when `a` is singular. No conditioning guard beyond that.
pub fn solve(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    anyhow::ensure!(n == m, "solve: matrix must be square, got {n}x{m}");
    let (rows, _) = b.dims2()?;
    anyhow::ensure!(
        rows == n,
        "solve: right-hand side has {rows} rows, matrix has {n}"
    );

    let a_mat = to_dmatrix(a)?;
    let b_mat = to_dmatrix(b)?;
    let x = a_mat
        .lu()
        .solve(&b_mat)
        .ok_or_else(|| anyhow::anyhow!("solve: singular {n}x{n} system"))?;

    from_dmatrix(&x, a.device())
}

/// Singular values of a 2-D tensor, largest first
pub fn singular_values(tensor: &Tensor) -> Result<Vec<f64>> {
    let mat = to_dmatrix(tensor)?;
    let mut values: Vec<f64> = mat.singular_values().iter().copied().collect();
    values.sort_by(|a, b| b.total_cmp(a));
    Ok(values)
}

/// Repeat every column `factor` times in place (`[a, b]` -> `[a, a, b, b]`)
pub fn repeat_interleave_columns(tensor: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 1 {
        return Ok(tensor.clone());
    }
    let (_, cols) = tensor.dims2()?;
    let index: Vec<u32> = (0..cols as u32)
        .flat_map(|c| std::iter::repeat(c).take(factor))
        .collect();
    let index = Tensor::from_vec(index, cols * factor, tensor.device())?;
    Ok(tensor.index_select(&index, 1)?)
}
