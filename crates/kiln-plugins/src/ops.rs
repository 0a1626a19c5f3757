//! Dense row-major kernels shared by the reference plugins.

use kiln_training::{Tensor, TrainingError, TrainingResult};

fn dims2(t: &Tensor, what: &str) -> TrainingResult<(usize, usize)> {
    match *t.shape() {
        [rows, cols] => Ok((rows, cols)),
        _ => Err(TrainingError::backend(format!("{what} must be a matrix, got shape {:?}", t.shape()))),
    }
}

/// `a · b` for `a: [n, k]`, `b: [k, m]`.
pub fn matmul(a: &Tensor, b: &Tensor) -> TrainingResult<Tensor> {
    let (n, k) = dims2(a, "lhs")?;
    let (k2, m) = dims2(b, "rhs")?;
    if k != k2 {
        return Err(TrainingError::backend(format!("matmul inner dims differ: {k} vs {k2}")));
    }
    let (a, b) = (a.data(), b.data());
    let mut out = vec![0.0; n * m];
    for i in 0..n {
        for p in 0..k {
            let av = a[i * k + p];
            for j in 0..m {
                out[i * m + j] += av * b[p * m + j];
            }
        }
    }
    Tensor::new(vec![n, m], out)
}

/// `aᵀ · b` for `a: [n, k]`, `b: [n, m]`.
pub fn matmul_tn(a: &Tensor, b: &Tensor) -> TrainingResult<Tensor> {
    let (n, k) = dims2(a, "lhs")?;
    let (n2, m) = dims2(b, "rhs")?;
    if n != n2 {
        return Err(TrainingError::backend(format!("matmul_tn row counts differ: {n} vs {n2}")));
    }
    let (a, b) = (a.data(), b.data());
    let mut out = vec![0.0; k * m];
    for r in 0..n {
        for p in 0..k {
            let av = a[r * k + p];
            for j in 0..m {
                out[p * m + j] += av * b[r * m + j];
            }
        }
    }
    Tensor::new(vec![k, m], out)
}

/// `a · bᵀ` for `a: [n, m]`, `b: [k, m]`.
pub fn matmul_nt(a: &Tensor, b: &Tensor) -> TrainingResult<Tensor> {
    let (n, m) = dims2(a, "lhs")?;
    let (k, m2) = dims2(b, "rhs")?;
    if m != m2 {
        return Err(TrainingError::backend(format!("matmul_nt column counts differ: {m} vs {m2}")));
    }
    let (a, b) = (a.data(), b.data());
    let mut out = vec![0.0; n * k];
    for i in 0..n {
        for j in 0..k {
            out[i * k + j] = (0..m).map(|p| a[i * m + p] * b[j * m + p]).sum();
        }
    }
    Tensor::new(vec![n, k], out)
}

/// Add `bias: [m]` to every row of `a: [n, m]`.
pub fn add_bias(a: &mut Tensor, bias: &Tensor) -> TrainingResult<()> {
    let (_, m) = dims2(a, "input")?;
    if bias.len() != m {
        return Err(TrainingError::backend(format!("bias has {} values, expected {m}", bias.len())));
    }
    let bias = bias.data();
    for row in a.data_mut().chunks_mut(m) {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    }
    Ok(())
}

/// Column sums of `a: [n, m]`, shape `[m]`.
pub fn sum_rows(a: &Tensor) -> TrainingResult<Tensor> {
    let (_, m) = dims2(a, "input")?;
    let mut out = vec![0.0; m];
    for row in a.data().chunks(m) {
        for (o, v) in out.iter_mut().zip(row) {
            *o += v;
        }
    }
    Tensor::new(vec![m], out)
}

pub fn map(t: &Tensor, f: impl Fn(f32) -> f32) -> TrainingResult<Tensor> {
    Tensor::new(t.shape().to_vec(), t.data().iter().map(|v| f(*v)).collect())
}

pub fn ensure_same_shape(a: &Tensor, b: &Tensor, what: &str) -> TrainingResult<()> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(TrainingError::backend(format!("{what}: shapes {:?} and {:?} differ", a.shape(), b.shape())))
    }
}
