//! Capability layer over the host's numeric backend.
//!
//! The processor never touches tensor internals: everything it needs is the
//! small capability set of [`TensorBackend`]. One implementation exists per
//! supported backend; the host picks one at construction, by type or by
//! name through [`BackendKind`].

use crate::primitives::TokenId;
use crate::{Error, Result};

/// The capability set the logits processor drives a backend through.
///
/// Implementations must not alias: only the logits tensor handed to
/// [`TensorBackend::mask_row`] may be mutated, and only its masked
/// positions. Kept positions stay bit-identical to the input.
pub trait TensorBackend {
    /// Integer tensor of generated ids, shape `[B, T]` (or `[T]` for one
    /// sequence).
    type Ids;
    /// Floating tensor of logits, shape `[B, V]` (or `[V]`).
    type Logits;

    /// `(batch, time)` of the ids tensor; a 1-D tensor reports batch 1.
    fn ids_shape(&self, ids: &Self::Ids) -> Result<(usize, usize)>;

    /// `(batch, vocab)` of the logits tensor; a 1-D tensor reports batch 1.
    fn logits_shape(&self, logits: &Self::Logits) -> Result<(usize, usize)>;

    /// The ids of row `row` from position `start` to the end.
    fn row_tail(&self, ids: &Self::Ids, row: usize, start: usize) -> Result<Vec<TokenId>>;

    /// Sets every position of row `row` where `keep` is false to the most
    /// negative representable value.
    fn mask_row(&self, logits: &mut Self::Logits, row: usize, keep: &[bool]) -> Result<()>;

    /// Indices of row `row` ordered by descending logit.
    fn argsort_descending(&self, logits: &Self::Logits, row: usize) -> Result<Vec<TokenId>>;
}

/// Names a compiled-in backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackendKind {
    Cpu,
    #[cfg(feature = "candle")]
    Candle,
}

impl BackendKind {
    /// Resolves a backend by name; unknown names and backends compiled out
    /// fail with `BackendUnavailable`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "cpu" => Ok(BackendKind::Cpu),
            #[cfg(feature = "candle")]
            "candle" => Ok(BackendKind::Candle),
            other => Err(Error::BackendUnavailable(Box::from(other))),
        }
    }
}

/// Row-major integer tensor owned by the host process.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuIds {
    data: Vec<TokenId>,
    rows: usize,
    cols: usize,
}

impl CpuIds {
    /// A `[rows, cols]` tensor from flat row-major data.
    pub fn matrix(data: Vec<TokenId>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Backend(format!(
                "ids buffer holds {} values, shape [{rows}, {cols}] needs {}",
                data.len(),
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// A single sequence, shape `[T]`.
    pub fn vector(data: Vec<TokenId>) -> Self {
        let cols = data.len();
        Self {
            data,
            rows: 1,
            cols,
        }
    }

    pub fn from_rows(rows: Vec<Vec<TokenId>>) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != width) {
            return Err(Error::Backend("ids rows have uneven lengths".to_string()));
        }
        Ok(Self {
            data: rows.into_iter().flatten().collect(),
            rows: height,
            cols: width,
        })
    }
}

/// Row-major float tensor owned by the host process.
///
/// A vector-shaped instance stands for one sequence; masking it in place
/// plays the role of the unsqueeze/squeeze round-trip of batched hosts.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuLogits {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl CpuLogits {
    pub fn matrix(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Backend(format!(
                "logits buffer holds {} values, shape [{rows}, {cols}] needs {}",
                data.len(),
                rows * cols
            )));
        }
        Ok(Self { data, rows, cols })
    }

    pub fn vector(data: Vec<f32>) -> Self {
        let cols = data.len();
        Self {
            data,
            rows: 1,
            cols,
        }
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Backend over plain process-local buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuBackend;

impl TensorBackend for CpuBackend {
    type Ids = CpuIds;
    type Logits = CpuLogits;

    fn ids_shape(&self, ids: &Self::Ids) -> Result<(usize, usize)> {
        Ok((ids.rows, ids.cols))
    }

    fn logits_shape(&self, logits: &Self::Logits) -> Result<(usize, usize)> {
        Ok((logits.rows, logits.cols))
    }

    fn row_tail(&self, ids: &Self::Ids, row: usize, start: usize) -> Result<Vec<TokenId>> {
        let begin = row * ids.cols + start.min(ids.cols);
        let end = (row + 1) * ids.cols;
        Ok(ids.data[begin..end].to_vec())
    }

    fn mask_row(&self, logits: &mut Self::Logits, row: usize, keep: &[bool]) -> Result<()> {
        let cols = logits.cols;
        let row = &mut logits.data[row * cols..(row + 1) * cols];
        for (position, value) in row.iter_mut().enumerate() {
            if !keep.get(position).copied().unwrap_or(false) {
                *value = f32::NEG_INFINITY;
            }
        }
        Ok(())
    }

    fn argsort_descending(&self, logits: &Self::Logits, row: usize) -> Result<Vec<TokenId>> {
        let row = logits.row(row);
        let mut indices: Vec<TokenId> = (0..row.len() as TokenId).collect();
        indices.sort_by(|&a, &b| {
            row[b as usize]
                .partial_cmp(&row[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(indices)
    }
}

/// Backend over `candle_core` tensors.
#[cfg(feature = "candle")]
pub use candle::CandleBackend;

#[cfg(feature = "candle")]
mod candle {
    use candle_core::{DType, Tensor};

    use super::TensorBackend;
    use crate::primitives::TokenId;
    use crate::{Error, Result};

    #[derive(Clone, Copy, Debug, Default)]
    pub struct CandleBackend;

    fn backend_err(e: candle_core::Error) -> Error {
        Error::Backend(e.to_string())
    }

    fn two_dims(dims: &[usize], what: &str) -> Result<(usize, usize)> {
        match dims {
            [cols] => Ok((1, *cols)),
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(Error::Backend(format!(
                "{what} tensor must be 1-D or 2-D, got {other:?}"
            ))),
        }
    }

    impl TensorBackend for CandleBackend {
        type Ids = Tensor;
        type Logits = Tensor;

        fn ids_shape(&self, ids: &Self::Ids) -> Result<(usize, usize)> {
            two_dims(ids.dims(), "ids")
        }

        fn logits_shape(&self, logits: &Self::Logits) -> Result<(usize, usize)> {
            two_dims(logits.dims(), "logits")
        }

        fn row_tail(&self, ids: &Self::Ids, row: usize, start: usize) -> Result<Vec<TokenId>> {
            let (_, cols) = self.ids_shape(ids)?;
            let start = start.min(cols);
            let flat = if ids.dims().len() == 1 {
                ids.clone()
            } else {
                ids.narrow(0, row, 1).map_err(backend_err)?
            };
            let tail = flat
                .narrow(ids.dims().len() - 1, start, cols - start)
                .map_err(backend_err)?
                .flatten_all()
                .map_err(backend_err)?
                .to_dtype(DType::U32)
                .map_err(backend_err)?
                .to_vec1::<u32>()
                .map_err(backend_err)?;
            Ok(tail)
        }

        fn mask_row(&self, logits: &mut Self::Logits, row: usize, keep: &[bool]) -> Result<()> {
            let (_, cols) = self.logits_shape(logits)?;
            let flat_row = if logits.dims().len() == 1 {
                logits.clone()
            } else {
                logits.narrow(0, row, 1).map_err(backend_err)?
            };
            let mut values = flat_row
                .flatten_all()
                .map_err(backend_err)?
                .to_dtype(DType::F32)
                .map_err(backend_err)?
                .to_vec1::<f32>()
                .map_err(backend_err)?;
            for (position, value) in values.iter_mut().enumerate() {
                if !keep.get(position).copied().unwrap_or(false) {
                    *value = f32::NEG_INFINITY;
                }
            }
            let masked = Tensor::from_vec(values, (1, cols), logits.device())
                .map_err(backend_err)?
                .to_dtype(logits.dtype())
                .map_err(backend_err)?;
            if logits.dims().len() == 1 {
                *logits = masked.flatten_all().map_err(backend_err)?;
            } else {
                *logits = logits
                    .slice_assign(&[row..row + 1, 0..cols], &masked)
                    .map_err(backend_err)?;
            }
            Ok(())
        }

        fn argsort_descending(&self, logits: &Self::Logits, row: usize) -> Result<Vec<TokenId>> {
            let flat_row = if logits.dims().len() == 1 {
                logits.clone()
            } else {
                logits.narrow(0, row, 1).map_err(backend_err)?
            };
            let values = flat_row
                .flatten_all()
                .map_err(backend_err)?
                .to_dtype(DType::F32)
                .map_err(backend_err)?
                .to_vec1::<f32>()
                .map_err(backend_err)?;
            let mut indices: Vec<TokenId> = (0..values.len() as TokenId).collect();
            indices.sort_by(|&a, &b| {
                values[b as usize]
                    .partial_cmp(&values[a as usize])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            Ok(indices)
        }
    }
}
