use std::fmt;
use std::str::FromStr;

use ndarray::Axis;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{fmt_shape, Data};
use crate::error::{Result, TaskError};
use crate::pair::{CoordinatePairSet, Coords};
use crate::task::Task;

/* =========================
   Operaciones del pipeline
   ========================= */

/// Operaciones conocidas. Cada una se registra en `Task::ops` con su nombre
/// (`nans_removed`, `batch_dim`, `tensor`, `gridded_data_flattened`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "nans_removed")]
    NansRemoved,
    #[serde(rename = "batch_dim")]
    BatchDim,
    #[serde(rename = "tensor")]
    Tensor,
    #[serde(rename = "gridded_data_flattened")]
    GriddedDataFlattened,
}

impl Op {
    pub const ALL: [Op; 4] = [
        Op::NansRemoved,
        Op::BatchDim,
        Op::Tensor,
        Op::GriddedDataFlattened,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::NansRemoved => "nans_removed",
            Op::BatchDim => "batch_dim",
            Op::Tensor => "tensor",
            Op::GriddedDataFlattened => "gridded_data_flattened",
        }
    }

    /// Operaciones que cambian formas; no se aceptan después de `tensor`.
    pub fn changes_shape(self) -> bool {
        !matches!(self, Op::Tensor)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Op {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Op::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| TaskError::UnknownOperation(s.to_string()))
    }
}

/// Parsea una lista separada por comas, ej: "nans_removed,batch_dim,tensor".
pub fn parse_ops(list: &str) -> Result<Vec<Op>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Op::from_str)
        .collect()
}

/* =========================
   Transformaciones por conjunto
   ========================= */

/// Elimina las columnas (observaciones) donde alguna dimensión de salida es
/// NaN, en coordenadas y valores a la vez.
///
/// Una grilla separable no puede perder puntos sueltos: un conjunto en
/// grilla sin NaNs pasa sin cambios, uno con NaNs es un error (hay que
/// aplicar `gridded_data_flattened` antes).
fn remove_nans_from_set(set: &CoordinatePairSet) -> Result<CoordinatePairSet> {
    let y = set.values().host(Op::NansRemoved)?;

    let x = match set.coords() {
        Coords::Flat { x } => x.host(Op::NansRemoved)?,
        Coords::Gridded { .. } => {
            let nans = y.iter().filter(|v| v.is_nan()).count();
            if nans > 0 {
                return Err(TaskError::ShapeMismatch(format!(
                    "conjunto en grilla {} con {} NaNs: aplanar con `{}` antes de `{}`",
                    fmt_shape(y.shape()),
                    nans,
                    Op::GriddedDataFlattened,
                    Op::NansRemoved
                )));
            }
            return Ok(set.clone());
        }
    };

    let axis = Axis(y.ndim() - 1);
    let keep: Vec<usize> = (0..y.len_of(axis))
        .filter(|&j| !y.index_axis(axis, j).iter().any(|v| v.is_nan()))
        .collect();

    if keep.len() == y.len_of(axis) {
        return Ok(set.clone());
    }

    debug!(
        "descartando {} de {} observaciones con NaN",
        y.len_of(axis) - keep.len(),
        y.len_of(axis)
    );

    Ok(CoordinatePairSet::from_parts(
        Coords::Flat {
            x: Data::Array(x.select(axis, &keep)),
        },
        Data::Array(y.select(axis, &keep)),
    ))
}

/* =========================
   Pipeline sobre Task
   ========================= */

impl Task {
    /// Aplica `f` a todos los conjuntos de contexto y target.
    ///
    /// Todo o nada: se calculan los conjuntos nuevos y recién entonces se
    /// reemplazan y se registra `op`. Si algo falla, el task queda igual.
    fn transform<F>(&mut self, op: Op, f: F) -> Result<&mut Self>
    where
        F: Fn(&CoordinatePairSet) -> Result<CoordinatePairSet>,
    {
        if op.changes_shape() && self.is_tensor() {
            return Err(TaskError::UnsupportedOperationOrder { op });
        }

        let context = self.context.iter().map(&f).collect::<Result<Vec<_>>>()?;
        let target = self.target.iter().map(&f).collect::<Result<Vec<_>>>()?;

        self.context = context;
        self.target = target;
        self.ops.push(op);

        debug!("task {}: aplicada `{}` (ops={})", self.time, op, self.ops.len());
        Ok(self)
    }

    /// Descarta observaciones con NaN en cada conjunto plano. Log: `nans_removed`.
    pub fn remove_nans(&mut self) -> Result<&mut Self> {
        self.transform(Op::NansRemoved, remove_nans_from_set)
    }

    /// Antepone un eje de batch de tamaño 1 a todos los arreglos (cada eje de
    /// una grilla por separado). Log: `batch_dim`.
    pub fn add_batch_dim(&mut self) -> Result<&mut Self> {
        self.transform(Op::BatchDim, |set| set.try_map_data(Data::with_batch_dim))
    }

    /// Convierte todos los arreglos a tensores del backend. Log: `tensor`.
    ///
    /// Debe ir al final: después de esto las operaciones que cambian formas
    /// devuelven `UnsupportedOperationOrder`.
    pub fn convert_to_tensor(&mut self) -> Result<&mut Self> {
        self.transform(Op::Tensor, |set| set.try_map_data(|d| Ok(d.to_tensor())))
    }

    /// Aplana los conjuntos en grilla; los planos no cambian.
    /// Log: `gridded_data_flattened`.
    pub fn flatten_gridded_data(&mut self) -> Result<&mut Self> {
        self.transform(Op::GriddedDataFlattened, CoordinatePairSet::flatten)
    }

    pub fn apply(&mut self, op: Op) -> Result<&mut Self> {
        match op {
            Op::NansRemoved => self.remove_nans(),
            Op::BatchDim => self.add_batch_dim(),
            Op::Tensor => self.convert_to_tensor(),
            Op::GriddedDataFlattened => self.flatten_gridded_data(),
        }
    }

    /// Aplica las operaciones en orden; se detiene en la primera que falle
    /// (las anteriores quedan aplicadas y registradas).
    pub fn apply_all(&mut self, ops: &[Op]) -> Result<&mut Self> {
        for &op in ops {
            self.apply(op)?;
        }
        Ok(self)
    }
}
