use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use ndarray::{concatenate, ArrayView2, Axis, Ix2};
use serde::{Deserialize, Serialize};

use crate::data::{fmt_shape, Data};
use crate::error::{Result, TaskError};
use crate::ops::Op;
use crate::pair::{CoordinatePairSet, Coords, CoordsShape};

/// Un bundle de conjuntos de contexto y target para una sola fecha.
///
/// El orden de `context` y `target` identifica la fuente de cada conjunto.
/// `ops` es el log append-only de operaciones aplicadas desde la creación;
/// sólo las operaciones del pipeline (ver `ops.rs`) lo modifican.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub(crate) time: DateTime<Utc>,
    pub(crate) context: Vec<CoordinatePairSet>,
    pub(crate) target: Vec<CoordinatePairSet>,
    pub(crate) ops: Vec<Op>,
}

/// Lo comparable barato de un `Task`: fecha, formas por conjunto y log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStructure {
    pub time: DateTime<Utc>,
    pub context: Vec<(CoordsShape, Vec<usize>)>,
    pub target: Vec<(CoordsShape, Vec<usize>)>,
    pub ops: Vec<Op>,
}

impl Task {
    /// Task recién creado, con el log de operaciones vacío.
    /// Listas vacías de contexto o target son válidas.
    pub fn new(
        time: DateTime<Utc>,
        context: Vec<CoordinatePairSet>,
        target: Vec<CoordinatePairSet>,
    ) -> Self {
        Self {
            time,
            context,
            target,
            ops: Vec::new(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn context(&self) -> &[CoordinatePairSet] {
        &self.context
    }

    pub fn target(&self) -> &[CoordinatePairSet] {
        &self.target
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn has_op(&self, op: Op) -> bool {
        self.ops.contains(&op)
    }

    /// Los modelos ramifican según si ya se aplicó `tensor`.
    pub fn is_tensor(&self) -> bool {
        self.has_op(Op::Tensor)
            || self
                .context
                .iter()
                .chain(self.target.iter())
                .any(CoordinatePairSet::is_tensor)
    }

    pub fn structure(&self) -> TaskStructure {
        let shapes = |sets: &[CoordinatePairSet]| {
            sets.iter()
                .map(|s| (s.coords_shape(), s.values_shape()))
                .collect::<Vec<_>>()
        };
        TaskStructure {
            time: self.time,
            context: shapes(&self.context),
            target: shapes(&self.target),
            ops: self.ops.clone(),
        }
    }

    pub fn same_structure(&self, other: &Task) -> bool {
        self.structure() == other.structure()
    }

    /// Devuelve una copia con `x_new` `(2, K)` / `y_new` `(N, K)` agregados
    /// al final del conjunto de contexto `set_idx`. El original no cambia
    /// y el log de operaciones se copia tal cual.
    ///
    /// Sólo vale para conjuntos planos, sin batch y sin convertir a tensor.
    pub fn append_obs(
        &self,
        set_idx: usize,
        x_new: ArrayView2<'_, f64>,
        y_new: ArrayView2<'_, f64>,
    ) -> Result<Task> {
        let set = self
            .context
            .get(set_idx)
            .ok_or(TaskError::SetIndexOutOfRange {
                index: set_idx,
                len: self.context.len(),
            })?;

        if set.is_tensor() {
            return Err(TaskError::AlreadyTensor { set: set_idx });
        }
        let x = match set.coords() {
            Coords::Flat { x } => x,
            Coords::Gridded { .. } => {
                return Err(TaskError::ShapeMismatch(format!(
                    "no se pueden agregar observaciones al conjunto en grilla {}",
                    set_idx
                )))
            }
        };

        let x = x.view().into_dimensionality::<Ix2>().map_err(|_| {
            TaskError::ShapeMismatch(format!(
                "conjunto {} con batch {}: agregar observaciones requiere (2, M)",
                set_idx,
                fmt_shape(x.shape())
            ))
        })?;
        let y = set.values().view().into_dimensionality::<Ix2>()?;

        if x_new.nrows() != 2 || y_new.nrows() != y.nrows() || x_new.ncols() != y_new.ncols() {
            return Err(TaskError::ShapeMismatch(format!(
                "observaciones nuevas {} / {} no encajan en el conjunto {} {}",
                fmt_shape(x_new.shape()),
                fmt_shape(y_new.shape()),
                set_idx,
                fmt_shape(y.shape())
            )));
        }

        let x = concatenate(Axis(1), &[x.view(), x_new.view()])?;
        let y = concatenate(Axis(1), &[y.view(), y_new.view()])?;

        let mut out = self.clone();
        out.context[set_idx] = CoordinatePairSet::from_parts(
            Coords::Flat {
                x: Data::Array(x.into_dyn()),
            },
            Data::Array(y.into_dyn()),
        );
        Ok(out)
    }
}

/// Falla si dos tasks comparten fecha.
pub fn check_unique_times(tasks: &[Task]) -> Result<()> {
    let unique: HashSet<DateTime<Utc>> = tasks.iter().map(|t| t.time).collect();
    if unique.len() != tasks.len() {
        return Err(TaskError::DuplicateTimes {
            total: tasks.len(),
            unique: unique.len(),
        });
    }
    Ok(())
}

fn write_shapes<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    shapes: impl Iterator<Item = T>,
) -> fmt::Result {
    let parts: Vec<String> = shapes.map(|s| s.to_string()).collect();
    writeln!(f, "{}: [{}]", name, parts.join(", "))
}

/// Representación para logs: fecha, log de operaciones y *formas* de cada
/// conjunto (nunca valores).
impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "time: {}", self.time)?;
        let ops: Vec<&str> = self.ops.iter().map(|op| op.name()).collect();
        writeln!(f, "ops: [{}]", ops.join(", "))?;

        write_shapes(f, "X_c", self.context.iter().map(|s| s.coords_shape()))?;
        write_shapes(
            f,
            "Y_c",
            self.context.iter().map(|s| fmt_shape(s.values().shape())),
        )?;
        write_shapes(f, "X_t", self.target.iter().map(|s| s.coords_shape()))?;
        write_shapes(
            f,
            "Y_t",
            self.target.iter().map(|s| fmt_shape(s.values().shape())),
        )
    }
}
