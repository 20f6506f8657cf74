use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ops::Op;

/// Errores del contenedor `Task`, del pipeline de operaciones y del muestreo.
///
/// Todos son deterministas (formas, índices, especificaciones): se devuelven
/// en el momento de la llamada y nunca se reintentan.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("formas inconsistentes: {0}")]
    ShapeMismatch(String),

    #[error("especificación de muestreo inválida: {0}")]
    InvalidSamplingSpec(String),

    #[error("la operación `{op}` cambia formas y no se puede aplicar después de `tensor`")]
    UnsupportedOperationOrder { op: Op },

    #[error("no hay datos para la fecha {time} en la fuente `{source_name}`")]
    TimeNotFound {
        time: DateTime<Utc>,
        source_name: String,
    },

    #[error("hay {total} tasks pero sólo {unique} fechas distintas")]
    DuplicateTimes { total: usize, unique: usize },

    #[error("índice de conjunto {index} fuera de rango ({len} conjuntos)")]
    SetIndexOutOfRange { index: usize, len: usize },

    #[error("el conjunto de contexto {set} ya fue convertido a tensor")]
    AlreadyTensor { set: usize },

    #[error("operación desconocida: `{0}`")]
    UnknownOperation(String),
}

impl From<ndarray::ShapeError> for TaskError {
    fn from(e: ndarray::ShapeError) -> Self {
        TaskError::ShapeMismatch(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
