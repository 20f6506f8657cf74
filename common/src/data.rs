use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};
use crate::ops::Op;

/// Tensor nativo del backend del modelo.
///
/// Buffer contiguo (layout estándar, row-major) con la misma forma y los
/// mismos valores que el arreglo del que se convirtió.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    #[serde(with = "nan_array")]
    data: ArrayD<f64>,
}

impl Tensor {
    pub fn from_array(array: &ArrayD<f64>) -> Self {
        Self {
            data: array.as_standard_layout().into_owned(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayViewD<'_, f64> {
        self.data.view()
    }

    pub fn into_array(self) -> ArrayD<f64> {
        self.data
    }
}

/// Un arreglo de coordenadas o valores dentro de un `Task`:
/// o bien un arreglo numérico (`Array`) o bien un `Tensor` ya convertido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Data {
    Array(#[serde(with = "nan_array")] ArrayD<f64>),
    Tensor(Tensor),
}

impl Data {
    pub fn shape(&self) -> &[usize] {
        match self {
            Data::Array(a) => a.shape(),
            Data::Tensor(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Data::Tensor(_))
    }

    /// Vista de sólo lectura, sin importar la representación.
    pub fn view(&self) -> ArrayViewD<'_, f64> {
        match self {
            Data::Array(a) => a.view(),
            Data::Tensor(t) => t.view(),
        }
    }

    /// Arreglo numérico subyacente para una operación que cambia formas.
    /// Falla si los datos ya son un tensor.
    pub(crate) fn host(&self, op: Op) -> Result<&ArrayD<f64>> {
        match self {
            Data::Array(a) => Ok(a),
            Data::Tensor(_) => Err(TaskError::UnsupportedOperationOrder { op }),
        }
    }

    pub(crate) fn with_batch_dim(&self) -> Result<Data> {
        let a = self.host(Op::BatchDim)?;
        Ok(Data::Array(a.clone().insert_axis(Axis(0))))
    }

    /// Conversión a tensor; sobre un tensor es un no-op.
    pub(crate) fn to_tensor(&self) -> Data {
        match self {
            Data::Array(a) => Data::Tensor(Tensor::from_array(a)),
            Data::Tensor(t) => Data::Tensor(t.clone()),
        }
    }
}

impl From<ArrayD<f64>> for Data {
    fn from(a: ArrayD<f64>) -> Self {
        Data::Array(a)
    }
}

/// Serialización de arreglos que conserva los NaN.
///
/// JSON no tiene NaN y serde_json lo escribe como `null`; acá `null` se lee
/// de vuelta como NaN. Mismo layout que ndarray: `{"v": 1, "dim", "data"}`.
mod nan_array {
    use ndarray::{ArrayD, IxDyn};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Repr {
        #[serde(default = "version")]
        v: u8,
        dim: Vec<usize>,
        data: Vec<Option<f64>>,
    }

    fn version() -> u8 {
        1
    }

    pub fn serialize<S: Serializer>(
        array: &ArrayD<f64>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        Repr {
            v: version(),
            dim: array.shape().to_vec(),
            data: array
                .iter()
                .map(|&x| if x.is_nan() { None } else { Some(x) })
                .collect(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<ArrayD<f64>, D::Error> {
        let repr = Repr::deserialize(deserializer)?;
        let data: Vec<f64> = repr
            .data
            .into_iter()
            .map(|x| x.unwrap_or(f64::NAN))
            .collect();
        ArrayD::from_shape_vec(IxDyn(&repr.dim), data).map_err(serde::de::Error::custom)
    }
}

/// Formatea una forma como tupla: `(3, 141, 221)`, `(112,)`, `()`.
pub fn fmt_shape(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}
