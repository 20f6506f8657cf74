use std::fmt;

use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::data::{fmt_shape, Data};
use crate::error::{Result, TaskError};
use crate::ops::Op;

/// Coordenadas de un conjunto de contexto o target.
///
/// - `Flat`: un arreglo `(..., 2, M)` con un punto por columna.
/// - `Gridded`: dos ejes separables `(..., 1, R)` y `(..., 1, C)`.
///
/// Los ejes iniciales (`...`) son ejes de batch; vacíos hasta `batch_dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum Coords {
    Flat { x: Data },
    Gridded { x1: Data, x2: Data },
}

/// Forma de las coordenadas tal como se imprime: una tupla, o un par de
/// tuplas por eje para conjuntos en grilla.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordsShape {
    Flat(Vec<usize>),
    Gridded(Vec<usize>, Vec<usize>),
}

impl fmt::Display for CoordsShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordsShape::Flat(s) => write!(f, "{}", fmt_shape(s)),
            CoordsShape::Gridded(s1, s2) => {
                write!(f, "({}, {})", fmt_shape(s1), fmt_shape(s2))
            }
        }
    }
}

/// Par coordenadas/valores de un conjunto de contexto o target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PairSetRepr")]
pub struct CoordinatePairSet {
    coords: Coords,
    values: Data,
}

impl CoordinatePairSet {
    /// Construye el par validando que coordenadas y valores tengan el mismo
    /// layout y el mismo número de observaciones.
    pub fn new(coords: Coords, values: Data) -> Result<Self> {
        validate(&coords, &values)?;
        Ok(Self { coords, values })
    }

    /// Conjunto disperso: `x` con forma `(2, M)`, `y` con forma `(N, M)`.
    pub fn flat(x: Array2<f64>, y: Array2<f64>) -> Result<Self> {
        Self::new(
            Coords::Flat {
                x: Data::Array(x.into_dyn()),
            },
            Data::Array(y.into_dyn()),
        )
    }

    /// Conjunto en grilla: ejes de largo R y C, valores `(N, R, C)`.
    pub fn gridded(x1: Array1<f64>, x2: Array1<f64>, y: Array3<f64>) -> Result<Self> {
        Self::new(
            Coords::Gridded {
                x1: Data::Array(x1.insert_axis(Axis(0)).into_dyn()),
                x2: Data::Array(x2.insert_axis(Axis(0)).into_dyn()),
            },
            Data::Array(y.into_dyn()),
        )
    }

    pub fn coords(&self) -> &Coords {
        &self.coords
    }

    pub fn values(&self) -> &Data {
        &self.values
    }

    pub fn is_gridded(&self) -> bool {
        matches!(self.coords, Coords::Gridded { .. })
    }

    pub fn is_tensor(&self) -> bool {
        let coords_tensor = match &self.coords {
            Coords::Flat { x } => x.is_tensor(),
            Coords::Gridded { x1, x2 } => x1.is_tensor() || x2.is_tensor(),
        };
        coords_tensor || self.values.is_tensor()
    }

    /// M para conjuntos planos, R×C para conjuntos en grilla (sin
    /// materializar la grilla).
    pub fn num_observations(&self) -> usize {
        match &self.coords {
            Coords::Flat { x } => last(x.shape()),
            Coords::Gridded { x1, x2 } => last(x1.shape()) * last(x2.shape()),
        }
    }

    pub fn coords_shape(&self) -> CoordsShape {
        match &self.coords {
            Coords::Flat { x } => CoordsShape::Flat(x.shape().to_vec()),
            Coords::Gridded { x1, x2 } => {
                CoordsShape::Gridded(x1.shape().to_vec(), x2.shape().to_vec())
            }
        }
    }

    pub fn values_shape(&self) -> Vec<usize> {
        self.values.shape().to_vec()
    }

    /// Expande una grilla `R×C` a `M = R·C` puntos en orden row-major
    /// (filas afuera, columnas adentro), igual que el layout de `(N, R, C)`.
    ///
    /// Los ejes de batch iniciales se conservan: `(..., 2, M)` y `(..., N, M)`.
    /// Sobre un conjunto ya plano devuelve una copia sin cambios.
    pub fn flatten(&self) -> Result<Self> {
        let (x1, x2) = match &self.coords {
            Coords::Flat { .. } => return Ok(self.clone()),
            Coords::Gridded { x1, x2 } => (
                x1.host(Op::GriddedDataFlattened)?,
                x2.host(Op::GriddedDataFlattened)?,
            ),
        };
        let y = self.values.host(Op::GriddedDataFlattened)?;

        let nd = x1.ndim();
        let lead = &x1.shape()[..nd - 2];
        let r = x1.shape()[nd - 1];
        let c = x2.shape()[nd - 1];
        let m = r * c;
        let b: usize = lead.iter().product();

        let x1b = x1.to_shape((b, r))?;
        let x2b = x2.to_shape((b, c))?;
        let x = Array3::from_shape_fn((b, 2, m), |(bi, k, j)| {
            if k == 0 {
                x1b[[bi, j / c]]
            } else {
                x2b[[bi, j % c]]
            }
        });

        let mut x_shape = lead.to_vec();
        x_shape.extend([2, m]);
        let x = x.into_dyn().into_shape_with_order(x_shape)?;

        let n = y.shape()[y.ndim() - 3];
        let mut y_shape = lead.to_vec();
        y_shape.extend([n, m]);
        let y = y.to_shape(y_shape)?.into_owned();

        Ok(Self {
            coords: Coords::Flat { x: Data::Array(x) },
            values: Data::Array(y),
        })
    }

    /// Aplica `f` a cada arreglo (coordenadas y valores) conservando el layout.
    pub(crate) fn try_map_data<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&Data) -> Result<Data>,
    {
        let coords = match &self.coords {
            Coords::Flat { x } => Coords::Flat { x: f(x)? },
            Coords::Gridded { x1, x2 } => Coords::Gridded {
                x1: f(x1)?,
                x2: f(x2)?,
            },
        };
        Ok(Self {
            coords,
            values: f(&self.values)?,
        })
    }

    /// Construye sin validar; sólo para transformaciones que preservan
    /// los invariantes por construcción.
    pub(crate) fn from_parts(coords: Coords, values: Data) -> Self {
        Self { coords, values }
    }
}

#[derive(Deserialize)]
struct PairSetRepr {
    coords: Coords,
    values: Data,
}

// Lo que viene de disco pasa por la misma validación que `new`.
impl TryFrom<PairSetRepr> for CoordinatePairSet {
    type Error = TaskError;

    fn try_from(repr: PairSetRepr) -> Result<Self> {
        Self::new(repr.coords, repr.values)
    }
}

fn last(shape: &[usize]) -> usize {
    shape.last().copied().unwrap_or(0)
}

fn validate(coords: &Coords, values: &Data) -> Result<()> {
    let ys = values.shape();

    match coords {
        Coords::Flat { x } => {
            let xs = x.shape();
            if xs.len() < 2 || xs[xs.len() - 2] != 2 {
                return Err(TaskError::ShapeMismatch(format!(
                    "coordenadas planas deben tener forma (..., 2, M), se recibió {}",
                    fmt_shape(xs)
                )));
            }
            if ys.len() != xs.len() {
                return Err(TaskError::ShapeMismatch(format!(
                    "coordenadas {} y valores {} tienen distinto número de ejes",
                    fmt_shape(xs),
                    fmt_shape(ys)
                )));
            }
            let nd = xs.len();
            if xs[..nd - 2] != ys[..nd - 2] || xs[nd - 1] != ys[nd - 1] {
                return Err(TaskError::ShapeMismatch(format!(
                    "coordenadas {} no coinciden con valores {}",
                    fmt_shape(xs),
                    fmt_shape(ys)
                )));
            }
        }
        Coords::Gridded { x1, x2 } => {
            let (s1, s2) = (x1.shape(), x2.shape());
            let axis_ok = |s: &[usize]| s.len() >= 2 && s[s.len() - 2] == 1;
            if !axis_ok(s1) || !axis_ok(s2) || s1.len() != s2.len() {
                return Err(TaskError::ShapeMismatch(format!(
                    "ejes de grilla deben tener forma (..., 1, R) y (..., 1, C), se recibió {} y {}",
                    fmt_shape(s1),
                    fmt_shape(s2)
                )));
            }
            let nd = s1.len();
            let lead = &s1[..nd - 2];
            if &s2[..nd - 2] != lead
                || ys.len() != nd + 1
                || &ys[..nd - 2] != lead
                || ys[nd - 1] != s1[nd - 1]
                || ys[nd] != s2[nd - 1]
            {
                return Err(TaskError::ShapeMismatch(format!(
                    "grilla ({}, {}) no coincide con valores {}",
                    fmt_shape(s1),
                    fmt_shape(s2),
                    fmt_shape(ys)
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array};

    fn small_grid() -> CoordinatePairSet {
        // valores[n, r, c] = 100 n + 10 r + c
        let y = Array::from_shape_fn((2, 2, 3), |(n, r, c)| (100 * n + 10 * r + c) as f64);
        CoordinatePairSet::gridded(arr1(&[0.0, 1.0]), arr1(&[5.0, 6.0, 7.0]), y).unwrap()
    }

    #[test]
    fn gridded_guarda_ejes_como_filas() {
        let set = small_grid();
        assert!(set.is_gridded());
        assert_eq!(
            set.coords_shape(),
            CoordsShape::Gridded(vec![1, 2], vec![1, 3])
        );
        assert_eq!(set.values_shape(), vec![2, 2, 3]);
        assert_eq!(set.num_observations(), 6);
        assert_eq!(set.coords_shape().to_string(), "((1, 2), (1, 3))");
    }

    #[test]
    fn flatten_expande_en_orden_row_major() {
        let flat = small_grid().flatten().unwrap();
        assert!(!flat.is_gridded());
        assert_eq!(flat.coords_shape(), CoordsShape::Flat(vec![2, 6]));
        assert_eq!(flat.values_shape(), vec![2, 6]);

        let Coords::Flat { x } = flat.coords() else {
            panic!("se esperaba layout plano");
        };
        let expected_x = arr2(&[
            [0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            [5.0, 6.0, 7.0, 5.0, 6.0, 7.0],
        ]);
        assert_eq!(x.view(), expected_x.into_dyn().view());

        let expected_y = arr2(&[
            [0.0, 1.0, 2.0, 10.0, 11.0, 12.0],
            [100.0, 101.0, 102.0, 110.0, 111.0, 112.0],
        ]);
        assert_eq!(flat.values().view(), expected_y.into_dyn().view());
    }

    #[test]
    fn flatten_sobre_conjunto_plano_no_cambia_nada() {
        let set = CoordinatePairSet::flat(
            arr2(&[[0.0, 1.0], [2.0, 3.0]]),
            arr2(&[[9.0, 8.0]]),
        )
        .unwrap();
        assert_eq!(set.flatten().unwrap(), set);
    }

    #[test]
    fn flatten_conserva_ejes_de_batch() {
        let batched = small_grid()
            .try_map_data(|d| d.with_batch_dim())
            .unwrap();
        let flat = batched.flatten().unwrap();
        assert_eq!(flat.coords_shape(), CoordsShape::Flat(vec![1, 2, 6]));
        assert_eq!(flat.values_shape(), vec![1, 2, 6]);
    }

    #[test]
    fn flat_rechaza_numero_de_puntos_distinto() {
        let err = CoordinatePairSet::flat(
            arr2(&[[0.0, 1.0, 2.0], [0.0, 1.0, 2.0]]),
            arr2(&[[1.0, 2.0]]),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::ShapeMismatch(_)));
    }

    #[test]
    fn flat_rechaza_coordenadas_sin_dos_filas() {
        let err = CoordinatePairSet::flat(arr2(&[[0.0, 1.0]]), arr2(&[[1.0, 2.0]])).unwrap_err();
        assert!(matches!(err, TaskError::ShapeMismatch(_)));
    }

    #[test]
    fn gridded_rechaza_valores_con_otra_grilla() {
        let y = Array::zeros((1, 3, 2));
        let err =
            CoordinatePairSet::gridded(arr1(&[0.0, 1.0]), arr1(&[5.0, 6.0, 7.0]), y).unwrap_err();
        assert!(matches!(err, TaskError::ShapeMismatch(_)));
    }

    #[test]
    fn new_rechaza_layouts_mezclados() {
        // coordenadas en grilla con valores planos
        let coords = Coords::Gridded {
            x1: Data::Array(arr2(&[[0.0, 1.0]]).into_dyn()),
            x2: Data::Array(arr2(&[[0.0, 1.0]]).into_dyn()),
        };
        let values = Data::Array(arr2(&[[1.0, 2.0, 3.0, 4.0]]).into_dyn());
        assert!(CoordinatePairSet::new(coords, values).is_err());
    }

    #[test]
    fn flatten_falla_sobre_tensor() {
        let set = small_grid().try_map_data(|d| Ok(d.to_tensor())).unwrap();
        assert!(set.is_tensor());
        let err = set.flatten().unwrap_err();
        assert!(matches!(
            err,
            TaskError::UnsupportedOperationOrder {
                op: Op::GriddedDataFlattened
            }
        ));
    }
}
