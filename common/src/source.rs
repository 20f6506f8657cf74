use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::data::fmt_shape;
use crate::error::{Result, TaskError};

/// Datos en grilla regular (reanálisis, rasters auxiliares).
///
/// `data` tiene forma `(T, N, R, C)`: fechas, variables, filas (`x1`) y
/// columnas (`x2`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GriddedSource {
    pub name: String,
    pub variables: Vec<String>,
    pub times: Vec<DateTime<Utc>>,
    pub x1: Array1<f64>,
    pub x2: Array1<f64>,
    pub data: Array4<f64>,
}

impl GriddedSource {
    pub fn new(
        name: impl Into<String>,
        variables: Vec<String>,
        times: Vec<DateTime<Utc>>,
        x1: Array1<f64>,
        x2: Array1<f64>,
        data: Array4<f64>,
    ) -> Result<Self> {
        let src = Self {
            name: name.into(),
            variables,
            times,
            x1,
            x2,
            data,
        };
        src.validate()?;
        Ok(src)
    }

    pub fn validate(&self) -> Result<()> {
        let expected = [
            self.times.len(),
            self.variables.len(),
            self.x1.len(),
            self.x2.len(),
        ];
        if self.data.shape() != expected {
            return Err(TaskError::ShapeMismatch(format!(
                "fuente `{}`: datos {} no coinciden con (T, N, R, C) = {}",
                self.name,
                fmt_shape(self.data.shape()),
                fmt_shape(&expected)
            )));
        }
        Ok(())
    }

    pub fn n_dims(&self) -> usize {
        self.variables.len()
    }

    /// Corte `(N, R, C)` para una fecha.
    pub fn slice_at(&self, time: DateTime<Utc>) -> Result<ArrayView3<'_, f64>> {
        let t = self
            .times
            .iter()
            .position(|&t| t == time)
            .ok_or_else(|| TaskError::TimeNotFound {
                time,
                source_name: self.name.clone(),
            })?;
        Ok(self.data.index_axis(Axis(0), t))
    }
}

/// Índice del valor más cercano a `v` en un eje.
pub(crate) fn nearest_index(axis: &Array1<f64>, v: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, a) in axis.iter().enumerate() {
        let d = (a - v).abs();
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Una fila de una tabla de estaciones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub x1: f64,
    pub x2: f64,
    pub values: Vec<f64>,
}

/// Observaciones dispersas (estaciones), en el orden en que se leyeron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatteredSource {
    pub name: String,
    pub variables: Vec<String>,
    pub observations: Vec<Observation>,
}

impl ScatteredSource {
    pub fn new(
        name: impl Into<String>,
        variables: Vec<String>,
        observations: Vec<Observation>,
    ) -> Result<Self> {
        let name = name.into();
        if let Some(bad) = observations
            .iter()
            .find(|o| o.values.len() != variables.len())
        {
            return Err(TaskError::ShapeMismatch(format!(
                "fuente `{}`: observación con {} valores, se esperaban {}",
                name,
                bad.values.len(),
                variables.len()
            )));
        }
        Ok(Self {
            name,
            variables,
            observations,
        })
    }

    pub fn n_dims(&self) -> usize {
        self.variables.len()
    }

    pub fn at(&self, time: DateTime<Utc>) -> Vec<&Observation> {
        self.observations.iter().filter(|o| o.time == time).collect()
    }
}

/// Fuente de un conjunto de contexto o target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Gridded(GriddedSource),
    Scattered(ScatteredSource),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::Gridded(g) => &g.name,
            Source::Scattered(s) => &s.name,
        }
    }

    pub fn n_dims(&self) -> usize {
        match self {
            Source::Gridded(g) => g.n_dims(),
            Source::Scattered(s) => s.n_dims(),
        }
    }

    pub fn is_gridded(&self) -> bool {
        matches!(self, Source::Gridded(_))
    }

    /// Fechas disponibles, ordenadas y sin repetir.
    pub fn times(&self) -> BTreeSet<DateTime<Utc>> {
        match self {
            Source::Gridded(g) => g.times.iter().copied().collect(),
            Source::Scattered(s) => s.observations.iter().map(|o| o.time).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::arr1;

    #[test]
    fn gridded_source_valida_forma() {
        let t = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let ok = GriddedSource::new(
            "era5",
            vec!["t2m".into()],
            vec![t],
            arr1(&[0.0, 1.0]),
            arr1(&[0.0, 1.0, 2.0]),
            Array4::zeros((1, 1, 2, 3)),
        );
        assert!(ok.is_ok());

        let bad = GriddedSource::new(
            "era5",
            vec!["t2m".into()],
            vec![t],
            arr1(&[0.0, 1.0]),
            arr1(&[0.0, 1.0, 2.0]),
            Array4::zeros((1, 2, 2, 3)),
        );
        assert!(matches!(bad, Err(TaskError::ShapeMismatch(_))));
    }

    #[test]
    fn slice_at_fecha_inexistente_falla() {
        let t = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let src = GriddedSource::new(
            "era5",
            vec!["t2m".into()],
            vec![t],
            arr1(&[0.0]),
            arr1(&[0.0]),
            Array4::zeros((1, 1, 1, 1)),
        )
        .unwrap();

        assert_eq!(src.slice_at(t).unwrap().shape(), &[1, 1, 1]);
        let other = Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap();
        assert!(matches!(
            src.slice_at(other),
            Err(TaskError::TimeNotFound { .. })
        ));
    }

    #[test]
    fn nearest_index_elige_el_mas_cercano() {
        let axis = arr1(&[0.0, 0.5, 1.0, 1.5]);
        assert_eq!(nearest_index(&axis, -3.0), 0);
        assert_eq!(nearest_index(&axis, 0.6), 1);
        assert_eq!(nearest_index(&axis, 1.4), 3);
    }

    #[test]
    fn scattered_source_rechaza_filas_con_otra_dimension() {
        let t = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap();
        let obs = vec![Observation {
            time: t,
            x1: 0.0,
            x2: 0.0,
            values: vec![1.0, 2.0],
        }];
        assert!(ScatteredSource::new("stations", vec!["t2m".into()], obs).is_err());
    }
}
