use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::LoaderConfig;
use crate::error::{Result, TaskError};
use crate::pair::CoordinatePairSet;
use crate::source::{nearest_index, GriddedSource, ScatteredSource, Source};
use crate::task::Task;

/// Cómo muestrear un conjunto de contexto o target.
#[derive(Debug, Clone, PartialEq)]
pub enum Sampling {
    /// Todos los puntos; en fuentes en grilla conserva la grilla.
    All,
    /// `n` puntos al azar, sin reemplazo.
    Count(usize),
    /// Coordenadas explícitas, forma `(2, K)`.
    Coords(Array2<f64>),
}

impl FromStr for Sampling {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Sampling::All);
        }
        s.parse::<usize>().map(Sampling::Count).map_err(|_| {
            TaskError::InvalidSamplingSpec(format!(
                "`{}`: se esperaba \"all\" o un número de puntos",
                s
            ))
        })
    }
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampling::All => f.write_str("all"),
            Sampling::Count(n) => write!(f, "{}", n),
            Sampling::Coords(x) => write!(f, "coords({})", x.ncols()),
        }
    }
}

/// Parsea una lista separada por comas, ej: "all,100".
pub fn parse_sampling(list: &str) -> Result<Vec<Sampling>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Sampling::from_str)
        .collect()
}

/// Motor de muestreo: arma un `Task` por fecha a partir de las fuentes de
/// contexto y target.
#[derive(Debug, Clone)]
pub struct TaskLoader {
    context: Vec<Source>,
    target: Vec<Source>,
    config: LoaderConfig,
}

impl TaskLoader {
    pub fn new(context: Vec<Source>, target: Vec<Source>, config: LoaderConfig) -> Self {
        Self {
            context,
            target,
            config,
        }
    }

    pub fn context_sources(&self) -> &[Source] {
        &self.context
    }

    pub fn target_sources(&self) -> &[Source] {
        &self.target
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Fechas muestreables: las que comparten todas las fuentes en grilla.
    /// Si no hay grillas, la unión de las fechas de estaciones.
    pub fn times(&self) -> Vec<DateTime<Utc>> {
        let sources = || self.context.iter().chain(self.target.iter());

        let mut grids = sources().filter(|s| s.is_gridded()).map(Source::times);
        let times: BTreeSet<DateTime<Utc>> = match grids.next() {
            Some(first) => grids.fold(first, |acc, t| acc.intersection(&t).copied().collect()),
            None => sources().flat_map(|s| s.times()).collect(),
        };
        times.into_iter().collect()
    }

    /// Arma el `Task` de una fecha.
    ///
    /// Cada lista de muestreo tiene un elemento por fuente, o uno solo que
    /// se aplica a todas.
    pub fn task(
        &self,
        time: DateTime<Utc>,
        context_sampling: &[Sampling],
        target_sampling: &[Sampling],
    ) -> Result<Task> {
        let context_sampling = broadcast(context_sampling, self.context.len(), "contexto")?;
        let target_sampling = broadcast(target_sampling, self.target.len(), "target")?;

        let mut rng = self.rng_for(time);

        let context = self
            .context
            .iter()
            .zip(context_sampling)
            .map(|(src, sampling)| self.sample_source(src, time, sampling, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let target = self
            .target
            .iter()
            .zip(target_sampling)
            .map(|(src, sampling)| self.sample_source(src, time, sampling, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        Ok(Task::new(time, context, target))
    }

    // Con semilla fija cada fecha tiene su propio stream: los tasks se pueden
    // construir en cualquier orden (o en paralelo) con el mismo resultado.
    fn rng_for(&self, time: DateTime<Utc>) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(time.timestamp() as u64)),
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }

    fn sample_source(
        &self,
        src: &Source,
        time: DateTime<Utc>,
        sampling: &Sampling,
        rng: &mut StdRng,
    ) -> Result<CoordinatePairSet> {
        let set = match src {
            Source::Gridded(g) => sample_gridded(g, time, sampling, rng)?,
            Source::Scattered(s) => {
                sample_scattered(s, time, sampling, rng, self.config.coord_tolerance)?
            }
        };
        debug!(
            "fuente `{}` @ {}: muestreo={} -> {} observaciones",
            src.name(),
            time,
            sampling,
            set.num_observations()
        );
        Ok(set)
    }
}

fn broadcast<'a>(sampling: &'a [Sampling], n_sources: usize, role: &str) -> Result<Vec<&'a Sampling>> {
    match sampling.len() {
        _ if n_sources == 0 => Ok(Vec::new()),
        1 => Ok(vec![&sampling[0]; n_sources]),
        len if len == n_sources => Ok(sampling.iter().collect()),
        len => Err(TaskError::InvalidSamplingSpec(format!(
            "{} muestreos de {} para {} fuentes",
            len, role, n_sources
        ))),
    }
}

/// `amount` índices distintos en `0..length`, ordenados.
fn sample_indices(rng: &mut StdRng, length: usize, amount: usize, name: &str) -> Result<Vec<usize>> {
    if amount > length {
        return Err(TaskError::InvalidSamplingSpec(format!(
            "fuente `{}`: se pidieron {} puntos pero sólo hay {}",
            name, amount, length
        )));
    }
    let mut idx = rand::seq::index::sample(rng, length, amount).into_vec();
    idx.sort_unstable();
    Ok(idx)
}

fn check_coords(x: &Array2<f64>, name: &str) -> Result<()> {
    if x.nrows() != 2 {
        return Err(TaskError::InvalidSamplingSpec(format!(
            "fuente `{}`: coordenadas explícitas deben tener forma (2, K), tienen {} filas",
            name,
            x.nrows()
        )));
    }
    Ok(())
}

fn sample_gridded(
    src: &GriddedSource,
    time: DateTime<Utc>,
    sampling: &Sampling,
    rng: &mut StdRng,
) -> Result<CoordinatePairSet> {
    let slice = src.slice_at(time)?;
    let n_dims = src.n_dims();
    let cols = src.x2.len();

    match sampling {
        Sampling::All => {
            CoordinatePairSet::gridded(src.x1.clone(), src.x2.clone(), slice.to_owned())
        }
        Sampling::Count(n) => {
            let idx = sample_indices(rng, src.x1.len() * cols, *n, &src.name)?;
            let x = Array2::from_shape_fn((2, idx.len()), |(k, j)| {
                if k == 0 {
                    src.x1[idx[j] / cols]
                } else {
                    src.x2[idx[j] % cols]
                }
            });
            let y = Array2::from_shape_fn((n_dims, idx.len()), |(v, j)| {
                slice[[v, idx[j] / cols, idx[j] % cols]]
            });
            CoordinatePairSet::flat(x, y)
        }
        Sampling::Coords(x) => {
            check_coords(x, &src.name)?;
            let cells: Vec<(usize, usize)> = x
                .axis_iter(Axis(1))
                .map(|p| (nearest_index(&src.x1, p[0]), nearest_index(&src.x2, p[1])))
                .collect();
            let y = Array2::from_shape_fn((n_dims, cells.len()), |(v, j)| {
                slice[[v, cells[j].0, cells[j].1]]
            });
            CoordinatePairSet::flat(x.clone(), y)
        }
    }
}

fn sample_scattered(
    src: &ScatteredSource,
    time: DateTime<Utc>,
    sampling: &Sampling,
    rng: &mut StdRng,
    tolerance: f64,
) -> Result<CoordinatePairSet> {
    let available = src.at(time);

    let chosen = match sampling {
        Sampling::All => available,
        Sampling::Count(n) => sample_indices(rng, available.len(), *n, &src.name)?
            .into_iter()
            .map(|i| available[i])
            .collect(),
        Sampling::Coords(x) => {
            check_coords(x, &src.name)?;
            x.axis_iter(Axis(1))
                .map(|p| {
                    available
                        .iter()
                        .copied()
                        .find(|o| (o.x1 - p[0]).abs() <= tolerance && (o.x2 - p[1]).abs() <= tolerance)
                        .ok_or_else(|| {
                            TaskError::InvalidSamplingSpec(format!(
                                "fuente `{}`: no hay observación en ({}, {}) para {}",
                                src.name, p[0], p[1], time
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let x = Array2::from_shape_fn((2, chosen.len()), |(k, j)| {
        if k == 0 {
            chosen[j].x1
        } else {
            chosen[j].x2
        }
    });
    let y = Array2::from_shape_fn((src.n_dims(), chosen.len()), |(v, j)| chosen[j].values[v]);
    CoordinatePairSet::flat(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use crate::pair::CoordsShape;
    use crate::source::Observation;
    use chrono::TimeZone;
    use ndarray::{arr2, Array, Array4};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 1, 0, 0, 0).unwrap()
    }

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 2, 0, 0, 0).unwrap()
    }

    fn seeded() -> LoaderConfig {
        LoaderConfig {
            seed: Some(42),
            ..LoaderConfig::default()
        }
    }

    /// Grilla 3×4 con 2 variables; valor = 1000 t + 100 v + 10 r + c.
    fn era5() -> Source {
        let data = Array4::from_shape_fn((2, 2, 3, 4), |(t, v, r, c)| {
            (1000 * t + 100 * v + 10 * r + c) as f64
        });
        Source::Gridded(
            GriddedSource::new(
                "era5",
                vec!["t2m".into(), "sp".into()],
                vec![t0(), t1()],
                Array::linspace(50.0, 52.0, 3),
                Array::linspace(0.0, 3.0, 4),
                data,
            )
            .unwrap(),
        )
    }

    fn stations() -> Source {
        let mut obs = Vec::new();
        for i in 0..5 {
            obs.push(Observation {
                time: t0(),
                x1: 50.0 + i as f64 * 0.1,
                x2: i as f64,
                values: vec![i as f64],
            });
        }
        obs.push(Observation {
            time: t1(),
            x1: 51.0,
            x2: 1.0,
            values: vec![-1.0],
        });
        Source::Scattered(ScatteredSource::new("stations", vec!["t2m".into()], obs).unwrap())
    }

    #[test]
    fn sampling_se_parsea_desde_texto() {
        assert_eq!(parse_sampling("all, 10").unwrap(), vec![Sampling::All, Sampling::Count(10)]);
        assert!(matches!(
            "mitad".parse::<Sampling>(),
            Err(TaskError::InvalidSamplingSpec(_))
        ));
    }

    #[test]
    fn all_sobre_grilla_conserva_la_grilla() {
        let loader = TaskLoader::new(vec![era5(), stations()], vec![stations()], seeded());
        let task = loader
            .task(t0(), &[Sampling::All], &[Sampling::All])
            .unwrap();

        assert_eq!(task.time(), t0());
        assert!(task.ops().is_empty());
        assert_eq!(
            task.context()[0].coords_shape(),
            CoordsShape::Gridded(vec![1, 3], vec![1, 4])
        );
        assert_eq!(task.context()[0].values_shape(), vec![2, 3, 4]);
        assert_eq!(task.context()[1].num_observations(), 5);
        assert_eq!(task.target()[0].values_shape(), vec![1, 5]);
    }

    #[test]
    fn count_submuestrea_sin_reemplazo() {
        let loader = TaskLoader::new(vec![era5(), stations()], vec![], seeded());
        let task = loader
            .task(t0(), &[Sampling::Count(7), Sampling::Count(3)], &[])
            .unwrap();

        let grid = &task.context()[0];
        assert!(!grid.is_gridded());
        assert_eq!(grid.values_shape(), vec![2, 7]);

        // puntos distintos, y cada valor corresponde a su celda
        let y = grid.values().view();
        let mut seen: Vec<i64> = y.index_axis(Axis(0), 0).iter().map(|v| *v as i64).collect();
        seen.dedup();
        assert_eq!(seen.len(), 7);
        for v in y.index_axis(Axis(0), 1).iter() {
            assert!(*v >= 100.0 && *v < 200.0);
        }

        assert_eq!(task.context()[1].num_observations(), 3);
    }

    #[test]
    fn count_mayor_a_lo_disponible_falla() {
        let loader = TaskLoader::new(vec![stations()], vec![], seeded());
        let err = loader.task(t0(), &[Sampling::Count(6)], &[]).unwrap_err();
        assert!(matches!(err, TaskError::InvalidSamplingSpec(_)));

        let loader = TaskLoader::new(vec![era5()], vec![], seeded());
        let err = loader.task(t0(), &[Sampling::Count(13)], &[]).unwrap_err();
        assert!(matches!(err, TaskError::InvalidSamplingSpec(_)));
    }

    #[test]
    fn misma_semilla_mismo_task() {
        let loader = TaskLoader::new(vec![era5(), stations()], vec![], seeded());
        let sampling = [Sampling::Count(5), Sampling::Count(2)];
        let a = loader.task(t0(), &sampling, &[]).unwrap();
        let b = loader.task(t0(), &sampling, &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn coords_explicitas_en_grilla_usan_la_celda_mas_cercana() {
        let loader = TaskLoader::new(vec![], vec![era5()], seeded());
        let x = arr2(&[[50.1, 51.9], [2.9, 0.2]]);
        let task = loader.task(t1(), &[], &[Sampling::Coords(x.clone())]).unwrap();

        let set = &task.target()[0];
        assert_eq!(set.values().view()[[0, 0]], 1003.0);
        assert_eq!(set.values().view()[[1, 1]], 1120.0);
        assert_eq!(set.coords_shape(), CoordsShape::Flat(vec![2, 2]));
    }

    #[test]
    fn coords_explicitas_en_estaciones_requieren_coincidencia() {
        let loader = TaskLoader::new(vec![stations()], vec![], seeded());
        let x = arr2(&[[50.2], [2.0]]);
        let task = loader.task(t0(), &[Sampling::Coords(x)], &[]).unwrap();
        assert_eq!(task.context()[0].values().view()[[0, 0]], 2.0);

        let missing = arr2(&[[49.0], [2.0]]);
        let err = loader
            .task(t0(), &[Sampling::Coords(missing)], &[])
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidSamplingSpec(_)));
    }

    #[test]
    fn lista_de_muestreo_con_largo_incorrecto_falla() {
        let loader = TaskLoader::new(vec![era5(), stations(), stations()], vec![], seeded());
        let err = loader
            .task(t0(), &[Sampling::All, Sampling::All], &[])
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidSamplingSpec(_)));
    }

    #[test]
    fn fecha_sin_grilla_falla() {
        let loader = TaskLoader::new(vec![era5()], vec![], seeded());
        let t = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            loader.task(t, &[Sampling::All], &[]),
            Err(TaskError::TimeNotFound { .. })
        ));
    }

    #[test]
    fn times_intersecta_las_grillas() {
        let loader = TaskLoader::new(vec![era5(), stations()], vec![], seeded());
        assert_eq!(loader.times(), vec![t0(), t1()]);

        let only_stations = TaskLoader::new(vec![stations()], vec![], seeded());
        assert_eq!(only_stations.times(), vec![t0(), t1()]);
    }

    #[test]
    fn all_aplanado_equivale_a_coords_explicitas() {
        let loader = TaskLoader::new(vec![era5()], vec![], seeded());

        let mut gridded = loader.task(t0(), &[Sampling::All], &[]).unwrap();
        gridded.flatten_gridded_data().unwrap();
        assert_eq!(gridded.ops(), &[Op::GriddedDataFlattened]);

        let crate::pair::Coords::Flat { x } = gridded.context()[0].coords() else {
            panic!("se esperaba layout plano");
        };
        let x = x.view().into_dimensionality::<ndarray::Ix2>().unwrap().to_owned();
        let explicit = loader.task(t0(), &[Sampling::Coords(x)], &[]).unwrap();

        assert_eq!(explicit.context()[0].num_observations(), 12);
        assert_eq!(gridded.context()[0], explicit.context()[0]);
    }
}
