//! Contenedor `Task` para modelos de procesos neuronales sobre datos
//! geoespaciales: conjuntos de contexto/target (en grilla o dispersos), un
//! log de operaciones aplicadas, y el motor de muestreo que los arma.

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod loader;
pub mod ops;
pub mod pair;
pub mod source;
pub mod task;

pub use config::{LoaderConfig, PipelineConfig, SourceSpec};
pub use data::{Data, Tensor};
pub use error::TaskError;
pub use loader::{parse_sampling, Sampling, TaskLoader};
pub use ops::{parse_ops, Op};
pub use pair::{CoordinatePairSet, Coords, CoordsShape};
pub use source::{GriddedSource, Observation, ScatteredSource, Source};
pub use task::{check_unique_times, Task, TaskStructure};
