use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::io;
use crate::loader::{Sampling, TaskLoader};
use crate::ops::Op;
use crate::source::Source;

pub const ENV_SEED: &str = "SENSORTASK_SEED";
pub const ENV_X1_NAME: &str = "SENSORTASK_X1_NAME";
pub const ENV_X2_NAME: &str = "SENSORTASK_X2_NAME";
pub const ENV_CONCURRENCY: &str = "SENSORTASK_CONCURRENCY";

const DEFAULT_CONCURRENCY: usize = 4;

/// Configuración del muestreo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Nombre de la columna del primer eje espacial (ej: "lat").
    pub x1_name: String,
    /// Nombre de la columna del segundo eje espacial (ej: "lon").
    pub x2_name: String,
    pub time_name: String,
    /// Semilla del submuestreo; sin semilla cada corrida es distinta.
    pub seed: Option<u64>,
    /// Tolerancia para encontrar coordenadas explícitas en estaciones.
    pub coord_tolerance: f64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            x1_name: "x1".to_string(),
            x2_name: "x2".to_string(),
            time_name: "time".to_string(),
            seed: None,
            coord_tolerance: 1e-6,
        }
    }
}

impl LoaderConfig {
    /// Defaults + variables de entorno.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Las variables SENSORTASK_* pisan lo que venga del archivo.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(seed) = env::var(ENV_SEED).ok().and_then(|s| s.parse::<u64>().ok()) {
            self.seed = Some(seed);
        }
        if let Ok(name) = env::var(ENV_X1_NAME) {
            self.x1_name = name;
        }
        if let Ok(name) = env::var(ENV_X2_NAME) {
            self.x2_name = name;
        }
        self
    }
}

/// Cantidad de tasks a construir en paralelo.
/// Se puede sobreescribir con la env var SENSORTASK_CONCURRENCY.
pub fn default_concurrency() -> usize {
    env::var(ENV_CONCURRENCY)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CONCURRENCY)
}

/// De dónde sale cada conjunto de contexto o target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Archivo JSON con un `GriddedSource`.
    Gridded { path: String },
    /// Uno o más CSV de estaciones; `path` admite glob, ej: "stations/*.csv".
    Stations { name: String, path: String },
}

fn default_sampling() -> Vec<String> {
    vec!["all".to_string()]
}

/// Archivo de configuración del pipeline: fuentes, muestreo por defecto y
/// operaciones a aplicar a cada task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub loader: LoaderConfig,
    pub context: Vec<SourceSpec>,
    #[serde(default)]
    pub target: Vec<SourceSpec>,
    #[serde(default = "default_sampling")]
    pub context_sampling: Vec<String>,
    #[serde(default = "default_sampling")]
    pub target_sampling: Vec<String>,
    #[serde(default)]
    pub ops: Vec<Op>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("no se pudo leer la configuración {}", path.display()))?;
        let mut cfg: PipelineConfig = serde_json::from_str(&text)
            .with_context(|| format!("configuración inválida en {}", path.display()))?;
        cfg.loader = cfg.loader.with_env_overrides();
        Ok(cfg)
    }

    pub fn context_sampling(&self) -> Result<Vec<Sampling>> {
        parse_tokens(&self.context_sampling)
    }

    pub fn target_sampling(&self) -> Result<Vec<Sampling>> {
        parse_tokens(&self.target_sampling)
    }

    /// Lee todas las fuentes; rutas relativas se resuelven contra `base_dir`
    /// (normalmente el directorio del archivo de configuración).
    pub fn build_loader(&self, base_dir: &Path) -> Result<TaskLoader> {
        let load_all = |specs: &[SourceSpec]| -> Result<Vec<Source>> {
            specs
                .iter()
                .map(|spec| io::load_source(spec, base_dir, &self.loader))
                .collect()
        };
        Ok(TaskLoader::new(
            load_all(&self.context)?,
            load_all(&self.target)?,
            self.loader.clone(),
        ))
    }
}

fn parse_tokens(tokens: &[String]) -> Result<Vec<Sampling>> {
    tokens
        .iter()
        .map(|t| t.parse::<Sampling>().map_err(anyhow::Error::from))
        .collect()
}
