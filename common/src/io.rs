use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use glob::glob;
use tracing::info;

use crate::config::{LoaderConfig, SourceSpec};
use crate::source::{GriddedSource, Observation, ScatteredSource, Source};
use crate::task::Task;

/* =========================
   Fechas
   ========================= */

/// Acepta RFC 3339, "YYYY-MM-DD HH:MM:SS" o "YYYY-MM-DD" (medianoche UTC).
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(anyhow!("fecha inválida: `{}`", s))
}

/* =========================
   Lectura de fuentes
   ========================= */

/// Lee una tabla de estaciones: columnas de fecha, `x1`, `x2` (según
/// `cfg`) y el resto son variables. Celdas vacías se leen como NaN.
pub fn read_station_csv(path: &Path, name: &str, cfg: &LoaderConfig) -> Result<ScatteredSource> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("no se pudo abrir {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        // Limpia BOM por si viene de Excel/Windows
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let col = |wanted: &str| {
        headers
            .iter()
            .position(|h| h == wanted)
            .ok_or_else(|| anyhow!("{}: falta la columna `{}`", path.display(), wanted))
    };
    let time_col = col(&cfg.time_name)?;
    let x1_col = col(&cfg.x1_name)?;
    let x2_col = col(&cfg.x2_name)?;

    let var_cols: Vec<usize> = (0..headers.len())
        .filter(|i| ![time_col, x1_col, x2_col].contains(i))
        .collect();
    let variables: Vec<String> = var_cols.iter().map(|&i| headers[i].clone()).collect();

    let mut observations = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();
        let number = |i: usize| -> Result<f64> {
            let raw = field(i);
            if raw.is_empty() {
                return Ok(f64::NAN);
            }
            raw.parse::<f64>().with_context(|| {
                format!("{} fila {}: valor no numérico `{}`", path.display(), line + 2, raw)
            })
        };

        observations.push(Observation {
            time: parse_time(field(time_col))
                .with_context(|| format!("{} fila {}", path.display(), line + 2))?,
            x1: number(x1_col)?,
            x2: number(x2_col)?,
            values: var_cols.iter().map(|&i| number(i)).collect::<Result<_>>()?,
        });
    }

    Ok(ScatteredSource::new(name, variables, observations)?)
}

/// Junta todos los CSV que hagan match con `pattern` en una sola fuente.
/// Todos tienen que tener las mismas variables.
pub fn read_station_glob(pattern: &str, name: &str, cfg: &LoaderConfig) -> Result<ScatteredSource> {
    let mut merged: Option<ScatteredSource> = None;

    for entry in glob(pattern).with_context(|| format!("patrón inválido `{}`", pattern))? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let src = read_station_csv(&path, name, cfg)?;
        match merged.as_mut() {
            None => merged = Some(src),
            Some(acc) => {
                if acc.variables != src.variables {
                    bail!(
                        "{}: variables {:?} distintas de {:?}",
                        path.display(),
                        src.variables,
                        acc.variables
                    );
                }
                acc.observations.extend(src.observations);
            }
        }
    }

    let src = merged.ok_or_else(|| anyhow!("ningún archivo coincide con `{}`", pattern))?;
    info!(
        "fuente `{}`: {} observaciones desde `{}`",
        name,
        src.observations.len(),
        pattern
    );
    Ok(src)
}

pub fn read_gridded_json(path: &Path) -> Result<GriddedSource> {
    let file = File::open(path).with_context(|| format!("no se pudo abrir {}", path.display()))?;
    let src: GriddedSource = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("grilla inválida en {}", path.display()))?;
    src.validate()?;
    info!(
        "fuente `{}`: {} fechas, grilla {}x{}",
        src.name,
        src.times.len(),
        src.x1.len(),
        src.x2.len()
    );
    Ok(src)
}

pub fn load_source(spec: &SourceSpec, base_dir: &Path, cfg: &LoaderConfig) -> Result<Source> {
    match spec {
        SourceSpec::Gridded { path } => {
            Ok(Source::Gridded(read_gridded_json(&base_dir.join(path))?))
        }
        SourceSpec::Stations { name, path } => {
            let pattern = base_dir.join(path).to_string_lossy().to_string();
            Ok(Source::Scattered(read_station_glob(&pattern, name, cfg)?))
        }
    }
}

/* =========================
   Tasks en JSONL
   ========================= */

/// Escribe un task por línea; crea la carpeta de salida si hace falta.
pub fn write_tasks_jsonl(path: &Path, tasks: &[Task]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for task in tasks {
        serde_json::to_writer(&mut writer, task)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_tasks_jsonl(path: &Path) -> Result<Vec<Task>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let task: Task = serde_json::from_str(&line)
            .with_context(|| format!("{} línea {}", path.display(), i + 1))?;
        out.push(task);
    }

    Ok(out)
}
