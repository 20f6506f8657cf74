use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use sensortask::config::default_concurrency;
use sensortask::io::{parse_time, write_tasks_jsonl};
use sensortask::{
    check_unique_times, parse_ops, parse_sampling, Op, PipelineConfig, Sampling, Task, TaskLoader,
};

#[derive(Parser)]
#[command(name = "taskctl")]
#[command(about = "Arma tasks de contexto/target a partir de grillas y estaciones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arma el task de una fecha y muestra sus formas
    Inspect {
        /// Archivo JSON del pipeline
        #[arg(long, value_name = "CONFIG")]
        config: PathBuf,

        /// Fecha del task (ej: 2020-06-01 o 2020-06-01T12:00:00Z)
        #[arg(long, value_name = "FECHA")]
        date: String,

        /// Muestreo de contexto, ej: "all,100" (pisa el del archivo)
        #[arg(long)]
        context_sampling: Option<String>,

        /// Muestreo de target (pisa el del archivo)
        #[arg(long)]
        target_sampling: Option<String>,

        /// Operaciones a aplicar, ej: "nans_removed,batch_dim"
        #[arg(long)]
        ops: Option<String>,
    },

    /// Arma un task por fecha en un rango y los guarda en JSONL
    Generate {
        #[arg(long, value_name = "CONFIG")]
        config: PathBuf,

        #[arg(long, value_name = "FECHA")]
        start: String,

        #[arg(long, value_name = "FECHA")]
        end: String,

        #[arg(long, default_value_t = 1)]
        step_days: i64,

        /// Tasks en paralelo (default: SENSORTASK_CONCURRENCY o 4)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Ruta de salida JSONL
        #[arg(long, value_name = "SALIDA")]
        output: PathBuf,
    },

    /// Lista las operaciones disponibles
    Ops,
}

/// Muestreo y operaciones resueltos: los flags de la línea de comandos
/// pisan lo que diga el archivo.
struct Plan {
    context_sampling: Vec<Sampling>,
    target_sampling: Vec<Sampling>,
    ops: Vec<Op>,
}

impl Plan {
    fn resolve(
        cfg: &PipelineConfig,
        context_sampling: Option<&str>,
        target_sampling: Option<&str>,
        ops: Option<&str>,
    ) -> Result<Self> {
        let context_sampling = match context_sampling {
            Some(s) => parse_sampling(s)?,
            None => cfg.context_sampling()?,
        };
        let target_sampling = match target_sampling {
            Some(s) => parse_sampling(s)?,
            None => cfg.target_sampling()?,
        };
        let ops = match ops {
            Some(s) => parse_ops(s)?,
            None => cfg.ops.clone(),
        };
        Ok(Self {
            context_sampling,
            target_sampling,
            ops,
        })
    }

    fn build(&self, loader: &TaskLoader, time: DateTime<Utc>) -> Result<Task> {
        let mut task = loader.task(time, &self.context_sampling, &self.target_sampling)?;
        task.apply_all(&self.ops)?;
        Ok(task)
    }
}

/// Carga la configuración y todas sus fuentes. Las rutas relativas se
/// resuelven contra la carpeta del archivo.
fn load_pipeline(path: &Path) -> Result<(PipelineConfig, TaskLoader)> {
    let cfg = PipelineConfig::load(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let loader = cfg
        .build_loader(base_dir)
        .with_context(|| format!("no se pudieron cargar las fuentes de {}", path.display()))?;
    info!(
        "pipeline cargado: {} fuentes de contexto, {} de target, {} fechas",
        loader.context_sources().len(),
        loader.target_sources().len(),
        loader.times().len()
    );
    Ok((cfg, loader))
}

/// Fechas `start, start + step, ...` hasta `end` inclusive.
fn dates_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_days: i64,
) -> Result<Vec<DateTime<Utc>>> {
    if step_days <= 0 {
        bail!("--step-days debe ser positivo (recibido {})", step_days);
    }
    if end < start {
        bail!("rango vacío: {} es anterior a {}", end, start);
    }
    let step = Duration::days(step_days);
    let mut out = Vec::new();
    let mut t = start;
    while t <= end {
        out.push(t);
        t += step;
    }
    Ok(out)
}

async fn generate(
    loader: TaskLoader,
    plan: Plan,
    dates: Vec<DateTime<Utc>>,
    concurrency: usize,
) -> Result<Vec<Task>> {
    let loader = Arc::new(loader);
    let plan = Arc::new(plan);
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));

    let mut handles = Vec::with_capacity(dates.len());
    for time in dates {
        let permit = sem.clone().acquire_owned().await?;
        let loader = loader.clone();
        let plan = plan.clone();

        handles.push(tokio::spawn(async move {
            let res = tokio::task::spawn_blocking(move || plan.build(&loader, time)).await;
            drop(permit);
            (time, res)
        }));
    }

    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        let (time, res) = handle.await?;
        match res {
            Ok(Ok(task)) => tasks.push(task),
            Ok(Err(e)) => bail!("no se pudo armar el task de {}: {:#}", time, e),
            Err(e) => bail!("panic o join error armando el task de {}: {:?}", time, e),
        }
    }

    tasks.sort_by_key(|t| t.time());
    check_unique_times(&tasks)?;
    Ok(tasks)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            config,
            date,
            context_sampling,
            target_sampling,
            ops,
        } => {
            let (cfg, loader) = load_pipeline(&config)?;
            let plan = Plan::resolve(
                &cfg,
                context_sampling.as_deref(),
                target_sampling.as_deref(),
                ops.as_deref(),
            )?;
            let time = parse_time(&date)?;

            let task = plan.build(&loader, time)?;
            print!("{}", task);
        }

        Commands::Generate {
            config,
            start,
            end,
            step_days,
            concurrency,
            output,
        } => {
            let (cfg, loader) = load_pipeline(&config)?;
            let plan = Plan::resolve(&cfg, None, None, None)?;
            let concurrency = concurrency.unwrap_or_else(default_concurrency);

            let available: BTreeSet<DateTime<Utc>> = loader.times().into_iter().collect();
            let (dates, missing): (Vec<_>, Vec<_>) =
                dates_between(parse_time(&start)?, parse_time(&end)?, step_days)?
                    .into_iter()
                    .partition(|t| available.contains(t));
            for t in &missing {
                warn!("sin datos para {}; se omite", t);
            }
            if dates.is_empty() {
                bail!("ninguna fecha del rango tiene datos");
            }

            info!(
                "armando {} tasks con concurrency={}",
                dates.len(),
                concurrency
            );
            let tasks = generate(loader, plan, dates, concurrency).await?;
            write_tasks_jsonl(&output, &tasks)?;

            println!("Tasks generados: {}", tasks.len());
            println!("  omitidos: {}", missing.len());
            println!("  salida  : {}", output.display());
        }

        Commands::Ops => {
            for op in Op::ALL {
                let note = if op.changes_shape() {
                    ""
                } else {
                    " (va al final)"
                };
                println!("{}{}", op, note);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::{Array, Array4};
    use sensortask::{GriddedSource, LoaderConfig, Source};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, d, 0, 0, 0).unwrap()
    }

    fn loader(days: &[u32]) -> TaskLoader {
        let times: Vec<_> = days.iter().map(|&d| day(d)).collect();
        let data = Array4::from_shape_fn((times.len(), 1, 2, 3), |(t, _, r, c)| {
            (t * 100 + r * 10 + c) as f64
        });
        let src = GriddedSource::new(
            "era5",
            vec!["t2m".into()],
            times,
            Array::linspace(0.0, 1.0, 2),
            Array::linspace(0.0, 2.0, 3),
            data,
        )
        .unwrap();
        let config = LoaderConfig {
            seed: Some(3),
            ..LoaderConfig::default()
        };
        TaskLoader::new(vec![Source::Gridded(src)], vec![], config)
    }

    #[test]
    fn dates_between_incluye_ambos_extremos() {
        let dates = dates_between(day(1), day(7), 3).unwrap();
        assert_eq!(dates, vec![day(1), day(4), day(7)]);
        assert!(dates_between(day(1), day(7), 0).is_err());
        assert!(dates_between(day(7), day(1), 1).is_err());
    }

    #[test]
    fn plan_flags_pisan_el_archivo() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"context": [], "context_sampling": ["all"], "ops": ["batch_dim"]}"#,
        )
        .unwrap();

        let plan = Plan::resolve(&cfg, Some("10"), None, Some("tensor")).unwrap();
        assert_eq!(plan.context_sampling, vec![Sampling::Count(10)]);
        assert_eq!(plan.target_sampling, vec![Sampling::All]);
        assert_eq!(plan.ops, vec![Op::Tensor]);

        let plan = Plan::resolve(&cfg, None, None, None).unwrap();
        assert_eq!(plan.ops, vec![Op::BatchDim]);
    }

    #[tokio::test]
    async fn generate_devuelve_tasks_ordenados_por_fecha() {
        let plan = Plan {
            context_sampling: vec![Sampling::Count(4)],
            target_sampling: vec![],
            ops: vec![Op::NansRemoved, Op::BatchDim],
        };
        let dates = vec![day(3), day(1), day(2)];

        let tasks = generate(loader(&[1, 2, 3]), plan, dates, 2).await.unwrap();

        let times: Vec<_> = tasks.iter().map(|t| t.time()).collect();
        assert_eq!(times, vec![day(1), day(2), day(3)]);
        for task in &tasks {
            assert_eq!(task.ops(), &[Op::NansRemoved, Op::BatchDim]);
            assert_eq!(task.context()[0].values_shape(), vec![1, 1, 4]);
        }
    }

    #[tokio::test]
    async fn generate_rechaza_fechas_repetidas() {
        let plan = Plan {
            context_sampling: vec![Sampling::All],
            target_sampling: vec![],
            ops: vec![],
        };
        let err = generate(loader(&[1]), plan, vec![day(1), day(1)], 4)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fechas distintas"));
    }

    #[tokio::test]
    async fn generate_propaga_errores_del_pipeline() {
        let plan = Plan {
            context_sampling: vec![Sampling::All],
            target_sampling: vec![],
            ops: vec![Op::Tensor, Op::BatchDim],
        };
        assert!(generate(loader(&[1]), plan, vec![day(1)], 1).await.is_err());
    }
}
