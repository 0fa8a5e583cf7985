use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_TIME_FORMAT: &str = "%m/%d %I:%M:%S %p";

pub fn experiment_name(save: &str, time: DateTime<Local>) -> String {
    format!("search-{save}-{}", time.format("%Y%m%d-%H%M%S"))
}

/// Creates `root/search-{save}-{timestamp}`. Fails if it already exists.
pub fn create_experiment_dir(root: &Path, save: &str) -> Result<PathBuf> {
    let dir = root.join(experiment_name(save, Local::now()));

    fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    fs::create_dir(&dir)
        .with_context(|| format!("failed to create experiment directory {}", dir.display()))?;

    Ok(dir)
}

pub fn save_config<C: Serialize>(dir: &Path, config: &C) -> Result<()> {
    let path = dir.join("config.json");
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn log_timer() -> ChronoLocal {
    ChronoLocal::new(LOG_TIME_FORMAT.to_string())
}

pub fn stdout_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_timer(log_timer())
        .with_target(false)
        .with_writer(std::io::stdout)
}

/// Plain-text layer for `log.txt`, without ANSI colours.
pub fn file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_timer(log_timer())
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
}

pub fn create_log_file(dir: &Path) -> Result<File> {
    let path = dir.join("log.txt");
    File::create(&path).with_context(|| format!("failed to create {}", path.display()))
}

/// Logs to stdout and to `log.txt` inside the experiment directory.
pub fn init_logging(dir: &Path) -> Result<()> {
    let file = create_log_file(dir)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer())
        .with(file_layer(file))
        .try_init()?;

    Ok(())
}

/// Appends `step,value` lines to one `<tag>.log` file per scalar.
pub struct ScalarWriter {
    dir: PathBuf,
}

impl ScalarWriter {
    pub fn new(experiment_dir: &Path) -> Result<Self> {
        let dir = experiment_dir.join("scalars");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn add_scalar(&self, tag: &str, value: f64, step: usize) -> Result<()> {
        let path = self.path(tag);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{step},{value}")?;

        tracing::debug!("scalar {tag} = {value} at step {step}");
        Ok(())
    }

    pub fn path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.log"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_experiment_name() {
        let time = Local.with_ymd_and_hms(2019, 10, 8, 0, 56, 42).unwrap();
        assert_eq!(experiment_name("EXP", time), "search-EXP-20191008-005642");
    }

    #[test]
    fn test_create_dir_and_config() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_experiment_dir(&root.path().join("runs"), "EXP").unwrap();

        assert!(dir.is_dir());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("search-EXP-"));

        save_config(&dir, &serde_json::json!({ "seed": 5 })).unwrap();
        let saved = fs::read_to_string(dir.join("config.json")).unwrap();
        assert!(saved.contains("\"seed\": 5"));
    }

    #[test]
    fn test_log_file_is_plain_and_timestamped() {
        let dir = tempfile::tempdir().unwrap();
        let file = create_log_file(dir.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(file_layer(file));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("valid_acc 12.500000");
        });

        let text = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        let line = text.lines().next().unwrap();

        assert!(line.ends_with("valid_acc 12.500000"));
        assert!(line.contains("INFO"));
        assert!(!text.contains('\u{1b}'));
        // "%m/%d %I:%M:%S %p" renders as e.g. "10/16 07:34:12 PM"
        let stamp = &line[..17];
        assert_eq!(&stamp[2..3], "/");
        assert!(chrono::NaiveTime::parse_from_str(&stamp[6..], "%I:%M:%S %p").is_ok());
    }

    #[test]
    fn test_scalars_append() {
        let root = tempfile::tempdir().unwrap();
        let writer = ScalarWriter::new(root.path()).unwrap();

        writer.add_scalar("val_loss", 2.5, 0).unwrap();
        writer.add_scalar("val_loss", 1.25, 1).unwrap();

        let text = fs::read_to_string(writer.path("val_loss")).unwrap();
        assert_eq!(text, "0,2.5\n1,1.25\n");
    }
}
