use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::Mutex,
    time::Instant,
};

use anyhow::{anyhow, ensure, Context, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*};
use thiserror::Error;

use crate::{
    cli::Args,
    data::{ImageBatch, ImageBatcher, ImageFolder},
    experiment::ScalarWriter,
    graph::{graph_files, read_graph_info, GraphInfo},
    metrics::{accuracy, AverageMeter},
    model::{RandWire, RandWireConfig},
};

pub const NUM_CLASSES: usize = 1000;

/// Serialises panic hook swaps between concurrent device checks.
static PANIC_HOOK: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
#[error("no gpu device available")]
pub struct NoDeviceError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    /// Top-1 accuracy in percent.
    pub top1: f64,
    /// Top-5 accuracy in percent.
    pub top5: f64,
    pub loss: f64,
    /// Seconds of forward pass per image.
    pub speed: f64,
    pub samples: usize,
}

/// Formats like C's `%e`: six decimals and a signed two-digit exponent.
pub fn scientific(value: f64) -> String {
    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exponent) => {
                let sign = if exponent < 0 { '-' } else { '+' };
                format!("{mantissa}e{sign}{:02}", exponent.abs())
            }
            Err(_) => formatted,
        },
        // inf and NaN have no exponent
        None => formatted,
    }
}

/// Runs the model once over `batches`, without tracking gradients.
pub fn infer<B: Backend>(
    batches: impl Iterator<Item = ImageBatch<B>>,
    model: &RandWire<B>,
    device: &B::Device,
    report_freq: usize,
) -> Result<EvalSummary> {
    ensure!(report_freq > 0, "report frequency must be positive");

    let mut objs = AverageMeter::new();
    let mut top1 = AverageMeter::new();
    let mut top5 = AverageMeter::new();
    let mut speed = AverageMeter::new();

    for (step, batch) in batches.enumerate() {
        let n = batch.labels.len();
        let labels = batch.labels.clone();

        B::sync(device);
        let tic = Instant::now();
        let output = model.forward_classification(batch);
        B::sync(device);
        let elapsed = tic.elapsed().as_secs_f64();

        let num_classes = output.logits.dims()[1];
        let logits = output
            .logits
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("failed to read logits: {err:?}"))?;
        let precision = accuracy(&logits, num_classes, &labels, &[1, 5])?;
        let (prec1, prec5) = (precision[0], precision[1]);
        let loss = output.loss.into_scalar().elem::<f64>();

        objs.update(loss, n);
        top1.update(prec1, n);
        top5.update(prec5, n);
        speed.update(elapsed / n as f64, n);

        if step % report_freq == 0 {
            tracing::info!(
                "valid {step:03} {} {:.6} {:.6} {:.6}",
                scientific(objs.avg()),
                top1.avg(),
                top5.avg(),
                speed.avg()
            );
        }
    }

    Ok(EvalSummary {
        top1: top1.avg(),
        top5: top5.avg(),
        loss: objs.avg(),
        speed: speed.avg(),
        samples: objs.count(),
    })
}

/// Whether a trivial computation succeeds on `device`.
///
/// Backends panic when they cannot open the device, so the check runs under
/// `catch_unwind` with the panic hook silenced for its duration.
pub fn device_available<B: Backend>(device: &B::Device) -> bool {
    let _guard = PANIC_HOOK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        Tensor::<B, 1>::zeros([1], device).into_data();
    }));

    panic::set_hook(hook);
    result.is_ok()
}

fn load_graphs(prefix: &str, small_regime: bool) -> Result<Vec<GraphInfo>> {
    graph_files(prefix, small_regime)
        .into_iter()
        .map(|path| {
            let graph = read_graph_info(&path)
                .with_context(|| format!("failed to load graph {}", path.display()))?;
            tracing::info!(
                "graph {}: {} nodes, {} edges",
                path.display(),
                graph.nodes.len(),
                graph.edge_count()
            );
            Ok(graph)
        })
        .collect()
}

/// Evaluates the model described by `args` `args.epochs` times, logging into `dir`.
///
/// Fails with [`NoDeviceError`] before touching any file when `device` cannot be used.
pub fn run<B: Backend>(args: &Args, dir: &Path, device: B::Device) -> Result<Vec<EvalSummary>> {
    if !device_available::<B>(&device) {
        return Err(NoDeviceError.into());
    }
    ensure!(args.batch_size > 0, "batch size must be positive");

    B::seed(args.seed);
    tracing::info!("gpu device = {}", args.gpu);
    tracing::info!("small regime or regular regime = {}", args.regime);
    tracing::info!("args = {args:?}");

    let graphs = load_graphs(&args.graph_txt, args.regime)?;

    let config = RandWireConfig::new(args.base_channels, NUM_CLASSES)
        .with_output_channels(args.output_channels)
        .with_small_regime(args.regime);
    let mut model: RandWire<B> = config.init(&graphs, &device)?;
    match &args.checkpoint {
        Some(path) => {
            model = model.load_checkpoint(path, &device)?;
            tracing::info!("loaded weights from {}", path.display());
        }
        None => tracing::warn!("no checkpoint given, evaluating randomly initialized weights"),
    }

    tracing::info!("param size = {:.6}MB", model.param_size_mb());
    tracing::info!(
        "FLOPs = {:.6}GB",
        config.flops(&graphs, args.image_size)? as f64 / 1e9
    );

    if args.train_flag {
        let train = ImageFolder::index(&args.data.join("train"), args.image_size)?;
        tracing::info!("train images = {}", train.entries().len());
    }
    let valid = ImageFolder::index(&args.data.join("val"), args.image_size)?;
    ensure!(
        valid.classes().len() <= NUM_CLASSES,
        "dataset has {} classes but the model predicts {NUM_CLASSES}",
        valid.classes().len()
    );
    tracing::info!(
        "valid images = {}, classes = {}",
        valid.entries().len(),
        valid.classes().len()
    );

    let mut builder =
        DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), args.image_size))
            .batch_size(args.batch_size);
    if args.workers > 0 {
        builder = builder.num_workers(args.workers);
    }
    let valid_queue = builder.build(valid);

    let writer = ScalarWriter::new(dir)?;
    let mut summaries = Vec::with_capacity(args.epochs);

    for epoch in 0..args.epochs {
        let summary = infer(valid_queue.iter(), &model, &device, args.report_freq)?;
        tracing::info!("valid_acc {:.6}", summary.top1);
        tracing::info!("valid_speed_per_image {:.6}", summary.speed);

        writer.add_scalar("val_loss", summary.loss, epoch)?;
        writer.add_scalar("val_top1", summary.top1, epoch)?;
        writer.add_scalar("val_top5", summary.top5, epoch)?;
        writer.add_scalar("val_speed", summary.speed, epoch)?;

        summaries.push(summary);
    }

    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use burn::{
        backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
        record::CompactRecorder,
    };
    use clap::Parser;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::graph::write_graph_info;

    fn chain(len: usize) -> GraphInfo {
        let edges: Vec<_> = (1..len).map(|i| (i - 1, i)).collect();
        GraphInfo::from_undirected(len, &edges).unwrap()
    }

    #[test]
    fn test_infer_averages_over_batches() {
        let device = Default::default();
        let model = RandWireConfig::new(4, 3)
            .with_output_channels(8)
            .init::<NdArray>(&vec![chain(2); 3], &device)
            .unwrap();

        let batch = |labels: Vec<usize>| ImageBatch::<NdArray> {
            images: Tensor::zeros([labels.len(), 3, 16, 16], &device),
            targets: Tensor::from_ints(
                labels.iter().map(|&l| l as i32).collect::<Vec<_>>().as_slice(),
                &device,
            ),
            labels,
        };
        let batches = vec![batch(vec![0, 1, 2]), batch(vec![1])];

        let summary = infer(batches.into_iter(), &model, &device, 1).unwrap();

        // three classes, so top-5 covers everything
        assert_eq!(summary.top5, 100.0);
        assert!((0.0..=100.0).contains(&summary.top1));
        assert!(summary.loss > 0.0);
        assert!(summary.speed >= 0.0);
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn test_infer_rejects_zero_report_freq() {
        let device = Default::default();
        let model = RandWireConfig::new(4, 3)
            .with_output_channels(8)
            .init::<NdArray>(&vec![chain(2); 3], &device)
            .unwrap();

        assert!(infer(std::iter::empty(), &model, &device, 0).is_err());
    }

    #[test]
    fn test_scientific_matches_c_exponent() {
        assert_eq!(scientific(2.302585), "2.302585e+00");
        assert_eq!(scientific(0.000123), "1.230000e-04");
        assert_eq!(scientific(-12345.678), "-1.234568e+04");
        assert_eq!(scientific(1e120), "1.000000e+120");
        assert_eq!(scientific(0.0), "0.000000e+00");
    }

    /// Writes small-regime chain graphs and a two-class `data/val` tree under
    /// `root`, returning the matching command line.
    fn fixture(root: &Path) -> Vec<String> {
        let prefix = root.join("chain_");
        for stage in [3, 4, 5] {
            write_graph_info(&chain(3), format!("{}{stage}.txt", prefix.display())).unwrap();
        }
        for (class, color) in [("cat", [200, 10, 10]), ("dog", [10, 200, 10])] {
            let dir = root.join("data/val").join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..3 {
                RgbImage::from_pixel(20, 18, Rgb(color))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }

        [
            "randwire-eval",
            "--data",
            &root.join("data").display().to_string(),
            "--graph_txt",
            &prefix.display().to_string(),
            "--base_channels",
            "4",
            "--output_channels",
            "8",
            "--batch_size",
            "4",
            "--report_freq",
            "1",
            "--workers",
            "0",
            "--image_size",
            "16",
        ]
        .map(String::from)
        .to_vec()
    }

    fn fixture_config() -> RandWireConfig {
        RandWireConfig::new(4, NUM_CLASSES).with_output_channels(8)
    }

    #[test]
    fn test_run_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let mut argv = fixture(root.path());
        argv.extend(["--epochs", "2"].map(String::from));
        let out = root.path().join("out");
        fs::create_dir(&out).unwrap();

        let args = Args::parse_from(argv);
        let summaries = run::<NdArray>(&args, &out, Default::default()).unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].samples, 6);
        // same data, same weights, same metrics
        assert_eq!(summaries[0].top1, summaries[1].top1);
        assert_eq!(summaries[0].top5, summaries[1].top5);

        let losses = fs::read_to_string(out.join("scalars/val_loss.log")).unwrap();
        assert_eq!(losses.lines().count(), 2);
        assert!(losses.starts_with("0,"));
    }

    #[test]
    fn test_run_with_checkpoint() {
        let root = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let weights = root.path().join("weights");
        fixture_config()
            .init::<NdArray>(&vec![chain(3); 3], &device)
            .unwrap()
            .save_file(weights.clone(), &CompactRecorder::new())
            .unwrap();

        let mut argv = fixture(root.path());
        argv.extend(["--checkpoint".to_string(), weights.display().to_string()]);
        let summaries = run::<NdArray>(&Args::parse_from(&argv), root.path(), device).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].samples, 6);

        let absent = root.path().join("absent");
        let mut argv = fixture(root.path());
        argv.extend(["--checkpoint".to_string(), absent.display().to_string()]);
        let err = run::<NdArray>(&Args::parse_from(&argv), root.path(), device).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load checkpoint"));
    }

    #[test]
    fn test_concurrent_device_checks() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| device_available::<NdArray>(&NdArrayDevice::Cpu)))
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_run_without_device() {
        let root = tempfile::tempdir().unwrap();
        let args = Args::parse_from(fixture(root.path()));

        let err = run::<Wgpu<f32, i32>>(&args, root.path(), WgpuDevice::DiscreteGpu(4096))
            .unwrap_err();

        assert!(err.is::<NoDeviceError>());
        assert!(!root.path().join("scalars").exists());
    }

    #[test]
    fn test_run_missing_graphs() {
        let root = tempfile::tempdir().unwrap();
        let args = Args::parse_from([
            "randwire-eval",
            "--graph_txt",
            &root.path().join("missing_").display().to_string(),
        ]);

        let err = run::<NdArray>(&args, root.path(), Default::default()).unwrap_err();
        assert!(format!("{err:#}").contains("missing_3.txt"));
    }
}
