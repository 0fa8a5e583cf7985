use std::{path::Path, process::ExitCode};

use anyhow::Result;
use burn::backend::{wgpu::WgpuDevice, Wgpu};
use clap::Parser;
use randwire_eval::{
    cli::Args,
    eval::{self, NoDeviceError},
    experiment::{create_experiment_dir, init_logging, save_config},
};

fn main() -> Result<ExitCode> {
    type Backend = Wgpu<f32, i32>;

    let args = Args::parse();

    let dir = create_experiment_dir(Path::new("."), &args.save)?;
    init_logging(&dir)?;
    save_config(&dir, &args)?;
    tracing::info!("experiment dir = {}", dir.display());

    let device = WgpuDevice::DiscreteGpu(args.gpu);
    match eval::run::<Backend>(&args, &dir, device) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) if err.is::<NoDeviceError>() => {
            tracing::info!("{err}");
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err),
    }
}
