use std::path::PathBuf;

use clap::{ArgAction, Parser};
use serde::Serialize;

/// Evaluate a pretrained randomly wired network on a validation image folder.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "randwire-eval", version)]
pub struct Args {
    /// Location of the data corpus, containing `train/` and `val/`
    #[arg(long, default_value = "/dataset/extract_ILSVRC2012")]
    pub data: PathBuf,

    /// Small regime when true, regular regime when false
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub regime: bool,

    #[arg(long = "batch_size", default_value_t = 256)]
    pub batch_size: usize,

    /// Base channel count, usually one of 78, 109, 154
    #[arg(long = "base_channels", default_value_t = 78)]
    pub base_channels: usize,

    #[arg(long = "output_channels", default_value_t = 1280)]
    pub output_channels: usize,

    /// Also index the training split
    #[arg(long = "train_flag", default_value_t = false, action = ArgAction::Set)]
    pub train_flag: bool,

    /// GPU device id
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,

    #[arg(long, default_value_t = 5)]
    pub seed: u64,

    /// Prefix of the stage graph files, `<prefix><stage>.txt`
    #[arg(long = "graph_txt", default_value = "ws_4_075_conv")]
    pub graph_txt: String,

    /// Experiment name
    #[arg(long, default_value = "EXP")]
    pub save: String,

    /// Number of passes over the validation set
    #[arg(long, default_value_t = 250)]
    pub epochs: usize,

    /// Log every `report_freq` steps
    #[arg(long = "report_freq", default_value_t = 100)]
    pub report_freq: usize,

    /// Pretrained weights saved with the compact recorder
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Data loader worker threads
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long = "image_size", default_value_t = 224)]
    pub image_size: usize,
}
