use log::*;
use mlcv::bovw::Normalization;
use mlcv::experiments::{
    bovw_svm::{self, BovwSvmOptions},
    fisher_sweep,
    sift_svm::{self, SiftSvmOptions},
};
use mlcv::features::Method;
use mlcv::svm::{Gamma, Kernel};
use mlcv::Settings;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "mlcv",
    about = "Image classification experiments with local features and SVMs"
)]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `mlcv::Settings`. Defaults are used when it does not exist.
    #[structopt(short, long, default_value = "mlcv-settings.json")]
    settings: PathBuf,
    /// Directory holding the dataset lists, overrides the settings.
    #[structopt(long, parse(from_os_str))]
    dataset_dir: Option<PathBuf>,
    /// Directory of trained models, overrides the settings.
    #[structopt(long, parse(from_os_str))]
    models_dir: Option<PathBuf>,
    /// Directory of cached intermediate results, overrides the settings.
    #[structopt(long, parse(from_os_str))]
    cache_dir: Option<PathBuf>,
    /// Number of worker threads, overrides the settings.
    #[structopt(short = "j", long)]
    n_jobs: Option<usize>,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Clone)]
enum Command {
    /// RBF SVM on keypoint descriptors with a vote per test image.
    SiftSvm {
        /// Training images used per class.
        #[structopt(long, default_value = "30")]
        images_per_class: usize,
        #[structopt(short = "c", long, default_value = "5")]
        c: f64,
        #[structopt(long, default_value = "0.1")]
        gamma: f64,
        /// Name of the cached model.
        #[structopt(long, default_value = "final_noprob_sift_30_svm")]
        model_name: String,
        /// Where to draw the normalized confusion matrix.
        #[structopt(short, long, parse(from_os_str))]
        plot: Option<PathBuf>,
    },
    /// Visual word histograms classified by an SVM.
    BovwSvm {
        /// Either `sift` or `dense`.
        #[structopt(long, default_value = "dense")]
        method: Method,
        #[structopt(short, long, default_value = "512")]
        k: usize,
        /// One of `none`, `l1`, `l2` or `power`.
        #[structopt(long, default_value = "l1")]
        normalization: Normalization,
        /// One of `linear`, `poly`, `rbf`, `sigmoid` or `intersection`.
        #[structopt(long, default_value = "intersection")]
        kernel: KernelName,
        #[structopt(short = "c", long, default_value = "1")]
        c: f64,
        /// Kernel coefficient of the poly, rbf and sigmoid kernels, `1 / n_features` when omitted.
        #[structopt(long)]
        gamma: Option<f64>,
        #[structopt(long, default_value = "3")]
        degree: u32,
        #[structopt(long, default_value = "0")]
        coef0: f64,
        /// Standardize the histograms before training.
        #[structopt(long)]
        standardize: bool,
        /// Prefix of the cached artifacts.
        #[structopt(long, default_value = "bovw_svm")]
        name: String,
        #[structopt(short, long, parse(from_os_str))]
        plot: Option<PathBuf>,
    },
    /// Fisher vector parameter sweep.
    FisherSweep {
        /// `train` runs the sweep, `plot` draws the accuracy curves of a finished sweep.
        #[structopt(long = "type", default_value = "train", possible_values = &["train", "plot"])]
        kind: String,
        /// Output of `plot`.
        #[structopt(short, long, default_value = "fisher_sweep.png", parse(from_os_str))]
        output: PathBuf,
    },
}

#[derive(Debug, Copy, Clone)]
enum KernelName {
    Linear,
    Poly,
    Rbf,
    Sigmoid,
    Intersection,
}

impl FromStr for KernelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(KernelName::Linear),
            "poly" => Ok(KernelName::Poly),
            "rbf" => Ok(KernelName::Rbf),
            "sigmoid" => Ok(KernelName::Sigmoid),
            "intersection" => Ok(KernelName::Intersection),
            other => Err(format!("unknown kernel {other}")),
        }
    }
}

fn kernel(name: KernelName, gamma: Option<f64>, degree: u32, coef0: f64) -> Kernel {
    let gamma = gamma.map_or(Gamma::Auto, Gamma::Value);
    match name {
        KernelName::Linear => Kernel::Linear,
        KernelName::Poly => Kernel::Polynomial {
            degree,
            gamma,
            coef0,
        },
        KernelName::Rbf => Kernel::Rbf { gamma },
        KernelName::Sigmoid => Kernel::Sigmoid { gamma, coef0 },
        KernelName::Intersection => Kernel::Intersection,
    }
}

fn run(opt: Opt) -> mlcv::Result<()> {
    let mut settings = Settings::load(&opt.settings)?;
    if let Some(dir) = opt.dataset_dir {
        settings.dataset_dir = dir;
    }
    if let Some(dir) = opt.models_dir {
        settings.models_dir = dir;
    }
    if let Some(dir) = opt.cache_dir {
        settings.cache_dir = dir;
    }
    if let Some(n_jobs) = opt.n_jobs {
        settings.n_jobs = n_jobs;
    }
    debug!("settings: {:?}", settings);

    match opt.command {
        Command::SiftSvm {
            images_per_class,
            c,
            gamma,
            model_name,
            plot,
        } => {
            let evaluation = sift_svm::run(
                &settings,
                &SiftSvmOptions {
                    images_per_class: Some(images_per_class),
                    c,
                    gamma,
                    model_name,
                    plot,
                },
            )?;
            println!("ACCURACY: {:.2}", evaluation.accuracy);
        }
        Command::BovwSvm {
            method,
            k,
            normalization,
            kernel: kernel_name,
            c,
            gamma,
            degree,
            coef0,
            standardize,
            name,
            plot,
        } => {
            let evaluation = bovw_svm::run(
                &settings,
                &BovwSvmOptions {
                    method,
                    codebook_size: k,
                    normalization,
                    kernel: kernel(kernel_name, gamma, degree, coef0),
                    c,
                    standardize,
                    images_per_class: None,
                    name,
                    plot,
                },
            )?;
            println!("{}", evaluation.confusion);
            println!("ACCURACY: {:.2}", evaluation.accuracy);
        }
        Command::FisherSweep { kind, output } => match kind.as_str() {
            "plot" => {
                fisher_sweep::plot(&settings, &output)?;
            }
            _ => {
                let best = fisher_sweep::train(&settings)?;
                println!(
                    "k={}, C={}, dim_red={}, dense_grid={} --> accuracy: {:.3}",
                    best.k, best.c, best.pca, best.dense_grid, best.accuracy
                );
            }
        },
    }
    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    if let Err(e) = run(opt) {
        error!("{}", e);
        std::process::exit(1);
    }
}
