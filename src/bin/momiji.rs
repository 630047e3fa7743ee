use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};
use const_default::ConstDefault;
use momiji::model::liblinear::LossType;
use momiji::model::TrainHyperParam;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new label tree model
    Train(TrainArgs),

    /// Test an existing label tree model
    Test(TestArgs),
}

#[derive(Args)]
#[command(rename_all = "snake_case")]
struct TrainArgs {
    /// Path to training dataset file
    ///
    /// The dataset file is expected to be in the format of the Extreme Classification
    /// Repository.
    #[arg(required = true)]
    training_data_path: PathBuf,

    /// Path of the directory where the trained model and its weight files will be written
    #[arg(long, default_value = "model")]
    model_path: PathBuf,

    /// Number of worker threads
    ///
    /// If 0, the number is selected automatically.
    #[arg(long, default_value_t = 0)]
    n_threads: usize,

    /// Number of clusters each node splits its labels into
    #[arg(long, value_name = "K", default_value_t = TrainHyperParam::DEFAULT.max_children)]
    max_children: usize,

    /// Maximum tree depth
    #[arg(long, value_name = "DEPTH", default_value_t = TrainHyperParam::DEFAULT.max_depth)]
    max_depth: usize,

    /// Seed for the random source used in clustering
    #[arg(long, default_value_t = TrainHyperParam::DEFAULT.seed)]
    seed: u64,

    /// Directory for caching tree structures across runs with identical inputs
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Liblinear-style option string, e.g. "-s 1 -c 1 -B 1"
    ///
    /// Overrides the individual linear.* settings when given.
    #[arg(long, allow_hyphen_values = true)]
    options: Option<String>,

    /// Loss function used by linear classifiers
    #[arg(value_enum, long = "linear.loss", value_name = "LOSS", default_value_t = TrainHyperParam::DEFAULT.linear.loss_type.into())]
    linear_loss: CliLossType,

    /// Epsilon value for determining linear classifier convergence
    #[arg(long = "linear.eps", default_value_t = TrainHyperParam::DEFAULT.linear.eps)]
    linear_eps: f32,

    /// Cost coefficient for regularizing linear classifiers
    #[arg(long = "linear.c", value_name = "C", default_value_t = TrainHyperParam::DEFAULT.linear.c)]
    linear_c: f32,

    /// Value of the bias feature appended to every example; negative disables it
    #[arg(long = "linear.bias", value_name = "BIAS", allow_hyphen_values = true, default_value_t = TrainHyperParam::DEFAULT.linear.bias)]
    linear_bias: f32,

    /// Threshold for pruning weight vectors of linear classifiers
    #[arg(long = "linear.weight_threshold", value_name = "MIN_WEIGHT", default_value_t = TrainHyperParam::DEFAULT.linear.weight_threshold)]
    linear_weight_threshold: f32,

    /// Max number of iterations for training each linear classifier
    #[arg(long = "linear.max_iter", value_name = "M", default_value_t = TrainHyperParam::DEFAULT.linear.max_iter)]
    linear_max_iter: u32,

    /// Max number of Lloyd iterations when clustering labels
    #[arg(long = "cluster.max_iter", value_name = "M", default_value_t = TrainHyperParam::DEFAULT.cluster.max_iter)]
    cluster_max_iter: usize,

    /// Tolerance for determining clustering convergence
    #[arg(long = "cluster.tol", default_value_t = TrainHyperParam::DEFAULT.cluster.tol)]
    cluster_tol: f32,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CliLossType {
    Hinge,
    Log,
}

impl From<LossType> for CliLossType {
    fn from(loss: LossType) -> Self {
        match loss {
            LossType::Log => Self::Log,
            LossType::Hinge => Self::Hinge,
        }
    }
}

impl From<CliLossType> for LossType {
    fn from(loss: CliLossType) -> Self {
        match loss {
            CliLossType::Log => LossType::Log,
            CliLossType::Hinge => LossType::Hinge,
        }
    }
}

impl TryFrom<&TrainArgs> for TrainHyperParam {
    type Error = momiji::Error;

    fn try_from(args: &TrainArgs) -> Result<Self, Self::Error> {
        let linear = match args.options {
            Some(ref options) => momiji::model::liblinear::HyperParam::from_options(options)?,
            None => momiji::model::liblinear::HyperParam {
                loss_type: args.linear_loss.into(),
                eps: args.linear_eps,
                c: args.linear_c,
                bias: args.linear_bias,
                weight_threshold: args.linear_weight_threshold,
                max_iter: args.linear_max_iter,
            },
        };
        let hyper_param = momiji::model::train::HyperParam {
            max_children: args.max_children,
            max_depth: args.max_depth,
            seed: args.seed,
            cache_dir: args.cache_dir.clone(),
            linear,
            cluster: momiji::model::cluster::HyperParam {
                max_iter: args.cluster_max_iter,
                tol: args.cluster_tol,
            },
        };
        hyper_param.validate()?;
        Ok(hyper_param)
    }
}

#[derive(Args)]
#[command(rename_all = "snake_case")]
struct TestArgs {
    /// Path of the directory where the trained model is saved
    #[arg(required = true)]
    model_path: PathBuf,

    /// Path to test dataset file
    ///
    /// The dataset file is expected to be in the format of the Extreme Classification
    /// Repository.
    #[arg(required = true)]
    test_data_path: PathBuf,

    /// Number of worker threads
    ///
    /// If 0, the number is selected automatically.
    #[arg(long, default_value_t = 0)]
    n_threads: usize,

    /// Beam size for beam search
    #[arg(long, default_value_t = 10, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    beam_size: usize,

    /// Number of top predictions to write out for each test example
    #[arg(long, value_name = "K", default_value_t = 5)]
    k_top: usize,

    /// Path to the which predictions will be written, if provided
    #[arg(long)]
    out_path: Option<PathBuf>,
}

fn set_num_threads(num_threads: usize) {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .stack_size(32 * 1024 * 1024)
        .build_global()
        .unwrap();
}

fn train(args: &TrainArgs) {
    set_num_threads(args.n_threads);
    let train_hyperparam =
        TrainHyperParam::try_from(args).expect("Invalid training hyper-parameters");

    let training_dataset = momiji::DataSet::load_xc_repo_data_file(&args.training_data_path)
        .expect("Failed to load training data");
    let y = training_dataset.label_matrix();
    let x = training_dataset.feature_matrix();
    drop(training_dataset);

    train_hyperparam
        .train(&y, &x, &args.model_path)
        .expect("Failed to train model");
}

fn test(args: &TestArgs) {
    set_num_threads(args.n_threads);

    let model = momiji::Model::load(&args.model_path).expect("Failed to load model");
    let test_dataset = momiji::DataSet::load_xc_repo_data_file(&args.test_data_path)
        .expect("Failed to load test data");

    // At least 5 labels for precision@5
    let (predictions, _) = momiji::model::eval::test_all(
        &model,
        &test_dataset,
        args.beam_size,
        args.k_top.max(5),
    );
    if let Some(out_path) = args.out_path.as_ref() {
        let mut writer =
            BufWriter::new(File::create(out_path).expect("Failed to create output file"));
        for prediction in predictions {
            for (i, &(label, score)) in prediction.iter().take(args.k_top).enumerate() {
                if i > 0 {
                    write!(&mut writer, "\t").unwrap();
                }
                write!(&mut writer, "{} {:.3}", label, score).unwrap();
            }
            writeln!(&mut writer).unwrap();
        }
    }
}

fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Test(args) => test(args),
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}

#[test]
fn test_beam_size_must_be_positive() {
    let parse = |beam_size: &str| {
        Cli::try_parse_from(["momiji", "test", "model", "test.txt", "--beam_size", beam_size])
    };
    assert!(parse("0").is_err());
    match parse("3").unwrap().command {
        Commands::Test(args) => assert_eq!(3, args.beam_size),
        Commands::Train(_) => panic!("Expected the test subcommand"),
    }
}
