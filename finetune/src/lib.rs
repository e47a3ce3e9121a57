pub mod configs;
pub mod error;
pub mod evaluation;
pub mod scores;
pub mod session;
pub mod training;

use log::info;
use machine_learning::{
    arch::{Fcn, FcnConfig, Model},
    checkpoint,
    dataset::{DataLoader, SegmentationDataset},
};
use rand::{SeedableRng, rngs::StdRng};

pub use error::{FinetuneErr, Result};

use configs::RunConfig;
use scores::ScoreBoard;
use session::{ModelSnapshot, RunContext};
use training::Trainer;

/// Fine-tunes a quantized FCN as described by `config`: loads the pretrained snapshot, measures
/// the accuracy of the quantized model and trains it for the configured amount of epochs,
/// saving and scoring it after every epoch.
pub fn run(config: RunConfig) -> Result<()> {
    config.validate()?;

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| FinetuneErr::InvalidConfig(format!("thread pool: {e}")))?;
    }
    info!("running on the cpu with {} threads", rayon::current_num_threads());

    info!("==> Preparing data");
    let crop = config.data.crop.map(|[h, w]| (h, w));
    let train = SegmentationDataset::from_csv(
        config.data.train_path(),
        config.n_class,
        crop,
        config.data.flip_rate,
    )?;
    let val = SegmentationDataset::from_csv(config.data.val_path(), config.n_class, None, 0.)?;
    info!("{} training and {} validation samples", train.len(), val.len());

    let mut train = DataLoader::new(train, config.batch_size, true, config.seed)?;
    let val = DataLoader::new(val, config.data.val_batch_size, false, config.seed)?;

    info!("==> Building model");
    let backbone = config.vgg().ok_or_else(|| {
        FinetuneErr::InvalidConfig(format!("unknown backbone {}", config.backbone))
    })?;
    let fcn_config = FcnConfig {
        n_class: config.n_class,
        backbone,
    };
    let mut model = Fcn::new(&fcn_config, &mut StdRng::seed_from_u64(config.seed));

    if let Some(path) = &config.checkpoint {
        let tensors = checkpoint::load(&mut model, path)?;
        info!("loaded {tensors} tensors from {}", path.display());
    }

    let quantized = config.quant.apply(&mut model);
    info!(
        "quantized {quantized} layers (n_lv: {}, bound: {}, ratio: {}), {} parameters",
        config.quant.n_lv,
        config.quant.bound,
        config.quant.ratio,
        model.size()
    );

    let scores = ScoreBoard::new(config.score_dir(), config.epochs, config.n_class);
    let mut context = RunContext::new(val, config.n_class, scores);

    info!("==> Quantized model accuracy");
    context.validate(&mut model, 0)?;

    let (optimizer, lr, momentum, w_decay) =
        (config.optimizer, config.lr, config.momentum, config.w_decay);
    let schedule = config.schedule.build(config.lr, config.step_size, config.gamma);
    let mut trainer = Trainer::new(
        model,
        |len| optimizer.build(len, lr, momentum, w_decay),
        schedule,
        config.epochs,
        config.log_every,
    );

    info!("==> Training {}", config.run_id());
    let mut snapshot = ModelSnapshot::new(config.model_path());
    trainer.run(&mut train, &mut snapshot, &mut context, None)
}
