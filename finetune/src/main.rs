use std::env;

use finetune::{FinetuneErr, configs::RunConfig};
use log::info;

fn main() -> Result<(), FinetuneErr> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("reading config from {path}");
            RunConfig::from_file(path)?
        }
        None => RunConfig::default(),
    };

    finetune::run(config)
}
