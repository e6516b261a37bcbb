use burn::{
    backend::{NdArray, ndarray::NdArrayDevice},
    config::Config,
};
use rust_rfcn::{
    config::{CONFIG_PATH, Commands, NmsConfig, RFCNCmd, RFCNConfig},
    debug::set_tensor_dbg_precision,
    error::RFCNError,
    inference,
    labels::ClassNames,
};
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    set_tensor_dbg_precision(4);

    let cli_cmd: RFCNCmd = argh::from_env();

    if let Err(err) = run(cli_cmd) {
        error!(%err, "failed");
        std::process::exit(1);
    }
}

fn run(cli_cmd: RFCNCmd) -> Result<(), RFCNError> {
    let device = NdArrayDevice::default();

    let class_names = match &cli_cmd.o {
        Some(list) => ClassNames::parse(list),
        None => ClassNames::voc(),
    };

    match cli_cmd.commands {
        Commands::Demo(sub_command_demo) => {
            let config = match &sub_command_demo.c {
                Some(path) => RFCNConfig::load(path)
                    .map_err(|e| RFCNError::Configuration(format!("{path}: {e}")))?,
                None => RFCNConfig::new(class_names.into_names()),
            };

            let defaults = NmsConfig::new();
            let nms = NmsConfig::new()
                .with_nms_thresh(sub_command_demo.i.unwrap_or(defaults.nms_thresh))
                .with_nms_topk(sub_command_demo.k.unwrap_or(defaults.nms_topk))
                .with_post_nms(sub_command_demo.n.unwrap_or(defaults.post_nms));

            let num_proposals = sub_command_demo.r.unwrap_or(300);
            let seed = sub_command_demo.s.unwrap_or(1);

            inference::demo::<NdArray<f32>>(config, nms, num_proposals, seed, &device)?;
        }
        Commands::InitConfig(sub_command_init) => {
            let path = sub_command_init.p.unwrap_or_else(|| CONFIG_PATH.to_string());

            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            RFCNConfig::new(class_names.into_names()).save(&path)?;
            info!(%path, "wrote default config");
        }
    };

    Ok(())
}
