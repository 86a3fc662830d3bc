use std::process::ExitCode;

use autoapi::{GatewayCommand, GatewayConf, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let conf = GatewayConf::from_env();
    if conf.log_init {
        init_tracing();
    }

    let cmd: GatewayCommand = argh::from_env();
    match cmd.run(conf).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("autoapi: {}", e);
            ExitCode::FAILURE
        }
    }
}
