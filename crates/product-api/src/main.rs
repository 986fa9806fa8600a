use product_api::{logging, run, shutdown_on_signal, BootError, Config};
use readiness::CancellationToken;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => match e.downcast::<clap::Error>() {
            // --help, --version and usage errors keep clap's own output
            Ok(clap_err) => clap_err.exit(),
            Err(e) => {
                let err = BootError::Config(e);
                eprintln!("product-api: {err}");
                return ExitCode::from(err.exit_code());
            }
        },
    };

    if let Err(e) = logging::init_logging(&config.log_level, config.log_format) {
        let err = BootError::Logging(e);
        eprintln!("product-api: {err}");
        return ExitCode::from(err.exit_code());
    }

    let cancel = CancellationToken::new();
    shutdown_on_signal(cancel.clone());

    match run(config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}
