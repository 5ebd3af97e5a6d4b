/// To build a distributable binary against static TSS libraries:
/// ```
/// TPM_TOOLS_BUILD_STATIC=1 cargo build --release --features esapi
/// ```
use eyre::Result;
use std::env;
use std::io;
use tpm_tools::cli::Cli;
use tpm_tools::tpm::esapi::EsapiOpener;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    env::set_var("TSS2_LOG", "all+NONE");
    let errors = cli.run(&EsapiOpener, &mut io::stdout().lock())?;
    errors.report(&mut io::stderr().lock())?;
    std::process::exit(errors.exit_code());
}
