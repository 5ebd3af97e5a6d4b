use crate::command::{self, Settings};
use crate::config::Config;
use crate::error::Errors;
use crate::tpm::pcr::{parse_pcr_bank, HashAlg};
use crate::tpm::Opener;
use clap::{Args, Parser, Subcommand};
use eyre::Result;
use std::io::Write;
use std::path::PathBuf;

const TPM_PATH_ENV_VAR: &str = "TPM_PATH";
const CONFIG_ENV_VAR: &str = "TPM_TOOLS_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device path or TCTI string [default: /dev/tpm0]
    #[arg(short = 'T', long, global = true, env = TPM_PATH_ENV_VAR)]
    tpm_path: Option<String>,

    /// YAML file providing `tpm_path` and `pcr_bank`
    #[arg(short, long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// PCR bank hashed by PolicyPCR [default: sha256]
    #[arg(long, global = true, value_parser = parse_pcr_bank)]
    pcr_bank: Option<HashAlg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a storage root key under the owner hierarchy and print its handle
    CreateSrk(CreateSrkArgs),
    /// Load a sealed object under a parent key and print its handle
    Load(LoadArgs),
    /// Seal data under a PCR and password policy
    Seal(SealArgs),
    /// Unseal a loaded object
    Unseal(UnsealArgs),
    /// Persist a transient object, or evict a persistent one
    EvictControl(EvictControlArgs),
    /// Release a transient object or session
    FlushContext(FlushContextArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CreateSrkArgs {
    /// Owner hierarchy authorization
    #[arg(long, default_value = "")]
    pub owner_password: String,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoadArgs {
    /// Handle of the parent key, in hex
    #[arg(long, default_value = "")]
    pub parent_handle: String,

    #[arg(long, default_value = "")]
    pub parent_password: String,

    #[arg(long)]
    pub public_path: PathBuf,

    #[arg(long)]
    pub private_path: PathBuf,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SealArgs {
    /// Handle of the parent key, in hex
    #[arg(long, default_value = "")]
    pub parent_handle: String,

    #[arg(long, default_value = "")]
    pub parent_password: String,

    /// Password required to unseal
    #[arg(long, default_value = "")]
    pub object_password: String,

    /// Hex encoded data, at most 128 bytes
    #[arg(long, default_value = "")]
    pub data: String,

    /// PCR to bind to, or -1 for none
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    pub pcr: String,

    #[arg(long)]
    pub private_path: PathBuf,

    #[arg(long)]
    pub public_path: PathBuf,
}

#[derive(Args, Debug, Clone, Default)]
pub struct UnsealArgs {
    /// Handle of the loaded sealed object, in hex
    #[arg(long, default_value = "")]
    pub object_handle: String,

    #[arg(long, default_value = "")]
    pub object_password: String,

    /// PCR used at seal time, or -1 for none
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    pub pcr: String,

    /// Where to write the unsealed data
    #[arg(long, visible_alias = "private-path")]
    pub output_path: PathBuf,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EvictControlArgs {
    #[arg(long, default_value = "")]
    pub owner_password: String,

    /// Transient object to persist, or the persistent handle itself to evict it
    #[arg(long, default_value = "")]
    pub object_handle: String,

    #[arg(long, default_value = "")]
    pub persistent_handle: String,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FlushContextArgs {
    #[arg(long, default_value = "")]
    pub flush_handle: String,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    /// Resolves the settings and runs the selected command, printing handles
    /// to `out`. Command failures end up in the returned [`Errors`].
    pub fn run<O: Opener>(&self, opener: &O, out: &mut impl Write) -> Result<Errors> {
        let config = Config::load(self.config.as_deref())?;
        let settings = Settings {
            tpm_path: config.tpm_path(self.tpm_path.as_deref()),
            pcr_bank: config.pcr_bank(self.pcr_bank),
        };
        log::debug!("{settings:?}");

        let mut errors = Errors::new();
        match &self.command {
            Commands::CreateSrk(args) => {
                command::create_srk(opener, &settings, args, &mut errors, out)
            }
            Commands::Load(args) => command::load(opener, &settings, args, &mut errors, out),
            Commands::Seal(args) => command::seal(opener, &settings, args, &mut errors),
            Commands::Unseal(args) => command::unseal(opener, &settings, args, &mut errors),
            Commands::EvictControl(args) => {
                command::evict_control(opener, &settings, args, &mut errors)
            }
            Commands::FlushContext(args) => {
                command::flush_context(opener, &settings, args, &mut errors)
            }
        };
        Ok(errors)
    }
}
