use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slidefetch::{
    convert_file, run, ApiVariant, AssemblyStrategy, Credentials, FetchConfig, FetchError, OriginClient,
    WriterOptions,
};

#[derive(Parser)]
#[command(name = "slidefetch", version, about = "Fetch whole-slide images into pyramidal BigTIFF")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one level of a remote image and write it as a pyramid
    Fetch(FetchArgs),
    /// Convert a local image file into a pyramid
    Convert(ConvertArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// TOML configuration file; flags override its values
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    image: Option<String>,
    /// Pyramid level, 0 = finest
    #[arg(long, short)]
    level: Option<u32>,
    #[arg(long)]
    z: Option<u32>,
    #[arg(long)]
    patch_size: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// direct or join
    #[arg(long)]
    assembly: Option<String>,
    /// Force the legacy origin API
    #[arg(long)]
    legacy_api: bool,
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Store JPEG tiles as RGB instead of YCbCr
    #[arg(long)]
    rgb_jpeg: bool,
    #[arg(long, env = "SLIDEFETCH_USERNAME")]
    username: Option<String>,
    #[arg(long, env = "SLIDEFETCH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args)]
struct ConvertArgs {
    input: PathBuf,
    output: PathBuf,
    #[arg(long, default_value_t = 256)]
    tile_size: u32,
    #[arg(long, default_value_t = 75)]
    quality: u8,
    #[arg(long)]
    rgb_jpeg: bool,
}

impl FetchArgs {
    fn into_config(self) -> Result<FetchConfig, FetchError> {
        let mut config = match &self.config {
            Some(path) => FetchConfig::from_file(path)?,
            None => FetchConfig::default(),
        };
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        if let Some(project) = self.project {
            config.project = project;
        }
        if let Some(image) = self.image {
            config.image = image;
        }
        if let Some(level) = self.level {
            config.level = level;
        }
        if let Some(z) = self.z {
            config.z = z;
        }
        if let Some(patch_size) = self.patch_size {
            config.patch_size = patch_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(assembly) = self.assembly {
            config.assembly = assembly.parse::<AssemblyStrategy>()?;
        }
        if self.legacy_api {
            config.api_variant = Some(ApiVariant::Legacy);
        }
        if let Some(output) = self.output {
            config.output = Some(output);
        }
        if self.rgb_jpeg {
            config.writer.rgb_jpeg = true;
        }
        match (self.username, self.password) {
            (Some(username), Some(password)) => config.credentials = Some(Credentials::new(username, password)),
            (None, None) => {}
            _ => return Err(FetchError::Config("username and password must be given together".to_string())),
        }
        Ok(config)
    }
}

async fn fetch(args: FetchArgs) -> Result<(), FetchError> {
    let config = args.into_config()?;
    let client = OriginClient::new(&config)?;
    let summary = run(&config, &client).await?;
    info!(
        output = %summary.output.display(),
        extent = %summary.level.extent,
        patches = summary.patches,
        "Done"
    );
    Ok(())
}

fn convert(args: ConvertArgs) -> Result<(), FetchError> {
    let options = WriterOptions {
        tile_size: args.tile_size,
        quality: args.quality,
        rgb_jpeg: args.rgb_jpeg,
        ..Default::default()
    };
    options.validate()?;
    convert_file(&args.input, &args.output, &options)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Fetch(args) => fetch(args).await,
        Commands::Convert(args) => tokio::task::block_in_place(|| convert(args)),
    };
    if let Err(e) = result {
        error!(error = %e, "Run failed");
        process::exit(1);
    }
}
