use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use nrf_ble_dfu::dfu::config::DEFAULT_MBR_SIZE;
use nrf_ble_dfu::dfu::{crc32, hex_to_bin, read_firmware_zip, ContentType, DfuConfig, DfuResult};
use nrf_ble_dfu::settings::SettingsManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Nordic BLE DFU package tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe the images and init packets in a firmware ZIP
    Inspect {
        package: PathBuf,
        /// HEX data below this address is dropped
        #[arg(long, default_value_t = DEFAULT_MBR_SIZE)]
        mbr_size: u32,
    },
    /// Convert an Intel HEX file to a flat binary
    Hex2bin {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MBR_SIZE)]
        mbr_size: u32,
    },
    /// Print the session configuration, or write the defaults to a file
    Config {
        /// Settings file to read
        #[arg(long)]
        file: Option<PathBuf>,
        /// Write the default configuration here
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Command::Inspect { package, mbr_size } => {
            inspect(&package, mbr_size).map(|report| print!("{}", report))
        }
        Command::Hex2bin {
            input,
            output,
            mbr_size,
        } => hex2bin(&input, &output, mbr_size).map(|size| {
            info!(size, output = %output.display(), "Binary written");
        }),
        Command::Config { file, write } => config(file.as_deref(), write.as_deref()),
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Human readable summary of a firmware package.
fn inspect(path: &Path, mbr_size: u32) -> DfuResult<String> {
    let package = read_firmware_zip(path, mbr_size, ContentType::AUTO)?;

    let mut report = String::new();
    let _ = writeln!(report, "Content: {}", package.content_type());
    let _ = writeln!(
        report,
        "Secure DFU required: {}",
        if package.is_secure_dfu_required() { "yes" } else { "no" }
    );
    for image in package.images() {
        let _ = writeln!(
            report,
            "  {:<24} {:>8} bytes  CRC32 0x{:08X}",
            image.kind.to_string(),
            image.size(),
            crc32(image.bytes())
        );
    }
    for (name, init) in [
        ("System init packet", package.system_init()),
        ("Application init packet", package.application_init()),
    ] {
        let Some(init) = init else { continue };
        let digest = init
            .digest
            .as_ref()
            .map(|d| d.algorithm())
            .unwrap_or("none");
        let _ = writeln!(
            report,
            "{}: {} bytes, digest {}",
            name,
            init.bytes.len(),
            digest
        );
    }
    let _ = writeln!(report, "Total: {} bytes", package.total_size());
    Ok(report)
}

fn hex2bin(input: &Path, output: &Path, mbr_size: u32) -> DfuResult<usize> {
    let data = std::fs::read(input)?;
    let bin = hex_to_bin(&data, mbr_size)?;
    std::fs::write(output, &bin)?;
    Ok(bin.len())
}

fn config(file: Option<&Path>, write: Option<&Path>) -> DfuResult<()> {
    if let Some(path) = write {
        SettingsManager::with_file(path).save(&DfuConfig::default())?;
        info!(path = %path.display(), "Default configuration written");
        return Ok(());
    }

    let config = match file {
        Some(path) => SettingsManager::with_file(path).load()?,
        None => DfuConfig::default(),
    };
    let text = toml::to_string_pretty(&config).map_err(|e| {
        nrf_ble_dfu::dfu::DfuError::InvalidSettings {
            reason: e.to_string(),
        }
    })?;
    print!("{}", text);
    Ok(())
}
