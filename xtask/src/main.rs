// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use consts::{ACTIVE_1_SIZE, BOOTLOADER_SIZE, DOWNLOAD_1_ADDR, DOWNLOAD_1_SIZE, HEADER_AREA_SIZE};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{exit, Command, Stdio};
use std::{env, fs};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PACKAGE_DIR: &str = "SfuPackage";

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct XtaskArgs {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the bootloader in release version, as binary and hex file
    BuildBootloader {
        /// Leave flash protection and the debug port open
        #[arg(long)]
        debug: bool,
    },

    /// Sign and encrypt an application binary with the sfu-image tool
    PackFirmware {
        /// Application binary, linked for the active slot
        input: PathBuf,
        /// Version written in the image header
        #[arg(long)]
        firmware_version: u16,
        /// Path to sfu-image.toml config file
        #[arg(long, default_value = "sfu-image.toml")]
        config_path: String,
        /// Application binary installed on the devices, to build a delta image
        #[arg(long)]
        partial_base: Option<PathBuf>,
    },

    /// Merge the bootloader and a packed image in a single hex file.
    /// The image lands in the download slot and is installed on first boot.
    #[command(verbatim_doc_comment)]
    Package,
}

fn project_root() -> PathBuf {
    Path::new(&env!("CARGO_MANIFEST_DIR")).ancestors().nth(1).unwrap().to_path_buf()
}

fn package_dir() -> PathBuf {
    project_root().join(PACKAGE_DIR)
}

pub fn cargo() -> String {
    env::var("CARGO").unwrap_or_else(|_| "cargo".to_string())
}

fn build_tools_check(verbose: bool) {
    tracing::info!("Checking cargo binutils install state");
    let mut cargo_cmd = Command::new(cargo());
    let mut cmd = cargo_cmd.current_dir(project_root()).args(["objcopy", "--version"]);
    if !verbose {
        cmd = cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let status = cmd.status().expect("Running Cargo objcopy version fails");
    if !status.success() {
        tracing::info!("Please install cargo binutils with these commands:");
        tracing::info!("cargo install cargo-binutils");
        tracing::info!("rustup component add llvm-tools");
        exit(-1);
    }

    let build_dir = package_dir();
    if !build_dir.exists() {
        fs::create_dir(build_dir).unwrap();
    }
}

fn build_bootloader(verbose: bool, debug: bool) {
    if debug {
        tracing::warn!("BUILDING DEBUG BOOTLOADER!!!");
    } else {
        tracing::info!("Building bootloader....");
    }
    let mut cargo_cmd = Command::new(cargo());
    let mut cmd = cargo_cmd
        .current_dir(project_root().join("bootloader"))
        .args(["build", "--release"]);
    if debug {
        cmd = cmd.args(["--no-default-features", "--features", "debug"]);
    }
    if !verbose {
        cmd = cmd.stdout(Stdio::null()).stderr(Stdio::null()).arg("--quiet");
    }
    let status = cmd.status().expect("Running Cargo failed");
    if !status.success() {
        tracing::error!("Bootloader build failed");
        exit(-1);
    }

    // Create bootloader binary first to show actual size
    tracing::info!("Creating bootloader binary file");
    let bin = format!("../{PACKAGE_DIR}/bootloader.bin");
    let mut cargo_cmd = Command::new(cargo());
    let cmd = cargo_cmd
        .current_dir(project_root().join("bootloader"))
        .args(["objcopy", "--release"]);
    let mut cmd = cmd.args(["--", "-j", ".text", "-O", "binary", bin.as_str()]);
    if !verbose {
        cmd = cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let status = cmd.status().expect("Running Cargo objcopy failed");
    if !status.success() {
        tracing::error!("Bootloader binary generation failed");
        exit(-1);
    }

    print_binary_size(
        &package_dir().join("bootloader.bin"),
        "Bootloader Binary (actual size)",
        BOOTLOADER_SIZE,
    );

    tracing::info!("Generating bootloader hex file...");
    let hex = format!("../{PACKAGE_DIR}/bootloader.hex");
    let mut cargo_cmd = Command::new(cargo());
    let cmd = cargo_cmd
        .current_dir(project_root().join("bootloader"))
        .args(["objcopy", "--release"]);
    let mut cmd = cmd.args(["--", "-O", "ihex", hex.as_str()]);
    if !verbose {
        cmd = cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let status = cmd.status().expect("Running Cargo objcopy failed");
    if !status.success() {
        tracing::error!("Bootloader hex generation failed");
        exit(-1);
    }
}

fn pack_firmware(input: &Path, version: u16, config_path: &str, partial_base: Option<&Path>) {
    let config_path = project_root().join(config_path);
    let config_path_str = config_path.to_str().unwrap();

    if let Err(e) = fs::File::open(&config_path) {
        tracing::info!("sfu-image config not found at {config_path_str}: {}", e);
        exit(-1);
    }

    // Verify that sfu-image exists
    if Command::new("sfu-image").stdout(Stdio::null()).stderr(Stdio::null()).spawn().is_err() {
        tracing::error!("unable to find sfu-image tool, please install it:");
        println!("   cargo install --path sfu-image/sfu-image-bin --bin sfu-image");
        exit(-1);
    }

    // The body starts right after the header area and must fit the slot.
    print_binary_size(input, "Firmware Binary (actual size)", ACTIVE_1_SIZE - HEADER_AREA_SIZE);

    let version = version.to_string();
    let input = input.to_str().unwrap();
    let output = package_dir().join("firmware_packed.bin");
    let output = output.to_str().unwrap();
    let mut args = vec![
        "pack",
        "-c",
        config_path_str,
        "-i",
        input,
        "--firmware-version",
        version.as_str(),
        "-o",
        output,
    ];
    if let Some(base) = partial_base {
        args.extend(["--partial-base", base.to_str().unwrap()]);
    }

    tracing::info!("Packing application with sfu-image...");

    if !Command::new("sfu-image")
        .stdout(Stdio::null())
        .current_dir(project_root())
        .args(&args)
        .status()
        .unwrap()
        .success()
    {
        tracing::error!("sfu-image failed");
        exit(-1);
    }

    // The packed image has to fit the download slot next to its trailer.
    print_binary_size(&package_dir().join("firmware_packed.bin"), "Packed Image", DOWNLOAD_1_SIZE);
}

enum MergeableFile<P: AsRef<Path>> {
    IHex(P),
    Binary(P, u32),
}

fn merge_files<P: AsRef<Path>>(inputs: Vec<MergeableFile<P>>, output: P) {
    let mut records = vec![];

    inputs.into_iter().for_each(|file| {
        match file {
            MergeableFile::IHex(path) => {
                let mut file = fs::File::open(path).expect("unable to open input file");
                let mut data = String::new();
                file.read_to_string(&mut data).expect("unable to read the whole file");

                // wrap ihex::Reader on string
                let ihex = ihex::Reader::new(&data);

                let mut upper_address = 0u32;
                // iterate through ihex records
                for record in ihex {
                    let record = record.expect("error while parsing ihex file");
                    match record {
                        ihex::Record::StartSegmentAddress { cs, ip } => {
                            upper_address = ((cs as u32) << 4) + (ip as u32);
                        }
                        ihex::Record::StartLinearAddress(addr) => {
                            upper_address = addr << 16;
                        }
                        ihex::Record::ExtendedSegmentAddress(addr) => {
                            upper_address = (addr as u32) << 4;
                        }
                        ihex::Record::ExtendedLinearAddress(addr) => {
                            upper_address = (addr as u32) << 16;
                        }
                        ihex::Record::Data { offset, value } => {
                            let address = upper_address + (offset as u32);
                            records.push((address, value));
                        }
                        ihex::Record::EndOfFile => {
                            // nothing to do
                        }
                    }
                }
            }
            MergeableFile::Binary(path, global_offset) => {
                let mut file = fs::File::open(path).expect("unable to open input file");

                let mut data = vec![];
                file.read_to_end(&mut data).expect("unable to read the whole file");

                // fill records with slice of 32 bytes from data
                for (i, chunk) in data.chunks(32).enumerate() {
                    let address = global_offset + (i as u32) * 32;
                    records.push((address, chunk.to_vec()));
                }
            }
        }
    });

    // sort all records by addresses
    records.sort_by_key(|(addr, _)| *addr);

    let mut out_records = vec![];

    // get first record to store starting upper address
    let (addr, _) = records[0];
    let mut segment_upper_address = addr >> 16;
    out_records.push(ihex::Record::ExtendedLinearAddress(segment_upper_address as u16));

    for (addr, value) in records.into_iter() {
        let upper = addr >> 16;

        // write extend linear address record if it has changed
        if upper != segment_upper_address {
            out_records.push(ihex::Record::ExtendedLinearAddress(upper as u16));
        }

        let offset = addr & 0xffff;
        out_records.push(ihex::Record::Data {
            offset: offset as u16,
            value,
        });
        segment_upper_address = upper;
    }

    out_records.push(ihex::Record::EndOfFile);

    let data = ihex::create_object_file_representation(&out_records).expect("error while create ihex object");

    let mut file = fs::File::create(output).expect("unable to create output file");
    file.write_all(data.as_bytes()).expect("unable to write ihex object to file");
}

fn build_package() {
    tracing::info!("Merging bootloader and packed image in single hex");
    merge_files(
        vec![
            MergeableFile::IHex(package_dir().join("bootloader.hex")),
            MergeableFile::Binary(package_dir().join("firmware_packed.bin"), DOWNLOAD_1_ADDR),
        ],
        package_dir().join("Sfu_Full_Image.hex"),
    );
}

fn print_binary_size(binary_path: &Path, description: &str, available: u32) {
    if let Ok(metadata) = fs::metadata(binary_path) {
        let size_bytes = metadata.len();
        let size_kb = size_bytes as f64 / 1024.0;
        let usage_percentage = (size_bytes as f64 / available as f64) * 100.0;

        println!("📊 {} Size:", description);
        println!("   Bytes: {} bytes", size_bytes);
        println!("   KiB: {:.2} KiB", size_kb);
        println!("   Flash Usage: {:.1}% of {} bytes available", usage_percentage, available);
        if size_bytes > available as u64 {
            tracing::error!("{} does not fit its flash region", description);
            exit(-1);
        }
    } else {
        tracing::warn!("Could not read binary metadata for: {}", binary_path.display());
    }
}

fn main() {
    // Adding some info tracing just for logging activity
    env::set_var("RUST_LOG", "info");

    // Tracing using RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = XtaskArgs::parse();

    match args.command {
        Commands::BuildBootloader { debug } => {
            build_tools_check(args.verbose);
            build_bootloader(args.verbose, debug);
        }
        Commands::PackFirmware {
            input,
            firmware_version,
            config_path,
            partial_base,
        } => {
            build_tools_check(args.verbose);
            pack_firmware(&input, firmware_version, &config_path, partial_base.as_deref());
        }
        Commands::Package => {
            build_package();
        }
    }
}
