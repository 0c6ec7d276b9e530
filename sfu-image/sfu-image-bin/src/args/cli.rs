//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Dump the header contents to stdout.
    Dump {
        /// The image file.
        #[clap(short, long)]
        input: PathBuf,
        /// Uncompressed public key in hex to check the header signature with.
        #[clap(long)]
        pubkey: Option<String>,
    },
    /// Build a signed and encrypted image from a firmware binary.
    Pack {
        /// The public key in hex, verified against the secret key to avoid
        /// accidental signing.
        #[clap(long)]
        pubkey: Option<String>,
        /// Path to PEM-encoded secret key.
        #[clap(long)]
        secret: Option<PathBuf>,
        /// AES-128 key in hex, used to encrypt the firmware.
        #[clap(long)]
        aes_key: Option<String>,
        /// Path to config file.
        #[clap(long, short)]
        config: Option<PathBuf>,
        /// The firmware binary.
        #[clap(short, long)]
        input: PathBuf,
        /// Replace the firmware binary with the image.
        #[clap(long)]
        in_place: bool,
        /// Path to write the image to.
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Version to write in the header.
        #[clap(long)]
        firmware_version: u16,
        /// Active slot the image is built for, starting at 1.
        #[clap(long, default_value_t = 1)]
        slot: usize,
        /// Firmware binary installed on the devices. Only the bytes that
        /// differ from it are shipped.
        #[clap(long)]
        partial_base: Option<PathBuf>,
        /// Bytes reserved for the header in front of the encrypted firmware.
        #[clap(long)]
        header_area: Option<u32>,
        /// Nonce in hex. Derived from the firmware when omitted.
        #[clap(long)]
        nonce: Option<String>,
    },
}
