use {
    clap::Parser,
    sec1::der::Decode,
    sfu_image::{rustcrypto::PUBLIC_KEY_LEN, Header, Magic},
    std::path::PathBuf,
};

mod cli;
mod config;

pub use config::Error as ConfigError;

/// Program arguments loaded from the CLI and config file.
#[derive(Debug, Clone)]
pub enum Args {
    /// Dump the header contents to stdout.
    Dump {
        input: PathBuf,
        pubkey: Option<[u8; PUBLIC_KEY_LEN]>,
    },
    /// Build a signed and encrypted image.
    Pack {
        pubkey: Option<[u8; PUBLIC_KEY_LEN]>,
        secret: [u8; 32],
        aes_key: [u8; 16],
        input: PathBuf,
        output: Output,
        version: u16,
        magic: Magic,
        partial_base: Option<PathBuf>,
        header_area: u32,
        nonce: Option<[u8; 16]>,
    },
}

#[derive(Debug, Clone)]
pub enum Output {
    InPlace,
    File(PathBuf),
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;
    match cli.command {
        cli::Command::Dump { input, pubkey } => Ok(Args::Dump {
            input,
            pubkey: pubkey.map(|p| parse_pubkey(&p)).transpose()?,
        }),
        cli::Command::Pack {
            pubkey,
            secret,
            aes_key,
            config,
            input,
            in_place,
            output,
            firmware_version,
            slot,
            partial_base,
            header_area,
            nonce,
        } => {
            // Load and validate the config.
            let config = config.map(|c| config::Config::load(&c)).transpose()?;
            let config_pubkey = config.as_ref().and_then(|config| config.pubkey.clone());
            let config_secret_path = config
                .as_ref()
                .and_then(|config| {
                    config.secret.as_ref().map(|secret| {
                        if !secret.is_absolute() {
                            return Err(Error::SecretPathNotAbsoluteInConfig(secret.clone()));
                        }
                        Ok(secret.clone())
                    })
                })
                .transpose()?;
            let config_aes_key = config.as_ref().and_then(|config| config.aes_key.clone());
            let config_header_area = config.as_ref().and_then(|config| config.header_area);

            // Reconcile the CLI and config arguments. Error if anything is specified both
            // on the CLI and in the config file.
            let pubkey = match (pubkey, config_pubkey) {
                (None, None) => None,
                (None, Some(pubkey)) => Some(pubkey),
                (Some(pubkey), None) => Some(pubkey),
                (Some(_), Some(_)) => return Err(Error::PubkeyInConfigAndCli),
            };
            let secret = match (secret, config_secret_path) {
                (None, None) => return Err(Error::SecretMissing),
                (None, Some(secret_path)) => secret_path,
                (Some(secret), None) => secret,
                (Some(_), Some(_)) => return Err(Error::SecretInConfigAndCli),
            };
            let aes_key = match (aes_key, config_aes_key) {
                (None, None) => return Err(Error::AesKeyMissing),
                (None, Some(aes_key)) => aes_key,
                (Some(aes_key), None) => aes_key,
                (Some(_), Some(_)) => return Err(Error::AesKeyInConfigAndCli),
            };
            let header_area = match (header_area, config_header_area) {
                (None, None) => consts::HEADER_AREA_SIZE,
                (None, Some(header_area)) => header_area,
                (Some(header_area), None) => header_area,
                (Some(_), Some(_)) => return Err(Error::HeaderAreaInConfigAndCli),
            };

            // Parse the arguments.
            let pubkey = pubkey.map(|p| parse_pubkey(&p)).transpose()?;
            let pem = std::fs::read(secret).map_err(Error::ReadPemFile)?;
            let key = pem::parse(pem)?;
            if key.tag() != "EC PRIVATE KEY" {
                return Err(Error::InvalidPemTag(key.tag().to_string()));
            }
            let secret: [u8; 32] = sec1::EcPrivateKey::from_der(key.contents())
                .map_err(Error::ParseDerContent)?
                .private_key
                .try_into()
                .map_err(|_| Error::InvalidSecretKey)?;
            if sfu_image::rustcrypto::P256Signer::from_slice(&secret).is_none() {
                return Err(Error::InvalidSecretKey);
            }
            let aes_key = hex::decode(&aes_key)
                .ok()
                .and_then(|k| <[u8; 16]>::try_from(k).ok())
                .ok_or(Error::InvalidAesKey)?;
            let output = match (in_place, output) {
                (true, Some(_)) => return Err(Error::InPlaceAndOutputSpecified),
                (true, None) => Output::InPlace,
                (false, Some(output)) => Output::File(output),
                (false, None) => return Err(Error::OutputMissing),
            };
            let magic = slot
                .checked_sub(1)
                .and_then(Magic::for_slot)
                .ok_or(Error::InvalidSlot(slot))?;
            if header_area < Header::SIZE as u32 {
                return Err(Error::HeaderAreaTooSmall(header_area));
            }
            let nonce = nonce
                .map(|n| {
                    hex::decode(&n)
                        .ok()
                        .and_then(|n| <[u8; 16]>::try_from(n).ok())
                        .ok_or(Error::InvalidNonce(n))
                })
                .transpose()?;
            Ok(Args::Pack {
                pubkey,
                secret,
                aes_key,
                input,
                output,
                version: firmware_version,
                magic,
                partial_base,
                header_area,
                nonce,
            })
        }
    }
}

fn parse_pubkey(pubkey: &str) -> Result<[u8; PUBLIC_KEY_LEN], Error> {
    let bytes = hex::decode(pubkey).map_err(|_| Error::InvalidPubkeyHex)?;
    bytes.try_into().map_err(|_| Error::InvalidPubkey)
}

#[derive(Debug)]
pub enum Error {
    AesKeyInConfigAndCli,
    AesKeyMissing,
    Cli(clap::Error),
    Config(ConfigError),
    HeaderAreaInConfigAndCli,
    HeaderAreaTooSmall(u32),
    InPlaceAndOutputSpecified,
    InvalidAesKey,
    InvalidNonce(String),
    InvalidPemTag(String),
    InvalidPubkey,
    InvalidPubkeyHex,
    InvalidSecretKey,
    InvalidSlot(usize),
    OutputMissing,
    ParseDerContent(sec1::der::Error),
    ParsePemFile(pem::PemError),
    PubkeyInConfigAndCli,
    ReadPemFile(std::io::Error),
    SecretInConfigAndCli,
    SecretMissing,
    SecretPathNotAbsoluteInConfig(PathBuf),
}

impl From<pem::PemError> for Error {
    fn from(e: pem::PemError) -> Self {
        Error::ParsePemFile(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AesKeyInConfigAndCli => write!(f, "AES key specified in both config and cli"),
            Error::AesKeyMissing => write!(f, "user did not specify an AES key"),
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::HeaderAreaInConfigAndCli => {
                write!(f, "header area specified in both config and cli")
            }
            Error::HeaderAreaTooSmall(size) => write!(
                f,
                "header area of {size} bytes cannot hold the {} byte header",
                Header::SIZE
            ),
            Error::InPlaceAndOutputSpecified => {
                write!(f, "cannot specify both --in-place and --output (-o)")
            }
            Error::InvalidAesKey => write!(f, "user specified invalid AES key, expected 16 bytes in hex"),
            Error::InvalidNonce(nonce) => {
                write!(f, r#"user specified invalid nonce: "{nonce}", expected 16 bytes in hex"#)
            }
            Error::InvalidPemTag(tag) => {
                write!(f, r#"invalid PEM tag: "{tag}", expected "EC PRIVATE KEY""#)
            }
            Error::InvalidPubkey => write!(
                f,
                "user specified invalid public key, expected {PUBLIC_KEY_LEN} bytes uncompressed"
            ),
            Error::InvalidPubkeyHex => write!(f, "user specified invalid public key hex"),
            Error::InvalidSecretKey => write!(f, "user specified invalid P-256 secret key"),
            Error::InvalidSlot(slot) => write!(f, "user specified invalid slot: {slot}, expected 1 to 3"),
            Error::OutputMissing => write!(f, "specify either --in-place or --output (-o)"),
            Error::ParseDerContent(e) => {
                write!(f, "failed to parse DER content inside PEM file: {e}")
            }
            Error::ParsePemFile(e) => write!(f, "invalid PEM file: {e}"),
            Error::PubkeyInConfigAndCli => write!(f, "pubkey specified in both config and cli"),
            Error::ReadPemFile(e) => write!(f, "failed to read PEM file: {e}"),
            Error::SecretInConfigAndCli => write!(f, "secret specified in both config and cli"),
            Error::SecretMissing => write!(f, "user did not specify a secret key"),
            Error::SecretPathNotAbsoluteInConfig(path) => {
                write!(
                    f,
                    r#"config error: secret key path is not absolute: "{}""#,
                    path.to_str().unwrap_or("<invalid path>")
                )
            }
        }
    }
}

impl std::error::Error for Error {}
