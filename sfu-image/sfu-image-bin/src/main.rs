use {
    colored::Colorize,
    sfu_image::{
        rustcrypto::{verify_p256, Aes128Ctr, P256Signer, Sha256},
        Header, ImageState, VerificationResult,
    },
    sha2::Digest,
    std::{
        ffi::OsString,
        io::{Read, Seek, Write},
        path::{Path, PathBuf},
    },
};

mod args;

#[cfg(test)]
mod tests;

fn main() -> std::process::ExitCode {
    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match run(args, stdout) {
        Ok(()) => ExitCode(0),
        Err(Error::Args(e @ args::Error::Cli(_))) => {
            // Clap already does the "error: {}" formatting.
            writeln!(stderr, "{e}").expect("write error to stderr");
            ExitCode(1)
        }
        Err(e) => {
            writeln!(stderr, "{} {e}", "error:".bold().red()).expect("write error to stderr");
            ExitCode(1)
        }
    }
}

fn run<I, T>(args: I, mut stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match args::args(args)? {
        args::Args::Dump { input, pubkey } => {
            let input_buf = read_file(&input)?;
            match Header::parse(&input_buf)? {
                Some(header) => {
                    if let Some(pubkey) = pubkey {
                        let res = verify_p256(&pubkey, &header.auth_region(), header.signature());
                        if res != VerificationResult::Valid {
                            return Err(Error::InvalidSignature);
                        }
                    }
                    dump(&header, &mut stdout).map_err(Error::Stdout)?;
                    if pubkey.is_some() {
                        writeln!(&mut stdout, "{:11} {}", "verified".bold(), "ok".green())
                            .map_err(Error::Stdout)?;
                    }
                }
                None => {
                    writeln!(&mut stdout, "{}", "no header found".bold()).map_err(Error::Stdout)?
                }
            }
        }
        args::Args::Pack {
            pubkey: expected_pubkey,
            secret,
            aes_key,
            input: input_path,
            output,
            version,
            magic,
            partial_base,
            header_area,
            nonce,
        } => {
            let signer = P256Signer::from_slice(&secret).ok_or(Error::InvalidSecretKey)?;
            // Check that user is not accidentally signing with the wrong key.
            let pubkey = signer.public_key();
            if let Some(expected_pubkey) = expected_pubkey {
                if pubkey != expected_pubkey {
                    return Err(Error::KeyMismatch);
                }
            }

            let mut input_options = std::fs::OpenOptions::new();
            input_options.read(true);
            if let args::Output::InPlace = output {
                // When working in-place, the input file will be written to.
                input_options.write(true);
            }
            let mut input = input_options
                .open(&input_path)
                .map_err(Error::OpenInputFile)?;
            let output = match output {
                args::Output::InPlace => OutputFile::InPlace(
                    // When working in-place, first write to a temporary file. The temporary
                    // file will be moved to the input file at the end of the process.
                    tempfile::NamedTempFile::new().map_err(Error::CreateTempFile)?,
                ),
                args::Output::File(path) => {
                    let mut output_options = std::fs::OpenOptions::new();
                    let file = output_options
                        // After being written, the output file will be read and parsed as a sanity
                        // check.
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&path)
                        .map_err(Error::OpenOutputFile)?;
                    OutputFile::File(file, path.to_owned())
                }
            };

            let mut firmware = Vec::new();
            input
                .read_to_end(&mut firmware)
                .map_err(Error::ReadInputFile)?;

            let partial = match partial_base {
                Some(path) => {
                    let base = read_file(&path)?;
                    Some(changed_range(&base, &firmware).ok_or(Error::NoChanges)?)
                }
                None => None,
            };
            let nonce = nonce.unwrap_or_else(|| derive_nonce(version, &firmware));

            let mut header = Header::new(magic, version, &firmware, partial, nonce, &Sha256)?;
            header.sign(&signer);

            // The shipped part of the firmware, encrypted.
            let (offset, size) = (
                header.partial_offset() as usize,
                header.partial_size() as usize,
            );
            let mut body = firmware[offset..offset + size].to_vec();
            Aes128Ctr::new(&aes_key, header.nonce()).apply_keystream(&mut body);

            // Write the header, the padding up to the header area and the body.
            let mut header_buf = vec![0xff; header_area as usize];
            header.serialize(&mut header_buf)?;
            output
                .file()
                .write_all(&header_buf)
                .map_err(Error::WriteOutputFile)?;
            output
                .file()
                .write_all(&body)
                .map_err(Error::WriteOutputFile)?;

            // When working in-place, the output is actually first written to a temporary
            // file. To achieve the effect of in-place editing, the temporary
            // file must be moved to the input file, replacing it.
            if output.is_in_place() {
                move_file(output.file(), output.path(), &input, &input_path)
                    .map_err(Error::MoveTempFile)?;
            }

            // Sanity check that the output file can be parsed. If not, it's possible the
            // output file was being used by another process.
            output
                .file()
                .seek(std::io::SeekFrom::Start(0))
                .map_err(Error::SeekOutputFile)?;
            let mut output_buf = Vec::new();
            output
                .file()
                .read_to_end(&mut output_buf)
                .map_err(Error::ReadOutputFile)?;
            let written = Header::parse(&output_buf)
                .map_err(Error::ParseOutputFile)?
                .ok_or(Error::ParseOutputFileNoHeader)?;
            if verify_p256(&pubkey, &written.auth_region(), written.signature())
                != VerificationResult::Valid
            {
                return Err(Error::InvalidSignature);
            }
        }
    }
    Ok(())
}

fn dump(header: &Header, mut stdout: impl Write) -> std::io::Result<()> {
    writeln!(
        &mut stdout,
        "{:11} slot {}",
        "magic".bold(),
        header.magic().slot_index() + 1
    )?;
    writeln!(
        &mut stdout,
        "{:11} {}",
        "protocol".bold(),
        header.protocol_version()
    )?;
    writeln!(&mut stdout, "{:11} {}", "version".bold(), header.fw_version())?;
    let human_size = humansize::format_size(header.fw_size(), humansize::BINARY);
    writeln!(
        &mut stdout,
        "{:11} {human_size} ({})",
        "size".bold(),
        header.fw_size(),
    )?;
    if header.is_delta() {
        let human_size = humansize::format_size(header.partial_size(), humansize::BINARY);
        writeln!(
            &mut stdout,
            "{:11} {human_size} ({}) at offset {}",
            "partial".bold(),
            header.partial_size(),
            header.partial_offset(),
        )?;
    }
    writeln!(
        &mut stdout,
        "{:11} {}",
        "fw tag".bold(),
        hex::encode(header.fw_tag())
    )?;
    if header.is_delta() {
        writeln!(
            &mut stdout,
            "{:11} {}",
            "partial tag".bold(),
            hex::encode(header.partial_tag())
        )?;
    }
    writeln!(
        &mut stdout,
        "{:11} {}",
        "nonce".bold(),
        hex::encode(header.nonce())
    )?;
    let signature = header.signature();
    writeln!(
        &mut stdout,
        "{:11} {}",
        "signature".bold(),
        hex::encode(&signature[..32]),
    )?;
    writeln!(
        &mut stdout,
        "{} {}",
        " ".repeat(11),
        hex::encode(&signature[32..]),
    )?;
    let state = match header.image_state() {
        ImageState::New => "new",
        ImageState::SelfTest => "self-test",
        ImageState::Valid => "valid",
        ImageState::ValidAll => "valid (all)",
        ImageState::Corrupt => "corrupt",
    };
    writeln!(&mut stdout, "{:11} {state}", "state".bold())
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    std::fs::File::open(path)
        .map_err(Error::OpenInputFile)?
        .read_to_end(&mut buf)
        .map_err(Error::ReadInputFile)?;
    Ok(buf)
}

/// Offset and length of the part of `firmware` that differs from `base`.
fn changed_range(base: &[u8], firmware: &[u8]) -> Option<(u32, u32)> {
    let grown = firmware.len() > base.len();
    let first = firmware
        .iter()
        .zip(base)
        .position(|(a, b)| a != b)
        .or(grown.then_some(base.len()))?;
    let end = if grown {
        firmware.len()
    } else {
        firmware
            .iter()
            .zip(base)
            .rposition(|(a, b)| a != b)?
            + 1
    };
    Some((first as u32, (end - first) as u32))
}

/// Nonce unique to a version and firmware, so that two images never share a
/// keystream unless they are the same image.
fn derive_nonce(version: u16, firmware: &[u8]) -> [u8; 16] {
    let digest = sha2::Sha256::new()
        .chain_update(b"sfu-image nonce")
        .chain_update(version.to_le_bytes())
        .chain_update(firmware)
        .finalize();
    let mut nonce = [0; 16];
    nonce.copy_from_slice(&digest[..16]);
    nonce
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum OutputFile {
    InPlace(tempfile::NamedTempFile),
    File(std::fs::File, PathBuf),
}

impl OutputFile {
    fn file(&self) -> &std::fs::File {
        match self {
            OutputFile::InPlace(file) => file.as_file(),
            OutputFile::File(file, _) => file,
        }
    }

    fn path(&self) -> &Path {
        match self {
            OutputFile::InPlace(file) => file.path(),
            OutputFile::File(_, path) => path,
        }
    }

    fn is_in_place(&self) -> bool {
        matches!(self, OutputFile::InPlace(_))
    }
}

fn move_file(
    mut from_file: &std::fs::File,
    from_path: &Path,
    mut to_file: &std::fs::File,
    to_path: &Path,
) -> std::io::Result<()> {
    if std::fs::rename(from_path, to_path).is_err() {
        // If rename fails, the files might be on different filesystems.
        // Fall back to copying and removing the original file.
        from_file.seek(std::io::SeekFrom::Start(0))?;
        to_file.seek(std::io::SeekFrom::Start(0))?;
        to_file.set_len(0)?;
        std::io::copy(&mut from_file, &mut to_file)?;
        std::fs::remove_file(from_path)?;
    }
    Ok(())
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    CreateTempFile(std::io::Error),
    Image(sfu_image::Error),
    InvalidSecretKey,
    InvalidSignature,
    KeyMismatch,
    MoveTempFile(std::io::Error),
    NoChanges,
    OpenInputFile(std::io::Error),
    OpenOutputFile(std::io::Error),
    ParseOutputFile(sfu_image::Error),
    ParseOutputFileNoHeader,
    ReadInputFile(std::io::Error),
    ReadOutputFile(std::io::Error),
    SeekOutputFile(std::io::Error),
    Stdout(std::io::Error),
    WriteOutputFile(std::io::Error),
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<sfu_image::Error> for Error {
    fn from(e: sfu_image::Error) -> Self {
        Error::Image(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::CreateTempFile(e) => write!(f, "failed to create temporary file: {e}"),
            Error::Image(e) => write!(f, "{e}"),
            Error::InvalidSecretKey => write!(f, "user specified invalid P-256 secret key"),
            Error::InvalidSignature => write!(f, "invalid header signature"),
            Error::KeyMismatch => write!(f, "public key does not match secret key"),
            Error::MoveTempFile(e) => write!(f, "failed to move temporary file to output: {e}"),
            Error::NoChanges => write!(f, "no bytes differ from the partial base"),
            Error::OpenInputFile(e) => write!(f, "failed to open input file: {e}"),
            Error::OpenOutputFile(e) => write!(f, "failed to open output file: {e}"),
            Error::ParseOutputFile(e) => write!(
                f,
                "failed to parse output file after writing: {e}; is another process using it?"
            ),
            Error::ParseOutputFileNoHeader => write!(
                f,
                "output file has no valid header after writing; is another process using it?"
            ),
            Error::ReadInputFile(e) => write!(f, "failed to read input file: {e}"),
            Error::ReadOutputFile(e) => write!(f, "failed to read output file: {e}"),
            Error::SeekOutputFile(e) => write!(f, "failed to seek output file: {e}"),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
            Error::WriteOutputFile(e) => write!(f, "failed to write to output file: {e}"),
        }
    }
}

impl std::error::Error for Error {}
