use {
    crate::ExitCode,
    sfu_image::{
        rustcrypto::{verify_p256, Aes128Ctr},
        Header, VerificationResult,
    },
    sha2::{Digest, Sha256},
    std::io::{Read, Write},
};


/// Try to dump header contents of a file with no header.
#[test]
fn dump_no_header() {
    let file = create_file(b"Hello, world!");
    let output = test(["dump", "-i", file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("no header"));
    assert!(output.stderr.is_empty());
}

/// Pack a firmware and dump the resulting header.
#[test]
fn pack_and_dump() {
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "7",
        "--nonce",
        "000102030405060708090a0b0c0d0e0f",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    let output = test([
        "dump",
        "-i",
        output_file.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_1_HEX,
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("slot 1"));
    assert!(output.stdout.contains("7"));
    // Prints firmware size.
    assert!(output.stdout.contains("13 B (13)"));
    // Full images have no partial range.
    assert!(!output.stdout.contains("partial"));
    assert!(output
        .stdout
        .contains(&hex::encode(Sha256::digest(b"Hello, world!"))));
    assert!(output.stdout.contains("000102030405060708090a0b0c0d0e0f"));
    assert!(output.stdout.contains("new"));
    assert!(output.stdout.contains("verified"));
    assert!(output.stderr.is_empty());
}

/// The packed file is the header, padding up to the header area and the
/// encrypted firmware.
#[test]
fn pack_output_layout() {
    let firmware = input::firmware(3000, 1);
    let input_file = create_file(&firmware);
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_1_HEX,
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
        "--slot",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let packed = read_file(output_file.path());
    let header_area = consts::HEADER_AREA_SIZE as usize;
    assert_eq!(packed.len(), header_area + firmware.len());
    assert!(packed[Header::SIZE..header_area].iter().all(|&b| b == 0xff));

    let header = Header::parse(&packed).unwrap().unwrap();
    assert_eq!(header.magic().slot_index(), 1);
    assert_eq!(header.fw_version(), 2);
    assert_eq!(header.fw_size(), 3000);
    assert!(!header.is_delta());
    assert_eq!(header.fw_tag().as_slice(), Sha256::digest(&firmware).as_slice());
    assert_eq!(
        verify_p256(&input::pubkey_1(), &header.auth_region(), header.signature()),
        VerificationResult::Valid
    );

    let mut body = packed[header_area..].to_vec();
    assert_ne!(body, firmware);
    Aes128Ctr::new(&input::AES_KEY, header.nonce()).apply_keystream(&mut body);
    assert_eq!(body, firmware);
}

/// Two versions of the same firmware never share a nonce.
#[test]
fn pack_derives_distinct_nonces() {
    let firmware = input::firmware(100, 3);
    let secret_pem = create_file(input::SECRET_1_PEM);
    let mut nonces = Vec::new();
    for version in ["1", "2"] {
        let input_file = create_file(&firmware);
        let output_file = tempfile::NamedTempFile::new().unwrap();
        let output = test([
            "pack",
            "--secret",
            secret_pem.path().to_str().unwrap(),
            "--aes-key",
            input::AES_KEY_HEX,
            "-i",
            input_file.path().to_str().unwrap(),
            "-o",
            output_file.path().to_str().unwrap(),
            "--firmware-version",
            version,
        ]);
        assert_eq!(output.exit_code, ExitCode(0));
        let header = Header::parse(&read_file(output_file.path()))
            .unwrap()
            .unwrap();
        nonces.push(*header.nonce());
    }
    assert_ne!(nonces[0], nonces[1]);
}

/// Pack a firmware in place.
#[test]
fn pack_in_place() {
    let firmware = input::firmware(500, 2);
    let input_file = create_file(&firmware);
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "3",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stderr.is_empty());

    let packed = read_file(input_file.path());
    assert_eq!(packed.len(), consts::HEADER_AREA_SIZE as usize + firmware.len());
    let header = Header::parse(&packed).unwrap().unwrap();
    assert_eq!(header.fw_version(), 3);
    assert_eq!(header.fw_size(), 500);
}

/// Only the bytes that differ from the installed firmware are shipped.
#[test]
fn pack_partial() {
    let base = input::firmware(1000, 4);
    let mut firmware = base.clone();
    firmware[100..110].fill(0xaa);
    firmware[150] ^= 1;
    let base_file = create_file(&base);
    let input_file = create_file(&firmware);
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
        "--partial-base",
        base_file.path().to_str().unwrap(),
        "--header-area",
        "512",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let packed = read_file(output_file.path());
    assert_eq!(packed.len(), 512 + 51);
    let header = Header::parse(&packed).unwrap().unwrap();
    assert!(header.is_delta());
    assert_eq!(header.partial_offset(), 100);
    assert_eq!(header.partial_size(), 51);
    assert_eq!(header.fw_size(), 1000);
    assert_eq!(header.fw_tag().as_slice(), Sha256::digest(&firmware).as_slice());
    assert_eq!(
        header.partial_tag().as_slice(),
        Sha256::digest(&firmware[100..151]).as_slice()
    );

    let mut body = packed[512..].to_vec();
    Aes128Ctr::new(&input::AES_KEY, header.nonce()).apply_keystream(&mut body);
    assert_eq!(body, &firmware[100..151]);

    let output = test(["dump", "-i", output_file.path().to_str().unwrap()]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stdout.contains("partial"));
    assert!(output.stdout.contains("at offset 100"));
}

/// A firmware that grew ships everything from the first changed byte to the
/// new end.
#[test]
fn pack_partial_grown_firmware() {
    let base = input::firmware(600, 5);
    let mut firmware = base.clone();
    firmware.extend_from_slice(&[1, 2, 3, 4]);
    let base_file = create_file(&base);
    let input_file = create_file(&firmware);
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
        "--partial-base",
        base_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let header = Header::parse(&read_file(output_file.path()))
        .unwrap()
        .unwrap();
    assert_eq!(header.partial_offset(), 600);
    assert_eq!(header.partial_size(), 4);
}

/// Try to pack a partial image identical to its base.
#[test]
fn pack_partial_without_changes() {
    let firmware = input::firmware(300, 6);
    let base_file = create_file(&firmware);
    let input_file = create_file(&firmware);
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
        "--partial-base",
        base_file.path().to_str().unwrap(),
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("no bytes differ"));
}

/// Try to pack with a secret key that does not match the given public key.
#[test]
fn pack_pubkey_mismatch() {
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_2_HEX,
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output
        .stderr
        .contains("public key does not match secret key"));
}

/// Dump with a public key that did not sign the header.
#[test]
fn dump_with_wrong_pubkey() {
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_2_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_2_HEX,
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test([
        "dump",
        "-i",
        output_file.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_2_HEX,
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    let output = test([
        "dump",
        "-i",
        output_file.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_1_HEX,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("invalid header signature"));
}

/// Dump a header whose signed fields were modified after signing.
#[test]
fn dump_tampered_header() {
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));

    // Bump the firmware version.
    let mut packed = read_file(output_file.path());
    packed[6] = 3;
    let tampered = create_file(&packed);
    let output = test([
        "dump",
        "-i",
        tampered.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_1_HEX,
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("invalid header signature"));
}

/// Try to pack without a secret key.
#[test]
fn pack_secret_missing() {
    let input_file = create_file(b"Hello, world!");
    let output = test([
        "pack",
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stdout.is_empty());
    assert!(output.stderr.contains("user did not specify a secret key"));
    // The input is untouched.
    assert_eq!(read_file(input_file.path()), b"Hello, world!");
}

/// Try to pack without an AES key.
#[test]
fn pack_aes_key_missing() {
    let input_file = create_file(b"Hello, world!");
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("user did not specify an AES key"));
}

/// Try to pack with an AES key of the wrong length.
#[test]
fn pack_invalid_aes_key() {
    let input_file = create_file(b"Hello, world!");
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        "0011",
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("invalid AES key"));
}

/// Try to pack with a PEM file that holds no EC private key.
#[test]
fn pack_invalid_pem_tag() {
    let input_file = create_file(b"Hello, world!");
    let secret_pem = create_file(input::PUBLIC_KEY_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("invalid PEM tag"));
    assert!(output.stderr.contains("PUBLIC KEY"));
}

/// Try to specify both an output file and in-place packing.
#[test]
fn pack_in_place_and_output() {
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output
        .stderr
        .contains("cannot specify both --in-place and --output (-o)"));
}

/// Try to pack for a slot that does not exist.
#[test]
fn pack_invalid_slot() {
    let input_file = create_file(b"Hello, world!");
    let secret_pem = create_file(input::SECRET_1_PEM);
    for slot in ["0", "4"] {
        let output = test([
            "pack",
            "--secret",
            secret_pem.path().to_str().unwrap(),
            "--aes-key",
            input::AES_KEY_HEX,
            "-i",
            input_file.path().to_str().unwrap(),
            "--in-place",
            "--firmware-version",
            "2",
            "--slot",
            slot,
        ]);
        assert_eq!(output.exit_code, ExitCode(1));
        assert!(output
            .stderr
            .contains(&format!("user specified invalid slot: {slot}")));
    }
}

/// Try to reserve less room than the header needs.
#[test]
fn pack_header_area_too_small() {
    let input_file = create_file(b"Hello, world!");
    let secret_pem = create_file(input::SECRET_1_PEM);
    let output = test([
        "pack",
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
        "--header-area",
        "256",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output
        .stderr
        .contains("header area of 256 bytes cannot hold the 304 byte header"));
}

/// Pack with the keys and header area taken from a config file.
#[test]
fn pack_with_config() {
    let secret_pem = create_file(input::SECRET_1_PEM);
    let config = create_file(
        format!(
            "pubkey = \"{}\"\nsecret = \"{}\"\naes_key = \"{}\"\nheader_area = 1024\n",
            input::PUBKEY_1_HEX,
            secret_pem.path().to_str().unwrap(),
            input::AES_KEY_HEX,
        )
        .as_bytes(),
    );
    let input_file = create_file(b"Hello, world!");
    let output_file = tempfile::NamedTempFile::new().unwrap();
    let output = test([
        "pack",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        input_file.path().to_str().unwrap(),
        "-o",
        output_file.path().to_str().unwrap(),
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(0));
    assert!(output.stderr.is_empty());
    assert_eq!(read_file(output_file.path()).len(), 1024 + 13);
}

/// Try to use a relative secret key path in the config file.
#[test]
fn pack_config_relative_secret_path() {
    let config = create_file(
        format!(
            "secret = \"keys/secret.pem\"\naes_key = \"{}\"\n",
            input::AES_KEY_HEX
        )
        .as_bytes(),
    );
    let input_file = create_file(b"Hello, world!");
    let output = test([
        "pack",
        "-c",
        config.path().to_str().unwrap(),
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output
        .stderr
        .contains("config error: secret key path is not absolute"));
}

/// Try to specify the public key both in the config and on the command line.
#[test]
fn pack_pubkey_in_config_and_cli() {
    let secret_pem = create_file(input::SECRET_1_PEM);
    let config = create_file(format!("pubkey = \"{}\"\n", input::PUBKEY_1_HEX).as_bytes());
    let input_file = create_file(b"Hello, world!");
    let output = test([
        "pack",
        "-c",
        config.path().to_str().unwrap(),
        "--pubkey",
        input::PUBKEY_1_HEX,
        "--secret",
        secret_pem.path().to_str().unwrap(),
        "--aes-key",
        input::AES_KEY_HEX,
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
        "--firmware-version",
        "2",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output
        .stderr
        .contains("pubkey specified in both config and cli"));
}

/// Try to pack without the required firmware version.
#[test]
fn pack_version_missing() {
    let input_file = create_file(b"Hello, world!");
    let output = test([
        "pack",
        "-i",
        input_file.path().to_str().unwrap(),
        "--in-place",
    ]);
    assert_eq!(output.exit_code, ExitCode(1));
    assert!(output.stderr.contains("--firmware-version"));
}

fn test<const N: usize>(args: [&str; N]) -> Output {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = crate::main_args(
        std::iter::once("sfu-image").chain(args),
        &mut stdout,
        &mut stderr,
    );
    println!("* args: {:?}", args);
    println!("* exit_code: {:?}", exit_code);
    println!("* stdout:\n{}", String::from_utf8_lossy(&stdout));
    println!("* stderr:\n{}", String::from_utf8_lossy(&stderr));
    Output {
        exit_code,
        stdout: String::from_utf8(stdout).unwrap(),
        stderr: String::from_utf8(stderr).unwrap(),
    }
}

#[derive(Debug)]
struct Output {
    exit_code: ExitCode,
    stdout: String,
    stderr: String,
}

fn create_file(data: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file
}

fn read_file(path: &std::path::Path) -> Vec<u8> {
    let mut buf = Vec::new();
    std::fs::File::open(path)
        .unwrap()
        .read_to_end(&mut buf)
        .unwrap();
    buf
}
