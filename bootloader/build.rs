// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! This build script writes the `memory.x` file into a directory where the
//! linker can always find it at build time. The flash partition of the
//! bootloader comes from the shared flash map in `consts`, so the linker
//! script and the installer never disagree on where the bootloader ends.

use consts::{BASE_BOOTLOADER_ADDR, BOOTLOADER_SIZE};
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

fn main() {
    let memory_x_content = format!(
        r##"
        BASE_BOOTLOADER_ADDR = {:#X};
        BOOTLOADER_SIZE = {:#X};

        MEMORY
        {{
            /* NOTE 1 K = 1 KiBi = 1024 bytes */
            /* The bootloader runs from the start of flash, the MCU has no MBR */
            FLASH (rx) : ORIGIN = BASE_BOOTLOADER_ADDR, LENGTH = BOOTLOADER_SIZE
            RAM : ORIGIN = 0x20000000, LENGTH = 256K
            uicr_approtect (r) : ORIGIN = 0x10001208, LENGTH = 0x4
        }}

        SECTIONS {{
            .uicr_approtect :  {{
                KEEP(*(.uicr_approtect))
                . = ALIGN(4);
            }} > uicr_approtect
        }};
        "##,
        BASE_BOOTLOADER_ADDR, BOOTLOADER_SIZE
    );
    // Put `memory.x` in our output directory and ensure it's
    // on the linker search path.
    let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
    File::create(out.join("memory.x"))
        .unwrap()
        .write_all(memory_x_content.as_bytes())
        .unwrap();
    println!("cargo:rustc-link-search={}", out.display());

    println!("cargo:rerun-if-changed=build.rs");

    println!("cargo:rustc-link-arg-bins=--nmagic");
    println!("cargo:rustc-link-arg-bins=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
}
