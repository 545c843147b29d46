//! Capsule-report pretty-printer (spec.md §1's "ancillary glue"). Reads a
//! binary dump of an `EFI_CAPSULE_RESULT_VARIABLE_HEADER` (the
//! `CapsuleLast`/`CapsuleXXXX` UEFI variable payload) from a file and prints
//! the fields `CapsuleDump.c`'s `DmpCapsuleStatusVariable` prints, minus the
//! runtime-services variable enumeration this CLI has no access to outside
//! firmware. Correctness depth is out of scope (spec.md Non-goals); this is
//! thin plumbing, not a capsule-report parser of record.

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[derive(Parser, Debug)]
#[command(name = "capsule-dump", about = "Pretty-print a UEFI capsule result variable")]
struct Cli {
    /// Path to a raw dump of the capsule result variable payload.
    path: std::path::PathBuf,
}

/// Mirrors `EFI_CAPSULE_RESULT_VARIABLE_HEADER` (`Guid/CapsuleReport.h`):
/// total size, a 16-byte capsule GUID, a 64-bit EFI timestamp, and a status code.
#[derive(Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct CapsuleResultHeader {
    variable_total_size: u32,
    reserved: u32,
    capsule_guid: [u8; 16],
    capsule_processed: u64,
    capsule_status: u32,
}

const STATUS_SUCCESS: u32 = 0;

fn format_guid(guid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

fn format_status(status: u32) -> &'static str {
    if status == STATUS_SUCCESS {
        "EFI_SUCCESS"
    } else {
        "EFI_ERROR"
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let bytes = fs::read(&cli.path).map_err(|e| format!("reading {}: {e}", cli.path.display()))?;
    let header = CapsuleResultHeader::ref_from_prefix(&bytes)
        .map_err(|_| "file too short for a capsule result header".to_string())?
        .0;

    if (header.variable_total_size as usize) < core::mem::size_of::<CapsuleResultHeader>() {
        return Err("VariableTotalSize smaller than the fixed header".to_string());
    }

    println!("Capsule Guid: {}", format_guid(&header.capsule_guid));
    println!("Capsule ProcessedTime (raw EFI_TIME bits): 0x{:016x}", header.capsule_processed);
    println!("Capsule Status: {}", format_status(header.capsule_status));
    println!("VariableTotalSize: 0x{:x}", header.variable_total_size);

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("capsule-dump: {e}");
            ExitCode::FAILURE
        }
    }
}
