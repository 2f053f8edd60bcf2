use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom},
    path::PathBuf,
};

use binrw::BinReaderExt;
use clap::Parser;
use discimg::{
    builder,
    checker,
    composer,
    context::Context,
    structs::{DiscHeader, WiiPartType},
    wbfs::{report::RepairOptions, WbfsFile},
    Fst, WiiIsoReader,
};
use thiserror::Error;

#[derive(Debug, Parser)]
#[clap(about = "inspect, extract, repack and manage Wii/GameCube disc images and WBFS containers")]
enum Commands {
    #[clap(about = "show the partitions of an iso")]
    Sections { filename: PathBuf },
    #[clap(about = "extract the system files of an iso partition to a destination folder")]
    ExtractSys {
        filename: PathBuf,
        destination: PathBuf,
        #[clap(long, default_value = "DATA")]
        section: String,
    },
    #[clap(about = "print all file names present in the given section")]
    PrintFiles {
        filename: PathBuf,
        #[clap(long, default_value = "DATA")]
        section: String,
    },
    #[clap(about = "repack a single-partition ISO from a directory tree")]
    Rebuild { src_dir: PathBuf, dest_file: PathBuf },
    #[clap(about = "repack a multi-partition ISO, normalising the sign policy first")]
    Compose { src_dir: PathBuf, dest_file: PathBuf },
    #[clap(about = "re-derive and compare every partition's hash tree against its TMD")]
    Verify {
        filename: PathBuf,
        #[clap(long, default_value_t = 10)]
        max_err: usize,
    },
    #[clap(about = "format a new, empty wbfs container")]
    WbfsFormat {
        wbfs_file: PathBuf,
        #[clap(long, default_value_t = 2_097_152)]
        n_hd_sec: u32,
        #[clap(long, default_value_t = 9)]
        hd_sec_sz_s: u8,
        #[clap(long, default_value_t = 21)]
        wbfs_sec_sz_s: u8,
        #[clap(long, default_value_t = 1)]
        wbfs_version: u8,
    },
    #[clap(about = "add an iso to a wbfs container")]
    WbfsAdd { wbfs_file: PathBuf, iso_file: PathBuf },
    #[clap(about = "remove a disc from a wbfs container by slot")]
    WbfsRemove {
        wbfs_file: PathBuf,
        slot: u32,
        #[clap(long)]
        free_blocks: bool,
    },
    #[clap(about = "rename a disc's id6/title in place")]
    WbfsRename {
        wbfs_file: PathBuf,
        slot: u32,
        #[clap(long)]
        id6: Option<String>,
        #[clap(long)]
        title: Option<String>,
    },
    #[clap(about = "list the discs stored in a wbfs container")]
    WbfsList { wbfs_file: PathBuf },
    #[clap(about = "check a wbfs container for consistency")]
    WbfsCheck { wbfs_file: PathBuf },
    #[clap(about = "check and repair a wbfs container")]
    WbfsRepair { wbfs_file: PathBuf },
    #[cfg(feature = "fuse")]
    #[clap(about = "mount an iso read-only at a directory")]
    Mount { filename: PathBuf, mountpoint: PathBuf },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read error: {0}")]
    Binrw(#[from] binrw::error::Error),
    #[error("{0}")]
    Core(#[from] discimg::CoreError),
    #[error("{0} is not a valid section, options are: DATA, CHANNEL, UPDATE")]
    InvalidSection(String),
    #[error("section {0:?} not present!")]
    SectionNotFound(WiiPartType),
    #[error("id6 must be exactly 6 bytes")]
    BadId6,
    #[error("title must fit in 64 bytes")]
    BadTitle,
    #[error("{0}")]
    Other(String),
}

fn parse_section(section: &str) -> Result<WiiPartType, CliError> {
    match section.to_ascii_uppercase().as_str() {
        "DATA" => Ok(WiiPartType::Data),
        "CHANNEL" => Ok(WiiPartType::Channel),
        "UPDATE" => Ok(WiiPartType::Update),
        _ => Err(CliError::InvalidSection(section.to_string())),
    }
}

fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Commands::parse();
    match args {
        Commands::Sections { filename } => {
            let f = File::open(filename)?;
            let reader = WiiIsoReader::create(f)?;
            for partition in reader.partitions() {
                println!("{:?}: {:X}", partition.part_type, *partition.part_data_off);
            }
        }
        Commands::PrintFiles { section, filename } => {
            let f = File::open(filename)?;
            let mut reader = WiiIsoReader::create(f)?;
            let part_type = parse_section(&section)?;
            reader
                .partitions()
                .iter()
                .find(|p| p.part_type == part_type)
                .cloned()
                .ok_or(CliError::SectionNotFound(part_type))?;
            let mut part_reader = reader.open_partition_stream(&part_type)?;
            let mut encr_reader = part_reader.open_encryption_reader();
            let disc_header = encr_reader.read_disc_header()?;
            let fst = Fst::read(&mut encr_reader, *disc_header.fst_off)?;
            fst.print_tree();
        }
        Commands::ExtractSys { section, destination, filename } => {
            let f = File::open(filename)?;
            let mut reader = WiiIsoReader::create(f)?;
            let part_type = parse_section(&section)?;
            reader
                .partitions()
                .iter()
                .find(|p| p.part_type == part_type)
                .cloned()
                .ok_or(CliError::SectionNotFound(part_type))?;
            let mut part_reader = reader.open_partition_stream(&part_type)?;
            let mut encryption_reader = part_reader.open_encryption_reader();
            encryption_reader.extract_system_files(&destination)?;
        }
        Commands::Rebuild { src_dir, dest_file } => {
            let mut f = OpenOptions::new().truncate(true).read(true).write(true).create(true).open(&dest_file)?;
            builder::build_from_directory(&src_dir, &mut f, &Context::from_env())
                .map_err(|e| CliError::Other(e.to_string()))?;
        }
        Commands::Compose { src_dir, dest_file } => {
            let mut f = OpenOptions::new().truncate(true).read(true).write(true).create(true).open(&dest_file)?;
            composer::compose_directory_tree(&src_dir, &mut f, composer::SignPolicy::default(), &Context::from_env())
                .map_err(|e| CliError::Other(e.to_string()))?;
        }
        Commands::WbfsFormat { wbfs_file, n_hd_sec, hd_sec_sz_s, wbfs_sec_sz_s, wbfs_version } => {
            let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&wbfs_file)?;
            let wbfs = WbfsFile::create(file, n_hd_sec, hd_sec_sz_s, wbfs_sec_sz_s, wbfs_version)?;
            println!("formatted wbfs container: max_discs={}", wbfs.geometry.max_discs);
        }
        Commands::Verify { filename, max_err } => {
            let f = File::open(filename)?;
            let mut disc = discimg::disc::Disc::open(f)?;
            let reports = checker::verify_disc(&mut disc, max_err)?;
            for (idx, report) in reports.iter().enumerate() {
                if report.is_clean() {
                    println!("partition {idx}: ok ({} groups)", report.groups_checked);
                } else {
                    println!("partition {idx}: {} mismatches, h4_ok={}", report.mismatches.len(), report.h4_ok);
                    for m in &report.mismatches {
                        println!("  {:?} at group {}: {}", m.level, m.group, m.detail);
                    }
                }
            }
        }
        Commands::WbfsAdd { wbfs_file, iso_file } => {
            let file = OpenOptions::new().read(true).write(true).open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            let mut iso = File::open(&iso_file)?;
            let header: DiscHeader = {
                iso.seek(SeekFrom::Start(0))?;
                iso.read_be()?
            };
            let iso_len = iso.metadata()?.len();
            let block_size = wbfs.geometry.wbfs_sec_sz as u64;
            let used_blocks = iso_len.div_ceil(block_size) as u32;
            let ctx = Context::from_env();
            wbfs.add_disc(
                &ctx,
                &header,
                |virt| -> discimg::Result<Option<Vec<u8>>> {
                    let off = virt as u64 * block_size;
                    if off >= iso_len {
                        return Ok(None);
                    }
                    let n = block_size.min(iso_len - off) as usize;
                    let mut buf = vec![0u8; block_size as usize];
                    iso.seek(SeekFrom::Start(off))?;
                    iso.read_exact(&mut buf[..n])?;
                    Ok(Some(buf))
                },
                used_blocks,
                true,
            )?;
        }
        Commands::WbfsRemove { wbfs_file, slot, free_blocks } => {
            let file = OpenOptions::new().read(true).write(true).open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            wbfs.remove_disc(slot, free_blocks)?;
        }
        Commands::WbfsRename { wbfs_file, slot, id6, title } => {
            let file = OpenOptions::new().read(true).write(true).open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            let id6 = id6.map(|s| s.into_bytes().try_into().map_err(|_| CliError::BadId6)).transpose()?;
            let title = title
                .map(|s| {
                    let mut buf = [0u8; 0x40];
                    let bytes = s.as_bytes();
                    if bytes.len() >= buf.len() {
                        return Err(CliError::BadTitle);
                    }
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(buf)
                })
                .transpose()?;
            wbfs.rename_disc(slot, id6, title)?;
        }
        Commands::WbfsList { wbfs_file } => {
            let file = File::open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            for slot in wbfs.live_slots().collect::<Vec<_>>() {
                let info = wbfs.read_disc_info(slot)?;
                println!("slot {slot}: {} {}", info.header.id6_str(), String::from_utf8_lossy(&info.header.disc_title).trim_end_matches('\0'));
            }
        }
        Commands::WbfsCheck { wbfs_file } => {
            let file = File::open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            let report = checker::check_wbfs(&mut wbfs)?;
            println!("{report:#?}");
        }
        Commands::WbfsRepair { wbfs_file } => {
            let file = OpenOptions::new().read(true).write(true).open(&wbfs_file)?;
            let mut wbfs = WbfsFile::open(file)?;
            let report = checker::check_wbfs(&mut wbfs)?;
            checker::repair_wbfs(&mut wbfs, &report, &RepairOptions::all())?;
        }
        #[cfg(feature = "fuse")]
        Commands::Mount { .. } => {
            return Err(CliError::Other("mount is not wired up to a real fuser session yet".into()));
        }
    }
    Ok(())
}
