use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};

use quill_wal::config::DatabaseOptions;
use quill_wal::database::Database;
use quill_wal::error::WalResult;
use quill_wal::recovery::lsn::{wal_file_name, DEFAULT_WAL_SEGMENT_SIZE};
use quill_wal::recovery::resource_manager::describe_record;
use quill_wal::recovery::timeline::read_timeline_history;
use quill_wal::recovery::wal::{LocalPageSource, SegmentFileManager, WalReader, XLOG_DIR};
use quill_wal::recovery::{ControlFileManager, Lsn};
use quill_wal::utils::timestamp::format_timestamptz;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Operator tool for quill-wal data directories", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new data directory.
    Init {
        dir: PathBuf,
        #[clap(long, help = "WAL segment size in bytes", default_value_t = DEFAULT_WAL_SEGMENT_SIZE)]
        segment_size: u64,
    },
    /// Print the control file.
    Controldata { dir: PathBuf },
    /// Decode WAL records.
    Dump {
        dir: PathBuf,
        #[clap(long, help = "Start position (X/X); defaults to the last checkpoint's redo")]
        start: Option<Lsn>,
        #[clap(long, help = "Stop after this many records")]
        limit: Option<usize>,
        #[clap(long, help = "Print per resource manager statistics instead of records")]
        stats: bool,
    },
    /// Open the directory, run a forced checkpoint and shut down.
    Checkpoint { dir: PathBuf },
    /// Open the directory, switch to a new WAL segment and shut down.
    Switch { dir: PathBuf },
}

fn controldata(dir: &PathBuf) -> WalResult<()> {
    let data = ControlFileManager::read_data(&ControlFileManager::control_path(dir))?;
    let cp = &data.checkpoint_copy;
    let seg = data.xlog_seg_size as u64;
    let mut table = Table::new();
    table.load_preset("||--+-++|    ++++++");
    table.set_header(vec![Cell::new("field"), Cell::new("value")]);
    let rows: Vec<(&str, String)> = vec![
        ("Database system identifier", data.system_identifier.to_string()),
        ("pg_control version number", data.pg_control_version.to_string()),
        ("Catalog version number", data.catalog_version_no.to_string()),
        ("Database cluster state", data.state.to_string()),
        ("pg_control last modified", format_timestamptz(data.time)),
        ("Latest checkpoint location", data.checkpoint.to_string()),
        ("Prior checkpoint location", data.prev_checkpoint.to_string()),
        ("Latest checkpoint's REDO location", cp.redo.to_string()),
        (
            "Latest checkpoint's REDO WAL file",
            wal_file_name(cp.this_tli.max(1), cp.redo.segment(seg), seg),
        ),
        ("Latest checkpoint's TimeLineID", cp.this_tli.to_string()),
        ("Latest checkpoint's PrevTimeLineID", cp.prev_tli.to_string()),
        ("Latest checkpoint's full_page_writes", if cp.full_page_writes { "on" } else { "off" }.to_string()),
        ("Latest checkpoint's NextXID", format!("{}/{}", cp.next_xid_epoch, cp.next_xid)),
        ("Latest checkpoint's NextOID", cp.next_oid.to_string()),
        ("Latest checkpoint's NextMultiXactId", cp.next_multi.to_string()),
        ("Latest checkpoint's NextMultiOffset", cp.next_multi_offset.to_string()),
        ("Latest checkpoint's oldestXID", cp.oldest_xid.to_string()),
        ("Latest checkpoint's oldestXID's DB", cp.oldest_xid_db.to_string()),
        ("Latest checkpoint's oldestActiveXID", cp.oldest_active_xid.to_string()),
        ("Time of latest checkpoint", format_timestamptz(cp.time)),
        ("Minimum recovery ending location", data.min_recovery_point.to_string()),
        ("Min recovery ending loc's timeline", data.min_recovery_point_tli.to_string()),
        ("Backup start location", data.backup_start_point.to_string()),
        ("Backup end location", data.backup_end_point.to_string()),
        ("End-of-backup record required", if data.backup_end_required { "yes" } else { "no" }.to_string()),
        ("Bytes per WAL segment", data.xlog_seg_size.to_string()),
        ("WAL block size", data.xlog_blcksz.to_string()),
        ("Database block size", data.blcksz.to_string()),
    ];
    for (field, value) in rows {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    }
    println!("{table}");
    Ok(())
}

#[derive(Default)]
struct RmgrStats {
    records: usize,
    record_bytes: u64,
    fpi: usize,
}

fn dump(dir: &PathBuf, start: Option<Lsn>, limit: Option<usize>, stats: bool) -> WalResult<()> {
    let data = ControlFileManager::read_data(&ControlFileManager::control_path(dir))?;
    let seg = data.xlog_seg_size as u64;
    let xlog = dir.join(XLOG_DIR);
    let tlis = read_timeline_history(&xlog, None, data.checkpoint_copy.this_tli.max(1))?;
    let segments = Arc::new(SegmentFileManager::new(&xlog, seg, false, false)?);
    let mut reader = WalReader::new(LocalPageSource::new(segments), seg, data.system_identifier, tlis);

    let mut next = Some(start.unwrap_or(data.checkpoint_copy.redo));
    let mut seen = 0usize;
    let mut per_rmgr: BTreeMap<String, RmgrStats> = BTreeMap::new();
    while limit.map_or(true, |l| seen < l) {
        let Some(record) = reader.read_record(next.take())? else {
            if let Some(err) = reader.last_error() {
                eprintln!("error in WAL record at {}: {}", reader.read_rec_ptr(), err);
            }
            break;
        };
        seen += 1;
        if stats {
            let entry = per_rmgr.entry(record.rmid.to_string()).or_default();
            entry.records += 1;
            entry.record_bytes += u64::from(record.header.tot_len);
            entry.fpi += record.blocks.len();
        } else {
            println!(
                "rmgr: {:<11} len (rec/tot): {:>6}/{:>6}, tx: {:>10}, lsn: {}, prev {}, bkp: {}, desc: {}",
                record.rmid.to_string(),
                record.header.len,
                record.header.tot_len,
                record.xid(),
                record.lsn,
                record.header.prev,
                record.blocks.len(),
                describe_record(&record)
            );
        }
    }

    if stats {
        let mut table = Table::new();
        table.load_preset("||--+-++|    ++++++");
        table.set_header(vec![
            Cell::new("Type"),
            Cell::new("N"),
            Cell::new("Record size"),
            Cell::new("FPI"),
        ]);
        for (name, s) in &per_rmgr {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(s.records),
                Cell::new(s.record_bytes),
                Cell::new(s.fpi),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

fn run(args: Args) -> WalResult<()> {
    match args.command {
        Command::Init { dir, segment_size } => {
            let mut options = DatabaseOptions::default();
            options.wal.segment_size = segment_size;
            let system_id = Database::init(&options, &dir)?;
            println!("initialized {} (system identifier {})", dir.display(), system_id);
        }
        Command::Controldata { dir } => controldata(&dir)?,
        Command::Dump {
            dir,
            start,
            limit,
            stats,
        } => dump(&dir, start, limit, stats)?,
        Command::Checkpoint { dir } => {
            let db = Database::open(&DatabaseOptions::default(), &dir)?;
            match db.checkpoint()? {
                Some(outcome) => println!("checkpoint at {} (redo {})", outcome.lsn, outcome.redo),
                None => println!("checkpoint skipped"),
            }
            db.shutdown()?;
        }
        Command::Switch { dir } => {
            let db = Database::open(&DatabaseOptions::default(), &dir)?;
            let next = db.switch_wal()?;
            println!("switched WAL; next segment starts at {}", next);
            db.shutdown()?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("quill-wal: {}", err);
            ExitCode::FAILURE
        }
    }
}
