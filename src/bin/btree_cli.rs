//! Small CLI over the first table of a shared B-tree file.
//!
//! Usage:
//!   btree_cli <db_path> put <key> <value>
//!   btree_cli <db_path> get <key>
//!   btree_cli <db_path> delete <key>
//!   btree_cli <db_path> scan [start] [end]
//!   btree_cli <db_path> stats
//!   btree_cli <db_path> dump
//!   btree_cli <db_path> bulk_insert <count>
//!   btree_cli <db_path> pagesize <bytes>
//!
//! Set `RUST_LOG=shared_btree=debug` to see transaction and page events.

use shared_btree::{Btree, Config, PageId, Result, SeekResult, StorageError};
use std::env;
use std::process::exit;
use tracing_subscriber::EnvFilter;

/// Root page of the table the CLI works on
const TABLE_ROOT: PageId = PageId::new(1);

fn usage() -> ! {
    eprintln!("Usage: btree_cli <db_path> <command> [args...]");
    eprintln!("Commands:");
    eprintln!("  put <key> <value>     - Insert or update a row");
    eprintln!("  get <key>             - Get the payload of a row");
    eprintln!("  delete <key>          - Delete a row");
    eprintln!("  scan [start] [end]    - Scan rows in key range");
    eprintln!("  stats                 - Show statistics as JSON");
    eprintln!("  dump                  - Show the tree as JSON");
    eprintln!("  bulk_insert <count>   - Append count test rows");
    eprintln!("  pagesize <bytes>      - Set the page size of an empty file");
    exit(1);
}

fn parse_key(arg: Option<&String>) -> Result<i64> {
    let arg = arg.ok_or_else(|| StorageError::invalid_operation("missing key"))?;
    arg.parse()
        .map_err(|_| StorageError::invalid_operation(format!("invalid key {:?}", arg)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| StorageError::invalid_operation(e.to_string()))
}

/// Begin a transaction, creating the table on first write
fn begin(db: &mut Btree, write: bool) -> Result<()> {
    db.begin_trans(write)?;
    if db.shared().stats().page_count <= TABLE_ROOT.value() {
        if !write {
            return Err(StorageError::invalid_operation("database has no table yet"));
        }
        let root = db.create_table()?;
        if root != TABLE_ROOT {
            return Err(StorageError::corruption(format!(
                "table created at page {}",
                root
            )));
        }
    }
    Ok(())
}

fn run(db: &mut Btree, command: &str, args: &[String]) -> Result<()> {
    match command {
        "put" => {
            let key = parse_key(args.first())?;
            let value = args.get(1).ok_or_else(|| StorageError::invalid_operation("missing value"))?;
            begin(db, true)?;
            let mut cursor = db.cursor(TABLE_ROOT, true)?;
            cursor.insert(key, value.as_bytes())?;
            drop(cursor);
            db.commit()?;
            println!("OK");
        }

        "get" => {
            let key = parse_key(args.first())?;
            begin(db, false)?;
            let mut cursor = db.cursor(TABLE_ROOT, false)?;
            if cursor.move_to(key, false)? == SeekResult::Found {
                let payload = cursor.payload()?;
                match String::from_utf8(payload) {
                    Ok(s) => println!("{}", s),
                    Err(_) => println!("<binary data>"),
                }
            } else {
                println!("NOT_FOUND");
            }
        }

        "delete" => {
            let key = parse_key(args.first())?;
            begin(db, true)?;
            let mut cursor = db.cursor(TABLE_ROOT, true)?;
            if cursor.move_to(key, false)? == SeekResult::Found {
                cursor.delete()?;
                println!("DELETED");
            } else {
                println!("NOT_FOUND");
            }
            drop(cursor);
            db.commit()?;
        }

        "scan" => {
            let start = args.first().map(|_| parse_key(args.first())).transpose()?;
            let end = args.get(1).map(|_| parse_key(args.get(1))).transpose()?;
            begin(db, false)?;
            let mut cursor = db.cursor(TABLE_ROOT, false)?;

            let mut more = match start {
                Some(start) => match cursor.move_to(start, true)? {
                    SeekResult::Less => cursor.next()?,
                    _ => cursor.is_valid(),
                },
                None => cursor.first()?,
            };
            let mut rows = Vec::new();
            while more {
                let key = cursor.key()?;
                if end.is_some_and(|end| key >= end) {
                    break;
                }
                rows.push((key, cursor.payload()?));
                more = cursor.next()?;
            }

            println!("COUNT: {}", rows.len());
            for (key, payload) in rows {
                println!("{} -> {}", key, String::from_utf8_lossy(&payload));
            }
        }

        "stats" => {
            println!("{}", to_json(&db.shared().stats())?);
        }

        "dump" => {
            begin(db, false)?;
            println!("{}", to_json(&db.export_tree(TABLE_ROOT)?)?);
        }

        "bulk_insert" => {
            let count: i64 = args
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StorageError::invalid_operation("invalid count"))?;

            let start = std::time::Instant::now();
            begin(db, true)?;
            let mut cursor = db.cursor(TABLE_ROOT, true)?;
            let first = if cursor.last()? { cursor.key()? + 1 } else { 0 };
            for key in first..first + count {
                cursor.insert(key, format!("value_{}", key).as_bytes())?;
            }
            drop(cursor);
            db.commit()?;
            let elapsed = start.elapsed();

            let ops_per_sec = count as f64 / elapsed.as_secs_f64();
            println!("INSERTED: {}", count);
            println!("TIME_MS: {}", elapsed.as_millis());
            println!("OPS_PER_SEC: {:.0}", ops_per_sec);
        }

        "pagesize" => {
            let size: usize = args
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StorageError::invalid_operation("invalid page size"))?;
            db.set_page_size(size)?;
            println!("PAGE_SIZE: {}", db.page_size());
        }

        _ => {
            eprintln!("Unknown command: {}", command);
            usage();
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let config = Config::new(&args[1]);
    let mut db = match Btree::open(&config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("ERROR: Failed to open database: {}", e);
            exit(1);
        }
    };

    if let Err(e) = run(&mut db, &args[2], &args[3..]) {
        eprintln!("ERROR: {}", e);
        exit(1);
    }

    if let Err(e) = db.close() {
        eprintln!("Warning: Failed to close: {}", e);
    }
}
