//! Command-line front end for tansu store files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use tansu::{
    init_logging, BtreeDb, Config, HashDb, OpenMode, Result, Stats, TableDb, TansuError,
};

#[derive(Parser)]
#[command(name = "tansu", version, about = "Embedded key-value and table stores")]
struct Cli {
    /// Log filter, e.g. "info" or "tansu=debug".
    #[arg(long, default_value = "warn", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Kind {
    Hash,
    Btree,
    Table,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty store file.
    Create {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
        /// Page size in bytes (power of two, at least 512).
        #[arg(long)]
        page_size: Option<u32>,
        /// Bucket count for hash stores.
        #[arg(long)]
        buckets: Option<u32>,
    },
    /// Print store statistics.
    Stat {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
        /// Emit the statistics as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Store a record. Table stores take repeated column=value pairs.
    Put {
        path: PathBuf,
        key: String,
        /// Value for hash and btree stores, column=value pairs for tables.
        values: Vec<String>,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
        /// Fail instead of overwriting an existing record.
        #[arg(long)]
        keep: bool,
    },
    /// Print the value of one record.
    Get {
        path: PathBuf,
        key: String,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
    },
    /// Remove a record.
    Out {
        path: PathBuf,
        key: String,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
    },
    /// List keys, optionally restricted to a prefix.
    List {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Rebuild the store compactly.
    Optimize {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = Kind::Hash)]
        kind: Kind,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;
    match cli.command {
        Command::Create {
            path,
            kind,
            page_size,
            buckets,
        } => {
            let mut config = Config::default();
            if let Some(page_size) = page_size {
                config.page_size = page_size;
            }
            if let Some(buckets) = buckets {
                config.bucket_count = buckets;
            }
            let mode = OpenMode::writer();
            match kind {
                Kind::Hash => drop(HashDb::open_with(&path, mode, config)?),
                Kind::Btree => drop(BtreeDb::open_with(&path, mode, config)?),
                Kind::Table => drop(TableDb::open_with(&path, mode, config)?),
            }
            println!("created {}", path.display());
        }
        Command::Stat { path, kind, json } => {
            let stats = match kind {
                Kind::Hash => HashDb::open(&path, OpenMode::reader())?.stats()?,
                Kind::Btree => BtreeDb::open(&path, OpenMode::reader())?.stats()?,
                Kind::Table => TableDb::open(&path, OpenMode::reader())?.stats()?,
            };
            print_stats(&stats, json)?;
        }
        Command::Put {
            path,
            key,
            values,
            kind,
            keep,
        } => match kind {
            Kind::Hash => {
                let db = HashDb::open(&path, OpenMode::writer())?;
                let value = joined_value(&values)?;
                if keep {
                    db.put_keep(key.as_bytes(), value.as_bytes())?;
                } else {
                    db.put(key.as_bytes(), value.as_bytes())?;
                }
            }
            Kind::Btree => {
                let db = BtreeDb::open(&path, OpenMode::writer())?;
                let value = joined_value(&values)?;
                if keep {
                    db.put_keep(key.as_bytes(), value.as_bytes())?;
                } else {
                    db.put(key.as_bytes(), value.as_bytes())?;
                }
            }
            Kind::Table => {
                let db = TableDb::open(&path, OpenMode::writer())?;
                let cols = parse_columns(&values)?;
                if keep {
                    db.put_keep(key.as_bytes(), &cols)?;
                } else {
                    db.put(key.as_bytes(), &cols)?;
                }
            }
        },
        Command::Get { path, key, kind } => match kind {
            Kind::Hash => {
                let db = HashDb::open(&path, OpenMode::reader())?;
                print_value(db.get(key.as_bytes())?)?;
            }
            Kind::Btree => {
                let db = BtreeDb::open(&path, OpenMode::reader())?;
                print_value(db.get(key.as_bytes())?)?;
            }
            Kind::Table => {
                let db = TableDb::open(&path, OpenMode::reader())?;
                match db.get(key.as_bytes())? {
                    Some(cols) => {
                        for (name, value) in cols {
                            println!("{name}\t{value}");
                        }
                    }
                    None => return Err(TansuError::NotFound("record")),
                }
            }
        },
        Command::Out { path, key, kind } => {
            let removed = match kind {
                Kind::Hash => HashDb::open(&path, OpenMode::writer())?.out(key.as_bytes())?,
                Kind::Btree => BtreeDb::open(&path, OpenMode::writer())?.out(key.as_bytes())?,
                Kind::Table => TableDb::open(&path, OpenMode::writer())?.out(key.as_bytes())?,
            };
            if !removed {
                return Err(TansuError::NotFound("record"));
            }
        }
        Command::List {
            path,
            kind,
            prefix,
            max,
        } => {
            let prefix = prefix.unwrap_or_default();
            let keys = match kind {
                Kind::Hash => {
                    HashDb::open(&path, OpenMode::reader())?.fwmkeys(prefix.as_bytes(), max)?
                }
                Kind::Btree => {
                    BtreeDb::open(&path, OpenMode::reader())?.fwmkeys(prefix.as_bytes(), max)?
                }
                Kind::Table => {
                    TableDb::open(&path, OpenMode::reader())?.fwmkeys(prefix.as_bytes(), max)?
                }
            };
            for key in keys {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Command::Optimize { path, kind } => match kind {
            Kind::Hash => HashDb::open(&path, OpenMode::writer())?.optimize(None)?,
            Kind::Btree => BtreeDb::open(&path, OpenMode::writer())?.optimize()?,
            Kind::Table => TableDb::open(&path, OpenMode::writer())?.optimize()?,
        },
    }
    Ok(())
}

fn joined_value(values: &[String]) -> Result<String> {
    if values.is_empty() {
        return Err(TansuError::InvalidArgument("a value is required".into()));
    }
    Ok(values.join(" "))
}

fn parse_columns(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut cols = BTreeMap::new();
    for pair in values {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            TansuError::InvalidArgument(format!("expected column=value, got {pair:?}"))
        })?;
        cols.insert(name.to_string(), value.to_string());
    }
    if cols.is_empty() {
        return Err(TansuError::InvalidArgument(
            "at least one column=value pair is required".into(),
        ));
    }
    Ok(cols)
}

fn print_stats(stats: &Stats, json: bool) -> Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(stats)
            .map_err(|e| TansuError::InvalidArgument(e.to_string()))?;
        println!("{rendered}");
    } else {
        println!("path         {}", stats.path);
        println!("kind         {}", stats.kind);
        println!("page size    {}", stats.page_size);
        println!("page count   {}", stats.page_count);
        println!("file size    {}", stats.file_size);
        println!("records      {}", stats.record_count);
        println!("free pages   {}", stats.free_pages);
    }
    Ok(())
}

fn print_value(value: Option<Vec<u8>>) -> Result<()> {
    match value {
        Some(value) => {
            println!("{}", String::from_utf8_lossy(&value));
            Ok(())
        }
        None => Err(TansuError::NotFound("record")),
    }
}
