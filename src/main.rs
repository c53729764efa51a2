use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use mbbsvm::btrieve::BtrieveProcessor;

/// Inspect a legacy Btrieve data file and optionally dump its records in
/// the recovery format.
#[derive(Parser, Debug)]
#[command(name = "btrecover")]
struct Cli {
    /// The .DAT (or mirrored .EMU) file to open.
    path: PathBuf,
    /// Write a recovery dump of every record to this file.
    #[arg(long)]
    recover: Option<PathBuf>,
    /// Print key definitions.
    #[arg(long)]
    keys: bool,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let dir = args.path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let name = match args.path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => {
            eprintln!("not a file path: {}", args.path.display());
            std::process::exit(1);
        }
    };

    let processor = match BtrieveProcessor::open(dir, name) {
        Ok(processor) => processor,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };

    let file = processor.file();
    println!("{}", args.path.display());
    println!(
        "  record length: {} (physical {})",
        file.record_length, file.physical_record_length
    );
    println!("  page length:   {} x {} pages", file.page_length, file.page_count);
    println!("  keys:          {}", file.key_count());
    println!("  records:       {}", processor.record_count());

    if args.keys {
        for (number, key) in &file.keys {
            for segment in &key.segments {
                println!(
                    "  key {number}: offset {} length {} {:?} {:?}",
                    segment.offset, segment.length, segment.data_type, segment.attributes
                );
            }
        }
    }

    if let Some(out_path) = args.recover {
        let result = File::create(&out_path)
            .and_then(|mut out| processor.dump_records(&mut out).and_then(|_| out.flush()));
        match result {
            Ok(()) => println!("recovered {} records to {}", processor.record_count(), out_path.display()),
            Err(error) => {
                eprintln!("recovery failed: {error}");
                std::process::exit(1);
            }
        }
    }
}
