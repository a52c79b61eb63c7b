use anyhow::{anyhow, Result};
use clap::Parser;
use sigcomp::{
    CompartmentId, Config, Decompressed, Decompressor, NackReport, StreamFramer, TransportKind,
};
use std::io::{self, BufRead, Write};
use tracing::{error, info, level_filters::LevelFilter};

/// Decompress hex encoded SigComp messages read from stdin, one per line
#[derive(Parser)]
#[clap(name = "nebula-udvm")]
struct Args {
    /// Compartment the messages belong to
    #[clap(short, long, default_value = "nebula-udvm")]
    compartment: String,

    /// Lines are chunks of a stream transport instead of whole messages
    #[clap(long)]
    stream: bool,

    /// Config file, RFC 3320 defaults when absent
    #[clap(long)]
    config: Option<String>,

    /// Log at debug level
    #[clap(short, long)]
    verbose: bool,
}

fn print_result(out: &mut impl Write, result: Result<Decompressed, NackReport>) -> Result<()> {
    match result {
        Ok(decompressed) => {
            writeln!(out, "{}", String::from_utf8_lossy(&decompressed.output))?;
            for state in decompressed.committed_states.iter() {
                info!("saved state {}", hex::encode(state.id));
            }
        }
        Err(nack) => {
            writeln!(out, "NACK {nack} {}", hex::encode(nack.to_bytes(None)))?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.verbose {
        nebula_log::init_with_level(LevelFilter::DEBUG);
    } else {
        nebula_log::init();
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let transport = if args.stream {
        TransportKind::Stream
    } else {
        TransportKind::Message
    };
    let decompressor = Decompressor::new(config);
    let compartment = CompartmentId::from(args.compartment.as_str());
    let mut framer = StreamFramer::new();

    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    for (n, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bytes = match hex::decode(line) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("line {}: {e}", n + 1);
                continue;
            }
        };

        if transport == TransportKind::Message {
            let result = decompressor.decompress(Some(&compartment), &bytes, transport);
            print_result(&mut out, result)?;
            continue;
        }
        for message in framer.push(&bytes) {
            match message {
                Ok(message) => {
                    let result = decompressor.decompress(Some(&compartment), &message, transport);
                    print_result(&mut out, result)?;
                }
                Err(e) => {
                    let nack = NackReport::build(e.reason(), None, None);
                    print_result(&mut out, Err(nack))?;
                }
            }
        }
    }

    if framer.pending() > 0 {
        return Err(anyhow!(
            "stream ended inside a message, {} bytes pending",
            framer.pending()
        ));
    }
    Ok(())
}
