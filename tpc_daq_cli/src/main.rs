//! # tpc_daq_cli
//!
//! Part of the tpc_daq crate family.
//!
//! Command line tool for working with DAQ parameter files. The readers and
//! the dispatcher are wired up by their own daemons; this tool only covers
//! the operator-facing file chores:
//!
//! ```bash
//! tpc_daq_cli -p/--path <parameters.ini> new    # write a template file
//! tpc_daq_cli -p/--path <parameters.ini>        # parse and summarize it
//! ```

use clap::{Arg, Command};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use libtpc_daq::options::{RunOptions, WriteMode};

const TEMPLATE: &str = "\
# tpc_daq run parameters
name template_mode
creator nobody
write_mode 2
compression 1
processing_mode 4
processing_num_threads 2
blt_size 524288

mongo_address mongodb://localhost:27017/
mongo_database data
mongo_min_insert_size 100
rotating_collections 0

# register <address hex> <value hex> [board]
register 8080 310
# link <type> <id> <crate>
link V2718 0 0
# board <type> <vme address hex> <id> <link> <crate>
board V1724 32100000 101 0 0
";

fn make_template_config(path: &Path) {
    let mut file = File::create(path).expect("Could not create template parameter file!");
    file.write_all(TEMPLATE.as_bytes())
        .expect("Failed to write template parameter file!");
}

fn main() {
    // Create a cli
    let matches = Command::new("tpc_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template parameter file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the parameter file"),
        )
        .get_matches();

    // Initialize feedback
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("Could not create logging!");

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if matches.subcommand_matches("new").is_some() {
        log::info!(
            "Making a template parameter file at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    log::info!("Loading parameters from {}...", config_path.to_string_lossy());
    let options = match RunOptions::read_parameter_file(&config_path) {
        Ok(options) => options,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Parameters successfully loaded.");
    log::info!("Mode Name: {}", options.name);
    log::info!("Write Mode: {:?}", options.write_mode());
    log::info!("Processing Mode: {:?}", options.processing_mode());
    log::info!("Compression: {:?}", options.compression());
    log::info!("Worker Threads: {}", options.num_threads());
    log::info!(
        "Boards: {} ({} registers, {} links)",
        options.boards.len(),
        options.registers.len(),
        options.links.len()
    );

    match options.write_mode() {
        WriteMode::Mongo => {
            let mongo = options.mongo_options();
            if mongo.address.is_empty() || mongo.database.is_empty() {
                log::error!("write_mode 2 requires mongo_address and mongo_database");
                return;
            }
            log::info!("Destination: {} / {}", mongo.address, mongo.database);
        }
        WriteMode::File => {
            if options.file_path.is_empty() {
                log::error!("write_mode 1 requires file_path");
                return;
            }
            log::info!("Destination: {}_NNNNNN.pb", options.file_path);
        }
        WriteMode::None => log::info!("Destination: none (parse and drop)"),
    }
    if options.boards.is_empty() {
        log::warn!("No boards defined; a reader started with this file will idle.");
    }
    log::info!("Done.");
}
