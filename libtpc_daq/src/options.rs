use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ConfigError;

/// Destination selected by the `write_mode` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    None = 0,
    File = 1,
    Mongo = 2,
}

/// Payload compression selected by the `compression` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

/// Parsing strategy selected by the `processing_mode` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Raw = 0,
    Blocks = 1,
    ChannelsZle = 2,
    ChannelsNoZle = 3,
    ChannelsNewFw = 4,
}

/// A register write to be applied to one board (or all boards for -1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub address: u32,
    pub value: u32,
    pub board: i32,
}

/// One optical link definition from the `link` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDef {
    pub link_type: String,
    pub id: i32,
    pub crate_id: i32,
}

/// One digitizer definition from the `board` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDef {
    pub board_type: String,
    pub vme_address: u32,
    pub id: i32,
    pub link: i32,
    pub crate_id: i32,
}

/// The structured view of the sink options handed to the provisioner and sink.
#[derive(Debug, Clone, Default)]
pub struct MongoOptions {
    pub address: String,
    pub database: String,
    pub collection: String,
    pub write_concern: i32,
    pub min_insert_size: i32,
    pub capped_size: i64,
    pub sharding: bool,
    pub indices: Vec<String>,
    pub shards: Vec<String>,
    pub hosts: Vec<(String, String)>,
}

impl MongoOptions {
    /// Distinct host addresses, falling back to the single configured address.
    pub fn distinct_hosts(&self) -> Vec<String> {
        if self.hosts.is_empty() {
            return vec![self.address.clone()];
        }
        let mut seen = Vec::new();
        for (_, addr) in &self.hosts {
            if !seen.contains(addr) {
                seen.push(addr.clone());
            }
        }
        seen
    }
}

/// The full set of recognized run options.
///
/// Scalar integers use -1 as the "unset" sentinel and strings use the empty
/// string, so a record parsed from a sparse file or document stays
/// distinguishable from one where an operator set a value explicitly.
/// Parsing the same input twice yields the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    // General
    pub name: String,
    pub creator: String,
    pub creation_date: String,
    // Run
    pub write_mode: i32,
    pub baseline_mode: i32,
    pub run_start: i32,
    pub run_start_module: i32,
    pub blt_size: i32,
    pub compression: i32,
    // Sink
    pub mongo_address: String,
    pub mongo_database: String,
    pub mongo_collection: String,
    pub mongo_write_concern: i32,
    pub mongo_min_insert_size: i32,
    pub mongo_capped_size: i64,
    pub mongo_sharding: i32,
    pub mongo_indices: Vec<String>,
    pub mongo_shards: Vec<String>,
    pub mongo_hosts: Vec<(String, String)>,
    // Processing
    pub processing_mode: i32,
    pub processing_num_threads: i32,
    pub processing_readout_threshold: i32,
    // File sink
    pub file_path: String,
    pub file_events_per_file: i32,
    // Feature flags
    pub rotating_collections: i32,
    pub lite_mode: i32,
    pub debug_output: i32,
    pub occurrence_integral: i32,
    // Run document extras
    pub trigger_mode: String,
    pub source_type: String,
    pub pulser_freq: i32,
    // Sequences
    pub registers: Vec<RegisterWrite>,
    pub links: Vec<LinkDef>,
    pub boards: Vec<BoardDef>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            creator: String::new(),
            creation_date: String::new(),
            write_mode: -1,
            baseline_mode: -1,
            run_start: -1,
            run_start_module: -1,
            blt_size: -1,
            compression: -1,
            mongo_address: String::new(),
            mongo_database: String::new(),
            mongo_collection: String::new(),
            mongo_write_concern: -1,
            mongo_min_insert_size: -1,
            mongo_capped_size: 0,
            mongo_sharding: -1,
            mongo_indices: Vec::new(),
            mongo_shards: Vec::new(),
            mongo_hosts: Vec::new(),
            processing_mode: -1,
            processing_num_threads: -1,
            processing_readout_threshold: -1,
            file_path: String::new(),
            file_events_per_file: -1,
            rotating_collections: -1,
            lite_mode: -1,
            debug_output: -1,
            occurrence_integral: -1,
            trigger_mode: String::new(),
            source_type: String::new(),
            pulser_freq: -1,
            registers: Vec::new(),
            links: Vec::new(),
            boards: Vec::new(),
        }
    }
}

/// One entry of the directive table: applies whitespace-split arguments to the
/// record. Returning Err marks the line malformed; the line is then skipped.
type Setter = fn(&mut RunOptions, &[&str]) -> Result<(), String>;

/// Table mapping directive names to typed setters. Unknown directives are
/// ignored so old readers keep accepting newer parameter files.
const DIRECTIVES: &[(&str, Setter)] = &[
    ("name", |o, w| set_string(&mut o.name, w)),
    ("creator", |o, w| set_string(&mut o.creator, w)),
    ("creation_date", |o, w| set_string(&mut o.creation_date, w)),
    ("write_mode", |o, w| set_int(&mut o.write_mode, w)),
    ("baseline_mode", |o, w| set_int(&mut o.baseline_mode, w)),
    ("run_start", |o, w| set_int(&mut o.run_start, w)),
    ("run_start_module", |o, w| set_int(&mut o.run_start_module, w)),
    ("blt_size", |o, w| set_int(&mut o.blt_size, w)),
    ("compression", |o, w| set_int(&mut o.compression, w)),
    ("mongo_address", |o, w| set_string(&mut o.mongo_address, w)),
    ("mongo_database", |o, w| set_string(&mut o.mongo_database, w)),
    ("mongo_collection", |o, w| set_string(&mut o.mongo_collection, w)),
    ("mongo_write_concern", |o, w| {
        set_int(&mut o.mongo_write_concern, w)
    }),
    ("mongo_min_insert_size", |o, w| {
        set_int(&mut o.mongo_min_insert_size, w)
    }),
    ("mongo_capped_size", |o, w| set_i64(&mut o.mongo_capped_size, w)),
    ("mongo_sharding", |o, w| set_int(&mut o.mongo_sharding, w)),
    ("mongo_index", |o, w| {
        for field in w {
            o.mongo_indices.push((*field).to_string());
        }
        Ok(())
    }),
    ("mongo_shard", |o, w| {
        o.mongo_shards.push(require(w, 0)?.to_string());
        Ok(())
    }),
    ("mongo_host", |o, w| {
        let name = require(w, 0)?.to_string();
        let addr = require(w, 1)?.to_string();
        o.mongo_hosts.push((name, addr));
        Ok(())
    }),
    ("processing_mode", |o, w| set_int(&mut o.processing_mode, w)),
    ("processing_num_threads", |o, w| {
        set_int(&mut o.processing_num_threads, w)
    }),
    ("processing_readout_threshold", |o, w| {
        set_int(&mut o.processing_readout_threshold, w)
    }),
    ("file_path", |o, w| set_string(&mut o.file_path, w)),
    ("file_events_per_file", |o, w| {
        set_int(&mut o.file_events_per_file, w)
    }),
    ("rotating_collections", |o, w| {
        set_int(&mut o.rotating_collections, w)
    }),
    ("lite_mode", |o, w| set_int(&mut o.lite_mode, w)),
    ("debug_output", |o, w| set_int(&mut o.debug_output, w)),
    ("occurrence_integral", |o, w| {
        set_int(&mut o.occurrence_integral, w)
    }),
    ("trigger_mode", |o, w| set_string(&mut o.trigger_mode, w)),
    ("source_type", |o, w| set_string(&mut o.source_type, w)),
    ("pulser_freq", |o, w| set_int(&mut o.pulser_freq, w)),
    ("register", |o, w| {
        // A token starting with '#' ends the directive.
        let w = strip_comment(w);
        let address = parse_hex(require(w, 0)?)?;
        let value = parse_hex(require(w, 1)?)?;
        let board = match w.get(2) {
            Some(token) => parse_int(token)?,
            None => -1,
        };
        o.registers.push(RegisterWrite {
            address,
            value,
            board,
        });
        Ok(())
    }),
    ("link", |o, w| {
        let w = strip_comment(w);
        o.links.push(LinkDef {
            link_type: require(w, 0)?.to_string(),
            id: parse_int(require(w, 1)?)?,
            crate_id: parse_int(require(w, 2)?)?,
        });
        Ok(())
    }),
    ("board", |o, w| {
        let w = strip_comment(w);
        o.boards.push(BoardDef {
            board_type: require(w, 0)?.to_string(),
            vme_address: parse_hex(require(w, 1)?)?,
            id: parse_int(require(w, 2)?)?,
            link: parse_int(require(w, 3)?)?,
            crate_id: parse_int(require(w, 4)?)?,
        });
        Ok(())
    }),
];

fn set_string(field: &mut String, w: &[&str]) -> Result<(), String> {
    *field = require(w, 0)?.to_string();
    Ok(())
}

fn set_int(field: &mut i32, w: &[&str]) -> Result<(), String> {
    *field = parse_int(require(w, 0)?)?;
    Ok(())
}

fn set_i64(field: &mut i64, w: &[&str]) -> Result<(), String> {
    *field = require(w, 0)?
        .parse::<i64>()
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn require<'a>(w: &[&'a str], index: usize) -> Result<&'a str, String> {
    w.get(index)
        .copied()
        .ok_or_else(|| format!("expected at least {} arguments", index + 1))
}

fn strip_comment<'a, 'b>(w: &'a [&'b str]) -> &'a [&'b str] {
    match w.iter().position(|token| token.starts_with('#')) {
        Some(end) => &w[..end],
        None => w,
    }
}

fn parse_int(s: &str) -> Result<i32, String> {
    s.parse::<i32>().map_err(|e| format!("'{s}': {e}"))
}

/// Registers and VME addresses are written in hex, with or without `0x`.
fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("'{s}': {e}"))
}

impl RunOptions {
    /// Read a line-oriented parameter file.
    ///
    /// Lines starting with `#` are comments; each directive is `key value…`.
    /// Unknown keys are ignored and malformed lines are skipped with a
    /// warning, so one bad directive never takes down a run start.
    pub fn read_parameter_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let mut options = RunOptions::default();
        for line in BufReader::new(file).lines() {
            options.apply_line(&line?);
        }
        Ok(options)
    }

    /// Apply a single parameter-file line to the record.
    pub fn apply_line(&mut self, line: &str) {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            return;
        }
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if words.len() < 2 {
            return;
        }
        if let Err(reason) = self.apply_directive(words[0], &words[1..]) {
            spdlog::warn!("Skipping malformed '{}' directive: {}", words[0], reason);
        }
    }

    /// Look up the directive table and apply one `key args…` pair.
    /// Unknown keys succeed without effect.
    pub fn apply_directive(&mut self, key: &str, args: &[&str]) -> Result<(), String> {
        for (name, setter) in DIRECTIVES {
            if *name == key {
                return setter(self, args);
            }
        }
        Ok(())
    }

    /// Build a record from a run-mode document.
    pub fn from_document(doc: &Value) -> Result<Self, ConfigError> {
        let fields = doc.as_object().ok_or(ConfigError::BadDocument)?;
        let mut options = RunOptions::default();
        for (key, value) in fields {
            options.apply_document_field(key, value);
        }
        Ok(options)
    }

    fn apply_document_field(&mut self, key: &str, value: &Value) {
        match key {
            "registers" => {
                for entry in value.as_array().into_iter().flatten() {
                    let (Some(address), Some(val)) = (
                        hex_field(entry, "address"),
                        hex_field(entry, "value"),
                    ) else {
                        spdlog::warn!("Skipping malformed register entry in run mode");
                        continue;
                    };
                    let board = entry
                        .get("board")
                        .and_then(Value::as_i64)
                        .unwrap_or(-1) as i32;
                    self.registers.push(RegisterWrite {
                        address,
                        value: val,
                        board,
                    });
                }
            }
            "links" => {
                for entry in value.as_array().into_iter().flatten() {
                    let Some(link_type) = entry.get("type").and_then(Value::as_str) else {
                        continue;
                    };
                    self.links.push(LinkDef {
                        link_type: link_type.to_string(),
                        id: int_field(entry, "id"),
                        crate_id: int_field(entry, "crate"),
                    });
                }
            }
            "boards" => {
                for entry in value.as_array().into_iter().flatten() {
                    let Some(board_type) = entry.get("type").and_then(Value::as_str) else {
                        continue;
                    };
                    self.boards.push(BoardDef {
                        board_type: board_type.to_string(),
                        vme_address: hex_field(entry, "vme_address").unwrap_or(0),
                        id: int_field(entry, "id"),
                        link: int_field(entry, "link"),
                        crate_id: int_field(entry, "crate"),
                    });
                }
            }
            "mongo_index" | "mongo_indices" => {
                for entry in value.as_array().into_iter().flatten() {
                    if let Some(field) = entry.as_str() {
                        self.mongo_indices.push(field.to_string());
                    }
                }
            }
            "mongo_shards" => {
                for entry in value.as_array().into_iter().flatten() {
                    if let Some(shard) = entry.as_str() {
                        self.mongo_shards.push(shard.to_string());
                    }
                }
            }
            "mongo_hosts" => {
                for (name, addr) in value.as_object().into_iter().flatten() {
                    if let Some(addr) = addr.as_str() {
                        self.mongo_hosts.push((name.clone(), addr.to_string()));
                    }
                }
            }
            // "parent" is inheritance plumbing, not an option
            "parent" | "_id" => {}
            _ => {
                let arg = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => String::from(if *b { "1" } else { "0" }),
                    _ => return,
                };
                if let Err(reason) = self.apply_directive(key, &[arg.as_str()]) {
                    spdlog::warn!("Skipping malformed '{key}' field in run mode: {reason}");
                }
            }
        }
    }

    /// Export the record as a document for embedding in the run document.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn write_mode(&self) -> WriteMode {
        match self.write_mode {
            1 => WriteMode::File,
            2 => WriteMode::Mongo,
            _ => WriteMode::None,
        }
    }

    pub fn compression(&self) -> Compression {
        match self.compression {
            1 => Compression::Snappy,
            _ => Compression::None,
        }
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        match self.processing_mode {
            1 => ProcessingMode::Blocks,
            2 => ProcessingMode::ChannelsZle,
            3 => ProcessingMode::ChannelsNoZle,
            4 => ProcessingMode::ChannelsNewFw,
            _ => ProcessingMode::Raw,
        }
    }

    pub fn rotating_collections(&self) -> bool {
        self.rotating_collections == 1
    }

    pub fn lite_mode(&self) -> bool {
        self.lite_mode == 1
    }

    pub fn debug_output(&self) -> bool {
        self.debug_output == 1
    }

    /// Worker count, at least one.
    pub fn num_threads(&self) -> usize {
        self.processing_num_threads.max(1) as usize
    }

    /// The structured sink options view.
    pub fn mongo_options(&self) -> MongoOptions {
        MongoOptions {
            address: self.mongo_address.clone(),
            database: self.mongo_database.clone(),
            collection: self.mongo_collection.clone(),
            write_concern: self.mongo_write_concern,
            min_insert_size: self.mongo_min_insert_size,
            capped_size: self.mongo_capped_size,
            sharding: self.mongo_sharding == 1,
            indices: self.mongo_indices.clone(),
            shards: self.mongo_shards.clone(),
            hosts: self.mongo_hosts.clone(),
        }
    }

    /// Last value written to `address` by the register sequence, if any.
    pub fn register_value(&self, address: u32) -> Option<u32> {
        self.registers
            .iter()
            .rev()
            .find(|r| r.address == address)
            .map(|r| r.value)
    }
}

fn int_field(entry: &Value, key: &str) -> i32 {
    entry.get(key).and_then(Value::as_i64).unwrap_or(-1) as i32
}

fn hex_field(entry: &Value, key: &str) -> Option<u32> {
    match entry.get(key)? {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::String(s) => parse_hex(s).ok(),
        _ => None,
    }
}

/// Merge a run-mode document with its parent so that child fields win.
///
/// The composite inherits the parent's own `parent` (or `"none"`), which is
/// what lets the resolver keep walking up a chain of modes.
pub fn compose_with_parent(child: &Value, parent: &Value) -> Value {
    let mut merged = serde_json::Map::new();
    let grandparent = parent
        .get("parent")
        .and_then(Value::as_str)
        .unwrap_or("none");
    merged.insert("parent".to_string(), Value::String(grandparent.to_string()));
    if let Some(fields) = child.as_object() {
        for (key, value) in fields {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if let Some(fields) = parent.as_object() {
        for (key, value) in fields {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_file() -> &'static str {
        "# sample run mode\n\
         name test_mode\n\
         write_mode 2\n\
         compression 1\n\
         processing_mode 2\n\
         mongo_address mongodb://daq0:27017/\n\
         mongo_database run\n\
         mongo_min_insert_size 100\n\
         register 8080 310 # DPP off\n\
         register 0x8000 0x10 1\n\
         link V2718 0 0\n\
         board V1724 0x32100000 101 0 0\n\
         board V1724 0x32110000 102 0 0\n\
         unknown_future_directive 42\n\
         malformed_board_line\n\
         blt_size notanumber\n"
    }

    fn parse_sample() -> RunOptions {
        let mut options = RunOptions::default();
        for line in sample_file().lines() {
            options.apply_line(line);
        }
        options
    }

    #[test]
    fn parses_scalars_and_sequences() {
        let options = parse_sample();
        assert_eq!(options.name, "test_mode");
        assert_eq!(options.write_mode(), WriteMode::Mongo);
        assert_eq!(options.compression(), Compression::Snappy);
        assert_eq!(options.processing_mode(), ProcessingMode::ChannelsZle);
        assert_eq!(options.mongo_min_insert_size, 100);
        assert_eq!(options.registers.len(), 2);
        assert_eq!(options.registers[0].address, 0x8080);
        assert_eq!(options.registers[0].value, 0x310);
        assert_eq!(options.registers[0].board, -1);
        assert_eq!(options.registers[1].board, 1);
        assert_eq!(options.links.len(), 1);
        assert_eq!(options.boards.len(), 2);
        assert_eq!(options.boards[0].vme_address, 0x3210_0000);
        assert_eq!(options.boards[1].id, 102);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let options = parse_sample();
        // blt_size had a bad value, so it stays at the unset sentinel
        assert_eq!(options.blt_size, -1);
    }

    #[test]
    fn parsing_twice_yields_the_same_record() {
        assert_eq!(parse_sample(), parse_sample());
    }

    #[test]
    fn missing_file_is_config_missing() {
        let result = RunOptions::read_parameter_file(Path::new("/nonexistent/daq.ini"));
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[test]
    fn reads_file_from_disk() {
        let path = std::env::temp_dir().join("tpc_daq_options_test.ini");
        let mut file = File::create(&path).unwrap();
        file.write_all(sample_file().as_bytes()).unwrap();
        let options = RunOptions::read_parameter_file(&path).unwrap();
        assert_eq!(options, parse_sample());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn compose_child_fields_win() {
        let child = json!({"a": 1, "parent": "p"});
        let parent = json!({"a": 9, "b": 2});
        let merged = compose_with_parent(&child, &parent);
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
        assert_eq!(merged["parent"], json!("none"));
    }

    #[test]
    fn compose_terminates_chain_with_none() {
        let child = json!({"a": 1, "parent": "p"});
        let parent = json!({"b": 2, "parent": "none"});
        let merged = compose_with_parent(&child, &parent);
        assert_eq!(merged, json!({"a": 1, "b": 2, "parent": "none"}));
    }

    #[test]
    fn from_document_applies_scalars_and_boards() {
        let doc = json!({
            "name": "doc_mode",
            "write_mode": 2,
            "mongo_min_insert_size": 250,
            "boards": [
                {"type": "V1724", "vme_address": "0x32100000", "id": 7, "link": 0, "crate": 0}
            ],
            "registers": [
                {"address": "0x8080", "value": "0x1000310", "board": -1}
            ],
            "parent": "none"
        });
        let options = RunOptions::from_document(&doc).unwrap();
        assert_eq!(options.name, "doc_mode");
        assert_eq!(options.mongo_min_insert_size, 250);
        assert_eq!(options.boards[0].id, 7);
        assert_eq!(options.registers[0].value, 0x100_0310);
        assert_eq!(options.register_value(0x8080), Some(0x100_0310));
    }
}
