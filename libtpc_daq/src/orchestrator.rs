//! Run lifecycle orchestration on the master.
//!
//! The coordinator owns three store connections (log, monitor, runs), polls
//! the control collection for operator commands, assembles and maintains the
//! run document, provisions destinations through [`crate::provision`], and
//! reports back to the console through the dispatcher-reply and log
//! collections. A secondary database going away is logged and the slot is
//! disabled until `reconnect`; the run itself only depends on the runs and
//! buffer databases.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use fxhash::FxHashMap;
use serde_json::{json, Value};

use super::error::{CommandError, OrchestratorError};
use super::options::{self, RunOptions, WriteMode};
use super::provision::{provision_collection, RollingWorker};
use super::store::{DocumentStore, Oid, StoreConnector};
use std::sync::Arc;

/// Register whose bit 24 disables on-board (DPP) triggering.
const DPP_REGISTER: u32 = 0x8080;
const DPP_DISABLE_BIT: u32 = 1 << 24;

/// Message priorities of the error taxonomy wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Info = 0,
    Warning = 1,
    Error = 2,
}

/// Reply codes understood by the operator console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Ack = 11,
    Action = 12,
    Started = 13,
    Error = 18,
    Done = 19,
}

/// Which detectors a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSelect {
    Tpc,
    MuonVeto,
    All,
}

impl DetectorSelect {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tpc" => Some(Self::Tpc),
            "muon_veto" => Some(Self::MuonVeto),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tpc => "tpc",
            Self::MuonVeto => "muon_veto",
            Self::All => "all",
        }
    }

    /// Does this selection cover the named detector?
    pub fn includes(&self, detector: &str) -> bool {
        matches!(self, Self::All) || self.as_str() == detector
    }
}

/// A validated operator command.
#[derive(Debug)]
pub enum DaqCommand {
    Start {
        user: String,
        comment: String,
        detector: DetectorSelect,
        override_run: bool,
        /// Resolved run options, keyed by detector name.
        options: BTreeMap<String, RunOptions>,
        expire_after_seconds: i32,
    },
    Stop {
        user: String,
        comment: String,
        detector: DetectorSelect,
    },
}

/// Addresses and names of the master's databases.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub log_address: String,
    pub monitor_address: String,
    pub runs_address: String,
    /// Database name shared by the three (historically always "run").
    pub db_name: String,
    pub runs_collection: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_address: String::new(),
            monitor_address: String::new(),
            runs_address: String::new(),
            db_name: String::from("run"),
            runs_collection: String::from("runs"),
        }
    }
}

/// The master-side orchestration engine.
pub struct RunCoordinator {
    connector: Arc<dyn StoreConnector>,
    config: CoordinatorConfig,
    log_db: Option<Arc<dyn DocumentStore>>,
    monitor_db: Option<Arc<dyn DocumentStore>>,
    runs_db: Option<Arc<dyn DocumentStore>>,
    /// Run-document ids of the live runs, keyed by detector.
    last_doc_oids: FxHashMap<String, Oid>,
    rolling_workers: FxHashMap<String, RollingWorker>,
    stop_deadlines: FxHashMap<String, Instant>,
}

impl RunCoordinator {
    pub fn new(connector: Arc<dyn StoreConnector>, config: CoordinatorConfig) -> Self {
        Self {
            connector,
            config,
            log_db: None,
            monitor_db: None,
            runs_db: None,
            last_doc_oids: FxHashMap::default(),
            rolling_workers: FxHashMap::default(),
            stop_deadlines: FxHashMap::default(),
        }
    }

    /// Open all three connections. A secondary slot failing is logged and
    /// left disabled; returns whether everything came up.
    pub fn connect(&mut self) -> bool {
        let mut all_up = true;
        for slot in ["log", "monitor", "runs"] {
            if !self.reconnect_slot(slot) {
                all_up = false;
            }
        }
        all_up
    }

    /// Retry every disabled slot.
    pub fn reconnect(&mut self) -> bool {
        self.connect()
    }

    /// Drop all connections.
    pub fn teardown(&mut self) {
        self.log_db = None;
        self.monitor_db = None;
        self.runs_db = None;
    }

    fn reconnect_slot(&mut self, slot: &'static str) -> bool {
        let (address, holder) = match slot {
            "log" => (self.config.log_address.clone(), &mut self.log_db),
            "monitor" => (self.config.monitor_address.clone(), &mut self.monitor_db),
            _ => (self.config.runs_address.clone(), &mut self.runs_db),
        };
        if holder.is_some() {
            return true;
        }
        match self.connector.connect(&address) {
            Ok(db) => {
                *holder = Some(db);
                true
            }
            Err(e) => {
                spdlog::warn!("Proceeding without {} DB: {}", slot, e);
                false
            }
        }
    }

    /// Insert into one of the three databases. A failed insert takes the
    /// slot down so a flaky secondary cannot spam errors; the next
    /// `reconnect` brings it back.
    fn insert_online(&mut self, slot: &'static str, ns: &str, doc: Value) {
        if !self.reconnect_slot(slot) {
            return;
        }
        let holder = match slot {
            "log" => &mut self.log_db,
            "monitor" => &mut self.monitor_db,
            _ => &mut self.runs_db,
        };
        if let Some(db) = holder.as_ref() {
            if let Err(e) = db.insert(ns, doc) {
                spdlog::error!(
                    "Failed inserting to '{}' DB, disabling it. Offending collection: {}. Error: {}",
                    slot,
                    ns,
                    e
                );
                *holder = None;
            }
        }
    }

    fn ns(&self, collection: &str) -> String {
        format!("{}.{}", self.config.db_name, collection)
    }

    fn runs_ns(&self) -> String {
        format!("{}.{}", self.config.db_name, self.config.runs_collection)
    }

    // ---------------------------------------------------------- commands

    /// Read, consume and validate at most one control document.
    ///
    /// Returns `Ok(None)` when the control collection is empty or the
    /// monitor database is down. A Start for `"all"` requires both
    /// detectors' run modes to resolve; any failure releases everything.
    pub fn check_for_command(&mut self) -> Result<Option<DaqCommand>, OrchestratorError> {
        self.reconnect_slot("monitor");
        let Some(monitor) = self.monitor_db.clone() else {
            return Ok(None);
        };
        let control_ns = self.ns("daq_control");
        if monitor.count(&control_ns)? == 0 {
            return Ok(None);
        }
        let Some(doc) = monitor.find_one(&control_ns, &json!({}), None)? else {
            return Ok(None);
        };

        let command = string_field(&doc, "command");
        let user = string_field(&doc, "user");
        let comment = string_field(&doc, "comment");
        let detector_name = string_field(&doc, "detector");

        // One command at a time: matching docs go away before validation.
        monitor.remove(
            &control_ns,
            &json!({"command": "Start", "detector": detector_name}),
        )?;
        monitor.remove(
            &control_ns,
            &json!({"command": "Stop", "detector": detector_name}),
        )?;

        let detector = DetectorSelect::parse(&detector_name)
            .ok_or_else(|| CommandError::Invalid(format!("detector '{detector_name}'")))?;

        match command.as_str() {
            "Stop" => Ok(Some(DaqCommand::Stop {
                user,
                comment,
                detector,
            })),
            "Start" => {
                let mode_tpc = string_field(&doc, "run_mode_tpc");
                let mode_mv = string_field(&doc, "run_mode_mv");
                let override_run = doc
                    .get("override")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let expire_after_seconds = doc
                    .get("stop_after_minutes")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as i32
                    * 60;

                let mut options = BTreeMap::new();
                match detector {
                    DetectorSelect::All => {
                        options.insert("tpc".to_string(), self.resolve_mode(&mode_tpc)?);
                        options.insert("muon_veto".to_string(), self.resolve_mode(&mode_mv)?);
                    }
                    DetectorSelect::Tpc => {
                        options.insert("tpc".to_string(), self.resolve_mode(&mode_tpc)?);
                    }
                    DetectorSelect::MuonVeto => {
                        options.insert("muon_veto".to_string(), self.resolve_mode(&mode_mv)?);
                    }
                }
                Ok(Some(DaqCommand::Start {
                    user,
                    comment,
                    detector,
                    override_run,
                    options,
                    expire_after_seconds,
                }))
            }
            other => Err(CommandError::Invalid(other.to_string()).into()),
        }
    }

    fn resolve_mode(&mut self, name: &str) -> Result<RunOptions, OrchestratorError> {
        let doc = self.pull_run_mode(name)?;
        Ok(RunOptions::from_document(&doc)?)
    }

    /// Fetch a run mode, walking its parent chain.
    ///
    /// Fields of the child dominate; the walk ends at `parent == "none"`, a
    /// missing `parent` field, or an empty parent (logged, not fatal).
    pub fn pull_run_mode(&mut self, name: &str) -> Result<Value, OrchestratorError> {
        self.reconnect_slot("monitor");
        let monitor = self
            .monitor_db
            .clone()
            .ok_or(OrchestratorError::NoConnection("monitor"))?;
        let modes_ns = self.ns("run_modes");
        let Some(mut resolved) = monitor.find_one(&modes_ns, &json!({"name": name}), None)? else {
            spdlog::error!("Top level run mode {} not found", name);
            return Err(CommandError::ModeMissing(name.to_string()).into());
        };
        loop {
            let parent_name = match resolved.get("parent").and_then(Value::as_str) {
                None | Some("none") => break,
                Some(parent) => parent.to_string(),
            };
            let Some(parent) =
                monitor.find_one(&modes_ns, &json!({"name": parent_name}), None)?
            else {
                spdlog::warn!("Parent mode '{}' is empty, allowing it", parent_name);
                break;
            };
            resolved = options::compose_with_parent(&resolved, &parent);
        }
        Ok(resolved)
    }

    /// Does a run of this name already exist for the detector?
    pub fn run_exists(&mut self, run_name: &str, detector: &str) -> bool {
        self.reconnect_slot("runs");
        let Some(runs) = self.runs_db.as_ref() else {
            return false;
        };
        matches!(
            runs.find_one(
                &self.runs_ns(),
                &json!({"name": run_name, "detector": detector}),
                None,
            ),
            Ok(Some(_))
        )
    }

    // ------------------------------------------------------------- start

    /// Create destinations and insert one run document per detector.
    pub fn start_run(
        &mut self,
        name: &str,
        user: &str,
        comment: &str,
        options_by_detector: &BTreeMap<String, RunOptions>,
    ) -> Result<(), OrchestratorError> {
        for (detector, options) in options_by_detector {
            // A stale rolling worker from the previous run must be gone
            // before its collection names get reused.
            if let Some(mut worker) = self.rolling_workers.remove(detector) {
                worker.stop();
            }

            let run_number = self.next_run_number(detector);
            let now_ms = Utc::now().timestamp_millis();
            let oid = Oid::new();

            let mut run_doc = json!({
                "_id": oid.to_string(),
                "name": name,
                "user": user,
                "detector": detector,
                "number": run_number,
                "start": now_ms,
            });

            if options.write_mode() == WriteMode::Mongo {
                let mongo_opts = options.mongo_options();
                if mongo_opts.address.is_empty() || mongo_opts.database.is_empty() {
                    let message =
                        "Writing to the buffer store requires both a database and address";
                    spdlog::error!("{}", message);
                    self.send_run_start_reply(ReplyCode::Error, message);
                    return Err(OrchestratorError::NoConnection("buffer"));
                }

                let board_list: Vec<i32> = options
                    .boards
                    .iter()
                    .filter(|board| board.board_type == "V1724")
                    .map(|board| board.id)
                    .collect();

                if options.rotating_collections() {
                    // The readers need cycles 0 and 1 before the first BLT.
                    for cycle in 0..2 {
                        self.provision_on_all_hosts(&mongo_opts, name, &board_list, cycle)?;
                    }
                    self.rolling_workers.insert(
                        detector.clone(),
                        RollingWorker::spawn(
                            self.connector.clone(),
                            mongo_opts.clone(),
                            name.to_string(),
                            board_list.clone(),
                        ),
                    );
                } else {
                    self.provision_on_all_hosts(&mongo_opts, name, &board_list, -1)?;
                }

                run_doc["data"] = json!([{
                    "type": "untriggered",
                    "status": "transferring",
                    "host": "reader",
                    "location": location_string(&mongo_opts),
                    "collection": name,
                    "compressed": options.compression,
                }]);
            }

            run_doc["reader"] = json!({
                "ini": options.to_document(),
                "self_trigger": self_trigger(options),
            });

            let mut trigger = json!({
                "mode": options.trigger_mode,
                "ended": false,
            });
            if options.trigger_mode != "ignore" {
                trigger["status"] = json!("waiting_to_be_processed");
            }
            run_doc["trigger"] = trigger;

            let mut source = json!({"type": options.source_type});
            if options.source_type == "LED" {
                source["frequency"] = json!(options.pulser_freq);
            }
            run_doc["source"] = source;

            if !comment.is_empty() {
                run_doc["comments"] = json!([{
                    "text": comment,
                    "date": now_ms,
                    "user": user,
                }]);
                let tags = hash_tags(comment);
                if !tags.is_empty() {
                    run_doc["tags"] = Value::Array(
                        tags.into_iter()
                            .map(|tag| json!({"name": tag, "user": user, "date": now_ms}))
                            .collect(),
                    );
                }
            }

            let runs_ns = self.runs_ns();
            self.insert_online("runs", &runs_ns, run_doc);
            self.last_doc_oids.insert(detector.clone(), oid);
            spdlog::info!(
                "Started run {} (number {}) for detector {}",
                name,
                run_number,
                detector
            );
        }
        Ok(())
    }

    /// Next run number for the detector, best effort: an unreachable runs
    /// database logs a warning and counts from zero.
    fn next_run_number(&mut self, detector: &str) -> i64 {
        if detector != "tpc" {
            return 0;
        }
        self.reconnect_slot("runs");
        let Some(runs) = self.runs_db.as_ref() else {
            return 0;
        };
        match runs.find_one(&self.runs_ns(), &json!({"detector": "tpc"}), Some("number")) {
            Ok(Some(doc)) => doc.get("number").and_then(Value::as_i64).unwrap_or(-1) + 1,
            Ok(None) => 0,
            Err(e) => {
                spdlog::warn!("Cannot query runs DB for the run number: {}", e);
                0
            }
        }
    }

    fn provision_on_all_hosts(
        &mut self,
        mongo_opts: &super::options::MongoOptions,
        collection: &str,
        board_list: &[i32],
        cycle: i32,
    ) -> Result<(), OrchestratorError> {
        for host in mongo_opts.distinct_hosts() {
            let mut host_opts = mongo_opts.clone();
            host_opts.address = host.clone();
            let store = match self.connector.connect(&host) {
                Ok(store) => store,
                Err(e) => {
                    self.send_run_start_reply(
                        ReplyCode::Error,
                        &format!("Cannot reach buffer host {host}"),
                    );
                    return Err(OrchestratorError::Store(e));
                }
            };
            if let Err(e) = provision_collection(
                store.as_ref(),
                &host_opts,
                collection,
                board_list,
                cycle,
                false,
            ) {
                spdlog::error!("Couldn't create buffer collection on {}: {}", host, e);
                self.send_run_start_reply(ReplyCode::Error, "Couldn't create buffer collection");
                return Err(e.into());
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------- stop

    /// End the run for the matched detectors.
    ///
    /// Sets `end` and `data.0.status` on each remembered run document, then
    /// forgets the document id, so a second Stop finds nothing to update.
    pub fn stop_run(&mut self, detector: DetectorSelect) -> Result<(), OrchestratorError> {
        for (name, worker) in self.rolling_workers.iter_mut() {
            if detector.includes(name) {
                worker.stop();
            }
        }
        self.rolling_workers
            .retain(|name, _| !detector.includes(name));
        self.stop_deadlines
            .retain(|name, _| !detector.includes(name));

        self.reconnect_slot("runs");
        let Some(runs) = self.runs_db.clone() else {
            return Err(OrchestratorError::NoConnection("runs"));
        };
        let runs_ns = self.runs_ns();
        let now_ms = Utc::now().timestamp_millis();

        for (name, oid) in self.last_doc_oids.iter_mut() {
            if !detector.includes(name) {
                continue;
            }
            let id = oid.to_string();
            let matched = runs.update_one(
                &runs_ns,
                &json!({"_id": id}),
                &json!({"end": now_ms}),
            )?;
            if !matched {
                spdlog::warn!("No run document found to stop for detector {}", name);
                continue;
            }
            runs.update_one(
                &runs_ns,
                &json!({"_id": id, "data.0": {"$exists": true}}),
                &json!({"data.0.status": "transferred"}),
            )?;
            // Forget the document so repeated stops cannot double-update.
            *oid = Oid::new();
            spdlog::info!("Stopped run for detector {}", name);
        }
        Ok(())
    }

    // -------------------------------------------------- deadlines / misc

    /// Arm the `stop_after_minutes` deadline of a Start command.
    pub fn arm_stop_deadline(&mut self, detector: &str, expire_after_seconds: i32) {
        if expire_after_seconds > 0 {
            self.stop_deadlines.insert(
                detector.to_string(),
                Instant::now() + Duration::from_secs(expire_after_seconds as u64),
            );
        }
    }

    /// Detectors whose deadline has passed. The caller issues the Stop.
    pub fn expired_deadlines(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .stop_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.stop_deadlines.remove(name);
        }
        expired
    }

    /// Persist a log message; warnings and errors additionally raise an
    /// alert with a monotonically increasing `idnum`.
    pub fn send_log_message(&mut self, message: &str, priority: Priority) {
        let now_ms = Utc::now().timestamp_millis();
        if priority != Priority::Info {
            let mut idnum = 0i64;
            self.reconnect_slot("monitor");
            if let Some(monitor) = self.monitor_db.as_ref() {
                if let Ok(Some(last)) =
                    monitor.find_one(&self.ns("alerts"), &json!({}), Some("idnum"))
                {
                    idnum = last.get("idnum").and_then(Value::as_i64).unwrap_or(-1) + 1;
                }
            }
            let alerts_ns = self.ns("alerts");
            self.insert_online(
                "monitor",
                &alerts_ns,
                json!({
                    "_id": Oid::new().to_string(),
                    "idnum": idnum,
                    "priority": priority as i32,
                    "timestamp": now_ms,
                    "sender": "dispatcher",
                    "message": message,
                    "addressed": false,
                }),
            );
        }
        let log_ns = self.ns("log");
        self.insert_online(
            "log",
            &log_ns,
            json!({
                "_id": Oid::new().to_string(),
                "message": message,
                "priority": priority as i32,
                "time": now_ms,
                "sender": "dispatcher",
            }),
        );
    }

    /// Tell the console how a Start attempt went.
    pub fn send_run_start_reply(&mut self, code: ReplyCode, message: &str) {
        let ns = self.ns("dispatcherreply");
        self.insert_online(
            "monitor",
            &ns,
            json!({"message": message, "replyenum": code as i32}),
        );
    }

    /// Drop stale console replies; run before starting a new run.
    pub fn clear_dispatcher_reply(&mut self) {
        self.reconnect_slot("monitor");
        if let Some(monitor) = self.monitor_db.as_ref() {
            if let Err(e) = monitor.drop_collection(&self.ns("dispatcherreply")) {
                spdlog::warn!("Could not clear dispatcher replies: {}", e);
            }
        }
    }

    /// Queue a Stop through the control collection, as the console would.
    pub fn send_stop_command(&mut self, user: &str, message: &str, detector: DetectorSelect) {
        let ns = self.ns("daq_control");
        self.insert_online(
            "monitor",
            &ns,
            json!({
                "command": "Stop",
                "detector": detector.as_str(),
                "user": user,
                "comment": message,
            }),
        );
    }

    /// Status snapshot into the TTL status collection.
    pub fn update_daq_status(&mut self, status: &DaqStatus) {
        let now_ms = Utc::now().timestamp_millis();
        let ns = self.ns("daq_status");
        self.insert_online(
            "monitor",
            &ns,
            json!({
                "createdAt": now_ms,
                "timeseconds": now_ms / 1000,
                "detector": status.detector,
                "mode": status.run_mode,
                "state": status.state,
                "network": status.network_up,
                "currentRun": status.run_number,
                "startedBy": status.started_by,
                "numSlaves": status.slaves.len(),
            }),
        );
    }

    /// Per-slave rates into the TTL rates collection.
    pub fn add_rates(&mut self, status: &DaqStatus) {
        let now_ms = Utc::now().timestamp_millis();
        for slave in &status.slaves {
            if slave.name.is_empty() {
                self.send_log_message("Corrupted slave data", Priority::Info);
                continue;
            }
            let ns = self.ns("daq_rates");
            self.insert_online(
                "monitor",
                &ns,
                json!({
                    "createdAt": now_ms,
                    "node": slave.name,
                    "bltrate": slave.blt_rate,
                    "datarate": slave.data_rate,
                    "runmode": status.run_mode,
                    "nboards": slave.n_boards,
                    "timeseconds": now_ms / 1000,
                }),
            );
        }
    }
}

/// One slave's contribution to a status packet.
#[derive(Debug, Clone, Default)]
pub struct SlaveStatus {
    pub name: String,
    pub blt_rate: f64,
    pub data_rate: f64,
    pub n_boards: i32,
}

/// What the master periodically persists about the whole DAQ.
#[derive(Debug, Clone, Default)]
pub struct DaqStatus {
    pub detector: String,
    pub run_mode: String,
    pub state: String,
    pub network_up: bool,
    pub run_number: i64,
    pub started_by: String,
    pub slaves: Vec<SlaveStatus>,
}

fn string_field(doc: &Value, key: &str) -> String {
    doc.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Strip the path off a connection string and append the database name.
fn location_string(mongo_opts: &super::options::MongoOptions) -> String {
    let hosts = mongo_opts.distinct_hosts();
    let mut locations = Vec::new();
    for host in &hosts {
        let base = match host.rfind('/') {
            // Keep the scheme's double slash intact.
            Some(index) if index > "mongodb://".len() - 1 => &host[..index + 1],
            _ => host.as_str(),
        };
        locations.push(format!("{}{}", base, mongo_opts.database));
    }
    locations.join(";")
}

/// Self triggering is on unless the DPP disable bit is set in 0x8080.
fn self_trigger(options: &RunOptions) -> bool {
    !options
        .registers
        .iter()
        .any(|r| r.address == DPP_REGISTER && r.value & DPP_DISABLE_BIT != 0)
}

/// `#tags` out of a run comment; purely numeric tags are dropped.
fn hash_tags(comment: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut open: Option<String> = None;
    for c in comment.chars() {
        match open.as_mut() {
            Some(tag) => {
                if c.is_whitespace() {
                    if !tag.is_empty() {
                        tags.push(std::mem::take(tag));
                    }
                    open = None;
                } else {
                    tag.push(c);
                }
            }
            None => {
                if c == '#' {
                    open = Some(String::new());
                }
            }
        }
    }
    if let Some(tag) = open {
        if !tag.is_empty() && !tag.chars().all(|c| c.is_ascii_digit()) {
            tags.push(tag);
        }
    }
    tags
}
