//! Daemon harness: brings up the restaging daemon with a file-backed store,
//! executes a startup command file, then serves an operator console.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info, warn};

use bard::cmd::{self, CommandError};
use bard::restage::{LogMailer, RestageController, RestageParams, SendmailMailer};
use bard::runtime::StartGate;
use bard::{Bard, BardParams, Bundle, BundleSink, PendingBundles};
use bard_eid::{parse_with_magnitude, EndpointId};
use bard_fname::Separators;

#[derive(Parser)]
#[command(
    name = "bard-cli",
    about = "Bundle Archival Restaging Daemon console",
    version
)]
struct Args {
    /// Startup command file executed before the console starts
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the durable store
    #[arg(long, default_value = "bard-db")]
    db: PathBuf,

    /// Execute the startup file and exit instead of serving the console
    #[arg(long)]
    batch: bool,

    /// Deliver notification emails through the system mail command instead
    /// of the log
    #[arg(long)]
    sendmail: bool,
}

/// Reloaded bundles re-enter internal storage through the same accounting
/// path as a bundle arriving off a link.
struct NodeSink {
    bard: Mutex<Option<Arc<Bard>>>,
}

impl NodeSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bard: Mutex::new(None),
        })
    }

    fn attach(&self, bard: &Arc<Bard>) {
        *self.bard.lock().unwrap() = Some(bard.clone());
    }
}

impl BundleSink for NodeSink {
    fn deliver(&self, bundle: Bundle) -> bard::Result<()> {
        let Some(bard) = self.bard.lock().unwrap().clone() else {
            return Err(bard::BardError::SinkRejected("node not ready".to_string()));
        };
        let bundle = Arc::new(bundle);
        bard.bundle_accepted(&bundle);
        bard.pending().insert(bundle);
        Ok(())
    }
}

struct Node {
    bard: Arc<Bard>,
    pending: Arc<PendingBundles>,
    sink: Arc<NodeSink>,
    gate: Arc<StartGate>,
    links: Mutex<Vec<Arc<RestageController>>>,
    use_sendmail: bool,
}

fn main() -> std::process::ExitCode {
    env_logger::init();
    let args = Args::parse();

    let store = match bard::store::FileStore::open(&args.db) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("unable to open durable store at {}: {e}", args.db.display());
            return std::process::ExitCode::FAILURE;
        }
    };

    let pending = PendingBundles::new();
    let bard = Bard::new(BardParams::default(), store, pending.clone());
    let sink = NodeSink::new();
    sink.attach(&bard);

    let node = Arc::new(Node {
        bard: bard.clone(),
        pending,
        sink,
        gate: StartGate::new(),
        links: Mutex::new(Vec::new()),
        use_sendmail: args.sendmail,
    });

    // startup file first so stored quotas can override it when the daemon
    // loads the data store
    if let Some(config) = &args.config {
        if let Err(e) = run_startup_file(&node, config) {
            error!("error in startup file {}: {e}", config.display());
            return std::process::ExitCode::FAILURE;
        }
    }

    if let Err(e) = bard.start(node.gate.clone()) {
        error!("unable to start daemon: {e}");
        return std::process::ExitCode::FAILURE;
    }
    node.gate.release();
    info!("daemon up");

    if args.batch {
        shutdown(&node);
        return std::process::ExitCode::SUCCESS;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            warn!("unable to install SIGINT handler: {e}");
        }
    }

    console(&node, &interrupted);
    shutdown(&node);
    std::process::ExitCode::SUCCESS
}

fn shutdown(node: &Node) {
    let links: Vec<_> = node.links.lock().unwrap().drain(..).collect();
    for link in links {
        link.shutdown();
    }
    node.bard.shutdown();
    info!("daemon down");
}

fn run_startup_file(node: &Arc<Node>, path: &PathBuf) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Err(e) = dispatch_line(node, line) {
            error!("{}:{}: {e}", path.display(), lineno + 1);
        }
    }
    Ok(())
}

fn console(node: &Arc<Node>, interrupted: &AtomicBool) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    loop {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        print!("bard> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("console read error: {e}");
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        match dispatch_line(node, line) {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            Err(e) => println!("error: {e}"),
        }
    }
}

fn dispatch_line(node: &Arc<Node>, line: &str) -> Result<String, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    match tokens.as_slice() {
        ["bard", rest @ ..] => cmd::execute(&node.bard, rest).map_err(|e| match e {
            CommandError::Usage(u) => format!("usage: {u}"),
            CommandError::Failed(f) => f,
        }),
        ["link", rest @ ..] => link_command(node, rest),
        ["inject", rest @ ..] => inject_command(node, rest),
        ["discard", rest @ ..] => discard_command(node, rest),
        ["pending"] => Ok(format!("{} bundle(s) in internal storage", node.pending.len())),
        _ => Err(format!("unknown command: {line}")),
    }
}

/// `link add <name> <storage path> [key=value ...]` or `link del <name>`.
fn link_command(node: &Arc<Node>, args: &[&str]) -> Result<String, String> {
    match args {
        ["add", name, path, options @ ..] => {
            let (name, path) = (*name, *path);
            let mut params = RestageParams {
                storage_path: PathBuf::from(path),
                // console bring-up is usually on a plain directory; the
                // option below turns validation back on
                mount_point: false,
                ..Default::default()
            };
            apply_link_options(&mut params, options)?;

            let mailer: Arc<dyn bard::restage::Mailer> = if node.use_sendmail {
                Arc::new(SendmailMailer)
            } else {
                Arc::new(LogMailer)
            };

            let ctl = RestageController::spawn(
                name,
                params,
                &node.bard,
                node.sink.clone(),
                mailer,
                node.gate.clone(),
            )
            .map_err(|e| e.to_string())?;

            node.links.lock().unwrap().push(ctl);
            Ok(format!("link {name} added"))
        }
        ["del", name] => {
            let name = *name;
            let mut links = node.links.lock().unwrap();
            let Some(pos) = links.iter().position(|l| l.link_name() == name) else {
                return Err(format!("no such link: {name}"));
            };
            let ctl = links.remove(pos);
            drop(links);
            ctl.shutdown();
            Ok(format!("link {name} removed"))
        }
        _ => Err("usage: link <add <name> <storage path> [key=value ...] | del <name>>".to_string()),
    }
}

fn apply_link_options(params: &mut RestageParams, options: &[&str]) -> Result<(), String> {
    let mut field_sep = params.separators.field;
    let mut eid_sep = params.separators.eid;

    for opt in options {
        let (key, value) = opt
            .split_once('=')
            .ok_or_else(|| format!("malformed link option (want key=value): {opt}"))?;
        match key {
            "mount_point" => params.mount_point = parse_bool(value)?,
            "disk_quota" => {
                params.disk_quota =
                    parse_with_magnitude(value).map_err(|e| e.to_string())?
            }
            "days_retention" => params.days_retention = parse_num(value)?,
            "expire_bundles" => params.expire_bundles = parse_bool(value)?,
            "ttl_override" => params.ttl_override = parse_num(value)?,
            "auto_reload_interval" => params.auto_reload_interval = parse_num(value)?,
            "part_of_pool" => params.part_of_pool = parse_bool(value)?,
            "email_enabled" => params.email_enabled = parse_bool(value)?,
            "min_disk_space" => {
                params.min_disk_space_available =
                    parse_with_magnitude(value).map_err(|e| e.to_string())?
            }
            "min_quota_available" => {
                params.min_quota_available =
                    parse_with_magnitude(value).map_err(|e| e.to_string())?
            }
            "write_rate_bps" => {
                params.write_rate_bps =
                    parse_with_magnitude(value).map_err(|e| e.to_string())?
            }
            "field_separator" => field_sep = single_char(value)?,
            "eid_field_separator" => eid_sep = single_char(value)?,
            "email_from" => params.email_from = value.to_string(),
            "email_to" => {
                params.email_to = value.split(',').map(str::to_string).collect()
            }
            _ => return Err(format!("unknown link option: {key}")),
        }
    }

    params.separators = Separators::new(field_sep, eid_sep).map_err(|e| e.to_string())?;
    Ok(())
}

/// `inject <src eid> <dst eid> <payload bytes> [<lifetime secs>]`: run a
/// synthetic bundle through the acceptance path.
fn inject_command(node: &Arc<Node>, args: &[&str]) -> Result<String, String> {
    if args.len() < 3 || args.len() > 4 {
        return Err("usage: inject <src eid> <dst eid> <payload bytes> [<lifetime secs>]".to_string());
    }

    let src = EndpointId::parse(args[0]).map_err(|e| e.to_string())?;
    let dst = EndpointId::parse(args[1]).map_err(|e| e.to_string())?;
    let payload_len = parse_with_magnitude(args[2]).map_err(|e| e.to_string())? as usize;
    let lifetime: u64 = if args.len() == 4 { parse_num(args[3])? } else { 3_600 };

    let now = bard::dtntime::now_dtn_secs();
    let bundle = Arc::new(Bundle::new(
        src,
        dst,
        now * 1_000,
        0,
        vec![0u8; payload_len],
        now + lifetime,
    ));

    if !node.bard.query_accept_bundle(&bundle) {
        // refusal still leaves internal reservations to unwind
        node.bard.bundle_deleted(&bundle);
        return Ok(format!("bundle {} refused", bundle.id()));
    }

    node.pending.insert(bundle.clone());

    // a restage-tagged bundle keeps its reservations until the restager
    // reports the file written; only bundles kept internally are committed
    if let Some(link_name) = bundle.restage_link_name() {
        if let Some(link) = node.bard.restage_link(&link_name) {
            link.enqueue(bundle.clone()).map_err(|e| e.to_string())?;
            return Ok(format!(
                "bundle {} queued for restaging via {link_name}",
                bundle.id()
            ));
        }
    }

    node.bard.bundle_accepted(&bundle);
    Ok(format!("bundle {} accepted", bundle.id()))
}

/// `discard <bundle id>`: delete a bundle from internal storage.
fn discard_command(node: &Arc<Node>, args: &[&str]) -> Result<String, String> {
    let [id] = args else {
        return Err("usage: discard <bundle id>".to_string());
    };
    let id: u64 = id.parse().map_err(|_| format!("bad bundle id: {id}"))?;

    let Some(bundle) = node.pending.remove(id) else {
        return Err(format!("no pending bundle with id {id}"));
    };
    node.bard.bundle_deleted(&bundle);
    Ok(format!("bundle {id} discarded"))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("invalid boolean: {s}")),
    }
}

fn parse_num(s: &str) -> Result<u64, String> {
    s.parse().map_err(|_| format!("invalid number: {s}"))
}

fn single_char(s: &str) -> Result<char, String> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(format!("separator must be a single character: {s}")),
    }
}
