//! Demonstration driver for `radius-core`: wires the two host-embedded demo
//! modules into one virtual server, then reads newline-delimited JSON
//! requests from stdin and prints each outcome as a JSON line. Mirrors the
//! "always exit 0, errors encoded in the output, not the exit code" style of
//! the example pack's own CLI.

use std::io::{self, BufRead, Write};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use clap::Parser;
use radius_core::builtin::{EchoModule, RejectEvenModule};
use radius_core::config::PoolConfig;
use radius_core::confsection::ConfSection;
use radius_core::contract::{CallNode, LiteralCallTree, ModuleFlags};
use radius_core::types::{Component, PacketCode, Rcode, Request};
use radius_core::Core;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "radius-core-cli", about = "Demonstration driver for radius-core")]
struct Args {
    /// Which numbers `reject_even` treats as rejects: "even" (default) or "odd".
    #[arg(long, default_value = "even")]
    parity: String,

    /// Per-request reply timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RequestLine {
    number: u64,
    #[serde(default = "default_server")]
    server: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    rounds: u32,
    #[serde(default = "default_packet_code")]
    packet_code: String,
}

fn default_server() -> String {
    "default".to_string()
}

fn default_packet_code() -> String {
    "access".to_string()
}

#[derive(Debug, Serialize)]
struct ReplyLine {
    number: u64,
    rcode: &'static str,
}

fn parse_packet_code(s: &str) -> PacketCode {
    match s {
        "accounting" => PacketCode::AccountingRequest,
        "coa" => PacketCode::CoaRequest,
        "disconnect" => PacketCode::DisconnectRequest,
        _ => PacketCode::AccessRequest,
    }
}

fn rcode_name(rcode: Rcode) -> &'static str {
    match rcode {
        Rcode::Ok => "ok",
        Rcode::Handled => "handled",
        Rcode::Reject => "reject",
        Rcode::Fail => "fail",
        Rcode::Noop => "noop",
        Rcode::NotFound => "notfound",
        Rcode::Invalid => "invalid",
        Rcode::UserLock => "userlock",
        Rcode::Updated => "updated",
        Rcode::Disallow => "disallow",
        _ => "unknown",
    }
}

fn build_core(parity: &str) -> Core {
    let core = Core::new(PoolConfig::default()).expect("default pool config is always valid");

    core.register_builtin_module(
        "echo",
        Arc::new(EchoModule),
        ModuleFlags { thread_unsafe: true, hup_safe: false },
        false,
        false,
    );
    core.register_builtin_module(
        "reject_even",
        Arc::new(RejectEvenModule),
        ModuleFlags { thread_unsafe: false, hup_safe: true },
        false,
        true,
    );

    core.add_instance("echo", None, ConfSection::new("echo", None))
        .expect("echo instance always bootstraps");

    let mut reject_cfg = ConfSection::new("reject_even", None);
    reject_cfg.set_pair("parity", parity);
    core.add_instance("reject_even", None, reject_cfg)
        .expect("parity is validated against \"even\"/\"odd\" before this call");

    let server = core.server("default");
    let authorize = LiteralCallTree::new(CallNode::Group(vec![
        CallNode::Leaf("reject_even".into()),
        CallNode::Leaf("echo".into()),
    ]));
    server.set_default(Component::Authorize, Arc::new(authorize));
    server.set_default(Component::Accounting, Arc::new(LiteralCallTree::leaf("echo")));

    core
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.parity != "even" && args.parity != "odd" {
        eprintln!("--parity must be \"even\" or \"odd\"");
        std::process::exit(2);
    }
    let core = build_core(&args.parity);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(e) => {
                eprintln!("error reading stdin: {e}");
                break;
            }
        };

        let parsed: RequestLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("skipping malformed request line: {e}");
                continue;
            }
        };

        let (tx, rx) = mpsc::channel();
        let mut request = Request::new(parsed.number, parsed.server, parse_packet_code(&parsed.packet_code))
            .with_priority(parsed.priority)
            .with_response(tx);
        request.rounds = parsed.rounds;

        if !core.enqueue(request) {
            let reply = ReplyLine { number: parsed.number, rcode: "queue_full" };
            let _ = writeln!(out, "{}", serde_json::to_string(&reply).expect("ReplyLine always serializes"));
            continue;
        }

        let reply = match rx.recv_timeout(Duration::from_millis(args.timeout_ms)) {
            Ok(outcome) => ReplyLine { number: parsed.number, rcode: rcode_name(outcome.rcode) },
            Err(_) => ReplyLine { number: parsed.number, rcode: "timeout" },
        };
        let _ = writeln!(out, "{}", serde_json::to_string(&reply).expect("ReplyLine always serializes"));
    }

    core.shutdown();
}
