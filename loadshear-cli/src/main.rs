//! Entry point: parses CLI args, loads and verifies a script program, builds the
//! execution plan (`src/cli/execution-plan.cpp`'s `generate_execution_plan`), and drives
//! the orchestrator to completion. Protocol is fixed to TCP (verifier rule 1's
//! `VALID_PROTOCOLS = {"TCP"}`), so this binary only ever instantiates `Orchestrator<TcpSession>`.

use std::fs;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};

use flux::logging::{self, info, o, warn};
use loadshear_core::error::LoadshearError;
use loadshear_core::handler::wasm::{WasmHandlerFactory, WasmModuleSource};
use loadshear_core::handler::{HandlerFactory, NopHandlerFactory};
use loadshear_core::net::tcp::TcpSession;
use loadshear_core::net::{HostInfo, SessionConfig};
use loadshear_core::resolve::{self, ResolveOptions};
use loadshear_core::script::program::Program;
use loadshear_core::{Orchestrator, OrchestratorConfig};

/// A run creating more sessions than this needs `--ack` before it proceeds, mirroring
/// `execution-plan.cpp`'s pre-run summary step for a tool that can saturate a network.
const ACK_THRESHOLD: u32 = 10_000;

fn main() {
    let matches = App::new("loadshear")
        .version("0.1.0")
        .author("Loadshear Contributors")
        .about("Scripted network load generator")
        .arg(Arg::with_name("SCRIPT").help("Path to the script JSON file").required(true))
        .arg(Arg::with_name("dry-run").long("dry-run").help("Verify the script and print a summary without starting shards"))
        .arg(Arg::with_name("expand-envs").long("expand-envs").help("Expand $ENV/ segments in packet and handler paths"))
        .arg(Arg::with_name("quiet").long("quiet").help("Suppress startup narration"))
        .arg(
            Arg::with_name("arena-init-mb")
                .long("arena-init-mb")
                .takes_value(true)
                .help("Pre-reserve this many MB when reading the script file"),
        )
        .arg(Arg::with_name("ack").long("ack").help("Acknowledge a run that creates a large number of sessions"))
        .get_matches();

    let script_path = matches.value_of("SCRIPT").unwrap();
    let dry_run = matches.is_present("dry-run");
    let quiet = matches.is_present("quiet");
    let ack = matches.is_present("ack");
    let resolve_options = ResolveOptions { expand_envs: matches.is_present("expand-envs") };
    let arena_init_mb: u64 = matches
        .value_of("arena-init-mb")
        .map(|v| v.parse().unwrap_or(0))
        .unwrap_or(0);

    let log = logging::init(false);

    match run(script_path, dry_run, quiet, ack, resolve_options, arena_init_mb, &log) {
        Ok(code) => process::exit(code),
        Err(e) => {
            let _ = writeln!(io::stderr(), "{}", e);
            process::exit(1);
        }
    }
}

fn run(
    script_path: &str,
    dry_run: bool,
    quiet: bool,
    ack: bool,
    resolve_options: ResolveOptions,
    arena_init_mb: u64,
    log: &logging::Logger,
) -> Result<i32, LoadshearError> {
    let script_path = Path::new(script_path);
    let base_dir = script_path.parent().unwrap_or_else(|| Path::new("."));

    let mut buf = String::new();
    buf.reserve((arena_init_mb as usize).saturating_mul(1024 * 1024));
    buf.push_str(
        &fs::read_to_string(script_path)
            .map_err(|e| LoadshearError::Resolve(loadshear_core::error::ResolveError::Io(script_path.display().to_string(), e)))?,
    );

    let program: Program = match serde_json::from_str(&buf) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("failed to parse script: {}", e);
            return Ok(1);
        }
    };

    let lowered = program.lower(base_dir, resolve_options)?;

    if !quiet {
        info!(
            log,
            "script verified";
            "actions" => lowered.actions.len(),
            "payloads" => lowered.payloads.len(),
            "endpoints" => program.settings.endpoints.len()
        );
    }

    if dry_run {
        println!(
            "script ok: {} actions, {} payloads, {} shards, {} endpoints",
            lowered.actions.len(),
            lowered.payloads.len(),
            program.settings.shards,
            program.settings.endpoints.len(),
        );
        return Ok(0);
    }

    let create_count: u32 = lowered
        .actions
        .iter()
        .find(|a| a.action_type == loadshear_core::ActionType::Create)
        .map(|a| a.count)
        .unwrap_or(0);

    if create_count > ACK_THRESHOLD && !ack {
        eprintln!(
            "this script creates {} sessions, which is over the {} threshold; re-run with --ack to proceed",
            create_count, ACK_THRESHOLD
        );
        return Ok(1);
    }

    let endpoints = resolve_endpoints(&program.settings.endpoints, log);
    if endpoints.is_empty() {
        eprintln!("no endpoint in the script resolved to a usable address");
        return Ok(1);
    }

    let handler_factory = build_handler_factory(&program.settings, base_dir, resolve_options)?;

    let session_config = SessionConfig {
        header_size: program.settings.header_size as usize,
        payload_size_limit: program.settings.body_max as usize,
        read_enabled: program.settings.read,
        repeat: program.settings.repeat,
        packet_sample_rate: program.settings.packet_sample_rate,
    };

    let config = OrchestratorConfig::<TcpSession> {
        session_config,
        host_info: HostInfo { endpoints },
        handler_factory,
        shard_count: program.settings.shards as usize,
        metrics_sample_interval: Duration::from_secs(1),
    };

    let mut orchestrator = Orchestrator::<TcpSession>::new(
        lowered.actions,
        lowered.payloads,
        lowered.steps,
        config,
        log.new(o!()),
    );

    let aggregates = orchestrator.run(Duration::from_secs(1));

    if let Some(last) = aggregates.last() {
        println!(
            "finished: {} bytes sent, {} bytes read, {} connections attempted, {} failed",
            last.current.bytes_sent,
            last.current.bytes_read,
            last.current.connection_attempts,
            last.current.failed_connections,
        );
    }

    Ok(0)
}

fn resolve_endpoints(raw: &[String], log: &logging::Logger) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    for entry in raw {
        match entry.to_socket_addrs() {
            Ok(addrs) => endpoints.extend(addrs),
            Err(e) => warn!(log, "endpoint did not resolve, skipping"; "endpoint" => entry.as_str(), "error" => e.to_string()),
        }
    }
    endpoints
}

fn build_handler_factory(
    settings: &loadshear_core::script::program::SettingsBlock,
    base_dir: &Path,
    resolve_options: ResolveOptions,
) -> Result<Arc<dyn HandlerFactory>, LoadshearError> {
    if !settings.read || settings.handler_value == "NOP" {
        return Ok(Arc::new(NopHandlerFactory));
    }

    let resolved = resolve::resolve_relative(&settings.handler_value, base_dir, resolve_options)
        .map_err(LoadshearError::Resolve)?;
    let bytes = resolve::read_binary_file(&resolved).map_err(LoadshearError::Resolve)?;
    let source = WasmModuleSource::compile(&bytes).map_err(LoadshearError::Wasm)?;
    Ok(Arc::new(WasmHandlerFactory::new(source)))
}
