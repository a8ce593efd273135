//! bitgrid-emu: compiler and cycle-accurate emulator for BitGrid fabrics

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use bitgrid_emu::bitstream::{self, ScanOrder};
use bitgrid_emu::config::Config;
use bitgrid_emu::emu::Emulator;
use bitgrid_emu::expr;
use bitgrid_emu::mapper::Mapper;
use bitgrid_emu::program::Program;
use bitgrid_emu::router::Router;
use bitgrid_emu::server;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str());

    match cmd {
        Some("compile") => cmd_compile(&args[2..]),
        Some("route") => cmd_route(&args[2..]),
        Some("run") => cmd_run(&args[2..]),
        Some("pack") => cmd_pack(&args[2..]),
        Some("unpack") => cmd_unpack(&args[2..]),
        Some("serve") => cmd_serve(&args[2..]),
        Some("config") => cmd_config(),
        Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            anyhow::bail!("unknown command: {}", other);
        }
    }
}

fn print_usage() {
    println!("bitgrid-emu - BitGrid fabric compiler and emulator");
    println!();
    println!("Usage:");
    println!("  bitgrid-emu compile --expr \"o = a + b\" --vars \"a:u8,b:u8\" [options]");
    println!("      --width N --height N   fabric dimensions (default from config)");
    println!("      --route                route non-adjacent nets after mapping");
    println!("      --out FILE             write the program JSON (default stdout)");
    println!("  bitgrid-emu route --program FILE [--out FILE] [--turn-penalty N]");
    println!("  bitgrid-emu run --program FILE --inputs \"a=5,b=7\" [--stream N]");
    println!("  bitgrid-emu pack --program FILE --out FILE [--order row|col|snake]");
    println!("  bitgrid-emu unpack --bitstream FILE [--program FILE] [--out FILE]");
    println!("  bitgrid-emu serve --program FILE [--host HOST] [--port PORT]");
    println!("  bitgrid-emu config");
}

/// Value of `--name v` in an argument slice.
fn opt(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn require(args: &[String], name: &str) -> anyhow::Result<String> {
    opt(args, name).ok_or_else(|| anyhow::anyhow!("missing required option {}", name))
}

/// Parse "a=5,b=0x1f" into input assignments.
fn parse_inputs(spec: &str) -> anyhow::Result<BTreeMap<String, u64>> {
    let mut out = BTreeMap::new();
    for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("bad input assignment: {}", part))?;
        let value = value.trim();
        let parsed = if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else {
            value.parse()
        }
        .map_err(|_| anyhow::anyhow!("bad input value: {}", part))?;
        out.insert(name.trim().to_string(), parsed);
    }
    Ok(out)
}

fn cmd_compile(args: &[String]) -> anyhow::Result<()> {
    let src = require(args, "--expr")?;
    let vars = expr::parse_var_decls(&require(args, "--vars")?)?;
    let cfg = Config::get();
    let width: u16 = match opt(args, "--width") {
        Some(v) => v.parse()?,
        None => cfg.grid_width(),
    };
    let height: u16 = match opt(args, "--height") {
        Some(v) => v.parse()?,
        None => cfg.grid_height(),
    };

    let graph = expr::compile(&src, &vars)?;
    let mut program = Mapper::new(width, height)?.map(&graph)?;

    if has_flag(args, "--route") {
        Router::new(cfg.turn_penalty()).route(&mut program)?;
    }

    println!(
        "Mapped {} cells on {}x{}, latency {} cycles",
        program.cells.len(),
        width,
        height,
        program.latency
    );

    emit_program(&program, opt(args, "--out"))
}

fn cmd_route(args: &[String]) -> anyhow::Result<()> {
    let path = require(args, "--program")?;
    let mut program = Program::load(Path::new(&path))?;
    let turn_penalty = match opt(args, "--turn-penalty") {
        Some(v) => v.parse()?,
        None => Config::get().turn_penalty(),
    };

    Router::new(turn_penalty).route(&mut program)?;
    println!(
        "Routed: {} cells, latency {} cycles",
        program.cells.len(),
        program.latency
    );

    emit_program(&program, opt(args, "--out"))
}

fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let path = require(args, "--program")?;
    let program = Program::load(Path::new(&path))?;
    let inputs = parse_inputs(&require(args, "--inputs")?)?;
    let mut emu = Emulator::new(program)?;

    // --stream N advances N half-cycles per vector without resetting;
    // the default is a fixed-vector evaluation over the program latency.
    let outputs = if let Some(ticks) = opt(args, "--stream") {
        let ticks: u64 = ticks.parse()?;
        emu.run_stream(std::slice::from_ref(&inputs), ticks, false)?
            .pop()
            .unwrap_or_default()
    } else {
        emu.eval(&inputs)?
    };

    for (name, value) in &outputs {
        println!("{} = {} (0x{:X})", name, value, value);
    }
    Ok(())
}

fn cmd_pack(args: &[String]) -> anyhow::Result<()> {
    let path = require(args, "--program")?;
    let out = require(args, "--out")?;
    let program = Program::load(Path::new(&path))?;
    let order = match opt(args, "--order") {
        Some(name) => ScanOrder::from_name(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown scan order: {}", name))?,
        None => ScanOrder::RowMajor,
    };

    let data = bitstream::pack(&program, order, 0);
    std::fs::write(&out, &data)?;
    println!(
        "Wrote {} bytes ({} order, {}x{})",
        data.len(),
        order.name(),
        program.width,
        program.height
    );
    Ok(())
}

fn cmd_unpack(args: &[String]) -> anyhow::Result<()> {
    let path = require(args, "--bitstream")?;
    let data = std::fs::read(&path)?;
    let (header, tables) = bitstream::unpack(&data)?;

    println!("BGBS v{}", header.version);
    println!("  Grid: {}x{}", header.width, header.height);
    println!("  Order: {}", header.order.name());
    println!("  Payload: {} bits, crc32 0x{:08X}", header.payload_bits, header.payload_crc32);
    let nonzero = tables
        .values()
        .filter(|t| t.iter().any(|&l| l != 0))
        .count();
    println!("  Cells with logic: {}", nonzero);

    // Optionally apply over an existing program and save it.
    if let Some(prog_path) = opt(args, "--program") {
        let mut program = Program::load(Path::new(&prog_path))?;
        let info = bitstream::apply(&mut program, &data)?;
        println!("  Applied: {} cells touched", info.cells_touched);
        emit_program(&program, opt(args, "--out"))?;
    }
    Ok(())
}

fn cmd_serve(args: &[String]) -> anyhow::Result<()> {
    let path = require(args, "--program")?;
    let program = Program::load(Path::new(&path))?;
    let cfg = Config::get();
    let host = opt(args, "--host").unwrap_or_else(|| cfg.serve_host());
    let port: u16 = match opt(args, "--port") {
        Some(v) => v.parse()?,
        None => cfg.serve_port(),
    };

    server::serve(&format!("{}:{}", host, port), program)
}

fn cmd_config() -> anyhow::Result<()> {
    if let Some(path) = Config::user_config_path() {
        println!("# User config path: {}", path.display());
        println!();
    }
    print!("{}", Config::sample_config());
    Ok(())
}

fn emit_program(program: &Program, out: Option<String>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            program.save(Path::new(&path))?;
            println!("Wrote {}", path);
        }
        None => println!("{}", program.to_json()?),
    }
    Ok(())
}
