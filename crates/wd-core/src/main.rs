use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wd_core::config::Config;
use wd_core::rollback::{RollbackAction, RollbackReport};
use wd_core::session::{RunMode, Session, SessionStatus};
use wd_core::{CoreError, Engine, RunOptions};
use wd_sandbox::TRAMPOLINE_FLAG;

fn print_help() {
    println!("warden: dry-run, approve and roll back scripts");
    println!();
    println!("Usage:");
    println!("  warden run <script> [--profile NAME] [--fast] [--name NAME]");
    println!("  warden list [--pending]");
    println!("  warden show <id>");
    println!("  warden approve <id> [--remember]");
    println!("  warden reject <id> [reason]");
    println!("  warden execute <id>");
    println!("  warden rollback <id> [--force] [--dry-run]");
    println!();
    println!("Options:");
    println!("  --version         Print version");
    println!("  --help            Print this help");
    println!();
    println!("Logging is controlled by RUST_LOG (default: warn).");
}

/// Positional arguments plus `--flag` / `--option VALUE` lookups.
struct Args {
    positional: Vec<String>,
    flags: Vec<String>,
    options: Vec<(String, String)>,
}

/// Options that take a value.
const VALUED: &[&str] = &["--profile", "--name", "--limit"];

impl Args {
    fn parse(raw: &[String]) -> Self {
        let mut args = Args {
            positional: Vec::new(),
            flags: Vec::new(),
            options: Vec::new(),
        };
        let mut iter = raw.iter();
        while let Some(arg) = iter.next() {
            if VALUED.contains(&arg.as_str()) {
                if let Some(value) = iter.next() {
                    args.options.push((arg.clone(), value.clone()));
                }
            } else if arg.starts_with("--") {
                args.flags.push(arg.clone());
            } else {
                args.positional.push(arg.clone());
            }
        }
        args
    }

    fn flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }

    fn option(&self, name: &str) -> Option<String> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    fn id(&self) -> Result<&str, CoreError> {
        self.positional
            .get(1)
            .map(String::as_str)
            .ok_or_else(|| CoreError::NotFound("session id argument".to_string()))
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Trampoline: confine this process, then exec the command. Never returns.
    if args.first().map(String::as_str) == Some(TRAMPOLINE_FLAG) {
        wd_sandbox::exec_sandboxed(&args[1..]);
    }

    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("warden {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(3);
        }
    };

    let code = runtime.block_on(dispatch(Args::parse(&args)));
    std::process::exit(code);
}

async fn dispatch(args: Args) -> i32 {
    let engine = match Engine::open(Config::load_or_default()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {e}");
            return e.exit_code();
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let command = args.positional.first().map(String::as_str).unwrap_or("");
    let result = match command {
        "run" => cmd_run(&engine, &args, cancel).await,
        "list" => cmd_list(&engine, &args),
        "show" => args.id().and_then(|id| engine.show(id)).map(|s| {
            print_session(&s, true);
            0
        }),
        "approve" => cmd_approve(&engine, &args),
        "reject" => args
            .id()
            .and_then(|id| engine.reject(id, args.positional.get(2).map(String::as_str)))
            .map(|s| {
                print_session(&s, false);
                0
            }),
        "execute" => match args.id() {
            Ok(id) => engine.execute(id, cancel).await.map(|s| {
                print_session(&s, true);
                0
            }),
            Err(e) => Err(e),
        },
        "rollback" => cmd_rollback(&engine, &args),
        other => {
            eprintln!("error: unknown command {other:?}; see --help");
            return 3;
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if let CoreError::Conflict(report) = &e {
                print_report(report);
            }
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn cmd_run(engine: &Engine, args: &Args, cancel: CancellationToken) -> Result<i32, CoreError> {
    let Some(script) = args.positional.get(1) else {
        return Err(CoreError::NotFound("script argument".to_string()));
    };
    let options = RunOptions {
        profile: args.option("--profile"),
        mode: if args.flag("--fast") {
            RunMode::FastPath
        } else {
            RunMode::DryRun
        },
        name: args.option("--name"),
    };
    let session = engine.run(&PathBuf::from(script), options, cancel).await?;
    print_session(&session, true);
    if session.status() == SessionStatus::Pending {
        println!();
        println!("review required: warden approve {}", session.id);
    }
    Ok(0)
}

fn cmd_approve(engine: &Engine, args: &Args) -> Result<i32, CoreError> {
    let id = args.id()?;
    let session = engine.approve(id)?;
    print_session(&session, false);
    if args.flag("--remember") {
        for command in engine.remember(id)? {
            println!("remembered: {command}");
        }
    }
    Ok(0)
}

fn cmd_list(engine: &Engine, args: &Args) -> Result<i32, CoreError> {
    let limit = args.option("--limit").and_then(|l| l.parse().ok());
    let sessions = engine.list(args.flag("--pending"), limit)?;
    if sessions.is_empty() {
        println!("no sessions");
    }
    for s in sessions {
        let aggregate = s.aggregate.map(|a| a.as_str()).unwrap_or("-");
        println!(
            "{:<40} {:<12} {:<8} {:>4} ops  {}",
            s.id,
            s.status().as_str(),
            aggregate,
            s.operations.len(),
            s.name
        );
    }
    Ok(0)
}

fn cmd_rollback(engine: &Engine, args: &Args) -> Result<i32, CoreError> {
    let id = args.id()?;
    let force = args.flag("--force");
    let report = if args.flag("--dry-run") {
        engine.rollback_preview(id, force)?
    } else {
        engine.rollback(id, force)?
    };
    print_report(&report);
    Ok(0)
}

fn print_session(s: &Session, detailed: bool) {
    println!("session   {}", s.id);
    println!("status    {}", s.status());
    if let Some(aggregate) = s.aggregate {
        println!("verdict   {aggregate}");
    }
    println!("profile   {} ({:?})", s.profile, s.mode);
    println!("script    {}", s.script_path.display());
    if let Some(reason) = &s.reason {
        println!("reason    {reason}");
    }
    if let Some(code) = s.exit_code {
        println!("exit      {code}");
    }
    if !detailed {
        return;
    }

    if !s.operations.is_empty() {
        println!();
        println!("operations:");
        for op in &s.operations {
            let decision = s
                .decision_for(op.sequence())
                .map(|d| d.decision.as_str())
                .unwrap_or("-");
            println!("  #{:<3} {:<7} {}", op.sequence(), decision, op.describe());
        }
    }
    for attempt in &s.network_attempts {
        println!("  blocked connection to {}", attempt.endpoint);
    }
    for record in s.live_execs.iter().chain(&s.commit_results) {
        let code = record
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "killed".to_string());
        println!("  #{:<3} exited {code}", record.sequence);
    }
    if !s.stdout.is_empty() {
        println!();
        println!("stdout:");
        print!("{}", s.stdout);
    }
    if !s.stderr.is_empty() {
        println!();
        println!("stderr:");
        print!("{}", s.stderr);
    }
}

fn print_report(report: &RollbackReport) {
    let verb = if report.dry_run { "would" } else { "did" };
    for entry in &report.entries {
        let action = match entry.action {
            RollbackAction::Restore => "restore",
            RollbackAction::Delete => "delete",
        };
        let marker = if entry.is_conflict() { "  (modified since commit)" } else { "" };
        println!("{verb} {action} {}{marker}", entry.path.display());
    }
    let forced = report.forced().count();
    if forced > 0 {
        println!("{forced} conflicting file(s) forced");
    }
}
