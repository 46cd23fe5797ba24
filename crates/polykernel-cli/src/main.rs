use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use polykernel::{
    EventKind, KernelLanguage, KernelManager, KernelMode, KernelOptions, KernelTypeSpec,
    LoopbackLauncher, ManagerConfig, PoolConfig,
};

/// Run a snippet on a managed loopback kernel and emit JSON events.
#[derive(Parser, Debug)]
#[command(
    name = "polykernel-cli",
    about = "Smoke harness: run a snippet on a managed loopback kernel and emit JSON events"
)]
struct Args {
    /// Read the snippet from a file instead of stdin
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    /// Execution mode for the kernel
    #[arg(long, value_enum, default_value_t = ModeArg::Worker)]
    mode: ModeArg,

    /// Guest language for the kernel
    #[arg(long, value_enum, default_value_t = LanguageArg::Python)]
    language: LanguageArg,

    /// Tenant namespace for the kernel id
    #[arg(long)]
    namespace: Option<String>,

    /// Pre-warm this many kernels for the chosen tuple before running
    #[arg(long, default_value_t = 0)]
    pool_size: usize,

    /// Idle window in milliseconds (0 disables auto-shutdown)
    #[arg(long, default_value_t = 0)]
    inactivity_timeout: u64,

    /// Per-execution deadline in milliseconds (0 disables stall detection)
    #[arg(long, default_value_t = 0)]
    max_execution_time: u64,

    /// Also permit in-process kernels (workers only by default)
    #[arg(long)]
    allow_in_process: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Worker,
    InProcess,
}

impl From<ModeArg> for KernelMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Worker => KernelMode::Worker,
            ModeArg::InProcess => KernelMode::InProcess,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LanguageArg {
    Python,
    Ts,
    Js,
}

impl From<LanguageArg> for KernelLanguage {
    fn from(language: LanguageArg) -> Self {
        match language {
            LanguageArg::Python => KernelLanguage::Python,
            LanguageArg::Ts => KernelLanguage::Ts,
            LanguageArg::Js => KernelLanguage::Js,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mode = KernelMode::from(args.mode);
    let language = KernelLanguage::from(args.language);

    // Read the snippet.
    let code = if let Some(path) = &args.file {
        std::fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("Error reading file: {e}");
            std::process::exit(1);
        })
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {e}");
            std::process::exit(1);
        });
        buf
    };

    // Build the manager configuration.
    let mut config = ManagerConfig::default();
    if args.allow_in_process {
        for spec_language in [KernelLanguage::Python, KernelLanguage::Ts, KernelLanguage::Js] {
            config
                .allowed_kernel_types
                .push(KernelTypeSpec::new(KernelMode::InProcess, spec_language));
        }
    }
    if args.pool_size > 0 {
        config.pool = PoolConfig {
            enabled: true,
            pool_size: args.pool_size,
            auto_refill: true,
            preload_configs: vec![KernelTypeSpec::new(mode, language)],
        };
    }

    let manager = KernelManager::new(config, Arc::new(LoopbackLauncher::new()));
    if args.pool_size > 0 {
        // Give preload a moment so the run can demonstrate a pool hit.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let created = manager
        .create(KernelOptions {
            namespace: args.namespace.clone(),
            mode,
            language,
            inactivity_timeout_ms: args.inactivity_timeout,
            max_execution_time_ms: args.max_execution_time,
            ..KernelOptions::default()
        })
        .await;

    // Errors are encoded in the JSON output; the exit code is always 0.
    let kernel_id = match created {
        Ok(kernel_id) => kernel_id,
        Err(error) => {
            let json = serde_json::json!({ "error": error });
            println!("{json}");
            return;
        }
    };

    // Print every event for the kernel as a JSON line.
    for kind in [
        EventKind::Stream,
        EventKind::DisplayData,
        EventKind::ExecuteResult,
        EventKind::ExecuteError,
        EventKind::ExecutionStalled,
    ] {
        let event_kernel_id = kernel_id.clone();
        manager.on(&kernel_id, kind, move |event| {
            let json = serde_json::json!({ "kernel_id": event_kernel_id, "event": event });
            println!("{json}");
        });
    }

    let outcome = manager.execute(&kernel_id, &code).await;
    let descriptor = manager
        .list(args.namespace.as_deref())
        .into_iter()
        .find(|descriptor| descriptor.id == kernel_id);

    let summary = match outcome {
        Ok(outcome) => serde_json::json!({
            "kernel_id": kernel_id,
            "kernel": descriptor,
            "outcome": outcome,
            "pool": manager.pool_stats(),
        }),
        Err(error) => serde_json::json!({
            "kernel_id": kernel_id,
            "kernel": descriptor,
            "error": error,
        }),
    };
    println!("{summary}");

    manager.shutdown().await;
}
