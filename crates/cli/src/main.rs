mod args;
mod logging;

use clap::Parser;

fn main() {
    let args = args::Args::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("validate flags error: {e}");
            std::process::exit(1);
        }
    };

    let guard = match logging::init(&config.log_dir, &config.name, config.cli_mode) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("create logger error: {e}");
            std::process::exit(1);
        }
    };

    run(config, guard)
}

#[cfg(target_os = "macos")]
fn run(config: podvm_core::InstanceConfig, guard: tracing_appender::non_blocking::WorkerGuard) -> ! {
    // The supervisor runs on worker threads; the main thread parks in the
    // dispatch loop so Virtualization.framework calls can land on it.
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("create runtime error: {e}");
                std::process::exit(1);
            }
        };

        let code = runtime.block_on(podvm::supervisor::run(config));

        // Flush buffered log lines before the hard exit.
        drop(guard);
        std::process::exit(code);
    });

    dispatch2::dispatch_main();
}

#[cfg(not(target_os = "macos"))]
fn run(_config: podvm_core::InstanceConfig, guard: tracing_appender::non_blocking::WorkerGuard) -> ! {
    drop(guard);
    eprintln!("podvm requires macOS (Virtualization.framework)");
    std::process::exit(1);
}
