//! extmount command-line entry point
//!
//! Two subcommands: `check` runs the setup diagnostics for every configured
//! mount, `list` resolves a virtual path for a user and prints the
//! directory listing. Both are administrator tools; the library facade is
//! the real surface.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use extmount::config::Config;
use extmount::diag::{self, Severity};
use extmount::facade::ExternalStorage;
use extmount::resolver::Caller;

fn print_usage() {
    eprintln!("Usage: extmount <config.yaml> <command> [args]");
    eprintln!();
    eprintln!("extmount - pluggable external storage mounts");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  check                 Run setup diagnostics for all configured mounts");
    eprintln!("  list <path> [user]    List a virtual path as the given user");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  extmount /etc/extmount/config.yaml check");
    eprintln!("  extmount /etc/extmount/config.yaml list /docs alice");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        print_usage();
        return ExitCode::FAILURE;
    }

    let config_path = PathBuf::from(&args[1]);
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("loaded configuration from {:?}", config_path);

    match args[2].as_str() {
        "check" => run_check(&config),
        "list" => {
            let Some(path) = args.get(3) else {
                print_usage();
                return ExitCode::FAILURE;
            };
            let user = args.get(4).cloned().unwrap_or_else(|| "admin".to_string());
            run_list(config, path, &user).await
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn run_check(config: &Config) -> ExitCode {
    let notes = diag::check_all(config.mounts.iter().map(|m| &m.config));
    if notes.is_empty() {
        println!("All {} mount(s) pass setup diagnostics", config.mounts.len());
        return ExitCode::SUCCESS;
    }

    let mut blocking = 0;
    for note in &notes {
        println!("{}", note);
        if note.severity == Severity::Blocking {
            blocking += 1;
        }
    }
    if blocking > 0 {
        eprintln!("{} mount(s) cannot be used as configured", blocking);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_list(config: Config, path: &str, user: &str) -> ExitCode {
    let storage = match ExternalStorage::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to set up storage: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let caller = Caller::new(user, vec![]);
    match storage.list(&caller, path).await {
        Ok(entries) => {
            for entry in entries {
                let marker = if entry.file_type == extmount::backend::FileType::Directory {
                    "/"
                } else {
                    ""
                };
                println!("{}{}", entry.name, marker);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("list failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
