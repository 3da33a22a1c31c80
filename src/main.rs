//! xtemplate CLI: build an instance from a template directory and serve it.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use xtemplate::config::Config;
use xtemplate::server::{adapter, Supervisor};
use xtemplate::{log, state, watch};

/// Serve a directory of templates and static files as a web application
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory containing templates and static files
    #[arg(short, long, value_hint = clap::ValueHint::DirPath)]
    template_dir: Option<PathBuf>,

    /// Second directory exposed to templates (never routed)
    #[arg(long, value_hint = clap::ValueHint::DirPath)]
    context_dir: Option<PathBuf>,

    /// Template file extension
    #[arg(long)]
    template_ext: Option<String>,

    /// Left action delimiter
    #[arg(long)]
    ldelim: Option<String>,

    /// Right action delimiter
    #[arg(long)]
    rdelim: Option<String>,

    /// Minify template sources before parsing
    #[arg(short, long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
    minify: Option<bool>,

    /// Watch the template directory and reload on changes
    #[arg(short, long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
    watch: Option<bool>,

    /// SQLite database path exposed to templates
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    db: Option<PathBuf>,

    /// Arbitrary config entries, key=value (repeatable)
    #[arg(short = 'c', long = "config-value", value_name = "KEY=VALUE")]
    config_values: Vec<String>,

    /// Config file path
    #[arg(short = 'C', long, default_value = "xtemplate.toml", value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short = 'V', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // file config first, CLI flags win
    let explicit_config = cli.config != PathBuf::from("xtemplate.toml");
    let mut config = Config::from_file(&cli.config, explicit_config)?;
    merge_cli(&mut config, &cli)?;
    let config = config.normalize();

    xtemplate::logger::set_verbose(config.verbose);
    state::setup_shutdown_handler()?;

    // first build is fatal on error; reloads fall back to the old instance
    let supervisor = Arc::new(Supervisor::new(config.clone())?);

    let (server, addr) = adapter::bind_with_retry(&config.listen)?;
    let server = Arc::new(server);

    let (shutdown_tx, shutdown_rx) = crossbeam::channel::unbounded::<()>();
    state::register_server(Arc::clone(&server), shutdown_tx);

    let watcher = if config.watch {
        let mut roots = vec![config.template_dir.clone()];
        if let Some(context) = &config.context_dir {
            roots.push(context.clone());
        }
        Some(watch::spawn_watcher(
            Arc::clone(&supervisor),
            roots,
            shutdown_rx,
        )?)
    } else {
        None
    };

    log!("serve"; "http://{}", addr);
    adapter::run_request_loop(&server, &supervisor);

    // unblocked by Ctrl+C: retire the live instance and stop the watcher
    supervisor.shutdown();
    if let Some(handle) = watcher {
        let _ = handle.join();
    }
    Ok(())
}

fn merge_cli(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(dir) = &cli.template_dir {
        config.template_dir = dir.clone();
    }
    if let Some(dir) = &cli.context_dir {
        config.context_dir = Some(dir.clone());
    }
    if let Some(ext) = &cli.template_ext {
        config.template_ext = ext.clone();
    }
    if let Some(l) = &cli.ldelim {
        config.ldelim = l.clone();
    }
    if let Some(r) = &cli.rdelim {
        config.rdelim = r.clone();
    }
    if let Some(minify) = cli.minify {
        config.minify = minify;
    }
    if let Some(watch) = cli.watch {
        config.watch = watch;
    }
    if let Some(db) = &cli.db {
        config.db = Some(db.clone());
    }
    for entry in &cli.config_values {
        let (k, v) = Config::parse_user_entry(entry)?;
        config.user.insert(k, v);
    }
    config.verbose |= cli.verbose;
    Ok(())
}
