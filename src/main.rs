mod api;
mod auth;
mod cache;
mod cli;
mod config;
mod profile;
mod search;
mod storage;
mod transcript;

use anyhow::Result;
use clap::Parser;
use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Parser)]
#[command(name = "mentori", about = "Terminal client for the Mentori mentor-matching service")]
pub struct Args {
    #[arg(long, env = "MENTORI_API_URL", help = "Backend base URL (overrides config)")]
    pub base_url: Option<String>,

    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory for session state, history and transcripts")]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "MENTORI_GOOGLE_ID_TOKEN",
        hide_env_values = true,
        help = "Google ID token used by /google"
    )]
    pub id_token: Option<String>,

    #[arg(long, help = "Disable the response cache (requests are still deduplicated)")]
    pub no_cache: bool,

    #[arg(short = 'e', long, value_name = "COMMAND", help = "Run one command and exit")]
    pub exec: Option<String>,

    #[arg(long, help = "Trace HTTP requests and cache decisions")]
    pub trace: bool,

    #[arg(long, help = "Debug output (print settings)")]
    pub debug: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)?
    } else {
        config::Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: ignoring config files: {:#}", e);
            config::Config::default()
        })
    };

    // CLI flags win over every config layer
    if let Some(base_url) = &args.base_url {
        cfg.api.base_url = Some(base_url.clone());
    }
    if let Some(state_dir) = &args.state_dir {
        cfg.storage.state_dir = Some(state_dir.clone());
    }
    if args.no_cache {
        cfg.cache.enabled = Some(false);
    }

    if let Err(errors) = cfg.validate() {
        for error in &errors {
            eprintln!("Config error {}", error);
        }
        anyhow::bail!("Invalid configuration ({} error(s))", errors.len());
    }

    if args.debug {
        eprintln!("[DEBUG] Backend: {}{}", cfg.base_url(), cfg.api_prefix());
        eprintln!("[DEBUG] Timeout: {:?}", cfg.timeout());
        eprintln!(
            "[DEBUG] Cache: {} (ttl {:?})",
            if cfg.cache_enabled() { "on" } else { "off" },
            cfg.cache_ttl()
        );
        eprintln!("[DEBUG] State: {}", cfg.state_file().display());
    }

    let state_dir = cfg.state_dir();
    let transcripts_dir = state_dir.join("sessions");
    std::fs::create_dir_all(&transcripts_dir)?;

    let store = storage::FileStore::open(&cfg.state_file())?;
    let storage = Arc::new(storage::AuthStorage::new(Box::new(store)));

    let session_id = uuid::Uuid::new_v4().to_string();
    let transcript_path = transcripts_dir.join(format!("{}.jsonl", session_id));
    let transcript = Arc::new(Mutex::new(transcript::Transcript::new(
        &transcript_path,
        &session_id,
    )?));

    let observed = transcript.clone();
    let mut api = api::ApiClient::new(
        cfg.base_url(),
        cfg.api_prefix(),
        cfg.timeout(),
        storage.clone(),
        cache::ResponseCache::new(cfg.cache_ttl()),
    )
    .with_trace(args.trace)
    .with_observer(move |r| {
        let mut t = observed.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = t.request(r.method, &r.path, r.status, r.duration_ms);
    });
    if !cfg.cache_enabled() {
        api = api.without_cache();
    }

    let ctx = cli::Context {
        flow: RefCell::new(auth::AuthFlow::new(storage.clone())),
        history_path: state_dir.join("history.txt"),
        args,
        config: cfg,
        api,
        storage,
        transcript,
        session_id,
    };

    if let Some(line) = ctx.args.exec.clone() {
        cli::run_once(&ctx, &line)
    } else {
        cli::run_repl(ctx)
    }
}
