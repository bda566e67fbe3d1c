use crate::api::{ApiClient, ApiResponse, Provider};
use crate::auth::{
    sanitize_code, AppleSignIn, Applied, AuthError, AuthFlow, AuthStep, Destination,
    IdTokenCredential, SuccessHandoff,
};
use crate::config::Config;
use crate::profile::{
    completion_percent, parse_tags, recommend, CreateProfileRequest, Profile,
    UpdateProfileRequest, RECOMMENDATION_COUNT,
};
use crate::search::SearchFilters;
use crate::storage::{AuthStorage, Role, Session};
use crate::transcript::Transcript;
use crate::Args;
use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

pub struct Context {
    pub args: Args,
    pub config: Config,
    pub api: ApiClient,
    pub storage: Arc<AuthStorage>,
    pub flow: RefCell<AuthFlow>,
    pub transcript: Arc<Mutex<Transcript>>,
    pub session_id: String,
    pub history_path: PathBuf,
}

/// Write a transcript event; failures only show up in debug mode
pub fn record(ctx: &Context, event: impl FnOnce(&mut Transcript) -> Result<()>) {
    let mut transcript = ctx.transcript.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = event(&mut transcript) {
        if ctx.args.debug {
            eprintln!("[DEBUG] transcript write failed: {}", e);
        }
    }
}

pub fn run_once(ctx: &Context, line: &str) -> Result<()> {
    let line = line.trim();
    if !line.starts_with('/') {
        anyhow::bail!("Commands start with '/', try /help");
    }
    handle_command(ctx, line);
    Ok(())
}

pub fn run_repl(ctx: Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if rl.load_history(&ctx.history_path).is_err() && ctx.args.debug {
        eprintln!("[DEBUG] no history at {}", ctx.history_path.display());
    }

    println!("mentori - type /help for commands, /exit to quit");
    match ctx.storage.session() {
        Some(session) => println!(
            "Signed in as {} ({})",
            session.user.email, session.user.role
        ),
        None => println!("Not signed in. Start with /login <email> or /google"),
    }

    loop {
        let prompt = format!("mentori({})> ", ctx.flow.borrow().step());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                if !line.starts_with('/') {
                    println!("Commands start with '/', try /help");
                    continue;
                }
                if handle_command(&ctx, line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&ctx.history_path) {
        eprintln!("Warning: failed to save history: {}", e);
    }
    Ok(())
}

fn handle_command(ctx: &Context, cmd: &str) -> bool {
    let words = match shell_words::split(cmd) {
        Ok(words) => words,
        Err(e) => {
            println!("Could not parse command: {}", e);
            return false;
        }
    };
    let Some((name, rest)) = words.split_first() else {
        return false;
    };
    record(ctx, |t| t.command(name));

    match name.as_str() {
        "/exit" | "/quit" => return true,
        "/help" => print_help(),
        "/login" => match rest.first() {
            Some(email) => {
                let result = ctx.flow.borrow_mut().submit_email(&ctx.api, email);
                report(ctx, result);
            }
            None => println!("Usage: /login <email>"),
        },
        "/verify" => match rest.first() {
            Some(code) => {
                let code = sanitize_code(code);
                let result = ctx.flow.borrow_mut().submit_code(&ctx.api, &code);
                report(ctx, result);
            }
            None => println!("Usage: /verify <6-digit code>"),
        },
        "/google" => {
            let token = rest.first().cloned().or_else(|| ctx.args.id_token.clone());
            match token {
                Some(token) => {
                    let google = IdTokenCredential::new(Provider::Google, &token);
                    let result = ctx.flow.borrow_mut().submit_oauth(&ctx.api, &google);
                    report(ctx, result);
                }
                None => {
                    println!("Usage: /google <id-token> (or set MENTORI_GOOGLE_ID_TOKEN)");
                    if let Some(client_id) = &ctx.config.auth.google_client_id {
                        println!("Obtain an ID token for client {}", client_id);
                    }
                }
            }
        }
        "/apple" => {
            let result = ctx.flow.borrow_mut().submit_oauth(&ctx.api, &AppleSignIn);
            report(ctx, result);
        }
        "/role" => match rest.first().and_then(|r| Role::from_str(r)) {
            Some(role) => {
                let result = ctx.flow.borrow_mut().submit_role(&ctx.api, role);
                report(ctx, result);
            }
            None => println!("Usage: /role mentor|mentee"),
        },
        "/back" => {
            ctx.flow.borrow_mut().back();
            let step = ctx.flow.borrow().step();
            record(ctx, |t| t.auth_step(step.as_str(), None));
            println!("Back at {}", step);
        }
        "/logout" => logout(ctx),
        "/whoami" => match ctx.storage.session() {
            Some(session) => {
                println!("{} ({})", session.user.email, session.user.role);
                println!("  id: {}", session.user.id);
                println!("  member since: {}", session.user.created_at.format("%Y-%m-%d"));
            }
            None => println!("Not signed in"),
        },
        "/profile" => handle_profile_command(ctx, rest),
        "/search" => handle_search_command(ctx, rest),
        "/dashboard" => show_dashboard(ctx),
        "/cache" => handle_cache_command(ctx, rest),
        "/health" => {
            let resp = ctx.api.health_check();
            if resp.is_success() {
                println!("Backend at {} is up", ctx.api.base_url());
            } else {
                println!(
                    "Backend unavailable (status {}): {}",
                    resp.status,
                    resp.error_message("no response")
                );
            }
        }
        "/config" => print!("{}", ctx.config.effective()),
        "/session" => {
            println!("Session: {}", ctx.session_id);
            let transcript = ctx.transcript.lock().unwrap_or_else(PoisonError::into_inner);
            println!("Transcript: {:?}", transcript.path);
        }
        _ => println!("Unknown command: {}", name),
    }
    false
}

fn print_help() {
    println!("Sign-in:");
    println!("  /login <email>       - email me a one-time code");
    println!("  /verify <code>       - enter the 6-digit code");
    println!("  /google [id-token]   - sign in with Google");
    println!("  /apple               - sign in with Apple");
    println!("  /role mentor|mentee  - pick a role (new accounts)");
    println!("  /back                - go back one step");
    println!("  /logout              - sign out");
    println!("  /whoami              - show the signed-in user");
    println!("Profiles:");
    println!("  /profile [show]      - show my profile");
    println!("  /profile create --first <name> --last <name> [--bio ..] [--location ..]");
    println!("                  [--expertise a,b] [--interests a,b] [--avatar <url>]");
    println!("  /profile edit [same flags] [--active true|false]");
    println!("  /profile delete      - delete my profile");
    println!("  /search [--role r] [--location l] [--expertise e] [--interest i] [--limit n] [--offset n]");
    println!("  /dashboard           - completion and recommendations");
    println!("Other:");
    println!("  /cache [clear]       - show or clear cached responses");
    println!("  /health              - check the backend");
    println!("  /config              - show effective settings");
    println!("  /session             - show session info");
    println!("  /exit                - quit");
}

fn report(ctx: &Context, result: Result<Applied, AuthError>) {
    let step = ctx.flow.borrow().step();
    match result {
        Err(e) => {
            println!("{}", e);
            record(ctx, |t| t.auth_error(step.as_str(), &e.to_string()));
        }
        Ok(Applied::Stayed(message)) => {
            println!("Error: {}", message);
            record(ctx, |t| t.auth_error(step.as_str(), &message));
        }
        Ok(Applied::Stale) => println!("Ignored a reply for a step you already left"),
        Ok(Applied::Advanced(step)) => {
            let (email, provider) = {
                let flow = ctx.flow.borrow();
                (flow.email().map(str::to_string), flow.provider())
            };
            record(ctx, |t| t.auth_step(step.as_str(), provider.map(|p| p.as_str())));
            match step {
                AuthStep::VerifyCode => println!(
                    "Code sent to {}. Enter it with /verify <code>",
                    email.unwrap_or_default()
                ),
                AuthStep::SelectRole => {
                    println!("Welcome! Are you here to mentor or to be mentored?");
                    println!("Choose with /role mentor or /role mentee");
                }
                AuthStep::Success => signed_in(ctx),
                AuthStep::Login => {}
            }
        }
    }
}

fn signed_in(ctx: &Context) {
    if let Some(session) = ctx.flow.borrow().session() {
        println!(
            "Signed in as {} ({})",
            session.user.email, session.user.role
        );
    }
    println!("Redirecting...");

    let handoff = SuccessHandoff::new(ctx.config.success_delay());
    match handoff.run(&ctx.api) {
        Destination::Dashboard => show_dashboard(ctx),
        Destination::CreateProfile => {
            println!("You don't have a profile yet. Create one with:");
            println!("  /profile create --first <name> --last <name>");
        }
    }
}

fn logout(ctx: &Context) {
    let user_id = ctx.storage.user().map(|u| u.id);
    if let Err(e) = ctx.storage.clear() {
        eprintln!("Failed to clear session: {}", e);
        return;
    }
    let entries = ctx.api.cache().len();
    ctx.api.invalidate_cache();
    ctx.flow.borrow_mut().reset();
    record(ctx, |t| t.logout(user_id.as_deref()));
    record(ctx, |t| t.cache("clear", entries));
    println!("Signed out");
}

fn require_session(ctx: &Context) -> Option<Session> {
    let session = ctx.storage.session();
    if session.is_none() {
        println!("Not signed in. Use /login <email> or /google first");
    }
    session
}

fn print_failure<T>(what: &str, resp: &ApiResponse<T>) {
    if resp.is_network_error() {
        println!("{}: cannot reach the backend", what);
    } else {
        println!(
            "{} (status {}): {}",
            what,
            resp.status,
            resp.error_message("API request failed")
        );
    }
}

fn print_profile(profile: &Profile) {
    println!("{}", profile.display_name());
    if !profile.location.is_empty() {
        println!("  location:  {}", profile.location);
    }
    if !profile.bio.is_empty() {
        println!("  bio:       {}", profile.bio);
    }
    if !profile.expertise.is_empty() {
        println!("  expertise: {}", profile.expertise.join(", "));
    }
    if !profile.interests.is_empty() {
        println!("  interests: {}", profile.interests.join(", "));
    }
    if !profile.is_active {
        println!("  (inactive)");
    }
}

/// `--key value` pairs; a repeated key keeps the last value
fn parse_flags(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut flags = BTreeMap::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let key = arg
            .strip_prefix("--")
            .ok_or_else(|| format!("Expected a --flag, got '{}'", arg))?;
        let value = iter
            .next()
            .ok_or_else(|| format!("Missing value for --{}", key))?;
        flags.insert(key.to_string(), value.clone());
    }
    Ok(flags)
}

const PROFILE_FLAGS: &[&str] = &[
    "first", "last", "bio", "avatar", "location", "expertise", "interests", "active",
];

fn check_flags(flags: &BTreeMap<String, String>) -> Result<(), String> {
    match flags.keys().find(|k| !PROFILE_FLAGS.contains(&k.as_str())) {
        Some(unknown) => Err(format!("Unknown flag: --{}", unknown)),
        None => Ok(()),
    }
}

fn create_request(flags: &BTreeMap<String, String>) -> Result<CreateProfileRequest, String> {
    check_flags(flags)?;
    let text = |key: &str| flags.get(key).cloned().unwrap_or_default();
    let request = CreateProfileRequest {
        first_name: text("first"),
        last_name: text("last"),
        bio: text("bio"),
        avatar_url: text("avatar"),
        expertise: parse_tags(&text("expertise")),
        interests: parse_tags(&text("interests")),
        location: text("location"),
    };
    request.validate()?;
    Ok(request)
}

fn update_request(flags: &BTreeMap<String, String>) -> Result<UpdateProfileRequest, String> {
    check_flags(flags)?;
    let is_active = match flags.get("active").map(String::as_str) {
        None => None,
        Some("true") | Some("yes") => Some(true),
        Some("false") | Some("no") => Some(false),
        Some(other) => return Err(format!("Invalid --active value: {}", other)),
    };
    Ok(UpdateProfileRequest {
        first_name: flags.get("first").cloned(),
        last_name: flags.get("last").cloned(),
        bio: flags.get("bio").cloned(),
        avatar_url: flags.get("avatar").cloned(),
        expertise: flags.get("expertise").map(|v| parse_tags(v)),
        interests: flags.get("interests").map(|v| parse_tags(v)),
        location: flags.get("location").cloned(),
        is_active,
    })
}

fn handle_profile_command(ctx: &Context, args: &[String]) {
    if require_session(ctx).is_none() {
        return;
    }

    let sub = args.first().map(String::as_str).unwrap_or("show");
    let rest = args.get(1..).unwrap_or_default();

    match sub {
        "show" => {
            let resp = ctx.api.get_profile();
            match &resp.data {
                Some(profile) => {
                    print_profile(profile);
                    println!("  complete:  {}%", completion_percent(Some(profile)));
                }
                None if resp.status == 404 => {
                    println!("No profile yet. Create one with /profile create")
                }
                None => print_failure("Could not load profile", &resp),
            }
        }
        "create" => {
            let request = match parse_flags(rest).and_then(|f| create_request(&f)) {
                Ok(request) => request,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            };
            let resp = ctx.api.create_profile(&request);
            match &resp.data {
                Some(profile) => {
                    record(ctx, |t| t.profile_saved("create", &profile.id));
                    println!("Profile created");
                    print_profile(profile);
                }
                None => print_failure("Failed to create profile", &resp),
            }
        }
        "edit" => {
            let update = match parse_flags(rest).and_then(|f| update_request(&f)) {
                Ok(update) => update,
                Err(e) => {
                    println!("{}", e);
                    return;
                }
            };
            if update.is_empty() {
                println!("Nothing to change. See /help for the profile flags");
                return;
            }
            let resp = ctx.api.update_profile(&update);
            match &resp.data {
                Some(profile) => {
                    record(ctx, |t| t.profile_saved("update", &profile.id));
                    println!("Profile updated");
                    print_profile(profile);
                }
                None => print_failure("Failed to update profile", &resp),
            }
        }
        "delete" => {
            let resp = ctx.api.delete_profile();
            if resp.is_success() {
                record(ctx, |t| t.profile_saved("delete", ""));
                println!("Profile deleted");
            } else {
                print_failure("Failed to delete profile", &resp);
            }
        }
        other => println!("Unknown profile command: {}", other),
    }
}

fn handle_search_command(ctx: &Context, args: &[String]) {
    let viewer = ctx.storage.user().map(|u| u.role);
    let filters = match SearchFilters::from_args(args) {
        Ok(filters) => filters.or_counterpart_of(viewer),
        Err(e) => {
            println!("{}", e);
            return;
        }
    };

    let resp = ctx.api.search_profiles(&filters);
    match &resp.data {
        Some(profiles) if profiles.is_empty() => println!("No matching profiles"),
        Some(profiles) => {
            println!("{} profile(s):", profiles.len());
            for profile in profiles {
                print_profile(profile);
            }
        }
        None => print_failure("Search failed", &resp),
    }
}

/// Own profile and counterpart listing, fetched in parallel
fn show_dashboard(ctx: &Context) {
    let Some(session) = require_session(ctx) else {
        return;
    };
    let counterpart = session.user.role.counterpart();
    let filters = SearchFilters {
        role: Some(counterpart),
        ..SearchFilters::default()
    };

    let api = &ctx.api;
    let (mine, listing) = thread::scope(|s| {
        let mine = s.spawn(|| api.get_profile());
        let listing = s.spawn(|| api.search_profiles(&filters));
        (
            mine.join()
                .unwrap_or_else(|_| ApiResponse::network_error("profile fetch panicked")),
            listing
                .join()
                .unwrap_or_else(|_| ApiResponse::network_error("search panicked")),
        )
    });

    println!("Dashboard for {} ({})", session.user.email, session.user.role);
    println!("  profile complete: {}%", completion_percent(mine.data.as_ref()));

    let Some(me) = mine.data else {
        println!("  Create your profile to get recommendations: /profile create");
        return;
    };
    match &listing.data {
        Some(candidates) => {
            let recs = recommend(&me, candidates.clone(), RECOMMENDATION_COUNT);
            if recs.is_empty() {
                println!("  No {}s to recommend yet", counterpart);
            } else {
                println!("  Recommended {}s:", counterpart);
                for rec in recs {
                    println!("    {} (score {})", rec.profile.display_name(), rec.score);
                }
            }
        }
        None => print_failure("  Could not load recommendations", &listing),
    }
}

fn handle_cache_command(ctx: &Context, args: &[String]) {
    let cache = ctx.api.cache();
    match args.first().map(String::as_str) {
        Some("clear") => {
            let entries = cache.len();
            ctx.api.invalidate_cache();
            record(ctx, |t| t.cache("clear", entries));
            println!("Cleared {} cached response(s)", entries);
        }
        None => {
            let stats = cache.stats();
            println!("Cached responses: {} (ttl {}s)", cache.len(), cache.ttl().as_secs());
            println!(
                "  hits: {}  joined in-flight: {}  misses: {}",
                stats.hits, stats.joins, stats.misses
            );
        }
        Some(other) => println!("Unknown cache command: {}", other),
    }
}
