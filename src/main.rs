use std::sync::Arc;

use keepr::auth::{self, AuthProvider, Credentials, GoTrueAuth, MemoryAuth};
use keepr::cache::EntityCache;
use keepr::config::KeeprConfig;
use keepr::core::note::{Note, NoteField};
use keepr::notes::NoteService;
use keepr::remote::{MemoryStore, RemoteStore, RestStore};
use keepr::view;

const USAGE: &str = "usage: keepr [--debug] [--offline] <command>

commands:
  login <email> <password>
  signup <email> <password>
  logout
  list [query]
  new <title> [content]
  trash
  empty-trash
  purge";

#[derive(Debug, PartialEq)]
enum Command {
    Login { email: String, password: String },
    Signup { email: String, password: String },
    Logout,
    List { query: Option<String> },
    New { title: String, content: Option<String> },
    Trash,
    EmptyTrash,
    Purge,
}

#[derive(Debug, Default, PartialEq)]
struct Flags {
    debug: bool,
    offline: bool,
}

fn parse_args(args: &[String]) -> Result<(Flags, Command), String> {
    let mut flags = Flags::default();
    let mut rest = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--debug" => flags.debug = true,
            "--offline" => flags.offline = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => rest.push(arg.clone()),
        }
    }
    let Some(name) = rest.first().cloned() else {
        return Err(USAGE.to_string());
    };
    let arg = |i: usize| rest.get(i).cloned();
    let need = |i: usize, what: &str| arg(i).ok_or_else(|| format!("{}: missing <{}>\n\n{}", name, what, USAGE));
    let command = match name.as_str() {
        "login" => Command::Login {
            email: need(1, "email")?,
            password: need(2, "password")?,
        },
        "signup" => Command::Signup {
            email: need(1, "email")?,
            password: need(2, "password")?,
        },
        "logout" => Command::Logout,
        "list" => Command::List { query: arg(1) },
        "new" => Command::New {
            title: need(1, "title")?,
            content: arg(2),
        },
        "trash" => Command::Trash,
        "empty-trash" => Command::EmptyTrash,
        "purge" => Command::Purge,
        other => return Err(format!("unknown command '{}'\n\n{}", other, USAGE)),
    };
    Ok((flags, command))
}

fn init_logging(debug: bool) {
    // Set up logging to the systemd user journal (`journalctl --user -t keepr -f`).
    // Wrapper filters: keepr at info/debug (per config), everything else at warn.
    struct FilteredJournal {
        inner: systemd_journal_logger::JournalLog,
    }

    impl log::Log for FilteredJournal {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            if metadata.target().starts_with("keepr") {
                let max = if keepr::debug_logging() {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                };
                metadata.level() <= max
            } else {
                metadata.level() <= log::LevelFilter::Warn
            }
        }
        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                self.inner.log(record);
            }
        }
        fn flush(&self) {
            self.inner.flush();
        }
    }

    keepr::set_debug_logging(debug);
    let journal = match systemd_journal_logger::JournalLog::new() {
        Ok(journal) => journal.with_syslog_identifier("keepr".to_string()),
        Err(e) => {
            eprintln!("keepr: journal logging unavailable: {}", e);
            return;
        }
    };
    if log::set_boxed_logger(Box::new(FilteredJournal { inner: journal })).is_ok() {
        // Global max must be Debug so keepr debug logs can pass through when toggled
        log::set_max_level(log::LevelFilter::Debug);
    }
}

struct Backend {
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn RemoteStore>,
    gotrue: Option<Arc<GoTrueAuth>>,
}

impl Backend {
    fn offline() -> Self {
        log::info!("using in-memory backend");
        Self {
            auth: Arc::new(MemoryAuth::signed_in("offline@localhost")),
            store: Arc::new(MemoryStore::new()),
            gotrue: None,
        }
    }

    async fn online(config: &KeeprConfig) -> keepr::Result<Self> {
        config.validate()?;
        let gotrue = Arc::new(
            GoTrueAuth::new(&config.backend_url, &config.anon_key, config.request_timeout())?
                .with_redirect(config.signup_redirect.clone()),
        );
        let store = RestStore::new(
            &config.backend_url,
            &config.anon_key,
            gotrue.sessions().subscribe(),
            config.request_timeout(),
        )?;

        match auth::keyring::load_refresh_token(&config.backend_url).await {
            Ok(Some(token)) => match gotrue.restore_session(&token).await {
                Ok(_) => remember_session(&gotrue, &config.backend_url).await,
                Err(e) => log::warn!("stored session could not be restored: {}", e),
            },
            Ok(None) => {}
            Err(e) => log::warn!("{}", e),
        }

        Ok(Self {
            auth: gotrue.clone(),
            store: Arc::new(store),
            gotrue: Some(gotrue),
        })
    }
}

/// Refresh tokens rotate; keep the latest one in the keyring.
async fn remember_session(gotrue: &GoTrueAuth, server: &str) {
    let Some(token) = gotrue.refresh_token() else {
        return;
    };
    if let Err(e) = auth::keyring::store_refresh_token(server, &token).await {
        log::warn!("{}", e);
    }
}

fn print_note(note: &Note) {
    let title = if note.title_text().is_empty() {
        "(untitled)"
    } else {
        note.title_text()
    };
    println!("  {}  {}", note.id, title);
    if !note.content_text().is_empty() {
        println!("      {}", note.content_text());
    }
}

fn print_section(name: &str, notes: &[Note]) {
    if notes.is_empty() {
        return;
    }
    println!("{}", name);
    for note in notes {
        print_note(note);
    }
}

async fn run(config: &KeeprConfig, flags: &Flags, command: Command) -> keepr::Result<()> {
    let backend = if flags.offline {
        Backend::offline()
    } else {
        Backend::online(config).await?
    };
    let cache = Arc::new(EntityCache::new(config.cache_stale_after()));
    let notes = NoteService::new(
        backend.store.clone(),
        backend.auth.clone(),
        cache,
        config.trash_retention(),
    );

    match command {
        Command::Login { email, password } => {
            let user = backend.auth.sign_in(&Credentials::new(email, password)?).await?;
            if let Some(gotrue) = &backend.gotrue {
                remember_session(gotrue, &config.backend_url).await;
            }
            println!("Signed in as {}", user.email.unwrap_or_else(|| user.id.to_string()));
        }
        Command::Signup { email, password } => {
            let credentials = Credentials::for_sign_up(email, password.clone(), &password)?;
            match backend.auth.sign_up(&credentials).await? {
                Some(user) => {
                    if let Some(gotrue) = &backend.gotrue {
                        remember_session(gotrue, &config.backend_url).await;
                    }
                    println!("Account created, signed in as {}", user.id);
                }
                None => println!("Check your email to confirm your account."),
            }
        }
        Command::Logout => {
            let result = backend.auth.sign_out().await;
            if backend.gotrue.is_some() {
                if let Err(e) = auth::keyring::delete_refresh_token(&config.backend_url).await {
                    log::warn!("{}", e);
                }
            }
            result?;
            println!("Signed out");
        }
        Command::List { query } => {
            let active = notes.active_notes().await?;
            let outcome = view::search(&active, query.as_deref().unwrap_or(""));
            if outcome.no_notes() {
                println!("No notes yet.");
            } else if outcome.is_empty_result() {
                println!("No notes match your search.");
            } else {
                let groups = view::group(&outcome.notes, !outcome.query_active());
                print_section("Pinned", &groups.pinned);
                print_section("Recent", &groups.recent);
                print_section("Others", &groups.others);
            }
        }
        Command::New { title, content } => {
            let editor = notes.compose(config.autosave_delay());
            editor.on_field_change(NoteField::Title(title));
            if let Some(content) = content {
                editor.on_field_change(NoteField::Content(content));
            }
            editor.on_session_close().await?;
            match editor.entity_id() {
                Some(id) => println!("Created note {}", id),
                None => println!("Nothing to save."),
            }
        }
        Command::Trash => {
            let trashed = notes.trashed_notes().await?;
            if trashed.is_empty() {
                println!("Trash is empty.");
            }
            let now = chrono::Utc::now();
            for note in &trashed {
                print_note(note);
                if let Some(deleted_at) = note.deleted_at {
                    let days = view::days_remaining(deleted_at, now, notes.retention());
                    println!("      {} days left", days);
                }
            }
        }
        Command::EmptyTrash => {
            let removed = notes.empty_trash().await?;
            println!("Deleted {} notes forever", removed);
        }
        Command::Purge => {
            let purged = notes.purge_expired().await?;
            println!("Purged {} expired notes", purged);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (flags, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(usage) => {
            eprintln!("{}", usage);
            std::process::exit(2);
        }
    };

    let config = match KeeprConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("keepr: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(flags.debug || config.debug_logging);

    if let Err(e) = run(&config, &flags, command).await {
        log::error!("{}", e);
        eprintln!("keepr: {}", e);
        std::process::exit(1);
    }
}
