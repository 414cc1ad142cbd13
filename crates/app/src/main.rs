use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exam_core::model::{EngineSettings, EngineSettingsDraft, ExamId, ProgramId, StudentId};
use exam_core::timer::remaining_seconds;
use services::{AppServices, Clock, SittingKey};
use storage::repository::SessionStore;

mod console;
mod uploads;

use uploads::DirectoryUploader;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidId { flag: &'static str, raw: String },
    InvalidDbUrl { raw: String },
    MissingStudent,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidId { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::MissingStudent => {
                write!(f, "a student is required (--student or EXAM_STUDENT_ID)")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

#[derive(Debug)]
enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Invalid(exam_core::model::SettingsError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
            ConfigError::Invalid(err) => write!(f, "invalid settings: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_id(value: &str, flag: &'static str) -> Result<u64, ArgsError> {
    value.trim().parse().map_err(|_| ArgsError::InvalidId {
        flag,
        raw: value.to_string(),
    })
}

fn env_id(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Sit,
    Status,
    Reset,
    Topics,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "sit" => Some(Self::Sit),
            "status" => Some(Self::Status),
            "reset" => Some(Self::Reset),
            "topics" => Some(Self::Topics),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    cache_url: String,
    config: Option<PathBuf>,
    program: ProgramId,
    exam: ExamId,
    student: Option<StudentId>,
    uploads: PathBuf,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("EXAM_DB_URL")
            .ok()
            .map_or_else(|| normalize_sqlite_url("exam.sqlite3".into()), normalize_sqlite_url);
        let mut cache_url = std::env::var("EXAM_CACHE_URL").ok().map_or_else(
            || normalize_sqlite_url("exam-cache.sqlite3".into()),
            normalize_sqlite_url,
        );
        let mut config = std::env::var("EXAM_CONFIG").ok().map(PathBuf::from);
        let mut program = ProgramId::new(env_id("EXAM_PROGRAM_ID").unwrap_or(1));
        let mut exam = ExamId::new(env_id("EXAM_ID").unwrap_or(1));
        let mut student = env_id("EXAM_STUDENT_ID").map(StudentId::new);
        let mut uploads = std::env::var("EXAM_UPLOAD_DIR")
            .map_or_else(|_| PathBuf::from("uploads"), PathBuf::from);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--cache-db" => {
                    let value = require_value(args, "--cache-db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    cache_url = normalize_sqlite_url(value);
                }
                "--config" => config = Some(PathBuf::from(require_value(args, "--config")?)),
                "--program" => {
                    program = ProgramId::new(parse_id(&require_value(args, "--program")?, "--program")?);
                }
                "--exam" => exam = ExamId::new(parse_id(&require_value(args, "--exam")?, "--exam")?),
                "--student" => {
                    student = Some(StudentId::new(parse_id(
                        &require_value(args, "--student")?,
                        "--student",
                    )?));
                }
                "--uploads" => uploads = PathBuf::from(require_value(args, "--uploads")?),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            cache_url,
            config,
            program,
            exam,
            student,
            uploads,
        })
    }

    fn key(&self) -> Result<SittingKey, ArgsError> {
        Ok(SittingKey {
            exam: self.exam,
            student: self.student.ok_or(ArgsError::MissingStudent)?,
            program: self.program,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- sit    --student <id> [options]  # interactive sitting");
    eprintln!("  cargo run -p app -- status --student <id> [options]");
    eprintln!("  cargo run -p app -- reset  --student <id> [options]  # administrator reset");
    eprintln!("  cargo run -p app -- topics [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>        Session and content store (default: sqlite:exam.sqlite3)");
    eprintln!("  --cache-db <sqlite_url>  Local cache (default: sqlite:exam-cache.sqlite3)");
    eprintln!("  --config <path>          Engine settings TOML");
    eprintln!("  --program <id>           Program (default: 1)");
    eprintln!("  --exam <id>              Exam (default: 1)");
    eprintln!("  --student <id>           Student sitting the exam");
    eprintln!("  --uploads <dir>          Where file answers are stored (default: uploads)");
    eprintln!();
    eprintln!("Environment (overridden by flags):");
    eprintln!("  EXAM_DB_URL, EXAM_CACHE_URL, EXAM_CONFIG, EXAM_PROGRAM_ID, EXAM_ID,");
    eprintln!("  EXAM_STUDENT_ID, EXAM_UPLOAD_DIR, RUST_LOG");
}

fn load_settings(path: Option<&Path>) -> Result<EngineSettings, ConfigError> {
    let draft = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str::<EngineSettingsDraft>(&content).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?
        }
        None => EngineSettingsDraft::new(),
    };
    draft.validate().map_err(ConfigError::Invalid)
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None | Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    let mut iter = argv.into_iter().skip(1);
    let parsed = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let settings = load_settings(parsed.config.as_deref())?;

    // Open + migrate SQLite at startup. Keep this in the binary glue so core/services stay pure.
    prepare_sqlite_file(&parsed.db_url)?;
    prepare_sqlite_file(&parsed.cache_url)?;
    let clock = Clock::default_clock();
    let services =
        AppServices::new_sqlite(&parsed.db_url, &parsed.cache_url, settings, clock.clone()).await?;

    match cmd {
        Command::Sit => {
            let key = parsed.key()?;
            let uploader = DirectoryUploader::new(&parsed.uploads)?;
            let services = services.with_uploader(Arc::new(uploader));
            let sitting = services.sitting(key);
            tracing::info!(session = %key.session_id(), student = %key.student, "sitting opened");
            console::run(sitting).await?;
        }
        Command::Status => {
            let key = parsed.key()?;
            let session = services
                .storage()
                .sessions
                .get_session(key.session_id())
                .await?;
            match session {
                None => println!("no session for student {}", key.student),
                Some(session) => {
                    println!("session {}", session.id());
                    println!("  status:    {}", session.status());
                    println!(
                        "  remaining: {}s",
                        remaining_seconds(session.end_time(), clock.now())
                    );
                    println!("  answers:   {}", session.answers().len());
                    if let Some(score) = session.final_score() {
                        println!("  score:     {score}");
                    }
                }
            }
        }
        Command::Reset => {
            let key = parsed.key()?;
            if services.reset_sitting(key).await? {
                println!("session {} deleted", key.session_id());
            } else {
                println!("no session for student {}", key.student);
            }
        }
        Command::Topics => {
            for topic in services.available_topics(parsed.program).await? {
                println!("{topic}");
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}
