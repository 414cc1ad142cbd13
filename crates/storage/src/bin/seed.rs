use std::fmt;

use exam_core::model::{ExamDefinition, ExamId, ProgramId, Question, QuestionId, TabularPayload, Topic};
use storage::repository::Storage;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    cache_url: String,
    program: ProgramId,
    duration_minutes: u32,
    passing_grade: u8,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidProgram { raw: String },
    InvalidDuration { raw: String },
    InvalidPassingGrade { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidProgram { raw } => write!(f, "invalid --program value: {raw}"),
            ArgsError::InvalidDuration { raw } => write!(f, "invalid --minutes value: {raw}"),
            ArgsError::InvalidPassingGrade { raw } => {
                write!(f, "invalid --passing-grade value (0-100): {raw}")
            }
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("EXAM_DB_URL").unwrap_or_else(|_| "sqlite:exam.sqlite3?mode=rwc".into());
        let mut cache_url = std::env::var("EXAM_CACHE_URL")
            .unwrap_or_else(|_| "sqlite:exam-cache.sqlite3?mode=rwc".into());
        let mut program = std::env::var("EXAM_PROGRAM_ID")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map_or_else(|| ProgramId::new(1), ProgramId::new);
        let mut duration_minutes = 180;
        let mut passing_grade = 70;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--cache-db" => {
                    let value = require_value(&mut args, "--cache-db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    cache_url = value;
                }
                "--program" => {
                    let value = require_value(&mut args, "--program")?;
                    let parsed: u64 = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidProgram { raw: value.clone() })?;
                    program = ProgramId::new(parsed);
                }
                "--minutes" => {
                    let value = require_value(&mut args, "--minutes")?;
                    duration_minutes = value
                        .parse::<u32>()
                        .ok()
                        .filter(|m| *m > 0)
                        .ok_or_else(|| ArgsError::InvalidDuration { raw: value.clone() })?;
                }
                "--passing-grade" => {
                    let value = require_value(&mut args, "--passing-grade")?;
                    passing_grade = value
                        .parse::<u8>()
                        .ok()
                        .filter(|g| *g <= 100)
                        .ok_or_else(|| ArgsError::InvalidPassingGrade { raw: value.clone() })?;
                }
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
            program,
            duration_minutes,
            passing_grade,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:exam.sqlite3)");
    eprintln!("  --cache-db <sqlite_url>   Local cache URL (default: sqlite:exam-cache.sqlite3)");
    eprintln!("  --program <id>            Program owning the content (default: 1)");
    eprintln!("  --minutes <n>             Sitting duration per definition (default: 180)");
    eprintln!("  --passing-grade <n>       Passing grade 0-100 (default: 70)");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  EXAM_DB_URL, EXAM_CACHE_URL, EXAM_PROGRAM_ID");
}

type SampleQuestion = (&'static str, [&'static str; 4], u32);

fn samples(topic: &str) -> [SampleQuestion; 3] {
    match topic {
        "EXCEL" => [
            ("Which function adds up a range?", ["SUM", "COUNT", "AVERAGE", "MAX"], 0),
            ("Which symbol fixes a cell reference?", ["#", "$", "&", "@"], 1),
            ("Which chart suits a share of a whole?", ["Line", "Scatter", "Pie", "Area"], 2),
        ],
        "WORD" => [
            ("Which view shows page margins?", ["Draft", "Outline", "Web", "Print Layout"], 3),
            ("Which feature builds a table of contents?", ["Styles", "Macros", "Comments", "Track Changes"], 0),
            ("Which shortcut inserts a page break?", ["Ctrl+B", "Ctrl+Enter", "Ctrl+P", "Ctrl+K"], 1),
        ],
        "PPT" => [
            ("Where do you edit a layout for every slide?", ["Slide Master", "Outline", "Notes", "Sorter"], 0),
            ("Which effect animates a slide change?", ["Animation", "Transition", "Morph", "Zoom"], 1),
            ("Which mode shows speaker notes?", ["Reading", "Normal", "Presenter", "Sorter"], 2),
        ],
        _ => [
            ("Which order files records by date?", ["Alphabetical", "Numerical", "Subject", "Chronological"], 3),
            ("How long are tax records usually kept?", ["1 year", "5 years", "1 month", "Forever"], 1),
            ("Which system retrieves by region?", ["Geographic", "Subject", "Numeric", "Date"], 0),
        ],
    }
}

fn definition(args: &Args, index: u64, topic: &Topic) -> Result<ExamDefinition, Box<dyn std::error::Error>> {
    let base = index * 100;
    let mut questions = Vec::new();
    if topic.as_str() == "PRAKTIKUM" {
        let table = TabularPayload::new(
            vec!["Region".into(), "Q1".into(), "Q2".into()],
            vec![
                vec!["North".into(), "1200".into(), "1350".into()],
                vec!["South".into(), "980".into(), "1010".into()],
            ],
        )?;
        questions.push(
            Question::essay(
                QuestionId::new(base + 1),
                "Build a workbook from the table with totals and a chart, then upload it.",
                40,
            )?
            .with_table(table),
        );
        questions.push(Question::essay(
            QuestionId::new(base + 2),
            "Write a one-page memo summarising the results and upload it.",
            30,
        )?);
    } else {
        for (offset, (text, options, correct)) in (1_u64..).zip(samples(topic.as_str())) {
            questions.push(Question::choice(
                QuestionId::new(base + offset),
                text,
                options.iter().map(|o| (*o).to_string()).collect(),
                correct,
                10,
            )?);
        }
    }

    Ok(ExamDefinition::new(
        ExamId::new(args.program.value() * 1000 + index),
        args.program,
        format!("{topic} certification"),
        args.duration_minutes,
        args.passing_grade,
        questions,
    )?)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let storage = Storage::sqlite(
        &args.db_url,
        &args.cache_url,
        std::time::Duration::from_millis(500),
    )
    .await?;

    let topics = ["EXCEL", "WORD", "PPT", "ARSIP", "PRAKTIKUM"];
    for (index, name) in (1_u64..).zip(topics) {
        let topic = Topic::new(name)?;
        let exam = definition(&args, index, &topic)?;
        storage.catalog.upsert_exam(&topic, &exam).await?;
    }

    println!(
        "Seeded {} topics for program {} into {}",
        topics.len(),
        args.program,
        args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
