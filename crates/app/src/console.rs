//! Line-oriented driver for one sitting, reading commands from stdin.

use std::fmt;
use std::sync::Arc;

use exam_core::model::{AnswerValue, QuestionId, QuestionKind, Topic, TopicSelection};
use services::{
    ExamSitting, SittingDrivers, SittingError, SittingEvent, SittingState, SittingView,
    SubmitOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    View,
    Questions,
    Start(TopicSelection),
    Goto(usize),
    Choose { question: QuestionId, option: u32 },
    Upload { question: QuestionId, path: String },
    Complete,
    Back,
    Submit { acknowledge_incomplete: bool },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn arg<'a>(parts: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str, ParseError> {
    parts
        .next()
        .ok_or_else(|| ParseError(format!("missing <{name}>")))
}

fn number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, ParseError> {
    raw.parse()
        .map_err(|_| ParseError(format!("invalid <{name}>: {raw}")))
}

/// Parse one input line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns `ParseError` for unknown commands or malformed arguments.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(None);
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "view" | "v" => ConsoleCommand::View,
        "questions" | "qs" => ConsoleCommand::Questions,
        "start" => {
            let raw = arg(&mut parts, "topic")?;
            if raw.eq_ignore_ascii_case("combined") || raw.eq_ignore_ascii_case("all") {
                ConsoleCommand::Start(TopicSelection::Combined)
            } else {
                let topic = Topic::new(raw).map_err(|e| ParseError(e.to_string()))?;
                ConsoleCommand::Start(TopicSelection::Single(topic))
            }
        }
        "goto" | "g" => ConsoleCommand::Goto(number(arg(&mut parts, "index")?, "index")?),
        "choose" | "c" => ConsoleCommand::Choose {
            question: number(arg(&mut parts, "question")?, "question")?,
            option: number(arg(&mut parts, "option")?, "option")?,
        },
        "upload" | "u" => ConsoleCommand::Upload {
            question: number(arg(&mut parts, "question")?, "question")?,
            path: arg(&mut parts, "path")?.to_string(),
        },
        "complete" | "done" => ConsoleCommand::Complete,
        "back" => ConsoleCommand::Back,
        "submit" => ConsoleCommand::Submit {
            acknowledge_incomplete: matches!(parts.next(), Some("--yes" | "-y")),
        },
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(ParseError(format!("unknown command: {other}"))),
    };

    if let Some(extra) = parts.next() {
        return Err(ParseError(format!("unexpected argument: {extra}")));
    }
    Ok(Some(command))
}

fn print_help() {
    println!("Commands:");
    println!("  view                      Show timer, state and answers");
    println!("  questions                 List questions of the open topic");
    println!("  start <TOPIC|combined>    Enter a topic");
    println!("  goto <index>              Move to a question (0-based)");
    println!("  choose <question> <n>     Answer a choice question");
    println!("  upload <question> <path>  Upload a file answer");
    println!("  complete                  Complete the open topic");
    println!("  back                      Return to topic selection");
    println!("  submit [--yes]            Submit; --yes confirms open topics");
    println!("  quit                      Leave without submitting");
}

fn format_remaining(seconds: Option<u64>) -> String {
    seconds.map_or_else(
        || "--:--:--".to_string(),
        |s| format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60),
    )
}

fn print_view(view: &SittingView) {
    println!(
        "[{}] {} | question {} | pending {}{}",
        format_remaining(view.remaining_seconds),
        view.state,
        view.question_index,
        view.pending_answers,
        if view.connected { "" } else { " | offline" },
    );
    if !view.completed_topics.is_empty() {
        let done: Vec<&str> = view.completed_topics.iter().map(Topic::as_str).collect();
        println!("  completed: {}", done.join(", "));
    }
    for (question, value) in &view.answers {
        println!("  #{question}: {value}");
    }
    if let Some(score) = view.final_score {
        println!("  final score: {score}");
    }
}

async fn print_questions(sitting: &ExamSitting) {
    for (index, question) in sitting.questions().await.iter().enumerate() {
        println!("{index:>3}. #{} ({} pts) {}", question.id(), question.points(), question.text());
        match question.kind() {
            QuestionKind::Choice { options, .. } => {
                for (n, option) in options.iter().enumerate() {
                    println!("       {n}) {option}");
                }
            }
            QuestionKind::Essay => println!("       (file answer)"),
        }
    }
}

fn report(result: Result<(), SittingError>) {
    if let Err(err) = result {
        println!("! {err}");
    }
}

async fn execute(sitting: &ExamSitting, command: ConsoleCommand) -> Result<(), SittingError> {
    match command {
        ConsoleCommand::View => print_view(&sitting.view().await),
        ConsoleCommand::Questions => print_questions(sitting).await,
        ConsoleCommand::Start(selection) => {
            sitting.start(selection).await?;
            print_questions(sitting).await;
        }
        ConsoleCommand::Goto(index) => {
            let at = sitting.move_to_question(index).await?;
            println!("at question {at}");
        }
        ConsoleCommand::Choose { question, option } => {
            sitting.answer(question, AnswerValue::Choice(option)).await?;
        }
        ConsoleCommand::Upload { question, path } => {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    println!("! cannot read {path}: {err}");
                    return Ok(());
                }
            };
            let file_name = std::path::Path::new(&path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.bin")
                .to_string();
            sitting.answer_with_upload(question, &file_name, bytes).await?;
            println!("uploaded {file_name}");
        }
        ConsoleCommand::Complete => {
            let view = sitting.view().await;
            let SittingState::InTopic(selection) = view.state else {
                println!("! no topic is open");
                return Ok(());
            };
            let completion = sitting.complete_topic(&selection).await?;
            println!("{selection}: {completion:?}");
        }
        ConsoleCommand::Back => sitting.return_to_selection().await?,
        ConsoleCommand::Submit {
            acknowledge_incomplete,
        } => match sitting.confirm_final(acknowledge_incomplete).await {
            Ok(SubmitOutcome::Submitted(report)) => println!(
                "submitted: score {} ({} / {} points, {} awaiting manual grading)",
                report.score, report.earned_points, report.total_points, report.pending_manual
            ),
            Ok(SubmitOutcome::AlreadySubmitted) => println!("already submitted"),
            Err(SittingError::ConfirmationRequired { remaining }) => {
                let names: Vec<&str> = remaining.iter().map(Topic::as_str).collect();
                println!(
                    "topics still open: {}. Use `submit --yes` to submit anyway.",
                    names.join(", ")
                );
            }
            Err(err) => return Err(err),
        },
        ConsoleCommand::Help => print_help(),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn describe(event: &SittingEvent) -> String {
    match event {
        SittingEvent::Started(selection) => format!("started {selection}"),
        SittingEvent::TopicCompleted {
            selection,
            completion,
        } => format!("completed {selection} ({completion:?})"),
        SittingEvent::Expired => "time is up".to_string(),
        SittingEvent::Submitted { reason, score } => format!("submitted ({reason}), score {score}"),
        SittingEvent::Review(status) => format!("session is {status}; review only"),
        SittingEvent::Reset => "session was reset by an administrator".to_string(),
        SittingEvent::ConnectionLost => "connection lost; answers are kept locally".to_string(),
        SittingEvent::Reconnected => "reconnected".to_string(),
    }
}

/// Drive `sitting` from stdin until `quit` or end of input.
///
/// # Errors
///
/// Returns `SittingError` if the sitting cannot be opened or watched.
pub async fn run(sitting: Arc<ExamSitting>) -> Result<(), SittingError> {
    let view = sitting.open().await?;
    let drivers = SittingDrivers::spawn(Arc::clone(&sitting)).await?;

    let mut events = sitting.events();
    let notifier = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("* {}", describe(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    print_view(&view);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "stdin read failed");
                break;
            }
        };
        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => report(execute(&sitting, command).await),
            Err(err) => println!("! {err}"),
        }
    }

    drivers.shutdown();
    notifier.abort();
    Ok(())
}
