use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{DigestIndexExtractor, MarkOutcome, NewPerson};
use rollcall_service::{AttendanceService, Config};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance from group photos")]
struct Cli {
    /// TOML configuration file; ROLLCALL_* variables still override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from one or more reference photos
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        roll: String,
        #[arg(long)]
        parent_name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Reference photos, one signature each
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Add a reference photo to an enrolled student
    AddPhoto {
        /// Student ID or roll number
        student: String,
        photo: PathBuf,
    },
    /// List enrolled students
    List,
    /// Remove a student and all of their attendance
    Remove {
        /// Student ID or roll number
        student: String,
    },
    /// Mark attendance from a classroom group photo
    Reconcile {
        photo: PathBuf,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Manually mark students present
    Mark {
        /// Student IDs or roll numbers
        #[arg(required = true)]
        students: Vec<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Day's verification code; the mark is refused if it does not match
        #[arg(long)]
        code: Option<String>,
    },
    /// Students without attendance for the day
    Unmarked {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Export attendance rows for an inclusive date range
    Export {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Present/absent counts for the day
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show (creating if needed) the day's verification code
    Token {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Check a verification code against the day's token
    VerifyToken {
        code: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Group photos processed on the day
    Photos {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn today(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| chrono::Local::now().date_naive())
}

async fn read_photo(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading photo {}", path.display()))
}

async fn resolve(service: &AttendanceService, student: &str) -> Result<String> {
    match service.find_person(student).await? {
        Some(person) => Ok(person.id),
        None => bail!("no student with ID or roll {student}"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let extractor = DigestIndexExtractor::load(&config.signature_index)?;
    let service = AttendanceService::open(&config, Box::new(extractor))
        .await
        .context("opening attendance store")?;

    match cli.command {
        Commands::Enroll {
            name,
            roll,
            parent_name,
            phone,
            photos,
        } => {
            let mut bytes = Vec::with_capacity(photos.len());
            for path in &photos {
                bytes.push(read_photo(path).await?);
            }
            let new = NewPerson {
                name,
                roll,
                parent_name,
                phone,
            };
            let person = service.enroll(new, bytes).await?;
            if cli.json {
                print_json(&person.summary())?;
            } else {
                println!(
                    "Enrolled {} (roll {}) as {} with {} signature(s)",
                    person.name,
                    person.roll,
                    person.id,
                    person.signatures.len()
                );
            }
        }
        Commands::AddPhoto { student, photo } => {
            let id = resolve(&service, &student).await?;
            let count = service.add_photo(&id, read_photo(&photo).await?).await?;
            println!("{id} now has {count} signature(s)");
        }
        Commands::List => {
            let roster = service.roster().await?;
            if cli.json {
                let people: Vec<_> = roster.iter().map(|p| p.summary()).collect();
                print_json(&people)?;
            } else if roster.is_empty() {
                println!("No students enrolled");
            } else {
                for p in &roster {
                    println!(
                        "{:<8} {:<24} {:<36} {} photo(s)",
                        p.roll,
                        p.name,
                        p.id,
                        p.signatures.len()
                    );
                }
            }
        }
        Commands::Remove { student } => {
            let id = resolve(&service, &student).await?;
            let person = service.delete_person(&id).await?;
            println!("Removed {} (roll {})", person.name, person.roll);
        }
        Commands::Reconcile { photo, date } => {
            let bytes = read_photo(&photo).await?;
            let result = service.reconcile_photo(&bytes, today(date)).await?;
            if cli.json {
                print_json(&result)?;
            } else {
                if let Some(reason) = &result.extraction_failure {
                    println!("Photo could not be processed: {reason}");
                }
                println!(
                    "{} face(s), {} matched ({} new), {} unresolved, {} ms",
                    result.faces_found,
                    result.auto.len(),
                    result.newly_marked(),
                    result.ambiguous_faces.len(),
                    result.processing_ms
                );
                for m in &result.auto {
                    let note = match m.outcome {
                        MarkOutcome::Recorded(_) => "",
                        MarkOutcome::AlreadyMarked(_) => " (already marked)",
                    };
                    println!("  {:<8} {:<24} {:.3}{note}", m.person.roll, m.person.name, m.score);
                }
                if !result.unmatched_people.is_empty() {
                    println!("Still unmarked:");
                    for p in &result.unmatched_people {
                        println!("  {:<8} {}", p.roll, p.name);
                    }
                }
            }
        }
        Commands::Mark {
            students,
            date,
            code,
        } => {
            let date = today(date);
            let mut ids = Vec::with_capacity(students.len());
            for s in &students {
                ids.push(resolve(&service, s).await?);
            }
            let marked = match code {
                Some(code) => {
                    let mut marked = 0;
                    for id in &ids {
                        if service.mark_verified(id, date, &code).await?.is_new() {
                            marked += 1;
                        }
                    }
                    marked
                }
                None => service.mark_manual_many(&ids, date).await?,
            };
            println!("{marked} student(s) newly marked present");
        }
        Commands::Unmarked { date } => {
            let people = service.unmarked(today(date)).await?;
            if cli.json {
                let refs: Vec<_> = people.iter().map(|p| p.summary()).collect();
                print_json(&refs)?;
            } else {
                for p in &people {
                    println!("{:<8} {}", p.roll, p.name);
                }
            }
        }
        Commands::Export { from, to } => {
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let rows = service.export(from, to).await?;
            if cli.json {
                print_json(&rows)?;
            } else {
                for r in &rows {
                    let score = r.score.map(|s| format!("{s:.3}")).unwrap_or_default();
                    let verified = if r.verified { "verified" } else { "" };
                    println!(
                        "{}\t{}\t{}\t{}\t{}\t{}",
                        r.date, r.roll, r.name, r.status, score, verified
                    );
                }
            }
        }
        Commands::Summary { date } => {
            let s = service.summary(today(date)).await?;
            if cli.json {
                print_json(&s)?;
            } else {
                println!(
                    "{}: {}/{} present ({} auto, {} manual), {} absent",
                    s.date, s.present, s.total, s.auto, s.manual, s.absent
                );
            }
        }
        Commands::Token { date } => {
            let token = service.token(today(date)).await?;
            if cli.json {
                print_json(&token)?;
            } else {
                println!("{}: {}", token.date, token.code);
            }
        }
        Commands::VerifyToken { code, date } => {
            if service.verify_token(today(date), &code).await? {
                println!("Code accepted");
            } else {
                bail!("code does not match the day's token");
            }
        }
        Commands::Photos { date } => {
            let logs = service.photo_logs(today(date)).await?;
            if cli.json {
                print_json(&logs)?;
            } else if logs.is_empty() {
                println!("No group photos processed");
            } else {
                for l in &logs {
                    println!(
                        "{}  {} face(s), {} marked, {} unresolved, {} ms  {}",
                        l.taken_at.format("%H:%M:%S"),
                        l.faces_found,
                        l.auto_marked,
                        l.ambiguous,
                        l.processing_ms,
                        l.photo_path.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    Ok(())
}
