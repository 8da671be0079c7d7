//! contentdb - versioned content repositories on top of Git
//!
//! This is the main entry point for the contentdb command-line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use contentdb::db::{ContentStore, Job, JobResult, RepositoryUpdate, StoreConfig, StoreResult, TaskRunner};
use contentdb::model::{ContentId, ContentRef, ContentSet, ContentType};
use contentdb::transaction::IsolationLevel;

#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned content repositories stored in Git")]
struct Cli {
    /// Path to the store directory
    #[arg(short, long, env = "CONTENTDB_PATH", default_value = ".contentdb", global = true)]
    database: PathBuf,

    #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase logging (-vv reaches trace)")]
    verbose: u8,

    #[arg(long, global = true, help = "Print results as JSON")]
    json: bool,

    /// Isolation level for store transactions
    #[arg(long, global = true, default_value = "read-committed")]
    isolation: IsolationLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage repositories
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Manage content units
    #[command(subcommand)]
    Content(ContentCommand),
    /// Manage artifacts
    #[command(subcommand)]
    Artifact(ArtifactCommand),
    /// Manage repository versions
    #[command(subcommand)]
    Version(VersionCommand),
    /// Orphan maintenance
    #[command(subcommand)]
    Orphans(OrphansCommand),
    /// Record counts of the store
    Stats,
    /// Recent store commits, newest first
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Show {
        name: String,
    },
    Update {
        name: String,
        #[arg(long)]
        rename: Option<String>,
        #[arg(long, conflicts_with = "clear_description")]
        description: Option<String>,
        #[arg(long)]
        clear_description: bool,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ContentCommand {
    Add {
        #[arg(long = "type")]
        content_type: ContentType,
        /// Content id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Field as key=value; values that parse as JSON are stored as JSON
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,
    },
    List {
        #[arg(long = "type")]
        content_type: Option<ContentType>,
    },
}

#[derive(Subcommand, Debug)]
enum ArtifactCommand {
    Add {
        /// Location relative to the artifact root
        location: String,
        #[arg(long)]
        size: u64,
        #[arg(long)]
        sha256: Option<String>,
        /// Attach to this content unit
        #[arg(long)]
        content: Option<String>,
        /// Path of the artifact within the content unit
        #[arg(long, requires = "content")]
        relative_path: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ContentChanges {
    /// Content to add, as type:id
    #[arg(long = "add")]
    add: Vec<ContentRef>,
    /// Content to remove, as type:id
    #[arg(long = "remove")]
    remove: Vec<ContentRef>,
}

#[derive(Subcommand, Debug)]
enum VersionCommand {
    Create {
        repository: String,
        /// Start from this version instead of the latest content
        #[arg(long)]
        base: Option<u64>,
        #[command(flatten)]
        changes: ContentChanges,
    },
    List {
        repository: String,
    },
    Show {
        repository: String,
        number: u64,
    },
    Content {
        repository: String,
        number: u64,
    },
    Delete {
        repository: String,
        number: u64,
    },
    /// Discard versions left unfinished by an interrupted build
    Cleanup {
        repository: String,
    },
}

#[derive(Subcommand, Debug)]
enum OrphansCommand {
    Cleanup,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = match ContentStore::open_with_config(StoreConfig::new(&cli.database).isolation(cli.isolation)) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, store) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error ({}): {}", e.status(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("contentdb={level}")));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli, store: ContentStore) -> StoreResult<()> {
    let out = Output { json: cli.json };
    let runner = TaskRunner::new(store);
    let store = runner.store();

    match &cli.command {
        Command::Repo(cmd) => match cmd {
            RepoCommand::Create { name, description } => {
                let info = store.create_repository(name, description.as_deref())?;
                out.print(&info, || format!("created repository {} ({})", info.name, info.id));
            }
            RepoCommand::List => {
                let repos = store.list_repositories()?;
                out.print(&repos, || {
                    repos
                        .iter()
                        .map(|r| format!("{}\tlatest={}", r.name, display_number(r.latest_version)))
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            }
            RepoCommand::Show { name } => {
                let info = store.get_repository(name)?;
                out.print(&info, || {
                    format!(
                        "{}\nid: {}\ndescription: {}\nlatest version: {}\nlast issued: {}",
                        info.name,
                        info.id,
                        info.description.as_deref().unwrap_or("-"),
                        display_number(info.latest_version),
                        info.last_version
                    )
                });
            }
            RepoCommand::Update {
                name,
                rename,
                description,
                clear_description,
            } => {
                let update = RepositoryUpdate {
                    name: rename.clone(),
                    description: if *clear_description {
                        Some(None)
                    } else {
                        description.clone().map(Some)
                    },
                };
                let outcome = runner.run(&Job::UpdateRepository {
                    repository: name.clone(),
                    update,
                })?;
                out.print(&outcome, || format!("updated repository {}", name));
            }
            RepoCommand::Delete { name } => {
                let outcome = runner.run(&Job::DeleteRepository {
                    repository: name.clone(),
                })?;
                out.print(&outcome, || format!("deleted repository {}", name));
            }
        },

        Command::Content(cmd) => match cmd {
            ContentCommand::Add {
                content_type,
                id,
                fields,
            } => {
                let id = id.as_deref().map(ContentId::new).transpose()?;
                let fields: BTreeMap<String, Value> = fields.iter().cloned().collect();
                let content = store.create_content(content_type, id, fields)?;
                out.print(&content, || content.to_string());
            }
            ContentCommand::List { content_type } => {
                let units = store.list_content(content_type.as_ref())?;
                let listed: Vec<_> = units
                    .iter()
                    .map(|(id, unit)| (ContentRef::new(unit.content_type.clone(), id.clone()), &unit.fields))
                    .collect();
                out.print(&listed, || {
                    listed
                        .iter()
                        .map(|(content, _)| content.to_string())
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            }
        },

        Command::Artifact(ArtifactCommand::Add {
            location,
            size,
            sha256,
            content,
            relative_path,
        }) => {
            let artifact = store.create_artifact(location, *size, sha256.as_deref())?;
            if let Some(content) = content {
                let content = ContentId::new(content.as_str())?;
                let path = relative_path.as_deref().unwrap_or(location);
                store.attach_artifact(&content, &artifact, path)?;
            }
            out.print(&artifact, || artifact.to_string());
        }

        Command::Version(cmd) => match cmd {
            VersionCommand::Create {
                repository,
                base,
                changes,
            } => {
                let outcome = runner.run(&Job::AddAndRemove {
                    repository: repository.clone(),
                    base_version: *base,
                    add: changes.add.iter().cloned().collect(),
                    remove: changes.remove.iter().cloned().collect(),
                })?;
                out.print(&outcome, || match &outcome.result {
                    JobResult::Version(info) => format!("created version {} of {}", info.number, repository),
                    other => format!("{:?}", other),
                });
            }
            VersionCommand::List { repository } => {
                let versions = store.list_versions(repository)?;
                out.print(&versions, || {
                    versions
                        .iter()
                        .map(|v| format!("{}\tbase={}\t{}", v.number, display_number(v.base_version), v.created_at))
                        .collect::<Vec<_>>()
                        .join("\n")
                });
            }
            VersionCommand::Show { repository, number } => {
                let detail = store.version_detail(repository, *number)?;
                out.print(&detail, || {
                    let mut lines = vec![format!("version {} of {}", detail.info.number, repository)];
                    for (label, counts) in [("present", &detail.present), ("added", &detail.added), ("removed", &detail.removed)] {
                        for (content_type, count) in counts {
                            lines.push(format!("  {} {}: {}", label, store.registry().label(content_type), count));
                        }
                    }
                    lines.join("\n")
                });
            }
            VersionCommand::Content { repository, number } => {
                let content = store.version_content(repository, *number)?;
                out.print(&content, || display_content(&content));
            }
            VersionCommand::Delete { repository, number } => {
                let outcome = runner.run(&Job::DeleteVersion {
                    repository: repository.clone(),
                    number: *number,
                })?;
                out.print(&outcome, || match &outcome.result {
                    JobResult::Deleted { deletion: Some(deletion) } => format!("version {}: {:?}", number, deletion),
                    _ => format!("version {} not found, nothing to do", number),
                });
            }
            VersionCommand::Cleanup { repository } => {
                let discarded = store.cleanup_incomplete(repository)?;
                out.print(&discarded, || format!("discarded {} unfinished version(s)", discarded.len()));
            }
        },

        Command::Orphans(OrphansCommand::Cleanup) => {
            let outcome = runner.run(&Job::ReclaimOrphans)?;
            out.print(&outcome, || match &outcome.result {
                JobResult::Reclaimed(report) => format!(
                    "removed {} content unit(s) and {} artifact(s)",
                    report.content_removed, report.artifacts_removed
                ),
                other => format!("{:?}", other),
            });
        }

        Command::Stats => {
            let stats = store.stats()?;
            out.print(&stats, || stats.to_string());
        }

        Command::Log { limit } => {
            let commits = store.history(Some(*limit))?;
            out.print(&commits, || {
                commits
                    .iter()
                    .map(|c| format!("{}  {}  {}", c.id.short(), c.time.format("%Y-%m-%d %H:%M:%S"), c.summary()))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
    }

    Ok(())
}

struct Output {
    json: bool,
}

impl Output {
    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string_pretty(value) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Error encoding output: {}", e),
            }
        } else {
            let text = human();
            if !text.is_empty() {
                println!("{}", text);
            }
        }
    }
}

fn display_number(number: Option<u64>) -> String {
    number.map_or_else(|| "-".to_string(), |n| n.to_string())
}

fn display_content(content: &ContentSet) -> String {
    content.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("\n")
}

fn parse_field(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
